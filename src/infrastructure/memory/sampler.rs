//! Resident memory sampling through `sysinfo`.

use parking_lot::Mutex;
use sysinfo::{Pid, System};
use tracing::warn;

use crate::domain::ports::MemorySamplerPort;

/// Samples the resident set size of the current process.
pub struct SysinfoMemorySampler {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl SysinfoMemorySampler {
    /// Creates a sampler for the current process.
    #[must_use]
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                warn!(error = %e, "Cannot determine current pid, memory sampling disabled");
                None
            }
        };
        Self {
            system: Mutex::new(System::new()),
            pid,
        }
    }
}

impl Default for SysinfoMemorySampler {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SysinfoMemorySampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SysinfoMemorySampler")
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

impl MemorySamplerPort for SysinfoMemorySampler {
    fn resident_bytes(&self) -> Option<u64> {
        let pid = self.pid?;
        let mut system = self.system.lock();
        if !system.refresh_process(pid) {
            return None;
        }
        system.process(pid).map(sysinfo::Process::memory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_samples_own_process() {
        let sampler = SysinfoMemorySampler::new();
        let resident = sampler.resident_bytes();
        assert!(resident.is_some_and(|bytes| bytes > 0));
    }
}
