//! Process memory pressure detection and broadcast.

mod pressure;
mod sampler;

pub use pressure::{
    MemoryPressureEvent, MemoryPressureMonitor, PressureBus, PressureLevel, PressureSubscription,
    PressureThresholds,
};
pub use sampler::SysinfoMemorySampler;
