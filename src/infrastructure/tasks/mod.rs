//! Background task scheduling.

mod registry;

pub use registry::TaskRegistry;
