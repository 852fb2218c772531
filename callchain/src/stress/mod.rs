//! Multi-threaded stress driver for the callchain pool
//!
//! Simulates processors with threads, interrupts with nested captures from
//! inside the frame walker, and consumer churn with a thread that keeps
//! registering, resizing and releasing. Results are collected per processor
//! and exported as JSON.

pub mod report;
pub mod sim;
pub mod workload;

// Re-export common types
pub use report::{CpuReport, CpuTally, StressReport};
pub use sim::{SimRegs, SimTask};
pub use workload::{run, run_on, StressConfig};
