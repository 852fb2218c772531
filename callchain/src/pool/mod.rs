//! Per-processor callchain buffer pool
//!
//! This module contains the pieces a capture is served from:
//! - Fixed-capacity callchain entries
//! - The per-processor slot table and the generations that own it
//! - The recursion guard handing out context slots
//! - Deferred reclamation of retired generations
//! - The reference-counted pool lifecycle tying them together

pub mod entry;
pub mod generation;
pub mod lifecycle;
pub mod reclaim;
pub mod recursion;
pub mod slot_table;

// Re-export common types
pub use entry::CallchainEntry;
pub use generation::{CurrentGeneration, Generation};
pub use lifecycle::{CallchainPool, ConsumerHandle, PoolStats};
pub use reclaim::DeferredReclaimer;
pub use recursion::{ContextSlot, RecursionGuard};
pub use slot_table::{NodeAllocator, PerCpuSlotTable, UniformAllocator};
