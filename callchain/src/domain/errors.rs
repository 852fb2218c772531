//! Structured error types for the callchain pool
//!
//! Using thiserror for automatic Display implementation and error chaining.

use super::types::CpuId;
use thiserror::Error;

/// Cold-path failures reported by pool construction and lifecycle calls
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Out of memory allocating {bytes} bytes of callchain buffers for {cpu}")]
    OutOfMemory { cpu: CpuId, bytes: usize },

    #[error("Callchain buffers unavailable: an earlier allocation failed")]
    AllocationFailed,

    #[error("Invalid pool configuration: {0}")]
    InvalidConfig(String),

    #[error("Too many callchain consumers")]
    ConsumerOverflow,

    #[error("{cpu} is outside the {cpus} possible processors")]
    CpuOutOfRange { cpu: CpuId, cpus: usize },
}

impl PoolError {
    /// Whether this error means no buffers could be allocated
    ///
    /// True both for the consumer whose allocation failed and for later
    /// consumers that found the pool in the failed state.
    #[must_use]
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, PoolError::OutOfMemory { .. } | PoolError::AllocationFailed)
    }
}

/// Every context slot of a processor is already held
///
/// The nesting budget is exhausted; the capture is dropped.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Callchain recursion depth exhausted on {cpu}")]
pub struct RecursionOverflow {
    pub cpu: CpuId,
}

/// Why a capture produced no entry
///
/// None of these are faults: the monitoring event simply records that no
/// callchain was captured.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureDropped {
    #[error("Neither trusted nor untrusted frames were requested")]
    NothingRequested,

    #[error(transparent)]
    RecursionOverflow(#[from] RecursionOverflow),

    #[error("No callchain buffers are published")]
    Uninitialized,

    #[error("{cpu} is outside the {cpus} possible processors")]
    CpuOutOfRange { cpu: CpuId, cpus: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_memory_display() {
        let err = PoolError::OutOfMemory { cpu: CpuId(2), bytes: 4096 };
        assert_eq!(
            err.to_string(),
            "Out of memory allocating 4096 bytes of callchain buffers for CPU:2"
        );
        assert!(err.is_out_of_memory());
        assert!(PoolError::AllocationFailed.is_out_of_memory());
        assert!(!PoolError::ConsumerOverflow.is_out_of_memory());
    }

    #[test]
    fn test_overflow_converts_into_drop_reason() {
        let dropped: CaptureDropped = RecursionOverflow { cpu: CpuId(1) }.into();
        assert_eq!(dropped, CaptureDropped::RecursionOverflow(RecursionOverflow { cpu: CpuId(1) }));
        assert!(dropped.to_string().contains("CPU:1"));
    }
}
