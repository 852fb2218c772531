//! Domain types providing compile-time safety and self-documentation
//!
//! These newtype wrappers keep processor indices, memory nodes, task
//! identities and generation numbers from being mixed up at call sites.

use serde::Serialize;
use std::fmt;

/// CPU ID
///
/// Index of a processor in `[0, possible_cpus)`. Rows of the slot table and
/// the recursion guard's busy masks are both indexed by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CpuId(pub u32);

impl CpuId {
    /// Position of this processor in per-processor arrays
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CPU:{}", self.0)
    }
}

/// Memory node ID
///
/// The NUMA node a processor's local memory belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NODE:{}", self.0)
    }
}

/// Task identity
///
/// Compared between the task an event is bound to and the task currently
/// running on the processor when deciding cross-task rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TASK:{}", self.0)
    }
}

/// Generation number
///
/// Every slot table published by a pool gets the next number, starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct GenerationId(pub u64);

impl fmt::Display for GenerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GEN:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_formats() {
        assert_eq!(CpuId(3).to_string(), "CPU:3");
        assert_eq!(NodeId(1).to_string(), "NODE:1");
        assert_eq!(TaskId(42).to_string(), "TASK:42");
        assert_eq!(GenerationId(7).to_string(), "GEN:7");
    }

    #[test]
    fn test_cpu_index() {
        assert_eq!(CpuId(5).index(), 5);
    }
}
