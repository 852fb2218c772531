//! Pool configuration
//!
//! Shape of every generation a pool publishes: how many nesting levels each
//! processor gets a buffer for, and how many addresses each buffer holds.

use callchain_common::{MAX_STACK_DEPTH, NR_CONTEXTS};
use serde::{Deserialize, Serialize};

use crate::domain::PoolError;

/// Upper bound on `entry_capacity`
///
/// Large enough for any real stack, small enough that a typo in a flag does
/// not try to reserve gigabytes per processor.
pub const MAX_ENTRY_CAPACITY: usize = 64 * 1024;

/// Shape of the per-processor buffer table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Nesting levels per processor (1..=4)
    pub contexts: usize,
    /// Addresses per callchain entry
    pub entry_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { contexts: NR_CONTEXTS, entry_capacity: MAX_STACK_DEPTH }
    }
}

impl PoolConfig {
    #[must_use]
    pub fn with_contexts(mut self, contexts: usize) -> Self {
        self.contexts = contexts;
        self
    }

    #[must_use]
    pub fn with_entry_capacity(mut self, entry_capacity: usize) -> Self {
        self.entry_capacity = entry_capacity;
        self
    }

    /// Check the configuration before any buffer is sized from it
    ///
    /// # Errors
    /// Returns `PoolError::InvalidConfig` if either dimension is out of range
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.contexts == 0 || self.contexts > NR_CONTEXTS {
            return Err(PoolError::InvalidConfig(format!(
                "contexts must be between 1 and {NR_CONTEXTS}, got {}",
                self.contexts
            )));
        }
        if self.entry_capacity == 0 || self.entry_capacity > MAX_ENTRY_CAPACITY {
            return Err(PoolError::InvalidConfig(format!(
                "entry_capacity must be between 1 and {MAX_ENTRY_CAPACITY}, got {}",
                self.entry_capacity
            )));
        }
        Ok(())
    }

    /// Bytes of address storage one processor's row needs
    #[must_use]
    pub fn bytes_per_cpu(&self) -> usize {
        self.contexts.saturating_mul(self.entry_capacity).saturating_mul(std::mem::size_of::<u64>())
    }
}
