//! Generations and the published current generation

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwapOption;

use super::slot_table::{NodeAllocator, PerCpuSlotTable};
use crate::config::PoolConfig;
use crate::domain::{GenerationId, PoolError};
use crate::topology::Topology;

/// One immutable instance of the per-processor slot table
///
/// Once published, neither the number of rows nor the shape of any entry
/// changes; a different shape is a different generation.
#[derive(Debug)]
pub struct Generation {
    id: GenerationId,
    table: PerCpuSlotTable,
}

impl Generation {
    /// Build a complete generation, or nothing
    ///
    /// # Errors
    /// Returns the allocation error of the slot table
    pub fn allocate<T: Topology + ?Sized>(
        id: GenerationId,
        topology: &T,
        config: &PoolConfig,
        allocator: &dyn NodeAllocator,
    ) -> Result<Self, PoolError> {
        let table = PerCpuSlotTable::allocate(topology, config, allocator)?;
        Ok(Self { id, table })
    }

    #[must_use]
    pub fn id(&self) -> GenerationId {
        self.id
    }

    #[must_use]
    pub fn table(&self) -> &PerCpuSlotTable {
        &self.table
    }
}

/// The single published generation, read lock-free
///
/// Publishing and unpublishing happen under the pool's lifecycle lock.
/// Readers get their own reference, so a generation swapped out here stays
/// alive until the last capture holding it is dropped.
pub struct CurrentGeneration {
    inner: ArcSwapOption<Generation>,
}

impl CurrentGeneration {
    #[must_use]
    pub fn new() -> Self {
        Self { inner: ArcSwapOption::empty() }
    }

    /// Make `generation` current, returning the one it replaces
    ///
    /// The generation is fully built before it is stored, so no reader can
    /// observe a partially constructed table.
    pub fn publish(&self, generation: Generation) -> Option<Arc<Generation>> {
        self.inner.swap(Some(Arc::new(generation)))
    }

    /// Unpublish the current generation
    ///
    /// Captures that loaded it before this call may still be using it; the
    /// caller routes it through the reclaimer.
    pub fn take(&self) -> Option<Arc<Generation>> {
        self.inner.swap(None)
    }

    /// Whether a generation is currently published
    pub fn is_published(&self) -> bool {
        self.inner.load().is_some()
    }

    /// The current generation, if any
    pub fn load(&self) -> Option<Arc<Generation>> {
        self.inner.load_full()
    }
}

impl Default for CurrentGeneration {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CurrentGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CurrentGeneration")
            .field("current", &self.inner.load().as_ref().map(|g| g.id()))
            .finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::pool::slot_table::UniformAllocator;
    use crate::topology::FixedTopology;

    fn generation(id: u64) -> Generation {
        Generation::allocate(
            GenerationId(id),
            &FixedTopology::new(2),
            &PoolConfig::default(),
            &UniformAllocator,
        )
        .unwrap()
    }

    #[test]
    fn test_publish_and_take() {
        let current = CurrentGeneration::new();
        assert!(!current.is_published());
        assert!(current.publish(generation(1)).is_none());
        assert!(current.is_published());

        assert_eq!(current.load().map(|g| g.id()), Some(GenerationId(1)));

        let taken = current.take().unwrap();
        assert_eq!(taken.id(), GenerationId(1));
        assert!(current.take().is_none());
        assert!(current.load().is_none());
    }

    #[test]
    fn test_publish_returns_superseded_generation() {
        let current = CurrentGeneration::new();
        current.publish(generation(1));
        let old = current.publish(generation(2)).unwrap();
        assert_eq!(old.id(), GenerationId(1));
        assert_eq!(current.load().map(|g| g.id()), Some(GenerationId(2)));
    }

    #[test]
    fn test_loaded_generation_survives_take() {
        let current = CurrentGeneration::new();
        current.publish(generation(1));
        let reader = current.load().unwrap();

        let taken = current.take().unwrap();
        assert!(Arc::ptr_eq(&reader, &taken));
        // The cell no longer holds it; the reader and the taker do
        assert_eq!(Arc::strong_count(&taken), 2);
        drop(reader);
        assert_eq!(Arc::strong_count(&taken), 1);
    }
}
