//! # Pool Lifecycle
//!
//! [`CallchainPool`] owns everything a capture needs: the recursion guard,
//! the published generation and the reclaimer that outlives it. Buffers exist
//! only while at least one consumer is registered:
//!
//! ```text
//! consumers 0 ──acquire──▶ 1   allocate + publish generation
//! consumers n ──acquire──▶ n+1 (no allocation; fails if buffers are missing)
//! consumers n ──release──▶ n-1 (no work)
//! consumers 1 ──release──▶ 0   unpublish + retire generation
//! ```
//!
//! Both cold transitions happen under one lifecycle lock, so concurrent first
//! consumers see exactly one allocation and agree on its outcome. If that
//! allocation fails the count stays at 1 with nothing published; every later
//! `acquire` reports the failure instead of retrying, until the count drains
//! back to zero and a fresh `acquire` starts over.

use log::{info, warn};
use serde::Serialize;
use std::fmt;

use super::generation::{CurrentGeneration, Generation};
use super::reclaim::DeferredReclaimer;
use super::recursion::RecursionGuard;
use super::slot_table::{NodeAllocator, UniformAllocator};
use crate::config::PoolConfig;
use crate::domain::{CpuId, GenerationId, PoolError};
use crate::sync::{AtomicUsize, Mutex, Ordering};
use crate::topology::{HostTopology, Topology};

/// State changed only under the lifecycle lock
#[derive(Debug)]
struct LifecycleState {
    config: PoolConfig,
    next_generation: u64,
    current: Option<GenerationId>,
    allocated: u64,
    retired: u64,
}

/// Snapshot of the pool's cold-path counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Registered consumers
    pub consumers: usize,
    /// Published generation, if any
    pub current: Option<GenerationId>,
    /// Generations successfully allocated and published
    pub generations_allocated: u64,
    /// Generations unpublished and handed to the reclaimer
    pub generations_retired: u64,
    /// Retired generations actually freed
    pub generations_reclaimed: u64,
    /// Retired generations still waiting for readers
    pub pending_reclaim: usize,
}

/// Reference-counted per-processor callchain buffer pool
pub struct CallchainPool<T: Topology = HostTopology> {
    topology: T,
    allocator: Box<dyn NodeAllocator>,
    consumers: AtomicUsize,
    lifecycle: Mutex<LifecycleState>,
    current: CurrentGeneration,
    recursion: RecursionGuard,
    reclaimer: DeferredReclaimer<Generation>,
}

impl CallchainPool<HostTopology> {
    /// Pool sized for the processors of this machine
    ///
    /// # Errors
    /// Returns an error if the host topology cannot be read or `config` is invalid
    pub fn for_host(config: PoolConfig) -> anyhow::Result<Self> {
        let topology = HostTopology::detect()?;
        Ok(Self::new(topology, config)?)
    }
}

impl<T: Topology> CallchainPool<T> {
    /// Pool for every processor of `topology`, shaped by `config`
    ///
    /// Nothing is allocated until the first [`acquire`](Self::acquire).
    ///
    /// # Errors
    /// Returns `PoolError::InvalidConfig` if `config` is invalid or the
    /// topology reports no processors
    pub fn new(topology: T, config: PoolConfig) -> Result<Self, PoolError> {
        config.validate()?;
        let cpus = topology.possible_cpus();
        if cpus == 0 {
            return Err(PoolError::InvalidConfig("topology reports no processors".to_string()));
        }

        Ok(Self {
            recursion: RecursionGuard::new(cpus, config.contexts),
            reclaimer: DeferredReclaimer::new(),
            topology,
            allocator: Box::new(UniformAllocator),
            consumers: AtomicUsize::new(0),
            lifecycle: Mutex::new(LifecycleState {
                config,
                next_generation: 1,
                current: None,
                allocated: 0,
                retired: 0,
            }),
            current: CurrentGeneration::new(),
        })
    }

    /// Use `allocator` for entry storage of generations allocated from now on
    #[must_use]
    pub fn with_allocator(mut self, allocator: impl NodeAllocator + 'static) -> Self {
        self.allocator = Box::new(allocator);
        self
    }

    /// Register one consumer, allocating the buffers if it is the first
    ///
    /// A consumer whose `acquire` fails with an allocation error still
    /// counts as registered and must [`release`](Self::release).
    ///
    /// # Errors
    /// - `PoolError::OutOfMemory` if this call allocated and failed
    /// - `PoolError::AllocationFailed` if an earlier allocation failed and
    ///   consumers are still registered
    /// - `PoolError::ConsumerOverflow` if the count cannot be incremented
    ///   (the count is left unchanged)
    pub fn acquire(&self) -> Result<(), PoolError> {
        let mut state = self.lifecycle.lock();
        self.reclaimer.try_reclaim();

        let count = self.increment_consumers()?;
        if count > 1 {
            // If the allocation failed, give up
            if !self.current.is_published() {
                return Err(PoolError::AllocationFailed);
            }
            return Ok(());
        }

        let id = GenerationId(state.next_generation);
        let generation =
            match Generation::allocate(id, &self.topology, &state.config, self.allocator.as_ref()) {
                Ok(generation) => generation,
                Err(e) => {
                    warn!("Failed to allocate callchain buffers: {e}");
                    return Err(e);
                }
            };

        state.next_generation += 1;
        state.allocated += 1;
        state.current = Some(id);
        if let Some(stale) = self.current.publish(generation) {
            // Unreachable while the invariant holds; never free it eagerly
            warn!("Replaced stale callchain generation {}", stale.id());
            state.retired += 1;
            self.reclaimer.retire(stale);
        }
        info!(
            "✓ Published callchain buffers {id}: {} CPUs x {} contexts x {} ips ({} bytes per CPU)",
            self.topology.possible_cpus(),
            state.config.contexts,
            state.config.entry_capacity,
            state.config.bytes_per_cpu()
        );
        Ok(())
    }

    /// Unregister one consumer, retiring the buffers if it was the last
    ///
    /// Releasing more often than acquiring is logged and ignored.
    pub fn release(&self) {
        // Fast path: somebody else still needs the buffers
        let mut count = self.consumers.load(Ordering::Acquire);
        while count > 1 {
            match self.consumers.compare_exchange_weak(
                count,
                count - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => count = actual,
            }
        }

        let mut state = self.lifecycle.lock();
        let previous = match self.consumers.fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |count| count.checked_sub(1),
        ) {
            Ok(previous) => previous,
            Err(_) => {
                warn!("Callchain pool released more often than acquired");
                return;
            }
        };
        if previous > 1 {
            return;
        }

        // Unpublish before the lock is dropped: nobody can retire it twice
        state.current = None;
        if let Some(generation) = self.current.take() {
            let id = generation.id();
            state.retired += 1;
            let freed = self.reclaimer.retire(generation);
            info!("Retired callchain buffers {id} ({freed} generation(s) reclaimed immediately)");
        }
    }

    /// Register a consumer that releases itself when dropped
    ///
    /// Unlike [`acquire`](Self::acquire), a failed registration leaves the
    /// consumer count as it was.
    ///
    /// # Errors
    /// Same as [`acquire`](Self::acquire)
    pub fn register(&self) -> Result<ConsumerHandle<'_, T>, PoolError> {
        match self.acquire() {
            Ok(()) => Ok(ConsumerHandle { pool: self }),
            Err(PoolError::ConsumerOverflow) => Err(PoolError::ConsumerOverflow),
            Err(e) => {
                self.release();
                Err(e)
            }
        }
    }

    /// Swap in buffers with a different entry capacity
    ///
    /// With consumers registered, a new generation is allocated and published
    /// and the old one is retired; captures in flight keep using the old
    /// buffers until they finish. Without consumers only the configuration
    /// for the next allocation changes.
    ///
    /// # Errors
    /// Returns `PoolError::InvalidConfig` for an invalid capacity, or the
    /// allocation error (the current generation then stays in place)
    pub fn resize(&self, entry_capacity: usize) -> Result<(), PoolError> {
        let mut state = self.lifecycle.lock();
        let config = state.config.with_entry_capacity(entry_capacity);
        config.validate()?;

        if !self.current.is_published() {
            state.config = config;
            return Ok(());
        }

        let id = GenerationId(state.next_generation);
        let generation =
            Generation::allocate(id, &self.topology, &config, self.allocator.as_ref())?;
        state.config = config;
        state.next_generation += 1;
        state.allocated += 1;
        state.current = Some(id);

        if let Some(old) = self.current.publish(generation) {
            let old_id = old.id();
            state.retired += 1;
            self.reclaimer.retire(old);
            info!("Resized callchain buffers {old_id} -> {id}: {entry_capacity} ips per entry");
        }
        Ok(())
    }

    /// Free retired generations whose readers have finished, without waiting
    pub fn try_reclaim(&self) -> usize {
        self.reclaimer.try_reclaim()
    }

    /// Wait until every retired generation has been freed
    ///
    /// Must not be called while holding a
    /// [`CapturedCallchain`](crate::capture::CapturedCallchain).
    pub fn synchronize(&self) -> usize {
        self.reclaimer.synchronize()
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let state = self.lifecycle.lock();
        PoolStats {
            consumers: self.consumers.load(Ordering::Acquire),
            current: state.current,
            generations_allocated: state.allocated,
            generations_retired: state.retired,
            generations_reclaimed: self.reclaimer.reclaimed(),
            pending_reclaim: self.reclaimer.pending(),
        }
    }

    /// Registered consumers
    #[must_use]
    pub fn consumers(&self) -> usize {
        self.consumers.load(Ordering::Acquire)
    }

    /// Configuration the next generation will be built with
    #[must_use]
    pub fn config(&self) -> PoolConfig {
        self.lifecycle.lock().config
    }

    #[must_use]
    pub fn topology(&self) -> &T {
        &self.topology
    }

    /// Whether buffers are currently published
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.current.is_published()
    }

    /// Context slots currently held on `cpu`
    #[must_use]
    pub fn nesting_depth(&self, cpu: CpuId) -> usize {
        self.recursion.depth(cpu)
    }

    pub(crate) fn recursion(&self) -> &RecursionGuard {
        &self.recursion
    }

    pub(crate) fn current(&self) -> &CurrentGeneration {
        &self.current
    }

    fn increment_consumers(&self) -> Result<usize, PoolError> {
        let mut count = self.consumers.load(Ordering::Acquire);
        loop {
            let next = count.checked_add(1).ok_or(PoolError::ConsumerOverflow)?;
            match self.consumers.compare_exchange_weak(
                count,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(next),
                Err(actual) => count = actual,
            }
        }
    }
}

impl<T: Topology> fmt::Debug for CallchainPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallchainPool")
            .field("cpus", &self.topology.possible_cpus())
            .field("consumers", &self.consumers())
            .field("current", &self.current)
            .field("reclaimer", &self.reclaimer)
            .finish_non_exhaustive()
    }
}

/// A registered consumer; releases the pool when dropped
#[must_use = "dropping the handle unregisters the consumer"]
pub struct ConsumerHandle<'a, T: Topology> {
    pool: &'a CallchainPool<T>,
}

impl<T: Topology> ConsumerHandle<'_, T> {
    #[must_use]
    pub fn pool(&self) -> &CallchainPool<T> {
        self.pool
    }
}

impl<T: Topology> Drop for ConsumerHandle<'_, T> {
    fn drop(&mut self) {
        self.pool.release();
    }
}

impl<T: Topology> fmt::Debug for ConsumerHandle<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerHandle").finish_non_exhaustive()
    }
}
