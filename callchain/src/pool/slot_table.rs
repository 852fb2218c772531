//! # Per-Processor Slot Table
//!
//! One row per possible processor, one [`CallchainEntry`] per nesting context
//! in each row:
//!
//! ```text
//!            Task      SoftIrq    HardIrq    Nmi
//! CPU 0   [ entry ]  [ entry ]  [ entry ]  [ entry ]
//! CPU 1   [ entry ]  [ entry ]  [ entry ]  [ entry ]
//! ...
//! ```
//!
//! The table is built in one go and never reshaped afterwards; a different
//! shape means building a new table. Building fails as a whole: if any entry
//! cannot be allocated, everything allocated so far is dropped and the error
//! names the processor that could not be served.
//!
//! Storage comes from a [`NodeAllocator`], which is told the memory node of
//! the processor each entry is for.

#![allow(unsafe_code)] // interior mutability of entries owned by context slots

use std::cell::UnsafeCell;
use std::fmt;
use std::ptr::NonNull;

use callchain_common::Context;
use log::debug;

use super::entry::CallchainEntry;
use crate::config::PoolConfig;
use crate::domain::{CpuId, NodeId, PoolError};
use crate::topology::Topology;

/// Source of entry storage
///
/// Called on the cold path only, once per entry of a new generation.
pub trait NodeAllocator: Send + Sync {
    /// Zeroed storage for `len` addresses used by `cpu`, ideally on `node`
    ///
    /// Returns `None` when the memory is not available.
    fn allocate(&self, cpu: CpuId, node: Option<NodeId>, len: usize) -> Option<Box<[u64]>>;
}

/// Allocates from the global allocator, ignoring memory nodes
#[derive(Debug, Default, Clone, Copy)]
pub struct UniformAllocator;

impl NodeAllocator for UniformAllocator {
    fn allocate(&self, _cpu: CpuId, _node: Option<NodeId>, len: usize) -> Option<Box<[u64]>> {
        let mut ips = Vec::new();
        ips.try_reserve_exact(len).ok()?;
        ips.resize(len, 0);
        Some(ips.into_boxed_slice())
    }
}

/// An entry that is written by whoever holds its context slot
struct EntrySlot(UnsafeCell<CallchainEntry>);

// Safety: an entry is only written through `PerCpuSlotTable::entry_ptr`, whose
// caller must hold the context slot for that (cpu, context) pair. Slots are
// handed out exclusively by the recursion guard.
unsafe impl Sync for EntrySlot {}

struct CpuRow {
    node: Option<NodeId>,
    entries: Box<[EntrySlot]>,
}

/// Pre-allocated callchain entries for every (processor, context) pair
pub struct PerCpuSlotTable {
    rows: Box<[CpuRow]>,
    contexts: usize,
    entry_capacity: usize,
}

impl PerCpuSlotTable {
    /// Allocate a full table shaped by `config` for every processor of `topology`
    ///
    /// # Errors
    /// Returns `PoolError::OutOfMemory` naming the first processor whose entry
    /// could not be allocated
    pub fn allocate<T: Topology + ?Sized>(
        topology: &T,
        config: &PoolConfig,
        allocator: &dyn NodeAllocator,
    ) -> Result<Self, PoolError> {
        config.validate()?;
        let cpus = topology.possible_cpus();
        let entry_bytes = config.entry_capacity * std::mem::size_of::<u64>();

        let mut rows = Vec::with_capacity(cpus);
        for index in 0..cpus {
            let cpu = CpuId(u32::try_from(index).map_err(|_| PoolError::CpuOutOfRange {
                cpu: CpuId(u32::MAX),
                cpus,
            })?);
            let node = topology.node_of(cpu);

            let mut entries = Vec::with_capacity(config.contexts);
            for _ in 0..config.contexts {
                // Dropping `rows` and `entries` on the error path frees every
                // entry allocated for this table so far.
                let ips = allocator
                    .allocate(cpu, node, config.entry_capacity)
                    .ok_or(PoolError::OutOfMemory { cpu, bytes: entry_bytes })?;
                entries.push(EntrySlot(UnsafeCell::new(CallchainEntry::from_storage(ips))));
            }

            rows.push(CpuRow { node, entries: entries.into_boxed_slice() });
        }

        let table = Self {
            rows: rows.into_boxed_slice(),
            contexts: config.contexts,
            entry_capacity: config.entry_capacity,
        };
        debug!(
            "Allocated callchain table: {cpus} CPUs x {} contexts x {} ips over {} memory nodes",
            table.contexts,
            table.entry_capacity,
            table.node_count()
        );
        Ok(table)
    }

    /// Number of processor rows
    #[must_use]
    pub fn cpus(&self) -> usize {
        self.rows.len()
    }

    /// Entries per processor row
    #[must_use]
    pub fn contexts(&self) -> usize {
        self.contexts
    }

    /// Capacity of every entry in the table
    #[must_use]
    pub fn entry_capacity(&self) -> usize {
        self.entry_capacity
    }

    /// Memory node recorded for `cpu`'s row
    #[must_use]
    pub fn node_of(&self, cpu: CpuId) -> Option<NodeId> {
        self.rows.get(cpu.index()).and_then(|row| row.node)
    }

    fn node_count(&self) -> usize {
        let mut nodes: Vec<NodeId> = self.rows.iter().filter_map(|row| row.node).collect();
        nodes.sort_unstable();
        nodes.dedup();
        nodes.len()
    }

    /// The entry reserved for `ctx` on `cpu`
    ///
    /// Dereferencing the pointer is only sound while the caller holds the
    /// context slot for `(cpu, ctx)` and a reference to the generation that
    /// owns this table.
    pub(crate) fn entry_ptr(&self, cpu: CpuId, ctx: Context) -> Option<NonNull<CallchainEntry>> {
        let slot = self.rows.get(cpu.index())?.entries.get(ctx.index())?;
        NonNull::new(slot.0.get())
    }
}

impl fmt::Debug for PerCpuSlotTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PerCpuSlotTable")
            .field("cpus", &self.cpus())
            .field("contexts", &self.contexts)
            .field("entry_capacity", &self.entry_capacity)
            .finish_non_exhaustive()
    }
}
