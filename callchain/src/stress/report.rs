//! Stress run results and JSON export

use anyhow::{Context, Result};
use serde::Serialize;
use std::io::Write;
use std::ops::AddAssign;

use crate::domain::CpuId;
use crate::pool::PoolStats;

/// Capture outcomes on one simulated processor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CpuTally {
    /// Captures that produced an entry
    pub captured: u64,
    /// Of those, captures taken from a nested (interrupt) level
    pub nested: u64,
    /// Captures dropped because every context was held
    pub overflowed: u64,
    /// Captures dropped because no buffers were published
    pub uninitialized: u64,
    /// Captures whose untrusted frames were withheld from another task
    pub cross_task: u64,
    /// Entries that filled up
    pub truncated: u64,
    /// Entries whose contents differed from what was walked
    pub corrupted: u64,
}

impl AddAssign for CpuTally {
    fn add_assign(&mut self, other: Self) {
        self.captured += other.captured;
        self.nested += other.nested;
        self.overflowed += other.overflowed;
        self.uninitialized += other.uninitialized;
        self.cross_task += other.cross_task;
        self.truncated += other.truncated;
        self.corrupted += other.corrupted;
    }
}

/// Tally of one processor, as sent back by its worker
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CpuReport {
    pub cpu: CpuId,
    #[serde(flatten)]
    pub tally: CpuTally,
}

/// Everything a stress run measured
#[derive(Debug, Clone, Serialize)]
pub struct StressReport {
    pub cpus: usize,
    pub contexts: usize,
    pub entry_capacity: usize,
    pub consumers: usize,
    pub captures_per_cpu: u64,
    pub nesting: usize,
    pub frames: usize,
    /// Register/resize/release cycles run by the churn thread
    pub churn_cycles: u64,
    pub elapsed_ms: u64,
    pub totals: CpuTally,
    pub per_cpu: Vec<CpuReport>,
    /// Pool counters after the final reclamation barrier
    pub pool: PoolStats,
}

impl StressReport {
    /// No entry was corrupted and every retired generation was freed
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.totals.corrupted == 0
            && self.pool.pending_reclaim == 0
            && self.pool.generations_reclaimed == self.pool.generations_retired
    }

    /// Write the report as pretty-printed JSON
    ///
    /// # Errors
    /// Returns an error if serialization or the write fails
    pub fn export<W: Write>(&self, writer: W) -> Result<()> {
        serde_json::to_writer_pretty(writer, self).context("Failed to write stress report JSON")?;
        Ok(())
    }

    /// Human-readable summary lines
    #[must_use]
    pub fn summary(&self) -> Vec<String> {
        let t = &self.totals;
        vec![
            format!(
                "{} CPUs x {} contexts x {} ips, {} consumer(s), {} ms",
                self.cpus, self.contexts, self.entry_capacity, self.consumers, self.elapsed_ms
            ),
            format!(
                "captured {} ({} nested, {} truncated, {} cross-task)",
                t.captured, t.nested, t.truncated, t.cross_task
            ),
            format!("dropped {} (overflow), {} (uninitialized)", t.overflowed, t.uninitialized),
            format!(
                "generations: {} allocated, {} retired, {} reclaimed, {} churn cycles",
                self.pool.generations_allocated,
                self.pool.generations_retired,
                self.pool.generations_reclaimed,
                self.churn_cycles
            ),
            format!("corrupted entries: {}", t.corrupted),
        ]
    }
}
