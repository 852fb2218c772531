//! # Stress Workload
//!
//! One thread per simulated processor issues captures against a shared pool.
//! Interrupts are simulated from inside the trusted walker: part-way through
//! walking, the walker starts another capture on the same processor, which
//! must land in the next context's entry and leave the interrupted entry
//! untouched.
//!
//! ```text
//! CPU n thread:  capture(depth 0) ─▶ walk_trusted ─┬─ frames 0..k/2
//!                                                  ├─ capture(depth 1) ─▶ ...
//!                                                  └─ frames k/2..k
//! churn thread:  register ─▶ resize ─▶ release ─▶ register ─▶ ...
//! ```
//!
//! Every captured entry is compared against the frames that were walked into
//! it; a mismatch counts as corruption.

use anyhow::{Context, Result};
use callchain_common::{CONTEXT_MARKER_TRUSTED, CONTEXT_MARKER_UNTRUSTED};
use crossbeam_channel::{bounded, unbounded, Sender, TryRecvError};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::thread;
use std::time::Instant;

use super::report::{CpuReport, CpuTally, StressReport};
use super::sim::{trusted_ip, untrusted_ip, SimRegs, SimTask};
use crate::capture::{CaptureRequest, CaptureSite, FrameWalker, TaskView};
use crate::config::{PoolConfig, MAX_ENTRY_CAPACITY};
use crate::domain::{CaptureDropped, CpuId, TaskId};
use crate::pool::{CallchainEntry, CallchainPool};
use crate::topology::{FixedTopology, Topology};

/// Parameters of one stress run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StressConfig {
    /// Simulated processors; `None` uses the host's possible CPUs
    pub cpus: Option<usize>,
    pub pool: PoolConfig,
    /// Long-lived consumers registered for the whole run
    pub consumers: usize,
    /// Top-level captures per processor
    pub captures_per_cpu: u64,
    /// Capture levels attempted per top-level capture (1 = no interrupts)
    pub nesting: usize,
    /// Trusted and untrusted frames walked per level
    pub frames: usize,
    /// Run a thread that keeps registering, resizing and releasing
    pub churn: bool,
    /// Bind every n-th top-level capture to another task (0 = never)
    pub cross_task_every: u64,
}

impl StressConfig {
    /// Check the workload shape; the pool shape is checked by the pool
    ///
    /// # Errors
    /// Returns an error for zero nesting or more frames per level than any
    /// entry can hold
    pub fn validate(&self) -> Result<()> {
        if self.nesting == 0 {
            anyhow::bail!("nesting must be at least 1");
        }
        if self.frames > MAX_ENTRY_CAPACITY {
            anyhow::bail!("frames must be at most {MAX_ENTRY_CAPACITY}, got {}", self.frames);
        }
        Ok(())
    }
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            cpus: None,
            pool: PoolConfig::default(),
            consumers: 1,
            captures_per_cpu: 10_000,
            nesting: 4,
            frames: 16,
            churn: false,
            cross_task_every: 0,
        }
    }
}

/// Run the workload on simulated (or host-sized) processors
///
/// # Errors
/// Returns an error for an invalid configuration, if the host topology
/// cannot be read, or if a consumer cannot be registered
pub fn run(config: &StressConfig) -> Result<StressReport> {
    config.validate()?;
    match config.cpus {
        Some(cpus) => {
            let pool = CallchainPool::new(FixedTopology::new(cpus), config.pool)
                .context("Failed to create callchain pool")?;
            run_on(&pool, config)
        }
        None => {
            let pool = CallchainPool::for_host(config.pool)?;
            run_on(&pool, config)
        }
    }
}

/// Run the workload against an existing pool
///
/// The pool should have no registered consumers; every consumer registered
/// here is released before the report is taken.
///
/// # Errors
/// Returns an error if a consumer cannot be registered or a thread panics
pub fn run_on<T: Topology>(pool: &CallchainPool<T>, config: &StressConfig) -> Result<StressReport> {
    let cpus = pool.topology().possible_cpus();
    let cpu_ids = (0..cpus)
        .map(|index| u32::try_from(index).map(CpuId))
        .collect::<Result<Vec<_>, _>>()
        .context("CPU index out of range")?;
    info!(
        "Stressing {cpus} CPUs: {} captures each, nesting {}, {} frames, churn {}",
        config.captures_per_cpu, config.nesting, config.frames, config.churn
    );

    let handles = (0..config.consumers)
        .map(|_| pool.register())
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to register stress consumers")?;

    let started = Instant::now();
    let (tally_tx, tally_rx) = unbounded();
    let (done_tx, done_rx) = bounded::<()>(0);

    let (per_cpu, churn_cycles) = thread::scope(|s| -> Result<(Vec<CpuReport>, u64)> {
        let churn = config.churn.then(|| {
            let capacities = [config.pool.entry_capacity, (config.pool.entry_capacity / 2).max(1)];
            s.spawn(move || {
                let mut cycles = 0u64;
                while let Err(TryRecvError::Empty) = done_rx.try_recv() {
                    churn_once(pool, capacities[usize::from(cycles % 2 == 1)]);
                    cycles += 1;
                    thread::yield_now();
                }
                cycles
            })
        });

        for cpu in cpu_ids {
            let tx = tally_tx.clone();
            s.spawn(move || CpuWorker::new(pool, cpu, config).run(&tx));
        }
        drop(tally_tx);

        let mut per_cpu: Vec<CpuReport> = tally_rx.iter().collect();
        per_cpu.sort_by_key(|report| report.cpu);

        drop(done_tx);
        let cycles = match churn {
            Some(handle) => {
                handle.join().map_err(|_| anyhow::anyhow!("Churn thread panicked"))?
            }
            None => 0,
        };
        Ok((per_cpu, cycles))
    })?;

    if per_cpu.len() != cpus {
        anyhow::bail!("{} of {cpus} CPU workers did not report", cpus - per_cpu.len());
    }

    drop(handles);
    let freed = pool.synchronize();
    debug!("Final reclamation freed {freed} generation(s)");

    let mut totals = CpuTally::default();
    for report in &per_cpu {
        totals += report.tally;
    }
    let pool_config = pool.config();

    Ok(StressReport {
        cpus,
        contexts: pool_config.contexts,
        entry_capacity: pool_config.entry_capacity,
        consumers: config.consumers,
        captures_per_cpu: config.captures_per_cpu,
        nesting: config.nesting,
        frames: config.frames,
        churn_cycles,
        elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        totals,
        per_cpu,
        pool: pool.stats(),
    })
}

/// One register / resize / release cycle
fn churn_once<T: Topology>(pool: &CallchainPool<T>, entry_capacity: usize) {
    match pool.register() {
        Ok(handle) => {
            if let Err(e) = handle.pool().resize(entry_capacity) {
                warn!("Resize to {entry_capacity} ips failed: {e}");
            }
        }
        Err(e) => warn!("Churn registration failed: {e}"),
    }
}

/// Capture loop of one simulated processor
struct CpuWorker<'p, T: Topology> {
    pool: &'p CallchainPool<T>,
    cpu: CpuId,
    task: SimTask,
    config: &'p StressConfig,
    depth: Cell<usize>,
    tally: RefCell<CpuTally>,
}

impl<'p, T: Topology> CpuWorker<'p, T> {
    fn new(pool: &'p CallchainPool<T>, cpu: CpuId, config: &'p StressConfig) -> Self {
        Self {
            pool,
            cpu,
            task: SimTask::for_cpu(cpu),
            config,
            depth: Cell::new(0),
            tally: RefCell::new(CpuTally::default()),
        }
    }

    fn run(self, tx: &Sender<CpuReport>) {
        let every = self.config.cross_task_every;
        for i in 1..=self.config.captures_per_cpu {
            self.capture_at(0, every > 0 && i % every == 0);
        }

        let report = CpuReport { cpu: self.cpu, tally: self.tally.into_inner() };
        if tx.send(report).is_err() {
            warn!("Stress collector went away before {} reported", report.cpu);
        }
    }

    fn capture_at(&self, depth: usize, cross_task: bool) {
        let regs = SimRegs::trusted();
        let triggering = if cross_task { TaskId(self.task_id().0 + 1) } else { self.task_id() };
        let site = CaptureSite::new(&regs, &self.task).on_cpu(self.cpu).bound_to(triggering);

        let outer = self.depth.replace(depth);
        let result = self.pool.try_capture(&site, CaptureRequest::for_event(false, false), self);
        self.depth.set(outer);

        let mut tally = self.tally.borrow_mut();
        match result {
            Ok(chain) => {
                tally.captured += 1;
                if depth > 0 {
                    tally.nested += 1;
                }
                if cross_task {
                    tally.cross_task += 1;
                }
                if chain.is_full() {
                    tally.truncated += 1;
                }
                if chain.ips() != self.expected(depth, !cross_task, chain.capacity()).as_slice() {
                    tally.corrupted += 1;
                }
            }
            Err(CaptureDropped::RecursionOverflow(_)) => tally.overflowed += 1,
            Err(CaptureDropped::Uninitialized) => tally.uninitialized += 1,
            Err(e) => warn!("Unexpected capture drop on {}: {e}", self.cpu),
        }
    }

    fn task_id(&self) -> TaskId {
        self.task.id()
    }

    /// What a capture at `depth` should contain
    fn expected(&self, depth: usize, untrusted: bool, capacity: usize) -> Vec<u64> {
        let frames = self.config.frames;
        let mut ips = Vec::with_capacity(2 * frames + 2);
        ips.push(CONTEXT_MARKER_TRUSTED);
        ips.extend((0..frames).map(|i| trusted_ip(self.cpu, depth, i)));
        if untrusted {
            ips.push(CONTEXT_MARKER_UNTRUSTED);
            ips.extend((0..frames).map(|i| untrusted_ip(self.cpu, depth, i)));
        }
        ips.truncate(capacity);
        ips
    }
}

impl<T: Topology> FrameWalker<SimRegs> for CpuWorker<'_, T> {
    fn walk_trusted(&self, entry: &mut CallchainEntry, _snapshot: &SimRegs) {
        let depth = self.depth.get();
        let frames = self.config.frames;
        let split = frames / 2;

        for i in 0..split {
            entry.push(trusted_ip(self.cpu, depth, i));
        }
        // An interrupt arrives mid-walk
        if depth + 1 < self.config.nesting {
            self.capture_at(depth + 1, false);
        }
        for i in split..frames {
            entry.push(trusted_ip(self.cpu, depth, i));
        }
    }

    fn walk_untrusted(&self, entry: &mut CallchainEntry, _snapshot: &SimRegs) {
        let depth = self.depth.get();
        for i in 0..self.config.frames {
            entry.push(untrusted_ip(self.cpu, depth, i));
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    fn config(cpus: usize) -> StressConfig {
        StressConfig { cpus: Some(cpus), captures_per_cpu: 50, frames: 4, ..StressConfig::default() }
    }

    #[test]
    fn test_nesting_within_budget_never_overflows() {
        let report = run(&config(2)).unwrap();
        assert!(report.is_clean());
        // 4 levels per top-level capture
        assert_eq!(report.totals.captured, 2 * 50 * 4);
        assert_eq!(report.totals.nested, 2 * 50 * 3);
        assert_eq!(report.totals.overflowed, 0);
        assert_eq!(report.pool.generations_allocated, 1);
        assert_eq!(report.pool.generations_reclaimed, 1);
        assert_eq!(report.pool.consumers, 0);
    }

    #[test]
    fn test_nesting_past_budget_overflows_once_per_sample() {
        let report = run(&StressConfig { nesting: 6, ..config(1) }).unwrap();
        assert!(report.is_clean());
        assert_eq!(report.totals.captured, 50 * 4);
        // The fifth level overflows; the sixth is never reached
        assert_eq!(report.totals.overflowed, 50);
    }

    #[test]
    fn test_without_consumers_every_capture_is_dropped() {
        let report = run(&StressConfig { consumers: 0, nesting: 1, ..config(2) }).unwrap();
        assert_eq!(report.totals.captured, 0);
        assert_eq!(report.totals.uninitialized, 100);
        assert_eq!(report.pool.generations_allocated, 0);
    }

    #[test]
    fn test_cross_task_captures_omit_untrusted_frames() {
        let report =
            run(&StressConfig { nesting: 1, cross_task_every: 5, ..config(1) }).unwrap();
        assert!(report.is_clean());
        assert_eq!(report.totals.cross_task, 10);
    }

    #[test]
    fn test_small_entries_truncate_cleanly() {
        let pool = PoolConfig::default().with_entry_capacity(3);
        let report = run(&StressConfig { pool, nesting: 2, ..config(1) }).unwrap();
        assert!(report.is_clean());
        assert_eq!(report.totals.truncated, report.totals.captured);
    }

    #[test]
    fn test_churn_keeps_entries_intact() {
        let report = run(&StressConfig {
            churn: true,
            captures_per_cpu: 500,
            ..config(4)
        })
        .unwrap();
        assert!(report.is_clean());
        assert_eq!(report.totals.corrupted, 0);
        assert_eq!(report.pool.consumers, 0);
        assert_eq!(report.pool.current, None);
    }

    #[test]
    fn test_rejects_zero_nesting() {
        assert!(run(&StressConfig { nesting: 0, ..config(1) }).is_err());
    }

    #[test]
    fn test_rejects_unbounded_frames() {
        let err = run(&StressConfig { frames: usize::MAX, ..config(1) }).unwrap_err();
        assert!(err.to_string().contains("frames must be at most"));
        assert!(StressConfig { frames: MAX_ENTRY_CAPACITY, ..config(1) }.validate().is_ok());
    }
}
