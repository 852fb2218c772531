#![cfg(not(loom))]

use callchain::capture::{CaptureRequest, CaptureSite, FrameWalker};
use callchain::domain::{CaptureDropped, CpuId, TaskId};
use callchain::stress::{SimRegs, SimTask};
use callchain::topology::FixedTopology;
use callchain::{CallchainEntry, CallchainPool, PoolConfig};
use callchain_common::{Context, CONTEXT_MARKER_TRUSTED, CONTEXT_MARKER_UNTRUSTED};
use std::cell::{Cell, RefCell};

/// Walker appending fixed synthetic frames
struct Frames {
    trusted: Vec<u64>,
    untrusted: Vec<u64>,
}

impl FrameWalker<SimRegs> for Frames {
    fn walk_trusted(&self, entry: &mut CallchainEntry, _: &SimRegs) {
        for &ip in &self.trusted {
            entry.push(ip);
        }
    }

    fn walk_untrusted(&self, entry: &mut CallchainEntry, _: &SimRegs) {
        for &ip in &self.untrusted {
            entry.push(ip);
        }
    }
}

fn frames() -> Frames {
    Frames { trusted: vec![0xffff_1, 0xffff_2, 0xffff_3], untrusted: vec![0x401, 0x402] }
}

fn pool(cpus: usize) -> CallchainPool<FixedTopology> {
    CallchainPool::new(FixedTopology::new(cpus), PoolConfig::default()).expect("valid pool")
}

#[test]
fn test_two_cpu_scenario() {
    let pool = pool(2);
    pool.acquire().unwrap();
    pool.acquire().unwrap();
    assert_eq!(pool.stats().generations_allocated, 1);

    // Idle kernel thread: trusted frames only
    let idle = SimTask::kernel(TaskId(0));
    let regs = SimRegs::trusted();
    let site = CaptureSite::new(&regs, &idle).on_cpu(CpuId(1));
    let request = CaptureRequest::for_event(false, true).with_markers(false);
    {
        let chain = pool.capture(&site, request, &frames()).unwrap();
        assert_eq!(chain.len(), 3);
        assert_eq!(chain.ips(), &[0xffff_1, 0xffff_2, 0xffff_3]);
    }

    pool.release();
    pool.release();
    let stats = pool.stats();
    assert_eq!(stats.generations_retired, 1);
    assert_eq!(stats.generations_reclaimed, 1);

    pool.acquire().unwrap();
    assert_eq!(pool.stats().generations_allocated, 2);
    pool.release();
}

#[test]
fn test_marker_ordering() {
    let pool = pool(1);
    let _consumer = pool.register().unwrap();
    let task = SimTask::user(TaskId(5));
    let regs = SimRegs::trusted();
    let site = CaptureSite::new(&regs, &task).bound_to(TaskId(5));

    let chain = pool.capture(&site, CaptureRequest::for_event(false, false), &frames()).unwrap();
    assert_eq!(
        chain.ips(),
        &[
            CONTEXT_MARKER_TRUSTED,
            0xffff_1,
            0xffff_2,
            0xffff_3,
            CONTEXT_MARKER_UNTRUSTED,
            0x401,
            0x402
        ]
    );
}

#[test]
fn test_cross_task_rejection_keeps_trusted_frames() {
    let pool = pool(1);
    let _consumer = pool.register().unwrap();
    let task = SimTask::user(TaskId(5));
    let regs = SimRegs::trusted();
    let site = CaptureSite::new(&regs, &task).bound_to(TaskId(6));

    let chain = pool.capture(&site, CaptureRequest::for_event(false, false), &frames()).unwrap();
    assert_eq!(chain.ips(), &[CONTEXT_MARKER_TRUSTED, 0xffff_1, 0xffff_2, 0xffff_3]);
    drop(chain);

    // Rejection disabled: the other task's frames are recorded
    let request = CaptureRequest::for_event(false, false).rejecting_cross_task(false);
    let chain = pool.capture(&site, request, &frames()).unwrap();
    assert_eq!(chain.len(), 7);
}

#[test]
fn test_untrusted_only_from_untrusted_snapshot() {
    let pool = pool(1);
    let _consumer = pool.register().unwrap();
    let task = SimTask::user(TaskId(1));
    let regs = SimRegs::untrusted();
    let site = CaptureSite::new(&regs, &task);

    // Trusted requested but the snapshot has no trusted frames to offer
    let chain = pool.capture(&site, CaptureRequest::for_event(false, false), &frames()).unwrap();
    assert_eq!(chain.ips(), &[CONTEXT_MARKER_UNTRUSTED, 0x401, 0x402]);
}

#[test]
fn test_truncation_is_silent() {
    let pool =
        CallchainPool::new(FixedTopology::new(1), PoolConfig::default().with_entry_capacity(4))
            .unwrap();
    let _consumer = pool.register().unwrap();
    let task = SimTask::user(TaskId(1));
    let regs = SimRegs::trusted();
    let site = CaptureSite::new(&regs, &task);

    let chain = pool.capture(&site, CaptureRequest::for_event(false, false), &frames()).unwrap();
    assert!(chain.is_full());
    assert_eq!(chain.ips(), &[CONTEXT_MARKER_TRUSTED, 0xffff_1, 0xffff_2, 0xffff_3]);
}

#[test]
fn test_every_exit_path_releases_the_slot() {
    let pool = pool(1);
    let task = SimTask::user(TaskId(1));
    let regs = SimRegs::trusted();
    let site = CaptureSite::new(&regs, &task);
    let both = CaptureRequest::for_event(false, false);

    // Uninitialized: slot taken, then released
    let err = pool.try_capture(&site, both, &frames()).unwrap_err();
    assert_eq!(err, CaptureDropped::Uninitialized);
    assert_eq!(pool.nesting_depth(CpuId(0)), 0);

    // Nothing requested: no slot taken at all
    let err = pool.try_capture(&site, CaptureRequest::default(), &frames()).unwrap_err();
    assert_eq!(err, CaptureDropped::NothingRequested);
    assert_eq!(pool.nesting_depth(CpuId(0)), 0);

    // Success: slot held exactly as long as the entry
    let _consumer = pool.register().unwrap();
    let chain = pool.capture(&site, both, &frames()).unwrap();
    assert_eq!(pool.nesting_depth(CpuId(0)), 1);
    drop(chain);
    assert_eq!(pool.nesting_depth(CpuId(0)), 0);

    // Cross-task early stop still releases
    let bound = CaptureSite::new(&regs, &task).bound_to(TaskId(2));
    drop(pool.capture(&bound, both, &frames()));
    assert_eq!(pool.nesting_depth(CpuId(0)), 0);
}

/// Re-enters the capture from inside the trusted walk, like an interrupt
struct Interrupting<'p> {
    pool: &'p CallchainPool<FixedTopology>,
    levels: usize,
    depth: Cell<usize>,
    seen: RefCell<Vec<Result<Context, CaptureDropped>>>,
}

impl FrameWalker<SimRegs> for Interrupting<'_> {
    fn walk_trusted(&self, entry: &mut CallchainEntry, snapshot: &SimRegs) {
        let depth = self.depth.get();
        entry.push(0x1000 + depth as u64);
        if depth + 1 < self.levels {
            self.depth.set(depth + 1);
            let task = SimTask::kernel(TaskId(0));
            let site = CaptureSite::new(snapshot, &task);
            let request = CaptureRequest::for_event(false, true).with_markers(false);
            let outcome = self.pool.try_capture(&site, request, self).map(|chain| {
                let nested = depth as u64 + 1;
                assert_eq!(chain.ips(), &[0x1000 + nested, 0x2000 + nested]);
                chain.context()
            });
            self.seen.borrow_mut().push(outcome);
            self.depth.set(depth);
        }
        entry.push(0x2000 + depth as u64);
    }
}

#[test]
fn test_recursion_bound_under_nested_captures() {
    let pool = pool(1);
    let _consumer = pool.register().unwrap();
    let walker = Interrupting { pool: &pool, levels: 6, depth: Cell::new(0), seen: RefCell::default() };
    let task = SimTask::kernel(TaskId(0));
    let regs = SimRegs::trusted();
    let site = CaptureSite::new(&regs, &task);
    let request = CaptureRequest::for_event(false, true).with_markers(false);

    let chain = pool.try_capture(&site, request, &walker).unwrap();
    assert_eq!(chain.context(), Context::Task);
    // The interrupted entry is untouched by the nested captures
    assert_eq!(chain.ips(), &[0x1000, 0x2000]);
    drop(chain);

    // Innermost first: the fifth level overflowed, the others got the next context
    let seen = walker.seen.into_inner();
    assert_eq!(
        seen,
        vec![
            Err(CaptureDropped::RecursionOverflow(callchain::domain::RecursionOverflow {
                cpu: CpuId(0)
            })),
            Ok(Context::Nmi),
            Ok(Context::HardIrq),
            Ok(Context::SoftIrq),
        ]
    );

    // All four slots came back
    assert_eq!(pool.nesting_depth(CpuId(0)), 0);
    let again = pool.capture(&site, CaptureRequest::for_event(false, true), &frames()).unwrap();
    assert_eq!(again.context(), Context::Task);
}

#[test]
fn test_cpus_capture_independently() {
    let pool = pool(2);
    let _consumer = pool.register().unwrap();
    let task = SimTask::kernel(TaskId(0));
    let regs = SimRegs::trusted();
    let request = CaptureRequest::for_event(false, true);

    let site0 = CaptureSite::new(&regs, &task).on_cpu(CpuId(0));
    let site1 = CaptureSite::new(&regs, &task).on_cpu(CpuId(1));
    let a = pool.capture(&site0, request, &frames()).unwrap();
    let b = pool.capture(&site1, request, &frames()).unwrap();

    // Both at task level, in different rows
    assert_eq!(a.context(), Context::Task);
    assert_eq!(b.context(), Context::Task);
    assert_eq!(a.cpu(), CpuId(0));
    assert_eq!(b.cpu(), CpuId(1));
    assert_eq!(a.ips(), b.ips());
}
