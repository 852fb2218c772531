//! # Callchain Capture
//!
//! One capture, start to finish, on the processor the event fired on:
//!
//! ```text
//! ┌──────────┐  nothing requested            ┌──────────────────────┐
//! │  Start   │──────────────────────────────▶│ NothingRequested     │
//! └────┬─────┘                               └──────────────────────┘
//!      ▼
//! ┌──────────┐  every context held           ┌──────────────────────┐
//! │ Acquire  │──────────────────────────────▶│ RecursionOverflow    │
//! │  slot    │                               └──────────────────────┘
//! └────┬─────┘
//!      ▼
//! ┌──────────┐  no generation published      ┌──────────────────────┐
//! │ Resolve  │──────────────────────────────▶│ Uninitialized        │
//! │  entry   │  (slot released on the way)   └──────────────────────┘
//! └────┬─────┘
//!      ▼
//! ┌──────────┐  snapshot already untrusted: skipped
//! │ Trusted  │  [CONTEXT_MARKER_TRUSTED] trusted frames...
//! └────┬─────┘
//!      ▼
//! ┌──────────┐  no untrusted address space: skipped
//! │Untrusted │  cross-task: stop here, entry kept
//! │          │  [CONTEXT_MARKER_UNTRUSTED] untrusted frames...
//! └────┬─────┘
//!      ▼
//!   CapturedCallchain (slot + generation held until dropped)
//! ```
//!
//! Frame walking itself belongs to the platform: this module only decides
//! which address spaces to walk, hands the walker the entry to append to, and
//! guarantees the entry stays valid and exclusively owned while it does.
//!
//! Nothing on this path allocates, locks or logs.

#![allow(unsafe_code)] // entry access under a context slot and a generation reference

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::Arc;

use callchain_common::{Context, CONTEXT_MARKER_TRUSTED, CONTEXT_MARKER_UNTRUSTED};

use crate::domain::{CaptureDropped, CpuId, GenerationId, TaskId};
use crate::pool::{CallchainEntry, CallchainPool, ContextSlot, Generation};
use crate::topology::Topology;

/// Saved register state a capture starts from
pub trait RegisterSnapshot {
    /// Whether the snapshot was taken while executing in the untrusted
    /// (user) address space
    fn is_untrusted(&self) -> bool;
}

/// The task running on the processor when the event fired
pub trait TaskView {
    type Snapshot: RegisterSnapshot;

    fn id(&self) -> TaskId;

    /// Whether the task has an untrusted address space at all
    ///
    /// Kernel threads do not; there is nothing to walk for them.
    fn has_untrusted_address_space(&self) -> bool;

    /// Register state saved when the task last left its untrusted address space
    fn saved_untrusted_snapshot(&self) -> Option<&Self::Snapshot>;
}

/// Platform frame walkers
///
/// Both walkers append addresses to `entry` in walk order. The entry never
/// grows: once full, [`CallchainEntry::push`] drops further addresses, which
/// is the expected way to truncate a deep stack. The default implementations
/// walk nothing.
pub trait FrameWalker<S: ?Sized> {
    fn walk_trusted(&self, _entry: &mut CallchainEntry, _snapshot: &S) {}

    fn walk_untrusted(&self, _entry: &mut CallchainEntry, _snapshot: &S) {}
}

impl<S: ?Sized, W: FrameWalker<S> + ?Sized> FrameWalker<S> for &W {
    fn walk_trusted(&self, entry: &mut CallchainEntry, snapshot: &S) {
        (**self).walk_trusted(entry, snapshot);
    }

    fn walk_untrusted(&self, entry: &mut CallchainEntry, snapshot: &S) {
        (**self).walk_untrusted(entry, snapshot);
    }
}

/// What one capture should record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureRequest {
    /// Walk the trusted (kernel) address space
    pub trusted: bool,
    /// Walk the untrusted (user) address space
    pub untrusted: bool,
    /// Skip untrusted frames unless the running task is the one the event
    /// is bound to
    pub reject_cross_task: bool,
    /// Insert a context marker before each address-space segment
    pub add_markers: bool,
    /// Leading slots left zeroed for the caller to fill in
    pub reserved: usize,
}

impl CaptureRequest {
    /// Request for a monitoring event, from its exclusion flags
    ///
    /// Events always get markers and never record another task's
    /// untrusted frames.
    #[must_use]
    pub fn for_event(exclude_trusted: bool, exclude_untrusted: bool) -> Self {
        Self {
            trusted: !exclude_trusted,
            untrusted: !exclude_untrusted,
            reject_cross_task: true,
            add_markers: true,
            reserved: 0,
        }
    }

    #[must_use]
    pub fn with_markers(mut self, add_markers: bool) -> Self {
        self.add_markers = add_markers;
        self
    }

    #[must_use]
    pub fn rejecting_cross_task(mut self, reject: bool) -> Self {
        self.reject_cross_task = reject;
        self
    }

    #[must_use]
    pub fn with_reserved(mut self, reserved: usize) -> Self {
        self.reserved = reserved;
        self
    }

    /// Whether any address space is requested at all
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.trusted && !self.untrusted
    }
}

/// Where a capture happens: processor, register state and tasks involved
pub struct CaptureSite<'a, K: TaskView> {
    cpu: Option<CpuId>,
    snapshot: &'a K::Snapshot,
    running: &'a K,
    triggering: Option<TaskId>,
}

impl<'a, K: TaskView> CaptureSite<'a, K> {
    /// Capture `snapshot`, taken while `running` was on the processor
    ///
    /// The processor defaults to [`Topology::current_cpu`] and the event is
    /// not bound to any task.
    #[must_use]
    pub fn new(snapshot: &'a K::Snapshot, running: &'a K) -> Self {
        Self { cpu: None, snapshot, running, triggering: None }
    }

    /// Capture on `cpu` instead of asking the topology
    #[must_use]
    pub fn on_cpu(mut self, cpu: CpuId) -> Self {
        self.cpu = Some(cpu);
        self
    }

    /// The event is bound to `task`
    #[must_use]
    pub fn bound_to(mut self, task: TaskId) -> Self {
        self.triggering = Some(task);
        self
    }

    fn is_cross_task(&self) -> bool {
        self.triggering.is_some_and(|task| task != self.running.id())
    }
}

impl<K: TaskView> fmt::Debug for CaptureSite<'_, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureSite")
            .field("cpu", &self.cpu)
            .field("running", &self.running.id())
            .field("triggering", &self.triggering)
            .finish_non_exhaustive()
    }
}

/// A completed capture
///
/// Borrows the processor's entry for its context level. The slot and the
/// generation are released together when this is dropped, so consume it
/// before the next capture at the same level on the same processor.
pub struct CapturedCallchain<'p> {
    entry: NonNull<CallchainEntry>,
    generation: Arc<Generation>,
    slot: ContextSlot<'p>,
}

impl CapturedCallchain<'_> {
    /// Generation the entry belongs to
    #[must_use]
    pub fn generation(&self) -> GenerationId {
        self.generation.id()
    }

    #[must_use]
    pub fn cpu(&self) -> CpuId {
        self.slot.cpu()
    }

    /// Nesting level the capture ran at
    #[must_use]
    pub fn context(&self) -> Context {
        self.slot.context()
    }
}

impl Deref for CapturedCallchain<'_> {
    type Target = CallchainEntry;

    fn deref(&self) -> &CallchainEntry {
        // Safety: `slot` makes this the only user of the entry and
        // `generation` keeps the table it lives in allocated.
        unsafe { self.entry.as_ref() }
    }
}

impl DerefMut for CapturedCallchain<'_> {
    fn deref_mut(&mut self) -> &mut CallchainEntry {
        // Safety: as in `deref`
        unsafe { self.entry.as_mut() }
    }
}

impl fmt::Debug for CapturedCallchain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapturedCallchain")
            .field("generation", &self.generation())
            .field("cpu", &self.cpu())
            .field("context", &self.context())
            .field("entry", &**self)
            .finish()
    }
}

impl<T: Topology> CallchainPool<T> {
    /// Capture a callchain, or nothing
    ///
    /// Every reason for not producing an entry is a silent drop; use
    /// [`try_capture`](Self::try_capture) to learn which one it was.
    pub fn capture<K, W>(
        &self,
        site: &CaptureSite<'_, K>,
        request: CaptureRequest,
        walker: &W,
    ) -> Option<CapturedCallchain<'_>>
    where
        K: TaskView,
        W: FrameWalker<K::Snapshot> + ?Sized,
    {
        self.try_capture(site, request, walker).ok()
    }

    /// Capture a callchain, reporting why none was produced
    ///
    /// # Errors
    /// Returns the reason the capture was dropped. None of them is a fault.
    pub fn try_capture<K, W>(
        &self,
        site: &CaptureSite<'_, K>,
        request: CaptureRequest,
        walker: &W,
    ) -> Result<CapturedCallchain<'_>, CaptureDropped>
    where
        K: TaskView,
        W: FrameWalker<K::Snapshot> + ?Sized,
    {
        if request.is_empty() {
            return Err(CaptureDropped::NothingRequested);
        }

        let cpus = self.topology().possible_cpus();
        let cpu = site.cpu.unwrap_or_else(|| self.topology().current_cpu());
        if cpu.index() >= cpus {
            return Err(CaptureDropped::CpuOutOfRange { cpu, cpus });
        }

        let slot = self.recursion().enter(cpu)?;
        let generation = self.current().load().ok_or(CaptureDropped::Uninitialized)?;
        let mut entry_ptr = generation
            .table()
            .entry_ptr(cpu, slot.context())
            .ok_or(CaptureDropped::Uninitialized)?;
        // Safety: `slot` grants exclusive use of (cpu, context) and
        // `generation` keeps the table alive; both outlive this borrow.
        let entry = unsafe { entry_ptr.as_mut() };

        entry.reset(request.reserved);
        let snapshot = site.snapshot;

        if request.trusted && !snapshot.is_untrusted() {
            if request.add_markers {
                entry.push(CONTEXT_MARKER_TRUSTED);
            }
            walker.walk_trusted(entry, snapshot);
        }

        if request.untrusted {
            let untrusted = if snapshot.is_untrusted() {
                Some(snapshot)
            } else if site.running.has_untrusted_address_space() {
                site.running.saved_untrusted_snapshot()
            } else {
                None
            };

            if let Some(untrusted) = untrusted {
                if !(request.reject_cross_task && site.is_cross_task()) {
                    if request.add_markers {
                        entry.push(CONTEXT_MARKER_UNTRUSTED);
                    }
                    walker.walk_untrusted(entry, untrusted);
                }
            }
        }

        Ok(CapturedCallchain { entry: entry_ptr, generation, slot })
    }
}
