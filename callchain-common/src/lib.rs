//! # Shared Callchain Definitions
//!
//! Constants and small plain types shared by every layer that produces or
//! consumes callchains: the buffer pool, the frame walkers plugged into it, and
//! whatever later decodes a captured chain. Nothing in here allocates, so the
//! crate stays `no_std` and usable from interrupt-context code.
//!
//! ## Key Items
//!
//! - [`Context`] - Nesting level a capture runs at (task, softirq, hardirq, NMI)
//! - [`MAX_STACK_DEPTH`] - Default capacity of one callchain entry
//! - [`CONTEXT_MARKER_TRUSTED`] / [`CONTEXT_MARKER_UNTRUSTED`] - Segment markers

#![no_std]

// ============================================================================
// Capacity Constants
// ============================================================================

/// Default maximum number of addresses held by one callchain entry
///
/// Matches the perf ABI's `PERF_MAX_STACK_DEPTH`. Walkers that produce more
/// frames than this are truncated silently.
pub const MAX_STACK_DEPTH: usize = 127;

/// Number of distinct nesting levels a processor can be in at once
///
/// One callchain buffer is reserved per level, so a capture interrupted by a
/// softirq, then a hardirq, then an NMI still gets four independent buffers.
pub const NR_CONTEXTS: usize = 4;

// ============================================================================
// Context Markers
// ============================================================================

/// Marker stored before frames walked from the trusted (kernel) address space
///
/// Same value as `PERF_CONTEXT_KERNEL` (`-128` as an unsigned address).
#[allow(clippy::cast_sign_loss)]
pub const CONTEXT_MARKER_TRUSTED: u64 = -128i64 as u64;

/// Marker stored before frames walked from the untrusted (user) address space
///
/// Same value as `PERF_CONTEXT_USER` (`-512` as an unsigned address).
#[allow(clippy::cast_sign_loss)]
pub const CONTEXT_MARKER_UNTRUSTED: u64 = -512i64 as u64;

/// Lowest value in the reserved marker range
///
/// Any address at or above this value is a marker, never a real frame.
#[allow(clippy::cast_sign_loss)]
pub const CONTEXT_MARKER_MAX: u64 = -4095i64 as u64;

/// Whether `ip` falls in the reserved context-marker range
#[must_use]
pub const fn is_context_marker(ip: u64) -> bool {
    ip >= CONTEXT_MARKER_MAX
}

// ============================================================================
// Nesting Context
// ============================================================================

/// Interruption depth a capture is running at
///
/// The discriminant doubles as the index of the buffer reserved for that
/// level in every processor's row.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "user", serde(rename_all = "snake_case"))]
pub enum Context {
    /// Ordinary task context
    Task = 0,
    /// Deferred interrupt work
    SoftIrq = 1,
    /// Hardware interrupt handler
    HardIrq = 2,
    /// Non-maskable interrupt
    Nmi = 3,
}

impl Context {
    /// All levels, outermost first
    pub const ALL: [Context; NR_CONTEXTS] =
        [Context::Task, Context::SoftIrq, Context::HardIrq, Context::Nmi];

    /// Level for buffer index `index`, if it is in range
    #[must_use]
    pub const fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(Context::Task),
            1 => Some(Context::SoftIrq),
            2 => Some(Context::HardIrq),
            3 => Some(Context::Nmi),
            _ => None,
        }
    }

    /// Buffer index reserved for this level
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }
}
