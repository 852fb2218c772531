//! # Recursion Guard
//!
//! Hands out the per-processor context index a capture may use, so that a
//! capture interrupted by another capture on the same processor writes into a
//! different entry.
//!
//! Each processor has one busy mask with a bit per context. Entering claims
//! the lowest clear bit with a compare-and-swap; leaving clears it. With
//! properly nested interrupts the lowest clear bit is always the current
//! nesting depth, so the task-level capture gets index 0, a capture from an
//! interrupt on top of it gets index 1, and so on. When every bit is set the
//! nesting budget is exhausted and the capture is refused.
//!
//! Neither path allocates, locks or spins on another processor: the only
//! contention on a mask comes from nested entries on the same processor.

use std::fmt;

use callchain_common::Context;

use crate::domain::{CpuId, RecursionOverflow};
use crate::sync::{AtomicU32, Ordering};

/// Per-processor context slot allocator
pub struct RecursionGuard {
    masks: Box<[AtomicU32]>,
    full: u32,
}

impl RecursionGuard {
    /// Guard for `cpus` processors with `contexts` nesting levels each
    ///
    /// `contexts` is clamped to the number of [`Context`] levels.
    #[must_use]
    pub fn new(cpus: usize, contexts: usize) -> Self {
        let contexts = contexts.min(Context::ALL.len());
        let masks = (0..cpus).map(|_| AtomicU32::new(0)).collect();
        Self { masks, full: (1u32 << contexts) - 1 }
    }

    /// Claim a free context slot on `cpu`
    ///
    /// The slot is released when the returned [`ContextSlot`] is dropped (or
    /// [`ContextSlot::leave`] is called), on whichever path the caller exits.
    ///
    /// # Errors
    /// Returns `RecursionOverflow` when every context of `cpu` is held, or
    /// when `cpu` has no mask at all
    pub fn enter(&self, cpu: CpuId) -> Result<ContextSlot<'_>, RecursionOverflow> {
        let mask = self.masks.get(cpu.index()).ok_or(RecursionOverflow { cpu })?;

        let mut current = mask.load(Ordering::Relaxed);
        loop {
            let free = !current & self.full;
            if free == 0 {
                return Err(RecursionOverflow { cpu });
            }
            let bit = free.trailing_zeros();
            let Some(ctx) = Context::from_index(bit as usize) else {
                return Err(RecursionOverflow { cpu });
            };

            // Acquire pairs with the Release in `leave`: whatever the previous
            // holder wrote into the entry is visible before we overwrite it.
            match mask.compare_exchange_weak(
                current,
                current | (1 << bit),
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(ContextSlot { mask, cpu, ctx }),
                Err(actual) => current = actual,
            }
        }
    }

    /// Number of context slots currently held on `cpu`
    #[must_use]
    pub fn depth(&self, cpu: CpuId) -> usize {
        self.masks.get(cpu.index()).map_or(0, |mask| mask.load(Ordering::Relaxed).count_ones() as usize)
    }

    /// Number of context levels per processor
    #[must_use]
    pub fn contexts(&self) -> usize {
        self.full.count_ones() as usize
    }
}

impl fmt::Debug for RecursionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecursionGuard")
            .field("cpus", &self.masks.len())
            .field("contexts", &self.contexts())
            .finish()
    }
}

/// A held context slot; released exactly once, on drop
#[must_use = "dropping the slot releases it immediately"]
pub struct ContextSlot<'a> {
    mask: &'a AtomicU32,
    cpu: CpuId,
    ctx: Context,
}

impl ContextSlot<'_> {
    #[must_use]
    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    #[must_use]
    pub fn context(&self) -> Context {
        self.ctx
    }

    /// Release the slot now
    pub fn leave(self) {
        drop(self);
    }
}

impl Drop for ContextSlot<'_> {
    fn drop(&mut self) {
        self.mask.fetch_and(!(1u32 << self.ctx.index()), Ordering::Release);
    }
}

impl fmt::Debug for ContextSlot<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextSlot").field("cpu", &self.cpu).field("ctx", &self.ctx).finish()
    }
}
