//! Simulated register state and tasks for driving captures without a kernel

use crate::capture::{RegisterSnapshot, TaskView};
use crate::domain::{CpuId, TaskId};

/// Register snapshot that only knows which address space it was taken in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimRegs {
    pub untrusted: bool,
}

impl SimRegs {
    /// Taken while executing trusted code
    #[must_use]
    pub fn trusted() -> Self {
        Self { untrusted: false }
    }

    /// Taken while executing untrusted code
    #[must_use]
    pub fn untrusted() -> Self {
        Self { untrusted: true }
    }
}

impl RegisterSnapshot for SimRegs {
    fn is_untrusted(&self) -> bool {
        self.untrusted
    }
}

/// A task pinned to one simulated processor
#[derive(Debug, Clone)]
pub struct SimTask {
    id: TaskId,
    saved: Option<SimRegs>,
}

impl SimTask {
    /// Task with an untrusted address space
    #[must_use]
    pub fn user(id: TaskId) -> Self {
        Self { id, saved: Some(SimRegs::untrusted()) }
    }

    /// Task with no untrusted address space (a kernel thread)
    #[must_use]
    pub fn kernel(id: TaskId) -> Self {
        Self { id, saved: None }
    }

    /// The task the stress workload runs on `cpu`
    #[must_use]
    pub fn for_cpu(cpu: CpuId) -> Self {
        Self::user(TaskId(1000 + u64::from(cpu.0)))
    }
}

impl TaskView for SimTask {
    type Snapshot = SimRegs;

    fn id(&self) -> TaskId {
        self.id
    }

    fn has_untrusted_address_space(&self) -> bool {
        self.saved.is_some()
    }

    fn saved_untrusted_snapshot(&self) -> Option<&SimRegs> {
        self.saved.as_ref()
    }
}

/// Synthetic trusted frame address, unique per (cpu, depth, index)
#[must_use]
pub fn trusted_ip(cpu: CpuId, depth: usize, index: usize) -> u64 {
    0xffff_8000_0000_0000 | frame_bits(cpu, depth, index)
}

/// Synthetic untrusted frame address, unique per (cpu, depth, index)
#[must_use]
pub fn untrusted_ip(cpu: CpuId, depth: usize, index: usize) -> u64 {
    0x0000_5500_0000_0000 | frame_bits(cpu, depth, index)
}

fn frame_bits(cpu: CpuId, depth: usize, index: usize) -> u64 {
    (u64::from(cpu.0 & 0xff_ffff) << 24) | ((depth as u64 & 0xff) << 16) | (index as u64 & 0xffff)
}
