//! Processor topology
//!
//! The pool needs three answers from the platform: how many processors can
//! ever run a capture, which one the caller is on right now, and which memory
//! node each processor is closest to.
//!
//! - [`HostTopology`] reads `/sys/devices/system/{cpu,node}` and asks the
//!   kernel for the current CPU with `sched_getcpu()`
//! - [`FixedTopology`] is a fixed processor count for simulations and tests

#![allow(unsafe_code)] // sched_getcpu() requires unsafe

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use crate::domain::{CpuId, NodeId};

/// Platform topology queries used by the pool
pub trait Topology: Send + Sync {
    /// Number of processor identifiers that may ever run a capture
    fn possible_cpus(&self) -> usize;

    /// Processor the caller is executing on
    fn current_cpu(&self) -> CpuId;

    /// Memory node local to `cpu`, when the platform exposes one
    fn node_of(&self, _cpu: CpuId) -> Option<NodeId> {
        None
    }
}

impl<T: Topology + ?Sized> Topology for &T {
    fn possible_cpus(&self) -> usize {
        (**self).possible_cpus()
    }

    fn current_cpu(&self) -> CpuId {
        (**self).current_cpu()
    }

    fn node_of(&self, cpu: CpuId) -> Option<NodeId> {
        (**self).node_of(cpu)
    }
}

/// Topology of the machine this process runs on
#[derive(Debug, Clone)]
pub struct HostTopology {
    possible: usize,
    nodes: Vec<Option<NodeId>>,
}

impl HostTopology {
    /// Discover possible CPUs and their memory nodes from `/sys`
    ///
    /// Missing node information is not an error: machines without NUMA
    /// simply report no node for any processor.
    ///
    /// # Errors
    /// Returns an error if `/sys/devices/system/cpu/possible` cannot be read or parsed
    pub fn detect() -> Result<Self> {
        let content = fs::read_to_string("/sys/devices/system/cpu/possible")
            .context("Failed to read /sys/devices/system/cpu/possible")?;
        let cpus = parse_cpu_list(&content)?;
        let possible = cpus.iter().map(|cpu| cpu.index() + 1).max().unwrap_or(1);

        let mut nodes = vec![None; possible];
        if let Err(e) = read_node_map(Path::new("/sys/devices/system/node"), &mut nodes) {
            log::debug!("No memory node information: {e:#}");
        }

        log::info!("✓ Detected {possible} possible CPUs");
        Ok(Self { possible, nodes })
    }
}

impl Topology for HostTopology {
    fn possible_cpus(&self) -> usize {
        self.possible
    }

    #[allow(clippy::cast_sign_loss)]
    fn current_cpu(&self) -> CpuId {
        let cpu = unsafe { libc::sched_getcpu() };
        if cpu < 0 || cpu as usize >= self.possible {
            return CpuId(0);
        }
        CpuId(cpu as u32)
    }

    fn node_of(&self, cpu: CpuId) -> Option<NodeId> {
        self.nodes.get(cpu.index()).copied().flatten()
    }
}

/// A fixed number of simulated processors
///
/// There is no notion of "the processor this thread runs on" in a
/// simulation, so [`Topology::current_cpu`] always answers CPU 0; drivers
/// choose the processor explicitly with
/// [`CaptureSite::on_cpu`](crate::capture::CaptureSite::on_cpu).
#[derive(Debug, Clone)]
pub struct FixedTopology {
    cpus: usize,
    cpus_per_node: Option<usize>,
}

impl FixedTopology {
    /// `cpus` processors on a single node
    #[must_use]
    pub fn new(cpus: usize) -> Self {
        Self { cpus, cpus_per_node: None }
    }

    /// Spread processors over nodes of `cpus_per_node` consecutive CPUs each
    #[must_use]
    pub fn with_nodes(cpus: usize, cpus_per_node: usize) -> Self {
        Self { cpus, cpus_per_node: Some(cpus_per_node.max(1)) }
    }
}

impl Topology for FixedTopology {
    fn possible_cpus(&self) -> usize {
        self.cpus
    }

    fn current_cpu(&self) -> CpuId {
        CpuId(0)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn node_of(&self, cpu: CpuId) -> Option<NodeId> {
        let per_node = self.cpus_per_node?;
        (cpu.index() < self.cpus).then(|| NodeId((cpu.index() / per_node) as u32))
    }
}

/// Parse a kernel CPU list such as `"0-3"` or `"0-3,8-11"` or `"5"`
///
/// # Errors
/// Returns an error if any element is not a number or a `start-end` range
pub fn parse_cpu_list(content: &str) -> Result<Vec<CpuId>> {
    let mut cpus = Vec::new();

    for range in content.trim().split(',').filter(|r| !r.is_empty()) {
        if let Some((start, end)) = range.split_once('-') {
            // Range like "0-3"
            let start: u32 = start.parse().with_context(|| format!("Bad CPU range: {range}"))?;
            let end: u32 = end.parse().with_context(|| format!("Bad CPU range: {range}"))?;
            for cpu in start..=end {
                cpus.push(CpuId(cpu));
            }
        } else {
            // Single CPU like "5"
            let cpu: u32 = range.parse().with_context(|| format!("Bad CPU number: {range}"))?;
            cpus.push(CpuId(cpu));
        }
    }

    Ok(cpus)
}

/// Fill `nodes` from `<root>/node<N>/cpulist`
fn read_node_map(root: &Path, nodes: &mut [Option<NodeId>]) -> Result<()> {
    let entries =
        fs::read_dir(root).with_context(|| format!("Failed to read {}", root.display()))?;

    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(node) = name.to_str().and_then(|n| n.strip_prefix("node")) else {
            continue;
        };
        let Ok(node) = node.parse::<u32>() else {
            continue;
        };

        let cpulist = fs::read_to_string(entry.path().join("cpulist"))
            .with_context(|| format!("Failed to read cpulist of node {node}"))?;
        for cpu in parse_cpu_list(&cpulist)? {
            if let Some(slot) = nodes.get_mut(cpu.index()) {
                *slot = Some(NodeId(node));
            }
        }
    }

    Ok(())
}
