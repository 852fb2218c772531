//! # Callchain - Per-CPU Callchain Buffer Pool
//!
//! Callchain provides the buffers a performance-monitoring subsystem captures
//! call stacks into. Captures run on every processor at once and can be
//! re-entered on one processor by nested interrupts, so the hot path never
//! allocates, locks or blocks: every (processor, nesting level) pair owns a
//! pre-allocated entry, and the buffers exist only while some monitoring event
//! needs them.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │               Monitoring events (consumers)                     │
//! │          acquire() / release()  ·  capture(site, request)        │
//! └──────────────┬───────────────────────────────┬──────────────────┘
//!                │ cold path (locked)            │ hot path (lock-free)
//!                ▼                               ▼
//! ┌──────────────────────────────┐  ┌───────────────────────────────┐
//! │        Pool Lifecycle        │  │       Callchain Capture       │
//! │  consumer count · generation │  │  markers · cross-task policy  │
//! │  allocation and retirement   │  │  platform frame walkers       │
//! └───────┬──────────────┬───────┘  └──────┬──────────────┬─────────┘
//!         │ publish      │ retire          │ enter/leave  │ load
//!         ▼              ▼                 ▼              ▼
//! ┌──────────────┐ ┌──────────────┐ ┌──────────────┐ ┌──────────────┐
//! │  Generation  │ │   Deferred   │ │  Recursion   │ │   Current    │
//! │ (slot table) │ │  Reclaimer   │ │    Guard     │ │  generation  │
//! └──────────────┘ └──────────────┘ └──────────────┘ └──────────────┘
//! ```
//!
//! ## Module Structure
//!
//! ### Core Modules
//!
//! - [`pool`]: Buffer pool internals and lifecycle
//!   - `lifecycle`: [`CallchainPool`], reference-counted allocation and teardown
//!   - `slot_table` / `generation`: Immutable per-CPU entry tables
//!   - `recursion`: Per-CPU context slots for nested captures
//!   - `reclaim`: Deferred reclamation of retired generations
//!
//! - [`capture`]: One capture, from slot acquisition to marker placement
//!
//! - [`topology`]: Possible CPUs, current CPU and memory nodes (`/sys` or fixed)
//!
//! ### Supporting Modules
//!
//! - [`config`]: Pool shape ([`PoolConfig`])
//! - [`domain`]: Core domain types (CpuId, NodeId, TaskId, GenerationId) and errors
//! - [`stress`]: Multi-threaded stress driver behind the `callchain-stress` binary
//! - [`cli`]: Command-line argument parsing for `callchain-stress`
//!
//! ## Typical Usage
//!
//! ```no_run
//! use callchain::capture::{CaptureRequest, CaptureSite};
//! use callchain::stress::{SimRegs, SimTask};
//! use callchain::{CallchainPool, PoolConfig};
//! # use callchain::domain::CpuId;
//! # struct Walker;
//! # impl callchain::capture::FrameWalker<SimRegs> for Walker {}
//!
//! # fn example() -> anyhow::Result<()> {
//! let pool = CallchainPool::for_host(PoolConfig::default())?;
//! let _consumer = pool.register()?;
//!
//! let task = SimTask::for_cpu(CpuId(0));
//! let regs = SimRegs::trusted();
//! let site = CaptureSite::new(&regs, &task);
//! if let Some(chain) = pool.capture(&site, CaptureRequest::for_event(false, false), &Walker) {
//!     println!("{} addresses", chain.len());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Key Concepts
//!
//! - **Context**: Nesting level a capture runs at; one entry per level per CPU
//! - **Generation**: One immutable instance of the per-CPU entry table
//! - **Grace period**: Time after which no CPU can still read a retired generation
//! - **Trusted / untrusted frames**: Kernel-side versus task-side call stack segments

// Expose modules for testing
pub mod capture;
pub mod cli;
pub mod config;
pub mod domain;
pub mod pool;
pub mod stress;
pub mod topology;

mod sync;

pub use capture::{CaptureRequest, CaptureSite, CapturedCallchain, FrameWalker};
pub use config::PoolConfig;
pub use pool::{CallchainEntry, CallchainPool, ConsumerHandle, PoolStats};
