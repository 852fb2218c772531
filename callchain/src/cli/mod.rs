//! Command-line interface for callchain-stress
//!
//! This module contains CLI argument parsing and configuration

pub mod args;

pub use args::Args;
