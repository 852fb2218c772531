//! # callchain-stress - Main Entry Point
//!
//! Runs the stress workload and prints a summary:
//! - **Interactive** (default): summary on stdout, progress through `RUST_LOG`
//! - **Export** (`--export report.json`): full per-CPU report as JSON
//!
//! Exits non-zero if any captured entry was corrupted or a retired generation
//! was never freed.

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::fs::File;
use std::io::BufWriter;

use callchain::cli::Args;
use callchain::stress;

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    let msg = err.to_string().to_lowercase();
    if msg.contains("invalid pool configuration") || msg.contains("must be at least") {
        EXIT_USAGE
    } else {
        EXIT_ERROR
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    let config = args.stress_config()?;
    let report = stress::run(&config)?;

    if let Some(path) = &args.export {
        let file =
            File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
        report.export(BufWriter::new(file))?;
        info!("✓ Report written to {}", path.display());
    }

    if !args.quiet {
        for line in report.summary() {
            println!("{line}");
        }
    }

    if !report.is_clean() {
        anyhow::bail!(
            "Stress run failed: {} corrupted entries, {} generations never reclaimed",
            report.totals.corrupted,
            report.pool.pending_reclaim
        );
    }
    Ok(())
}
