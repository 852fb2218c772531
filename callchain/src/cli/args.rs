//! CLI argument definitions

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use crate::stress::StressConfig;

#[derive(Parser, Debug)]
#[command(
    name = "callchain-stress",
    about = "Stress the per-CPU callchain buffer pool with nested captures",
    after_help = "\
EXAMPLES:
    callchain-stress                              One worker per host CPU
    callchain-stress --cpus 8 --nesting 5         Overflow the context budget
    callchain-stress --churn --export run.json    Resize while capturing, save report"
)]
pub struct Args {
    /// Load the stress configuration from a JSON file (flags override it)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Simulated CPUs (default: possible CPUs of this host)
    #[arg(long)]
    pub cpus: Option<usize>,

    /// Nesting contexts per CPU (1-4)
    #[arg(long)]
    pub contexts: Option<usize>,

    /// Addresses per callchain entry
    #[arg(long)]
    pub capacity: Option<usize>,

    /// Long-lived consumers registered for the run
    #[arg(long)]
    pub consumers: Option<usize>,

    /// Top-level captures per CPU
    #[arg(short = 'n', long)]
    pub captures: Option<u64>,

    /// Capture levels attempted per sample (1 = no simulated interrupts)
    #[arg(long)]
    pub nesting: Option<usize>,

    /// Frames walked per address space and level
    #[arg(long)]
    pub frames: Option<usize>,

    /// Bind every N-th sample to another task (0 = never)
    #[arg(long, value_name = "N")]
    pub cross_task_every: Option<u64>,

    /// Keep registering, resizing and releasing the pool while capturing
    #[arg(long)]
    pub churn: bool,

    /// Export the report as JSON
    #[arg(long, value_name = "FILE")]
    pub export: Option<PathBuf>,

    /// Suppress the summary
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    /// Stress configuration: file (or defaults) with flags applied on top
    ///
    /// # Errors
    /// Returns an error if the configuration file cannot be read or parsed
    pub fn stress_config(&self) -> Result<StressConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                serde_json::from_str(&content)
                    .with_context(|| format!("Failed to parse {}", path.display()))?
            }
            None => StressConfig::default(),
        };

        if self.cpus.is_some() {
            config.cpus = self.cpus;
        }
        if let Some(contexts) = self.contexts {
            config.pool.contexts = contexts;
        }
        if let Some(capacity) = self.capacity {
            config.pool.entry_capacity = capacity;
        }
        if let Some(consumers) = self.consumers {
            config.consumers = consumers;
        }
        if let Some(captures) = self.captures {
            config.captures_per_cpu = captures;
        }
        if let Some(nesting) = self.nesting {
            config.nesting = nesting;
        }
        if let Some(frames) = self.frames {
            config.frames = frames;
        }
        if let Some(every) = self.cross_task_every {
            config.cross_task_every = every;
        }
        config.churn |= self.churn;

        config.pool.validate()?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_flags_override_defaults() {
        let args = Args::parse_from([
            "callchain-stress",
            "--cpus",
            "3",
            "--capacity",
            "32",
            "-n",
            "7",
            "--churn",
        ]);
        let config = args.stress_config().unwrap();
        assert_eq!(config.cpus, Some(3));
        assert_eq!(config.pool.entry_capacity, 32);
        assert_eq!(config.pool.contexts, 4);
        assert_eq!(config.captures_per_cpu, 7);
        assert!(config.churn);
    }

    #[test]
    fn test_flags_override_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"cpus": 2, "nesting": 3, "pool": {{"contexts": 2}}}}"#).unwrap();

        let path = file.path().to_str().unwrap();
        let args = Args::parse_from(["callchain-stress", "--config", path, "--nesting", "1"]);
        let config = args.stress_config().unwrap();
        assert_eq!(config.cpus, Some(2));
        assert_eq!(config.nesting, 1);
        assert_eq!(config.pool.contexts, 2);
        assert_eq!(config.pool.entry_capacity, 127);
    }

    #[test]
    fn test_oversized_frames_are_rejected() {
        let args = Args::parse_from(["callchain-stress", "--frames", "1000000"]);
        let err = args.stress_config().unwrap_err();
        assert!(err.to_string().contains("frames must be at most"));
    }

    #[test]
    fn test_invalid_pool_shape_is_rejected() {
        let args = Args::parse_from(["callchain-stress", "--contexts", "5"]);
        assert!(args.stress_config().is_err());
    }
}
