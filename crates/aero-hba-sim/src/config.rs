use std::path::PathBuf;
use std::time::Duration;

use aero_hba::AdapterConfig;
use anyhow::{bail, Context, Result};
use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "aero-hba-sim", version, about = "Drives the HBA scheduling core against a simulated transport")]
struct Args {
    /// JSON file with `AdapterConfig` fields (durations in milliseconds).
    ///
    /// Flags below override values from the file.
    ///
    /// Environment variable: `AERO_HBA_CONFIG`.
    #[arg(long, env = "AERO_HBA_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter (tracing-subscriber EnvFilter syntax). `RUST_LOG` takes precedence.
    ///
    /// Environment variable: `AERO_HBA_LOG_LEVEL`.
    #[arg(long, env = "AERO_HBA_LOG_LEVEL")]
    log_level: Option<String>,

    /// Emit logs as JSON lines.
    ///
    /// Environment variable: `AERO_HBA_LOG_JSON`.
    #[arg(long, env = "AERO_HBA_LOG_JSON")]
    log_json: bool,

    /// Number of commands to submit.
    ///
    /// Environment variable: `AERO_HBA_COMMANDS`.
    #[arg(long, env = "AERO_HBA_COMMANDS", default_value_t = 2000)]
    commands: usize,

    /// Environment variable: `AERO_HBA_SLOTS`.
    #[arg(long, env = "AERO_HBA_SLOTS")]
    slots: Option<u16>,

    /// Environment variable: `AERO_HBA_TARGETS`.
    #[arg(long, env = "AERO_HBA_TARGETS")]
    targets: Option<u16>,

    /// Completion delivery threads (0 delivers on the hardware thread).
    ///
    /// Environment variable: `AERO_HBA_WORKERS`.
    #[arg(long, env = "AERO_HBA_WORKERS")]
    workers: Option<usize>,

    /// Fraction of submissions answered with queue-full.
    ///
    /// Environment variable: `AERO_HBA_QFULL_RATE`.
    #[arg(long, env = "AERO_HBA_QFULL_RATE", default_value_t = 0.02)]
    qfull_rate: f64,

    /// Fraction of submissions answered with busy.
    ///
    /// Environment variable: `AERO_HBA_BUSY_RATE`.
    #[arg(long, env = "AERO_HBA_BUSY_RATE", default_value_t = 0.01)]
    busy_rate: f64,

    /// Fraction of submissions the hardware never answers. These are recovered by the
    /// watchdog through target and bus resets.
    ///
    /// Environment variable: `AERO_HBA_STALL_RATE`.
    #[arg(long, env = "AERO_HBA_STALL_RATE", default_value_t = 0.0)]
    stall_rate: f64,

    /// Periodically pull a random device and plug it back in.
    ///
    /// Environment variable: `AERO_HBA_HOTPLUG`.
    #[arg(long, env = "AERO_HBA_HOTPLUG")]
    hotplug: bool,

    /// Upper bound on simulated hardware latency, in milliseconds.
    ///
    /// Environment variable: `AERO_HBA_MAX_LATENCY_MS`.
    #[arg(long, env = "AERO_HBA_MAX_LATENCY_MS", default_value_t = 5)]
    max_latency_ms: u64,

    /// Seed for the workload and fault generator. Random when unset.
    ///
    /// Environment variable: `AERO_HBA_SEED`.
    #[arg(long, env = "AERO_HBA_SEED")]
    seed: Option<u64>,

    /// Give up if the workload has not drained after this many seconds.
    ///
    /// Environment variable: `AERO_HBA_DEADLINE_SECS`.
    #[arg(long, env = "AERO_HBA_DEADLINE_SECS", default_value_t = 120)]
    deadline_secs: u64,
}

/// What the simulated hardware and the workload generator do.
#[derive(Debug, Clone)]
pub struct Workload {
    pub commands: usize,
    pub qfull_rate: f64,
    pub busy_rate: f64,
    pub stall_rate: f64,
    pub hotplug: bool,
    pub max_latency: Duration,
    pub seed: Option<u64>,
    pub deadline: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub adapter: AdapterConfig,
    pub workload: Workload,
    pub log_level: String,
    pub log_json: bool,
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::from_args(Args::parse())
    }

    fn from_args(args: Args) -> Result<Self> {
        let mut adapter = match &args.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                serde_json::from_str::<AdapterConfig>(&text)
                    .with_context(|| format!("parsing {}", path.display()))?
            }
            None => sim_defaults(),
        };
        if let Some(slots) = args.slots {
            adapter.slots = slots;
        }
        if let Some(targets) = args.targets {
            adapter.targets = targets;
        }
        if let Some(workers) = args.workers {
            adapter.delivery_workers = workers;
        }
        adapter.validate().context("invalid adapter configuration")?;

        for (name, rate) in [
            ("qfull-rate", args.qfull_rate),
            ("busy-rate", args.busy_rate),
            ("stall-rate", args.stall_rate),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                bail!("--{name} must be within [0, 1], got {rate}");
            }
        }
        if args.qfull_rate + args.busy_rate + args.stall_rate > 1.0 {
            bail!("fault rates add up to more than 1");
        }

        let log_level = args
            .log_level
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "info".to_string());

        Ok(Self {
            adapter,
            workload: Workload {
                commands: args.commands,
                qfull_rate: args.qfull_rate,
                busy_rate: args.busy_rate,
                stall_rate: args.stall_rate,
                hotplug: args.hotplug,
                max_latency: Duration::from_millis(args.max_latency_ms),
                seed: args.seed,
                deadline: Duration::from_secs(args.deadline_secs),
            },
            log_level,
            log_json: args.log_json,
        })
    }
}

/// Timings scaled down so recovery paths finish in well under a second.
fn sim_defaults() -> AdapterConfig {
    AdapterConfig {
        slots: 32,
        targets: 8,
        max_throttle: 8,
        tick: Duration::from_millis(10),
        default_command_timeout: Duration::from_millis(200),
        reset_delay: Duration::from_millis(30),
        qfull_retries: 5,
        qfull_retry_interval: Duration::from_millis(20),
        offline_delay: Duration::from_millis(50),
        delivery_workers: 2,
        ..AdapterConfig::default()
    }
}
