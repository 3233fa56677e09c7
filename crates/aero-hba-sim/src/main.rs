#![forbid(unsafe_code)]

mod config;
mod sim;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use crate::config::Config;

fn main() -> Result<()> {
    let config = Config::load()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    // Logs go to stderr so stdout carries only the JSON report.
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if config.log_json {
        builder.json().init();
    } else {
        builder.init();
    }

    tracing::debug!(?config, "loaded configuration");
    let report = sim::run(config.adapter, config.workload)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
