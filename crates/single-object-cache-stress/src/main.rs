//! Runs configurable workloads against a [`single_object_cache::SingleObjectCache`] and reports
//! throughput, latency and how requests were resolved.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use humantime::parse_duration;

use config::Config;
use workloads::WorkloadsConfig;

mod config;
mod logging;
mod stresstest;
mod workloads;

#[cfg(not(target_env = "msvc"))]
use jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

/// Command line interface parser.
#[derive(Parser)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Path to the workload definition file.
    #[arg(long, short, value_name = "FILE")]
    workloads: PathBuf,

    /// Duration of the stresstest.
    #[arg(long, short, value_parser = parse_duration)]
    duration: Duration,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // parse configs
    let workloads = WorkloadsConfig::from_path(&cli.workloads)?;
    let config = Config::get(cli.config.as_deref()).context("failed loading config")?;

    // SAFETY: No other threads are running yet.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        single_object_cache::metrics::configure_statsd(
            &config.metrics.prefix,
            statsd,
            config.metrics.custom_tags.clone(),
        )
        .context("failed to configure statsd")?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;

    runtime.block_on(stresstest::perform_stresstest(workloads, cli.duration))
}
