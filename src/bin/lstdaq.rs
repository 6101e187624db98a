//! LSTDAQ binary - collects FEB records and builds combined events
//!
//! Usage:
//!   cargo run --bin lstdaq -- -f Connection.conf -n 10000 -i 1000
//!   cargo run --bin lstdaq -- -f daq.toml -s -o run42_ -d /data

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use lstdaq_rs::collector::TcpConnector;
use lstdaq_rs::common::cli::DaqArgs;
use lstdaq_rs::common::{setup_shutdown, StopFlag};
use lstdaq_rs::config::Config;
use lstdaq_rs::daq::Daq;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("lstdaq_rs=info".parse()?)
                .add_directive("lstdaq=info".parse()?),
        )
        .init();

    let args = DaqArgs::parse();

    let config_path = &args.common.config_file;
    let mut config = Config::load(config_path)
        .with_context(|| format!("failed to load configuration from {config_path}"))?;
    info!(config_file = %config_path, sources = config.sources.len(), "Loaded configuration");

    // CLI overrides config file
    if let Some(ndaq) = args.ndaq {
        config.daq.ndaq = ndaq;
    }
    if let Some(infreq) = args.infreq {
        config.daq.infreq = infreq;
    }
    if args.save {
        config.daq.save = true;
    }
    if let Some(prefix) = args.file_prefix {
        config.daq.file_prefix = prefix;
    }
    if let Some(dir) = args.output_dir {
        config.daq.output_dir = PathBuf::from(dir);
    }
    if args.no_sampler {
        config.sampler.enabled = false;
    }

    let daq = Daq::new(config)?;
    let stop = StopFlag::new();
    setup_shutdown(stop.clone());

    let run_stop = stop.clone();
    let result = tokio::task::spawn_blocking(move || {
        let connector = TcpConnector::new(daq.config().poll_timeout());
        let mut sink = daq.create_sink()?;
        daq.run(&connector, sink.as_mut(), &run_stop)
    })
    .await?;

    match result {
        Ok(summary) => {
            println!(
                "Built {} events from {} sources in {:.3} s ({} rounds abandoned)",
                summary.build.built,
                summary.n_sources,
                summary.build.elapsed_secs,
                summary.build.abandoned_rounds
            );
            Ok(())
        }
        Err(e) if e.is_aborted() && stop.is_requested() => {
            warn!(error = %e, "Acquisition stopped by user");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
