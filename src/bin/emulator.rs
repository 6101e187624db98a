//! Emulator binary - serves FEB record streams over TCP
//!
//! Usage:
//!   cargo run --bin emulator                                   # One FEB on 127.0.0.1:24
//!   cargo run --bin emulator -- -l 127.0.0.1:5001 -l 127.0.0.1:5002 -n 10000
//!   cargo run --bin emulator -- -r 1000 --skip-probability 0.01

use clap::Parser;
use lstdaq_rs::common::cli::EmulatorArgs;
use lstdaq_rs::common::{setup_shutdown, StopFlag};
use lstdaq_rs::data_source_emulator::{FebEmulator, FebEmulatorConfig};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("lstdaq_rs=info".parse()?))
        .init();

    let args = EmulatorArgs::parse();
    let defaults = FebEmulatorConfig::default();

    let stop = StopFlag::new();
    setup_shutdown(stop.clone());

    let mut tasks = Vec::with_capacity(args.listen.len());
    for (i, listen) in args.listen.iter().enumerate() {
        let config = FebEmulatorConfig {
            listen: listen.clone(),
            event_size: args.event_size.unwrap_or(defaults.event_size),
            events: args.events,
            rate_hz: args.rate_hz,
            skip_probability: args.skip_probability,
            skip_triggers: args.skip_triggers.clone(),
            max_chunk: args.max_chunk,
            // Distinct streams per FEB when seeded
            seed: args.seed.map(|s| s.wrapping_add(i as u64)),
        };
        let emulator = FebEmulator::bind(config).await?;
        tasks.push(tokio::spawn(emulator.run(stop.clone())));
    }

    println!(
        "Emulating {} FEB(s) on {}. Press Ctrl+C to stop.",
        args.listen.len(),
        args.listen.join(", ")
    );

    for task in tasks {
        match task.await? {
            Ok(()) => {}
            Err(e) => error!(error = %e, "Emulator failed"),
        }
    }

    info!("Emulator stopped");
    Ok(())
}
