//! ethercand — standalone driver process for a Fibre Positioner Unit grid.
//!
//! Reads its configuration from a TOML file (default `ethercand.toml`;
//! override with `--config`), connects to every configured gateway, and
//! then serves a minimal line-oriented command shell on stdin for manual
//! operation — `ping <fpu>`, `datum`, `abort`, `grid`, `quit`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use ethercan_driver::command::DatumOptions;
use ethercan_driver::config::DriverConfig;
use ethercan_driver::driver::AsyncDriver;
use ethercan_driver::fpu::FpuStateArray;
use ethercan_driver::gateway::GatewayDriver;
use ethercan_driver::persistence::LmdbEnvelopeStore;
use ethercan_driver::pool::CommandPool;
use ethercan_driver::protection::{EnvelopeStore, InMemoryEnvelopeStore, ProtectionLayer};
use ethercan_driver::queue::CommandQueue;

#[derive(Parser, Debug)]
#[command(name = "ethercand", about = "EtherCAN driver for a Fibre Positioner Unit grid")]
struct Args {
    /// Path to a TOML configuration file.
    #[arg(long, default_value = "ethercand.toml")]
    config: PathBuf,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match DriverConfig::from_file(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("warning: could not read {}: {e}; using defaults", args.config.display());
            DriverConfig::default()
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_filter_directive().into()),
        )
        .init();

    config.validate()?;
    tracing::info!(num_fpus = config.num_fpus, gateways = config.gateway_addresses.len(), "starting ethercand");

    let fpu_ids: Vec<u32> = (0..config.num_fpus as u32).collect();

    let grid = Arc::new(FpuStateArray::new(config.num_fpus));
    let queue = Arc::new(CommandQueue::new(config.gateway_addresses.len().max(1)));
    let pool = Arc::new(CommandPool::new(config.num_fpus));

    let store: Arc<dyn EnvelopeStore> = match LmdbEnvelopeStore::open(&config.lmdb_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::warn!(error = %e, path = %config.lmdb_path.display(), "falling back to in-memory protection store");
            Arc::new(InMemoryEnvelopeStore::default())
        }
    };
    let protection = Arc::new(ProtectionLayer::new(store));

    let mut gateway = GatewayDriver::new(config.clone(), queue.clone(), grid.clone());
    gateway.connect()?;

    let driver = AsyncDriver::new(config, grid.clone(), queue, pool, gateway.timeouts(), protection);
    driver.connect(&fpu_ids, Duration::from_secs(5))?;

    run_shell(&driver, &fpu_ids);

    gateway.disconnect();
    Ok(())
}

fn run_shell(driver: &AsyncDriver, fpu_ids: &[u32]) {
    use std::io::{BufRead, Write};
    let stdin = std::io::stdin();
    loop {
        print!("ethercand> ");
        let _ = std::io::stdout().flush();
        let mut line = String::new();
        if stdin.lock().read_line(&mut line).unwrap_or(0) == 0 {
            break;
        }
        let mut words = line.split_whitespace();
        match words.next() {
            Some("ping") => {
                for id in parse_targets(words, fpu_ids) {
                    if let Err(e) = driver.ping_fpu(id) {
                        eprintln!("ping {id} failed: {e}");
                    }
                }
            }
            Some("datum") => match driver.find_datum(fpu_ids, DatumOptions::default(), Some(Duration::from_secs(60))) {
                Ok(outcome) => println!("datum search finished: {}", outcome.completed()),
                Err(e) => eprintln!("datum search failed: {e}"),
            },
            Some("abort") => {
                if let Err(e) = driver.abort_motion(fpu_ids) {
                    eprintln!("abort failed: {e}");
                }
            }
            Some("grid") => {
                let gs = driver.grid_state();
                println!("summary={:?} pending={}", gs.summary(), gs.count_pending);
            }
            Some("quit") | Some("exit") => break,
            Some(other) => eprintln!("unrecognised command: {other}"),
            None => {}
        }
    }
}

fn parse_targets<'a>(mut words: impl Iterator<Item = &'a str>, all: &[u32]) -> Vec<u32> {
    match words.next() {
        Some("all") | None => all.to_vec(),
        Some(id) => id.parse().ok().into_iter().collect(),
    }
}
