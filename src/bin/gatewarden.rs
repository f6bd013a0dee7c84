//! Gatewarden gateway daemon.
//!
//! Runs the credential sync, remote commands and the tag reader against
//! one community until interrupted. Exits non-zero when the gateway's
//! health turns fatal so the service manager restarts it.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};

use gatewarden::clock::SystemClock;
use gatewarden::config::GatewayConfig;
use gatewarden::feed::NdjsonRemote;
use gatewarden::gateway::{Gateway, GatewayParts, Health};
use gatewarden::hardware::{open_device, Actuator, RecordingActuator, RelayProgramActuator, TagReader};
use gatewarden::logging::init_logging;
use gatewarden::storage::open_database;

#[derive(Parser)]
#[command(name = "gatewarden")]
#[command(about = "Offline-first RFID access gateway", long_about = None)]
struct Args {
    /// Path to the JSON configuration file
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Record relay actuations instead of switching relays
    #[arg(long)]
    dry_run: bool,

    /// Override the data directory from the configuration
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => match GatewayConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("error: {e}");
                return ExitCode::FAILURE;
            }
        },
        None => GatewayConfig::default(),
    };
    if let Some(dir) = args.data_dir {
        config.store.data_dir = dir;
    }

    init_logging(config.log_level.as_deref());

    match run(&config, args.dry_run) {
        Ok(Health::Healthy) => ExitCode::SUCCESS,
        Ok(Health::Fatal(reason)) => {
            error!(reason = %reason, "exiting after fatal failure");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!(error = %e, "gateway failed to start");
            ExitCode::FAILURE
        }
    }
}

fn run(config: &GatewayConfig, dry_run: bool) -> Result<Health, Box<dyn std::error::Error>> {
    let stores = open_database(&config.store.data_dir, Some(config.store.engine.clone()))?;
    info!(data_dir = %config.store.data_dir.display(), "local store opened");

    let actuator: Arc<dyn Actuator> = if dry_run {
        info!("dry run, relays will not be switched");
        Arc::new(RecordingActuator::new())
    } else {
        let relay = &config.hardware.relay;
        Arc::new(RelayProgramActuator::new(
            relay.program.clone(),
            relay.args.clone(),
            relay.relays.clone(),
        ))
    };

    let reader: Option<Box<dyn TagReader>> = match &config.hardware.device {
        Some(path) => Some(Box::new(open_device(path, config.hardware.tag_len)?)),
        None => None,
    };

    let remote = NdjsonRemote::new(
        config.remote.address.clone(),
        config.remote.connect_timeout,
        config.remote.request_timeout,
    );

    let parts = GatewayParts {
        credentials: Arc::new(stores.credentials.clone()),
        ledger: Arc::new(stores.ledger.clone()),
        remote: Arc::new(remote),
        actuator,
        reader,
        clock: Arc::new(SystemClock),
    };
    let gateway = Gateway::start(config, parts)?;

    let trigger = gateway.shutdown_trigger();
    if let Err(e) = ctrlc::set_handler(move || trigger.fire()) {
        warn!(error = %e, "could not install interrupt handler");
    }

    let health = gateway.health();
    while !gateway.is_shutting_down() && !health.is_fatal() {
        std::thread::sleep(Duration::from_millis(200));
    }
    gateway.shutdown();
    let health = gateway.join();

    match stores.compact() {
        Ok(result) => info!(entries = result.entries_compacted, "store compacted on exit"),
        Err(e) => warn!(error = %e, "compaction on exit failed"),
    }
    info!(health = ?health, "gateway stopped");
    Ok(health)
}
