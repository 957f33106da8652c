//! snapshotd - RTSP snapshot daemon
//!
//! This daemon:
//! 1. Loads configuration (JSON file, then SNAPSHOT_* environment overrides)
//! 2. Starts the decoder warning monitor on stderr
//! 3. Restarts a worker for every camera in the registry
//! 4. Serves register / snapshot / status routes until Ctrl-C

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};

use rtsp_snapshot::{
    api::{ApiConfig, ApiServer},
    BuildSupport, CameraStore, DecoderWarningMonitor, MediaDriver, SnapshotConfig,
    SnapshotService,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Serve live RTSP streams as JPEG snapshots")]
struct Args {
    /// JSON configuration file. Environment variables override its values.
    #[arg(long, env = "SNAPSHOT_CONFIG")]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = SnapshotConfig::load_from(args.config.as_deref())?;

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.log_level.as_str()),
    )
    .init();

    let support = BuildSupport::compiled();
    log::info!(
        "snapshotd {} starting (ffmpeg={}, gstreamer={})",
        env!("CARGO_PKG_VERSION"),
        support.ffmpeg,
        support.gstreamer
    );

    let monitor = Arc::new(DecoderWarningMonitor::new(config.decoder_monitor.enabled));
    DecoderWarningMonitor::start(&monitor);

    let store = Arc::new(CameraStore::open(&config.db_path)?);
    let service = Arc::new(SnapshotService::new(
        store,
        Arc::new(MediaDriver::new()),
        monitor,
        config.service_options(),
    ));

    let started = service.bootstrap()?;
    log::info!("restored {} camera(s) from {}", started, config.db_path);

    let api_config = ApiConfig {
        addr: config.api_addr.clone(),
    };
    let api_handle = ApiServer::new(api_config, service.clone()).spawn()?;
    log::info!("snapshotd running. api on {}", api_handle.addr);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    let _ = rx.recv();
    log::info!("shutdown signal received, stopping API server and workers...");
    api_handle.stop()?;
    service.shutdown();
    log::info!("snapshotd stopped");

    Ok(())
}
