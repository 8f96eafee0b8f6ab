//! Route tracker - GPS journey logger started and stopped by RFID card swipes
//!
//! Runs three tasks that share one `JourneyContext`:
//! - GPS feed: serial receiver -> position queue
//! - Card signal: card reader -> Start/Stop signals
//! - Journey controller: consumes both, writes path logs and the ledger
//!
//! A route interrupted by power loss is resumed from its path log on the
//! next start.

use clap::Parser;
use route_tracker::infra::{Config, Metrics};
use route_tracker::io::{card_reader, GpsFeed};
use route_tracker::services::context::shutdown_requested;
use route_tracker::services::{signal_channel, CardSignal, JourneyContext, JourneyController, LogObserver};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Route tracker - GPS journeys delimited by card swipes
#[derive(Parser, Debug)]
#[command(name = "route-tracker", version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("GIT_HASH"), ")"), about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, env = "CONFIG_FILE", default_value = "config/tracker.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Default: INFO, use RUST_LOG=debug for per-fix visibility
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    let args = Args::parse();
    info!(version = %env!("CARGO_PKG_VERSION"), git_hash = %env!("GIT_HASH"), "route_tracker_starting");

    let config = Config::load_from_path(&args.config);
    info!(
        config_file = %config.config_file(),
        gps_device = ?config.gps_device(),
        gps_usb_vid = %config.gps_usb_vid(),
        card_reader = %config.card_reader().as_str(),
        card_device = %config.card_device(),
        allow_list = %config.allow_list().len(),
        debounce_ms = %config.debounce_ms(),
        log_dir = %config.log_dir().display(),
        movement_threshold_m = %config.movement_threshold_m(),
        position_queue_capacity = %config.position_queue_capacity(),
        "config_loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Shared components
    let ctx = Arc::new(JourneyContext::new(config.position_queue_capacity()));
    let metrics = Arc::new(Metrics::new());
    let observer = Arc::new(LogObserver);
    let (signal_tx, signal_rx) = signal_channel();

    // GPS feed
    let gps = GpsFeed::new(&config, ctx.clone(), observer.clone(), metrics.clone());
    let gps_task = tokio::spawn(gps.run(shutdown_rx.clone()));

    // Card signal
    let reader = card_reader::from_config(&config);
    let card_signal = CardSignal::new(&config, ctx.clone(), signal_tx, observer.clone(), metrics.clone());
    let card_task = tokio::spawn(card_signal.run(reader, shutdown_rx.clone()));

    // Metrics reporter
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs();
    let mut metrics_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(metrics_interval));
        interval.tick().await;
        loop {
            tokio::select! {
                _ = shutdown_requested(&mut metrics_shutdown) => break,
                _ = interval.tick() => metrics_clone.report().log(),
            }
        }
    });

    // Handle shutdown on Ctrl+C
    let shutdown_signal = shutdown_tx.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_signal.send(true);
    });

    // Journey controller runs on this task until shutdown or a fatal error
    let controller = JourneyController::new(&config, ctx, signal_rx, observer, metrics.clone());
    info!("journey_controller_spawned");
    let result = controller.run(shutdown_rx).await;

    // Stop the producers and let them release their ports
    let _ = shutdown_tx.send(true);
    let _ = gps_task.await;
    let _ = card_task.await;
    metrics.report().log();

    match result {
        Ok(()) => {
            info!("route-tracker shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "route-tracker halted on fatal error");
            ExitCode::FAILURE
        }
    }
}
