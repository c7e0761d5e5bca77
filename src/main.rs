//! Door counter - dual-beam people counter for a single doorway
//!
//! Two time-of-flight range sensors look across the doorway, one on each
//! side. The order in which their beams are broken gives the direction of a
//! crossing; the running occupancy is kept in the store and snapshotted
//! hourly.
//!
//! Module structure:
//! - `domain/` - Core types (SensorId, Distance, CrossingEvent, Decision)
//! - `io/` - External interfaces (serial sensors, store, Prometheus)
//! - `services/` - Detection and scheduling (EdgeDetector, CrossingResolver, PollLoop)
//! - `infra/` - Infrastructure (Config, Metrics)

use anyhow::Context;
use clap::Parser;
use door_counter::domain::{Distance, SensorId};
use door_counter::infra::{Config, Metrics};
use door_counter::io::{FileStore, OccupancyStore, SerialRangeSource};
use door_counter::services::{baseline, HourlyLogger, PollLoop, RetryPolicy};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Door counter - people counting with two range sensors
#[derive(Parser, Debug)]
#[command(name = "door-counter", version, about)]
struct Args {
    /// Path to TOML configuration file (default: $CONFIG_FILE or config/door.toml)
    #[arg(short, long)]
    config: Option<String>,
}

/// Pinned baselines from config, otherwise measured now
async fn resolve_baselines(
    config: &Config,
    source: &mut SerialRangeSource,
) -> anyhow::Result<[Distance; 2]> {
    if let Some(pinned) = config.baseline_mm() {
        let baselines = pinned.map(Distance);
        for sensor in SensorId::ALL {
            info!(
                sensor = %sensor,
                baseline_mm = %baselines[sensor.index()].mm(),
                "baseline_pinned"
            );
        }
        return Ok(baselines);
    }

    let mut baselines = [Distance::default(); 2];
    for sensor in SensorId::ALL {
        baselines[sensor.index()] = baseline::calibrate(
            &mut *source,
            sensor,
            config.baseline_samples(),
            config.baseline_interval(),
        )
        .await
        .with_context(|| {
            format!("baseline calibration failed for {} ({})", sensor, source.device(sensor))
        })?;
    }
    Ok(baselines)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize structured logging with configurable level via RUST_LOG env var
    // Default: INFO, use RUST_LOG=debug for per-read visibility
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), git_hash = env!("GIT_HASH"), "door-counter starting");

    let args = Args::parse();
    let config_path = args.config.unwrap_or_else(|| Config::resolve_config_path(&[]));
    let config = Config::load_from_path(&config_path);

    let (open_hour, close_hour) = config.open_hours();
    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        devices = ?config.sensor_devices(),
        tolerance_mm = %config.tolerance_mm(),
        timeout_secs = %config.timeout_secs(),
        poll_interval_ms = %config.poll_interval_ms(),
        store_dir = %config.store_dir(),
        snapshots_enabled = %config.snapshots_enabled(),
        open_hour = %open_hour,
        close_hour = %close_hour,
        prometheus_port = %config.prometheus_port(),
        "config_loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());

    let store: Arc<dyn OccupancyStore> = Arc::new(
        FileStore::open(config.store_dir())
            .with_context(|| format!("cannot open store at {}", config.store_dir()))?,
    );

    if config.reset_on_start() {
        match store.reset_to_zero().await {
            Ok(()) => info!("occupancy_reset_on_start"),
            Err(e) => warn!(error = %e, "occupancy_reset_failed"),
        }
    }

    let mut source = SerialRangeSource::new(&config);
    let baselines = resolve_baselines(&config, &mut source).await?;

    // Hourly snapshots
    if config.snapshots_enabled() {
        let logger = HourlyLogger::from_config(&config, store.clone(), metrics.clone());
        let logger_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            logger.run(logger_shutdown).await;
        });
    }

    // Start Prometheus metrics HTTP server (if port > 0)
    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let prom_metrics = metrics.clone();
        let prom_site = config.site_id().to_string();
        let prom_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = door_counter::io::prometheus::start_metrics_server(
                prometheus_port,
                prom_metrics,
                prom_site,
                prom_shutdown,
            )
            .await
            {
                tracing::error!(error = %e, "Prometheus metrics server error");
            }
        });
    }

    // Start metrics reporter (lock-free reads)
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(metrics_interval));
        loop {
            interval.tick().await;
            metrics_clone.report().log();
        }
    });

    // Handle shutdown on Ctrl+C
    let shutdown_signal = shutdown_tx;
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_signal.send(true);
    });

    let poll_loop = PollLoop::new(
        source,
        store,
        baselines,
        config.detection(),
        RetryPolicy::from_config(&config),
        metrics,
    );
    poll_loop.run(shutdown_rx).await.context("poll loop stopped on fatal store error")?;

    info!("door-counter shutdown complete");
    Ok(())
}
