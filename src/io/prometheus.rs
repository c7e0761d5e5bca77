//! Prometheus metrics HTTP endpoint
//!
//! Exposes door counter metrics in Prometheus text format at /metrics and a
//! liveness probe at /health. Uses hyper for the HTTP server.

use crate::domain::types::SensorId;
use crate::infra::metrics::{
    Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS,
};
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with site label
fn write_metric(
    output: &mut String,
    name: &str,
    help: &str,
    typ: MetricType,
    site: &str,
    val: impl std::fmt::Display,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

/// Write a counter with one series per sensor
fn write_per_sensor(output: &mut String, name: &str, help: &str, site: &str, vals: &[u64; 2]) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} counter");
    for sensor in SensorId::ALL {
        let _ = writeln!(
            output,
            "{name}{{site=\"{site}\",sensor=\"{sensor}\"}} {}",
            vals[sensor.index()]
        );
    }
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    bounds: &[u64; 10],
    avg: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in bounds.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let sum = avg * count;
    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {count}");
}

/// Format metrics in Prometheus text exposition format
fn format_prometheus_metrics(metrics: &Metrics, site_id: &str) -> String {
    let summary = metrics.report();
    let mut output = String::with_capacity(4096);

    write_poll_metrics(&mut output, site_id, &summary);
    write_sensor_metrics(&mut output, site_id, &summary);
    write_occupancy_metrics(&mut output, site_id, &summary);
    write_store_metrics(&mut output, site_id, &summary);

    output
}

fn write_poll_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "door_ticks_total",
        "Total poll ticks",
        MetricType::Counter,
        site,
        summary.ticks_total,
    );
    let _ = writeln!(output, "# HELP door_ticks_per_sec Poll ticks per second");
    let _ = writeln!(output, "# TYPE door_ticks_per_sec gauge");
    let _ = writeln!(output, "door_ticks_per_sec{{site=\"{site}\"}} {:.2}", summary.ticks_per_sec);

    write_histogram(
        output,
        "door_tick_latency_us",
        "Poll tick latency in microseconds",
        site,
        &summary.tick_lat_buckets,
        &METRICS_BUCKET_BOUNDS,
        summary.tick_lat_avg_us,
    );
    write_metric(
        output,
        "door_tick_latency_p99_us",
        "99th percentile poll tick latency",
        MetricType::Gauge,
        site,
        summary.tick_lat_p99_us,
    );
}

fn write_sensor_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_per_sensor(
        output,
        "door_sensor_read_errors_total",
        "Failed sensor reads (timeouts excluded)",
        site,
        &summary.read_errors,
    );
    write_per_sensor(
        output,
        "door_sensor_read_timeouts_total",
        "Timed-out sensor reads",
        site,
        &summary.read_timeouts,
    );
    write_per_sensor(
        output,
        "door_sensor_false_triggers_total",
        "Single-sensor triggers discarded by timeout",
        site,
        &summary.false_triggers,
    );
}

fn write_occupancy_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "door_occupancy",
        "People currently in the room",
        MetricType::Gauge,
        site,
        summary.occupancy,
    );
    write_metric(
        output,
        "door_enters_total",
        "Resolved entering crossings",
        MetricType::Counter,
        site,
        summary.enters_total,
    );
    write_metric(
        output,
        "door_exits_total",
        "Resolved exiting crossings",
        MetricType::Counter,
        site,
        summary.exits_total,
    );
    write_metric(
        output,
        "door_dwell_notices_total",
        "Dwell notifications (someone standing in the doorway)",
        MetricType::Counter,
        site,
        summary.dwell_notices_total,
    );
    write_metric(
        output,
        "door_underflow_clamped_total",
        "Exits applied to an empty room",
        MetricType::Counter,
        site,
        summary.underflow_clamped_total,
    );
}

fn write_store_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "door_store_failures_total",
        "Failed store operations",
        MetricType::Counter,
        site,
        summary.store_failures_total,
    );
    write_metric(
        output,
        "door_pending_updates",
        "Counter updates waiting for the store",
        MetricType::Gauge,
        site,
        summary.pending_updates,
    );
    write_metric(
        output,
        "door_dropped_updates_total",
        "Counter updates dropped on queue overflow",
        MetricType::Counter,
        site,
        summary.dropped_updates_total,
    );
    write_metric(
        output,
        "door_snapshots_written_total",
        "Hourly snapshots written",
        MetricType::Counter,
        site,
        summary.snapshots_written_total,
    );
    write_metric(
        output,
        "door_snapshots_failed_total",
        "Hourly snapshot cycles that failed",
        MetricType::Counter,
        site,
        summary.snapshots_failed_total,
    );
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    site_id: Arc<String>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let body = format_prometheus_metrics(&metrics, &site_id);
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
                .body(Full::new(Bytes::from(body)))
                .expect("static response should not fail"))
        }
        (&Method::GET, "/health") => Ok(Response::builder()
            .status(StatusCode::OK)
            .body(Full::new(Bytes::from("ok")))
            .expect("static response should not fail")),
        _ => Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("Not Found")))
            .expect("static response should not fail")),
    }
}

/// Start the Prometheus metrics HTTP server
pub async fn start_metrics_server(
    port: u16,
    metrics: Arc<Metrics>,
    site_id: String,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    let site_id = Arc::new(site_id);

    info!(port = %port, site = %site_id, "prometheus_metrics_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let metrics = metrics.clone();
                        let site_id = site_id.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                let site_id = site_id.clone();
                                async move { handle_request(req, metrics, site_id).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "prometheus_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "prometheus_accept_error");
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("prometheus_metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}
