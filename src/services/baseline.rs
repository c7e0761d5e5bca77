//! Startup calibration of the empty-doorway distance per beam

use crate::domain::types::{Distance, SensorId};
use crate::io::sensor::SensorSource;
use anyhow::bail;
use std::time::Duration;
use tracing::{info, warn};

/// Average `samples` successful reads spaced by `interval`.
///
/// Failed reads are retried, up to `3 * samples` attempts in total. Fails when
/// no read succeeds. The result is rounded to the nearest millimetre.
pub async fn calibrate<S: SensorSource + ?Sized>(
    source: &mut S,
    sensor: SensorId,
    samples: usize,
    interval: Duration,
) -> anyhow::Result<Distance> {
    let samples = samples.max(1);
    let max_attempts = samples * 3;
    let mut readings: Vec<u32> = Vec::with_capacity(samples);
    let mut attempts = 0;

    while readings.len() < samples && attempts < max_attempts {
        if attempts > 0 {
            tokio::time::sleep(interval).await;
        }
        attempts += 1;

        match source.read(sensor).await {
            Ok(distance) => readings.push(distance.mm()),
            Err(e) => warn!(sensor = %sensor, attempt = attempts, error = %e, "baseline_read_failed"),
        }
    }

    if readings.is_empty() {
        bail!("no successful reads from {} sensor after {} attempts", sensor, attempts);
    }

    let sum: u64 = readings.iter().map(|&mm| u64::from(mm)).sum();
    let count = readings.len() as u64;
    let mean = (sum + count / 2) / count;
    let baseline = Distance(mean as u32);

    info!(
        sensor = %sensor,
        baseline_mm = %baseline.mm(),
        samples = readings.len(),
        attempts = attempts,
        "baseline_calibrated"
    );
    Ok(baseline)
}
