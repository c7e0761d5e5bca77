//! Hourly occupancy snapshots
//!
//! Wakes on every local hour boundary. Inside the open-hours window it purges
//! snapshots past retention and appends the current count. A failing store is
//! logged and the next hour is tried as usual.

use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::store::{OccupancyStore, StoreError};
use chrono::{DateTime, FixedOffset, Local, TimeDelta, TimeZone, Timelike, Utc};
use std::ops::RangeInclusive;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// First instant of the hour following `now`, in the same time zone
pub fn next_hour_boundary<Tz: TimeZone>(now: &DateTime<Tz>) -> DateTime<Tz> {
    let into_hour = TimeDelta::seconds(i64::from(now.minute() * 60 + now.second()))
        + TimeDelta::nanoseconds(i64::from(now.nanosecond() % 1_000_000_000));
    now.clone() - into_hour + TimeDelta::hours(1)
}

/// Wall-clock source; hour boundaries are taken in the local zone
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub struct HourlyLogger {
    store: Arc<dyn OccupancyStore>,
    open_hours: RangeInclusive<u32>,
    retention: TimeDelta,
    metrics: Arc<Metrics>,
    clock: Clock,
}

impl HourlyLogger {
    pub fn new(
        store: Arc<dyn OccupancyStore>,
        open_hours: RangeInclusive<u32>,
        retention: TimeDelta,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { store, open_hours, retention, metrics, clock: Arc::new(Utc::now) }
    }

    #[cfg(test)]
    fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn from_config(
        config: &Config,
        store: Arc<dyn OccupancyStore>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (open, close) = config.open_hours();
        let retention = TimeDelta::days(i64::from(config.retention_days()));
        Self::new(store, open..=close, retention, metrics)
    }

    /// Snapshot for the hour starting at `slot`. Returns the logged count, or
    /// None when `slot` is outside open hours.
    pub async fn run_cycle(&self, slot: DateTime<FixedOffset>) -> Result<Option<i64>, StoreError> {
        if !self.open_hours.contains(&slot.hour()) {
            debug!(hour = slot.hour(), "snapshot_skipped_closed");
            return Ok(None);
        }

        let purged = self.store.purge_snapshots_older_than(self.retention).await?;
        if purged > 0 {
            info!(purged = purged, retention_days = self.retention.num_days(), "snapshots_purged");
        }

        let count = self.store.get_count().await?;
        self.store.log_snapshot(slot, count).await?;
        self.metrics.record_snapshot_written();
        info!(datetime = %slot, count = %count, "snapshot_logged");
        Ok(Some(count))
    }

    /// Run until shutdown, one cycle per local hour boundary
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            open_hour = *self.open_hours.start(),
            close_hour = *self.open_hours.end(),
            retention_days = self.retention.num_days(),
            "hourly_logger_started"
        );

        loop {
            let now = (self.clock)().with_timezone(&Local);
            let slot = next_hour_boundary(&now);
            let wait = (slot - now).to_std().unwrap_or_default();
            debug!(next = %slot, wait_secs = wait.as_secs(), "hourly_logger_sleeping");

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("hourly_logger_shutdown");
                        return;
                    }
                    continue;
                }
                _ = tokio::time::sleep(wait) => {}
            }

            if let Err(e) = self.run_cycle(slot.fixed_offset()).await {
                self.metrics.record_snapshot_failed();
                error!(error = %e, "snapshot_failed");
            }
        }
    }
}
