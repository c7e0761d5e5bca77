//! Poll loop - drives both beams through the crossing resolver
//!
//! Each tick reads both sensors, advances the resolver and applies any
//! decision to the occupancy store. Ticks never overlap: the next one starts
//! only after the previous read/resolve/store cycle finished.
//!
//! Store updates go through a FIFO of pending decisions. A transient store
//! failure leaves the decision queued and arms an exponential backoff; a
//! fatal one (corrupt counter data) ends the loop with the error.

use crate::domain::types::{Decision, Distance, SensorId};
use crate::infra::config::{Config, DetectionParams};
use crate::infra::metrics::Metrics;
use crate::io::sensor::{SensorError, SensorSource};
use crate::io::store::{OccupancyStore, StoreError};
use crate::services::crossing_resolver::{CrossingResolver, ResolverOutput};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Retry behaviour for decisions the store could not take
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
    pub max_pending: usize,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            base: config.retry_base(),
            max: config.retry_max(),
            max_pending: config.max_pending(),
        }
    }

    /// Delay after `failures` consecutive failures (1-based)
    pub fn backoff(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(31);
        self.base.saturating_mul(1u32 << exp).min(self.max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(30),
            max_pending: 1000,
        }
    }
}

/// Decisions waiting for the store, oldest first
struct PendingUpdates {
    queue: VecDeque<Decision>,
    policy: RetryPolicy,
    consecutive_failures: u32,
    retry_at: Option<Instant>,
}

impl PendingUpdates {
    fn new(policy: RetryPolicy) -> Self {
        Self { queue: VecDeque::new(), policy, consecutive_failures: 0, retry_at: None }
    }

    /// Queue a decision, returning the one evicted on overflow
    fn push(&mut self, decision: Decision) -> Option<Decision> {
        let dropped = if self.queue.len() >= self.policy.max_pending.max(1) {
            self.queue.pop_front()
        } else {
            None
        };
        self.queue.push_back(decision);
        dropped
    }

    fn ready(&self, now: Instant) -> bool {
        !self.queue.is_empty() && self.retry_at.map_or(true, |at| now >= at)
    }

    fn record_success(&mut self) {
        self.queue.pop_front();
        self.consecutive_failures = 0;
        self.retry_at = None;
    }

    fn record_failure(&mut self, now: Instant) -> Duration {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let delay = self.policy.backoff(self.consecutive_failures);
        self.retry_at = Some(now + delay);
        delay
    }
}

pub struct PollLoop<S: SensorSource> {
    source: S,
    store: Arc<dyn OccupancyStore>,
    resolver: CrossingResolver,
    poll_interval: Duration,
    pending: PendingUpdates,
    metrics: Arc<Metrics>,
    /// Last count the store reported; None until the first successful call
    last_count: Option<i64>,
}

impl<S: SensorSource> PollLoop<S> {
    pub fn new(
        source: S,
        store: Arc<dyn OccupancyStore>,
        baselines: [Distance; 2],
        params: DetectionParams,
        retry: RetryPolicy,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            source,
            store,
            resolver: CrossingResolver::new(baselines, params),
            poll_interval: params.poll_interval,
            pending: PendingUpdates::new(retry),
            metrics,
            last_count: None,
        }
    }

    pub fn resolver(&self) -> &CrossingResolver {
        &self.resolver
    }

    pub fn pending_len(&self) -> usize {
        self.pending.queue.len()
    }

    /// Run until shutdown is signalled or the store reports a fatal error
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), StoreError> {
        info!(
            poll_interval_ms = %self.poll_interval.as_millis(),
            outside_baseline_mm = %self.resolver.detector(SensorId::Outside).baseline().mm(),
            inside_baseline_mm = %self.resolver.detector(SensorId::Inside).baseline().mm(),
            "poll_loop_started"
        );

        match self.store.get_count().await {
            Ok(count) => self.observe_count(count),
            Err(e) if e.is_transient() => warn!(error = %e, "initial_count_unavailable"),
            Err(e) => return Err(e),
        }

        let mut poll_timer = interval(self.poll_interval);
        poll_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        if !self.pending.queue.is_empty() {
                            warn!(pending = self.pending.queue.len(), "poll_loop_shutdown_with_pending");
                        }
                        info!("poll_loop_shutdown");
                        return Ok(());
                    }
                }
                _ = poll_timer.tick() => {
                    self.tick().await?;
                }
            }
        }
    }

    /// One read/resolve/store cycle
    pub async fn tick(&mut self) -> Result<ResolverOutput, StoreError> {
        let started = Instant::now();

        let mut samples = [None; 2];
        for sensor in SensorId::ALL {
            samples[sensor.index()] = self.read_sensor(sensor).await;
        }

        let output = self.resolver.tick(Instant::now().into_std(), samples);

        if let Some(sensor) = output.timed_out {
            self.metrics.record_false_trigger(sensor);
        }
        if output.dwell.is_some() {
            self.metrics.record_dwell_notice();
        }
        if let Some(decision) = output.decision {
            self.metrics.record_decision(decision);
            if let Some(dropped) = self.pending.push(decision) {
                error!(
                    dropped = %dropped.as_str(),
                    max_pending = self.pending.policy.max_pending,
                    "pending_update_dropped"
                );
                self.metrics.record_dropped_update();
            }
        }

        self.flush_pending().await?;

        self.metrics.set_pending_updates(self.pending.queue.len() as u64);
        self.metrics.record_tick(started.elapsed().as_micros() as u64);
        Ok(output)
    }

    async fn read_sensor(&mut self, sensor: SensorId) -> Option<Distance> {
        match self.source.read(sensor).await {
            Ok(distance) => {
                tracing::trace!(sensor = %sensor, distance_mm = %distance.mm(), "sensor_sample");
                Some(distance)
            }
            Err(SensorError::Timeout(_)) => {
                self.metrics.record_read_timeout(sensor);
                debug!(sensor = %sensor, "sensor_read_timeout");
                None
            }
            Err(e @ SensorError::Disconnected(_)) => {
                // Open failures are already logged by the source, once per attempt
                self.metrics.record_read_error(sensor);
                debug!(sensor = %sensor, error = %e, "sensor_read_failed");
                None
            }
            Err(e) => {
                self.metrics.record_read_error(sensor);
                warn!(sensor = %sensor, error = %e, "sensor_read_failed");
                None
            }
        }
    }

    /// Apply queued decisions in order, stopping at the first failure
    async fn flush_pending(&mut self) -> Result<(), StoreError> {
        let now = Instant::now();
        if !self.pending.ready(now) {
            return Ok(());
        }

        while let Some(&decision) = self.pending.queue.front() {
            let result = match decision {
                Decision::Enter => self.store.increment().await,
                Decision::Exit => self.store.decrement().await,
            };

            match result {
                Ok(count) => {
                    self.pending.record_success();
                    if decision == Decision::Exit && count == 0 && self.last_count == Some(0) {
                        warn!("occupancy_underflow_clamped");
                        self.metrics.record_underflow_clamped();
                    }
                    self.observe_count(count);
                    info!(decision = %decision.as_str(), count = %count, "occupancy_updated");
                }
                Err(e) if e.is_transient() => {
                    self.metrics.record_store_failure();
                    let retry_in = self.pending.record_failure(now);
                    warn!(
                        decision = %decision.as_str(),
                        pending = self.pending.queue.len(),
                        retry_in_ms = %retry_in.as_millis(),
                        error = %e,
                        "store_update_failed"
                    );
                    break;
                }
                Err(e) => {
                    self.metrics.record_store_failure();
                    error!(decision = %decision.as_str(), error = %e, "store_update_fatal");
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn observe_count(&mut self, count: i64) {
        self.last_count = Some(count);
        self.metrics.set_occupancy(count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::store::MemoryStore;
    use async_trait::async_trait;

    /// Fixed distances per beam; `None` fails the read
    struct FixedSensors {
        readings: [Option<u32>; 2],
    }

    #[async_trait]
    impl SensorSource for FixedSensors {
        async fn read(&mut self, sensor: SensorId) -> Result<Distance, SensorError> {
            self.readings[sensor.index()].map(Distance).ok_or(SensorError::Timeout(sensor))
        }
    }

    fn poll_loop(
        readings: [Option<u32>; 2],
        store: Arc<dyn OccupancyStore>,
        retry: RetryPolicy,
    ) -> PollLoop<FixedSensors> {
        PollLoop::new(
            FixedSensors { readings },
            store,
            [Distance(800); 2],
            DetectionParams::default(),
            retry,
            Arc::new(Metrics::new()),
        )
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(5), Duration::from_millis(1600));
        assert_eq!(policy.backoff(20), Duration::from_secs(30));
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_pending_overflow_drops_oldest() {
        let mut pending =
            PendingUpdates::new(RetryPolicy { max_pending: 2, ..RetryPolicy::default() });
        assert_eq!(pending.push(Decision::Enter), None);
        assert_eq!(pending.push(Decision::Exit), None);
        assert_eq!(pending.push(Decision::Exit), Some(Decision::Enter));
        assert_eq!(pending.queue, [Decision::Exit, Decision::Exit]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_reads_are_skipped() {
        let store = Arc::new(MemoryStore::new());
        let mut lp = poll_loop([None, Some(500)], store.clone(), RetryPolicy::default());

        let output = lp.tick().await.unwrap();
        assert_eq!(output, ResolverOutput::default());
        assert!(lp.resolver().state(SensorId::Inside).active);
        assert!(!lp.resolver().state(SensorId::Outside).active);
        assert_eq!(lp.metrics.report().read_timeouts, [1, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_queues_and_retries_with_backoff() {
        let store = Arc::new(MemoryStore::new());
        let mut lp = poll_loop([Some(800); 2], store.clone(), RetryPolicy::default());

        store.set_unavailable(true);
        lp.pending.push(Decision::Enter);
        lp.tick().await.unwrap();
        assert_eq!(lp.pending_len(), 1);
        assert_eq!(lp.metrics.store_failures_total(), 1);

        // Store back, but backoff (100 ms) not yet elapsed
        store.set_unavailable(false);
        tokio::time::advance(Duration::from_millis(50)).await;
        lp.tick().await.unwrap();
        assert_eq!(lp.pending_len(), 1);
        assert_eq!(store.get_count().await.unwrap(), 0);

        tokio::time::advance(Duration::from_millis(60)).await;
        lp.tick().await.unwrap();
        assert_eq!(lp.pending_len(), 0);
        assert_eq!(store.get_count().await.unwrap(), 1);
        assert_eq!(lp.metrics.occupancy(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_preserves_order() {
        let store = Arc::new(MemoryStore::new());
        let mut lp = poll_loop([Some(800); 2], store.clone(), RetryPolicy::default());

        store.set_unavailable(true);
        for decision in [Decision::Enter, Decision::Enter, Decision::Exit, Decision::Enter] {
            lp.pending.push(decision);
        }
        lp.tick().await.unwrap();
        assert_eq!(lp.pending_len(), 4);

        store.set_unavailable(false);
        tokio::time::advance(Duration::from_millis(100)).await;
        lp.tick().await.unwrap();
        assert_eq!(lp.pending_len(), 0);
        assert_eq!(store.get_count().await.unwrap(), 2);
        assert_eq!(lp.metrics.underflow_clamped_total(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_on_empty_room_is_clamped() {
        let store = Arc::new(MemoryStore::new());
        let mut lp = poll_loop([Some(800); 2], store.clone(), RetryPolicy::default());
        lp.observe_count(0);

        lp.pending.push(Decision::Exit);
        lp.tick().await.unwrap();
        assert_eq!(store.get_count().await.unwrap(), 0);
        assert_eq!(lp.metrics.underflow_clamped_total(), 1);
    }

    struct CorruptStore;

    #[async_trait]
    impl OccupancyStore for CorruptStore {
        async fn increment(&self) -> Result<i64, StoreError> {
            Err(StoreError::Corrupt {
                path: "count.json".to_string(),
                source: serde_json::from_str::<i64>("garbage").unwrap_err(),
            })
        }
        async fn decrement(&self) -> Result<i64, StoreError> {
            self.increment().await
        }
        async fn get_count(&self) -> Result<i64, StoreError> {
            Ok(0)
        }
        async fn reset_to_zero(&self) -> Result<(), StoreError> {
            Ok(())
        }
        async fn log_snapshot(
            &self,
            _timestamp: chrono::DateTime<chrono::FixedOffset>,
            _count: i64,
        ) -> Result<(), StoreError> {
            Ok(())
        }
        async fn purge_snapshots_older_than(
            &self,
            _age: chrono::TimeDelta,
        ) -> Result<usize, StoreError> {
            Ok(0)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_store_error_ends_tick() {
        let mut lp = poll_loop([Some(800); 2], Arc::new(CorruptStore), RetryPolicy::default());
        lp.pending.push(Decision::Enter);

        let err = lp.tick().await.unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(lp.pending_len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let lp = poll_loop([Some(800); 2], store, RetryPolicy::default());
        let metrics = lp.metrics.clone();
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(lp.run(rx));
        tokio::time::sleep(Duration::from_millis(105)).await;
        tx.send(true).unwrap();

        assert!(handle.await.unwrap().is_ok());
        assert!(metrics.ticks_total() >= 10);
    }
}
