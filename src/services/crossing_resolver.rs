//! Dual-beam crossing resolution
//!
//! Fuses the Set/Reset edges of the outside and inside beams into Enter/Exit
//! decisions. Per tick, after running both edge detectors:
//!
//! 1. Timeout: a beam holding a Set while its partner has none is cleared once
//!    the Set is older than the timeout (false trigger, no decision).
//! 2. Dwell: both beams blocked for longer than the dwell threshold produces a
//!    rate-limited notice. Observability only.
//! 3. Resolution: once both beams completed Set -> Reset, the direction comes
//!    from whichever beam's Set was recorded first in the history. Insertion
//!    order is the only rule; timestamps are never compared because the poll
//!    cadence is too coarse for fast walkers. Within a single tick the outside
//!    beam is sampled first, so simultaneous Sets resolve as Enter.
//!
//! The history keeps the first Set and the latest Reset of each beam, so it
//! never holds more than four events however long a beam stays blocked.
//!
//! State is in memory only. A restart mid-crossing loses at most that one
//! cycle; the store's counter stays authoritative.

use crate::domain::types::{CrossingEvent, Decision, Distance, DwellNotice, EdgeAction, SensorId};
use crate::infra::config::DetectionParams;
use crate::services::edge_detector::{EdgeDetector, SensorState};
use smallvec::SmallVec;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Doorway-level state derived from the two beams
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoorwayPhase {
    /// No beam holds an unresolved Set
    Idle,
    /// Exactly one beam holds an unresolved Set
    OneTriggered,
    /// Both beams have produced a Set in the current cycle
    BothCycling,
}

impl DoorwayPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            DoorwayPhase::Idle => "idle",
            DoorwayPhase::OneTriggered => "one_triggered",
            DoorwayPhase::BothCycling => "both_cycling",
        }
    }
}

/// Result of one resolver tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolverOutput {
    pub decision: Option<Decision>,
    pub dwell: Option<DwellNotice>,
    /// Beam whose lone Set expired this tick
    pub timed_out: Option<SensorId>,
}

pub struct CrossingResolver {
    detectors: [EdgeDetector; 2],
    states: [SensorState; 2],
    /// Edges of the current unresolved cycle, in observation order
    history: SmallVec<[CrossingEvent; 4]>,
    params: DetectionParams,
    last_dwell_notice: Option<Instant>,
}

impl CrossingResolver {
    /// `baselines` are indexed by `SensorId::index()`
    pub fn new(baselines: [Distance; 2], params: DetectionParams) -> Self {
        let detectors = SensorId::ALL
            .map(|sensor| EdgeDetector::new(sensor, baselines[sensor.index()], params.tolerance));
        Self {
            detectors,
            states: [SensorState::default(); 2],
            history: SmallVec::new(),
            params,
            last_dwell_notice: None,
        }
    }

    /// Advance the state machine by one poll.
    ///
    /// A `None` sample means the read failed this tick: that beam keeps its
    /// previous state and emits nothing.
    pub fn tick(&mut self, now: Instant, samples: [Option<Distance>; 2]) -> ResolverOutput {
        for sensor in SensorId::ALL {
            let idx = sensor.index();
            let Some(distance) = samples[idx] else {
                continue;
            };
            if let Some(event) = self.detectors[idx].detect(&mut self.states[idx], distance, now) {
                match event.action {
                    EdgeAction::Set => {
                        info!(sensor = %sensor, distance_mm = %distance.mm(), "sensor_set");
                    }
                    EdgeAction::Reset => {
                        info!(sensor = %sensor, distance_mm = %distance.mm(), "sensor_reset");
                    }
                }
                self.record(event);
            }
        }

        ResolverOutput {
            timed_out: self.expire_lone_set(now),
            dwell: self.check_dwell(now),
            decision: self.resolve(now),
        }
    }

    /// Append an edge to the cycle history. A beam that Sets again keeps its
    /// first Set and drops its earlier Reset.
    fn record(&mut self, event: CrossingEvent) {
        let repeat = event.action == EdgeAction::Set
            && self.history.iter().any(|e| e.sensor == event.sensor && e.action == EdgeAction::Set);
        if repeat {
            self.history.retain(|e| e.sensor != event.sensor || e.action == EdgeAction::Set);
            debug!(sensor = %event.sensor, events = %self.history.len(), "sensor_reset_collapsed");
        } else {
            self.history.push(event);
        }
    }

    /// Clear a beam whose Set has waited too long for its partner
    fn expire_lone_set(&mut self, now: Instant) -> Option<SensorId> {
        for sensor in SensorId::ALL {
            let (idx, other) = (sensor.index(), sensor.other().index());
            let Some(set_time) = self.states[idx].set_time else {
                continue;
            };
            if self.states[other].set_time.is_some() {
                continue;
            }

            let waited = now.duration_since(set_time);
            if waited > self.params.timeout {
                info!(
                    sensor = %sensor,
                    waited_ms = %waited.as_millis(),
                    phase = %self.phase().as_str(),
                    "sensor_timeout"
                );
                self.states[idx].clear();
                self.history.retain(|e| e.sensor != sensor);
                return Some(sensor);
            }
        }
        None
    }

    fn check_dwell(&mut self, now: Instant) -> Option<DwellNotice> {
        let [a, b] = &self.states;
        if !(a.active && b.active) {
            return None;
        }
        let latest_set = a.set_time.max(b.set_time)?;
        let dwell = now.duration_since(latest_set);
        if dwell <= self.params.dwell_threshold {
            return None;
        }

        if let Some(last) = self.last_dwell_notice {
            if now.duration_since(last) <= self.params.dwell_repeat {
                return None;
            }
        }

        self.last_dwell_notice = Some(now);
        info!(dwell_ms = %dwell.as_millis(), "dwell_detected");
        Some(DwellNotice { dwell })
    }

    fn resolve(&mut self, now: Instant) -> Option<Decision> {
        if !self.states.iter().all(SensorState::cycle_complete) {
            return None;
        }

        let first_set = self.history.iter().find(|e| e.action == EdgeAction::Set).copied();
        let decision = match first_set.map(|e| e.sensor) {
            Some(SensorId::Outside) => Some(Decision::Enter),
            Some(SensorId::Inside) => Some(Decision::Exit),
            None => None,
        };

        match (decision, first_set) {
            (Some(decision), Some(first)) => {
                info!(
                    decision = %decision.as_str(),
                    first_sensor = %first.sensor,
                    events = %self.history.len(),
                    span_ms = %now.duration_since(first.time).as_millis(),
                    "crossing_resolved"
                );
            }
            _ => {
                warn!(events = %self.history.len(), "crossing_history_missing_set_discarded");
            }
        }

        self.reset_cycle();
        self.last_dwell_notice = Some(now);
        decision
    }

    fn reset_cycle(&mut self) {
        let from = self.phase();
        for state in &mut self.states {
            state.clear();
        }
        self.history.clear();
        debug!(from_phase = %from.as_str(), "crossing_cycle_reset");
    }

    pub fn phase(&self) -> DoorwayPhase {
        match self.states.iter().filter(|s| s.set_time.is_some()).count() {
            0 => DoorwayPhase::Idle,
            1 => DoorwayPhase::OneTriggered,
            _ => DoorwayPhase::BothCycling,
        }
    }

    pub fn state(&self, sensor: SensorId) -> &SensorState {
        &self.states[sensor.index()]
    }

    pub fn history(&self) -> &[CrossingEvent] {
        &self.history
    }

    pub fn detector(&self, sensor: SensorId) -> &EdgeDetector {
        &self.detectors[sensor.index()]
    }
}
