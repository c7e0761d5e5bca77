//! Per-beam thresholding of raw range samples into Set/Reset edges
//!
//! A beam is blocked when the reading drops more than `tolerance` below its
//! baseline. Readings inside the tolerance band count as an empty doorway,
//! which absorbs sensor jitter around the baseline.

use crate::domain::types::{CrossingEvent, Distance, EdgeAction, SensorId};
use std::time::Instant;

/// Live state of one beam, owned by the crossing resolver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SensorState {
    pub active: bool,
    /// Stamped on idle -> active
    pub set_time: Option<Instant>,
    /// Stamped on active -> idle
    pub reset_time: Option<Instant>,
    pub last_distance: Distance,
}

impl SensorState {
    /// Clear the cycle (set/reset stamps and active flag)
    pub fn clear(&mut self) {
        self.active = false;
        self.set_time = None;
        self.reset_time = None;
    }

    /// Both edges of a Set -> Reset cycle have been seen
    pub fn cycle_complete(&self) -> bool {
        self.set_time.is_some() && self.reset_time.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeDetector {
    sensor: SensorId,
    baseline: Distance,
    tolerance: Distance,
}

impl EdgeDetector {
    pub fn new(sensor: SensorId, baseline: Distance, tolerance: Distance) -> Self {
        Self { sensor, baseline, tolerance }
    }

    pub fn baseline(&self) -> Distance {
        self.baseline
    }

    /// Readings strictly below this count as blocked
    pub fn threshold(&self) -> Distance {
        self.baseline.saturating_sub(self.tolerance)
    }

    pub fn is_triggered(&self, distance: Distance) -> bool {
        distance < self.threshold()
    }

    /// Feed one sample. Returns an event only when the beam changes state.
    pub fn detect(
        &self,
        state: &mut SensorState,
        distance: Distance,
        now: Instant,
    ) -> Option<CrossingEvent> {
        state.last_distance = distance;
        let triggered = self.is_triggered(distance);

        let action = match (triggered, state.active) {
            (true, false) => {
                state.active = true;
                state.set_time = Some(now);
                EdgeAction::Set
            }
            (false, true) => {
                state.active = false;
                state.reset_time = Some(now);
                EdgeAction::Reset
            }
            _ => return None,
        };

        tracing::trace!(
            sensor = %self.sensor,
            action = %action.as_str(),
            threshold_mm = %self.threshold().mm(),
            "sensor_edge"
        );

        Some(CrossingEvent { sensor: self.sensor, action, time: now })
    }
}
