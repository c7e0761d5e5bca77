//! Shared types for the door counter

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// One of the two beams across the doorway.
///
/// The outside beam is index 0: a person whose outside beam trips first is
/// walking into the room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorId {
    Outside,
    Inside,
}

impl SensorId {
    pub const ALL: [SensorId; 2] = [SensorId::Outside, SensorId::Inside];

    pub fn index(self) -> usize {
        match self {
            SensorId::Outside => 0,
            SensorId::Inside => 1,
        }
    }

    pub fn other(self) -> SensorId {
        match self {
            SensorId::Outside => SensorId::Inside,
            SensorId::Inside => SensorId::Outside,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SensorId::Outside => "outside",
            SensorId::Inside => "inside",
        }
    }
}

impl std::fmt::Display for SensorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Range reading in millimetres
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct Distance(pub u32);

impl Distance {
    pub fn mm(self) -> u32 {
        self.0
    }

    pub fn saturating_sub(self, other: Distance) -> Distance {
        Distance(self.0.saturating_sub(other.0))
    }
}

impl std::fmt::Display for Distance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}mm", self.0)
    }
}

/// Edge transition on a single beam
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeAction {
    /// idle -> active
    Set,
    /// active -> idle
    Reset,
}

impl EdgeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeAction::Set => "set",
            EdgeAction::Reset => "reset",
        }
    }
}

/// A Set or Reset edge, recorded in the order it was observed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrossingEvent {
    pub sensor: SensorId,
    pub action: EdgeAction,
    pub time: Instant,
}

/// Direction of a resolved crossing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Enter,
    Exit,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Enter => "enter",
            Decision::Exit => "exit",
        }
    }
}

/// Both beams have been blocked longer than the dwell threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DwellNotice {
    /// Time since the later of the two Set edges
    pub dwell: Duration,
}

/// One row of the occupancy history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub datetime: DateTime<FixedOffset>,
    pub num_people: i64,
}
