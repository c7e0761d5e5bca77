//! Domain models - core types shared by the detector and its collaborators
//!
//! - `SensorId` / `Distance` - which beam and what it measured
//! - `CrossingEvent` - Set/Reset edges on a beam
//! - `Decision` - resolved direction of a crossing
//! - `Snapshot` - persisted hourly occupancy row

pub mod types;

pub use types::{CrossingEvent, Decision, Distance, DwellNotice, EdgeAction, SensorId, Snapshot};
