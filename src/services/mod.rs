//! Services - detection logic and scheduled work
//!
//! - `edge_detector` - Thresholds one beam's samples into Set/Reset edges
//! - `crossing_resolver` - Fuses both beams into Enter/Exit decisions
//! - `baseline` - Startup calibration of the empty-doorway distance
//! - `poll_loop` - Drives sensors and resolver, applies decisions to the store
//! - `hourly_logger` - Hourly occupancy snapshots with retention

pub mod baseline;
pub mod crossing_resolver;
pub mod edge_detector;
pub mod hourly_logger;
pub mod poll_loop;

// Re-export commonly used types
pub use crossing_resolver::{CrossingResolver, DoorwayPhase, ResolverOutput};
pub use edge_detector::{EdgeDetector, SensorState};
pub use hourly_logger::HourlyLogger;
pub use poll_loop::{PollLoop, RetryPolicy};
