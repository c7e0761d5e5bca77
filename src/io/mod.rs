//! IO modules - external system interfaces
//!
//! - `sensor` - Serial time-of-flight range sensors
//! - `store` - Occupancy counter and snapshot storage
//! - `prometheus` - Prometheus metrics HTTP endpoint

pub mod prometheus;
pub mod sensor;
pub mod store;

// Re-export commonly used types
pub use sensor::{SensorError, SensorSource, SerialRangeSource};
pub use store::{FileStore, MemoryStore, OccupancyStore, StoreError};
