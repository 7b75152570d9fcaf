//! savewatch-core: tailing and telemetry extraction for VRChat save-data logs.
//!
//! Provides:
//! - `interpolate`: linear interpolation between two timestamped samples
//! - `speed`: windowed one-minute delta estimator for a growing counter
//! - `parser`: per-file line parser (timestamp lines, save-data URL lines)
//! - `record`: measurement type and InfluxDB line protocol encoding
//! - `offsets`: persisted file name → byte offset map
//! - `sink`: measurement sink trait and the InfluxDB HTTP implementation
//! - `watcher`: resumable per-file tail loop
//! - `supervisor`: directory rescans, one watcher task per log file

pub mod interpolate;
pub mod offsets;
pub mod parser;
pub mod record;
pub mod sink;
pub mod speed;
pub mod supervisor;
pub mod watcher;

pub use offsets::OffsetStore;
pub use parser::LineParser;
pub use record::{FieldValue, Measurement};
pub use sink::{InfluxSink, Sink, SinkError};
pub use speed::SpeedEstimator;
pub use supervisor::{Supervisor, SupervisorConfig};
pub use watcher::{FileWatcher, WatcherSettings};

/// Crate version with the git SHA it was built from.
pub const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("SAVEWATCH_GIT_SHA"),
    ")"
);
