//! Worker side of the grid. A [`WorkerNode`] listens for job announcements,
//! asks the coordinator to be admitted and runs one [`TaskExecutor`] for the
//! job it is working on.

pub mod config;
pub mod executor;
pub mod node;
pub mod telemetry;

pub use config::WorkerConfig;
pub use executor::TaskExecutor;
pub use node::{WorkerNode, WorkerState};
pub use telemetry::{Telemetry, TelemetrySnapshot};
