//! The cluster manager side of the grid: accepts jobs, splits them into
//! tasks, tracks the workers taking part and collects results until a job's
//! future resolves.

pub mod collector;
pub mod config;
pub mod coordinator;
pub mod failure;
pub mod future;
pub mod manager;
pub mod profile;
pub mod proxy;
pub mod splitter;

pub use config::CoordinatorConfig;
pub use coordinator::{CoordinatorBuilder, JobCoordinator, JobRequest};
pub use future::{JobFuture, JobOutcome, JobState};
pub use proxy::ClientJobFuture;
