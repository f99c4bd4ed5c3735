//! Worker registry: model, heartbeat API, dead-worker reaper.

pub mod heartbeat;
pub mod model;
pub mod reaper;

pub use heartbeat::WorkerRegistry;
pub use model::{WorkerRecord, WorkerStatus};
pub use reaper::{DeadWorkerReaper, ReapOutcome};
