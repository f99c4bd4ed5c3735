//! Worker-facing liveness API.
//!
//! Job workers call `heartbeat` at tick start and `record_completion` after
//! each job. Both swallow storage errors — a worker must never die because
//! the monitoring store is down. The sentinel itself only reads this state.

use std::sync::Arc;

use tracing::warn;

use crate::store::traits::WorkerStore;
use crate::workers::model::WorkerStatus;

/// Upserts worker liveness rows and completion counters.
#[derive(Clone)]
pub struct WorkerRegistry {
    workers: Arc<dyn WorkerStore>,
}

impl WorkerRegistry {
    pub fn new(workers: Arc<dyn WorkerStore>) -> Self {
        Self { workers }
    }

    /// Record a heartbeat. Idempotent upsert; a previously reaped worker
    /// that heartbeats again is alive again, no manual intervention.
    pub async fn heartbeat(&self, worker_id: &str, kind: &str, status: Option<WorkerStatus>) {
        let status = status.unwrap_or(WorkerStatus::Alive);
        if let Err(e) = self.workers.upsert_heartbeat(worker_id, kind, status).await {
            warn!(worker_id, error = %e, "Heartbeat write failed");
        }
    }

    /// Record a job completion: bumps processed/failed counters; a failure
    /// extends the consecutive-failure streak, a success resets it.
    pub async fn record_completion(&self, worker_id: &str, failed: bool, error: Option<&str>) {
        if let Err(e) = self.workers.record_completion(worker_id, failed, error).await {
            warn!(worker_id, error = %e, "Completion write failed");
        }
    }
}
