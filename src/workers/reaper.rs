//! Dead worker reaping.
//!
//! A liveness timeout, not a crash signal: workers silent past the
//! threshold are flipped `alive → dead` (CAS) and one warning event is
//! written per worker. The threshold is strictly greater than the stuck-job
//! threshold so job recovery has already happened by the time an owner is
//! declared dead.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::error::StorageError;
use crate::events::emitter::EventEmitter;
use crate::events::model::{EventType, SystemEvent};
use crate::store::traits::WorkerStore;

/// Counters from one reaping pass.
#[derive(Debug, Default)]
pub struct ReapOutcome {
    pub scanned: u64,
    pub marked_dead: u64,
    pub events_emitted: u64,
}

/// Flags workers whose heartbeat has gone stale.
pub struct DeadWorkerReaper {
    workers: Arc<dyn WorkerStore>,
    emitter: EventEmitter,
    threshold: Duration,
}

impl DeadWorkerReaper {
    pub fn new(workers: Arc<dyn WorkerStore>, emitter: EventEmitter, threshold: Duration) -> Self {
        Self {
            workers,
            emitter,
            threshold,
        }
    }

    /// One pass over alive workers. A CAS miss (worker heartbeated between
    /// the read and the write) emits nothing, which also makes an immediate
    /// re-run a no-op.
    pub async fn reap(&self) -> Result<ReapOutcome, StorageError> {
        let now = Utc::now();
        let cutoff = now
            - chrono::Duration::from_std(self.threshold)
                .unwrap_or_else(|_| chrono::Duration::minutes(15));

        let alive = self.workers.list_alive_workers().await?;
        let mut outcome = ReapOutcome::default();

        for worker in alive {
            outcome.scanned += 1;
            if !worker.silent_since(cutoff) {
                continue;
            }

            match self.workers.mark_worker_dead(&worker.id).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!(worker_id = %worker.id, error = %e, "Failed to mark worker dead");
                    continue;
                }
            }
            outcome.marked_dead += 1;

            let silent_min = (now - worker.last_heartbeat_at).num_minutes();
            info!(worker_id = %worker.id, kind = %worker.kind, silent_min, "Reaped dead worker");

            let event = SystemEvent::new(
                EventType::StuckJob,
                "worker_reaper",
                format!(
                    "Worker {} ({}) silent for {} min; marked dead",
                    worker.id, worker.kind, silent_min
                ),
            )
            .with_payload(serde_json::json!({
                "worker_id": worker.id,
                "kind": worker.kind,
                "last_heartbeat_at": worker.last_heartbeat_at.to_rfc3339(),
                "consecutive_failures": worker.consecutive_failures,
            }));
            if self.emitter.emit(event).await.ok {
                outcome.events_emitted += 1;
            }
        }

        Ok(outcome)
    }
}
