//! Rule 2: orphaned sub-jobs.
//!
//! A running job whose lease owner is unknown or has stopped heartbeating
//! is requeued via the same CAS lease release the scanner uses. The orphan
//! threshold is strictly longer than the stuck threshold, and jobs whose
//! lease already expired past the stuck threshold are skipped here — the
//! scanner's stuck pass handled those earlier in this tick.

use std::collections::HashMap;

use chrono::Utc;

use crate::checks::{CheckContext, CheckCounters};
use crate::error::StorageError;
use crate::events::model::{EventType, ResolutionStatus, SystemEvent};
use crate::jobs::model::JobSource;

const CODE_ORPHANED: &str = "orphaned_job";

pub(super) async fn run(
    ctx: &CheckContext,
    counters: &mut CheckCounters,
) -> Result<(), StorageError> {
    let now = Utc::now();
    let heartbeat_cutoff = now - duration(ctx.config.scan.orphan);
    let stuck_cutoff = now - duration(ctx.config.scan.stuck);

    // Worker liveness looked up once per owner, not per job.
    let mut owner_silent: HashMap<String, bool> = HashMap::new();

    for source in JobSource::ALL {
        let running = match ctx.jobs.list_running(source, ctx.config.batch_size).await {
            Ok(jobs) => jobs,
            Err(e) if e.is_schema_mismatch() => {
                tracing::warn!(table = source.table(), error = %e, "Skipping table with schema mismatch");
                continue;
            }
            Err(e) => return Err(e),
        };

        for job in running {
            // Stuck-pass territory: expired lease, handled earlier.
            if job.lease_expired_before(stuck_cutoff) {
                continue;
            }

            let orphaned = match &job.lease_owner {
                None => true,
                Some(owner) => {
                    if let Some(&silent) = owner_silent.get(owner) {
                        silent
                    } else {
                        let silent = match ctx.workers.get_worker(owner).await? {
                            Some(worker) => worker.silent_since(heartbeat_cutoff),
                            None => true,
                        };
                        owner_silent.insert(owner.clone(), silent);
                        silent
                    }
                }
            };
            if !orphaned {
                continue;
            }

            if !ctx.jobs.release_lease(source, &job.id).await? {
                continue;
            }
            counters.orphans_requeued += 1;

            let owner = job.lease_owner.as_deref().unwrap_or("(none)");
            tracing::info!(
                table = source.table(),
                job_id = %job.id,
                owner,
                "Requeued orphaned job"
            );

            let mut event = SystemEvent::new(
                EventType::LeaseExpired,
                "invariant_checks",
                format!(
                    "Job {} on {} owned by silent worker {}; requeued",
                    job.id,
                    source.table(),
                    owner
                ),
            )
            .with_code(CODE_ORPHANED)
            .with_job(&job.id, source.table())
            .with_resolution(ResolutionStatus::Retrying);
            if let Some(deal_id) = &job.deal_id {
                event = event.with_deal(deal_id.clone());
            }
            if ctx.emitter.emit(event).await.ok {
                counters.events_emitted += 1;
            }
        }
    }

    Ok(())
}

fn duration(d: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::minutes(15))
}
