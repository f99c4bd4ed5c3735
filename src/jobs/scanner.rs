//! Job health scanning — stuck-lease recovery and failed-job triage.
//!
//! Per table, bounded batch, two passes:
//! 1. Running jobs whose lease expired past the stuck threshold get their
//!    lease released (`running → queued`). Lease recovery is not a retry —
//!    the attempt count is untouched.
//! 2. Failed jobs are classified and either suppressed (systemic outage),
//!    retried with backoff, or marked dead.
//!
//! Every state mutation is CAS-guarded at the store; a missed CAS means
//! another writer (or an overlapping tick) already handled the job, so no
//! event is emitted for it.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::classify::{self, Classification, ErrorClassifier};
use crate::config::SentinelConfig;
use crate::error::StorageError;
use crate::events::emitter::EventEmitter;
use crate::events::model::{EventType, ResolutionStatus, Severity, SystemEvent};
use crate::jobs::model::{JobRecord, JobSource};
use crate::store::traits::JobStore;

/// What to do with one failed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobDecision {
    /// Signature is systemically suppressed this tick: record, don't touch.
    Suppress,
    /// Retry after the given backoff.
    Retry { delay: Duration },
    /// Terminal: no (more) automatic retries.
    MarkDead { reason: &'static str },
}

/// Decide the outcome for a failed job. Pure: deterministic given the
/// classification, attempt counts, and suppressed-set membership.
pub fn decide(
    classification: &Classification,
    attempt: u32,
    max_attempts: u32,
    default_max: u32,
    suppressed: bool,
) -> JobDecision {
    if suppressed {
        return JobDecision::Suppress;
    }
    if !classification.class.is_retryable() {
        return JobDecision::MarkDead {
            reason: "non-retryable failure class",
        };
    }
    let effective_max = if max_attempts > 0 { max_attempts } else { default_max };
    if attempt < effective_max {
        JobDecision::Retry {
            delay: classify::backoff(classification.class, attempt),
        }
    } else {
        JobDecision::MarkDead {
            reason: "max retries exceeded",
        }
    }
}

/// Counters from one scan.
#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub stuck_seen: u64,
    pub failed_seen: u64,
    pub leases_released: u64,
    pub retried: u64,
    pub marked_dead: u64,
    pub suppressed: u64,
    pub events_emitted: u64,
    /// Tables skipped because their schema is behind.
    pub skipped_tables: Vec<&'static str>,
    pub errors: Vec<String>,
}

/// Scans job tables and applies retry/suppress/kill decisions.
pub struct JobHealthScanner {
    jobs: Arc<dyn JobStore>,
    emitter: EventEmitter,
    classifier: ErrorClassifier,
    config: SentinelConfig,
}

impl JobHealthScanner {
    pub fn new(jobs: Arc<dyn JobStore>, emitter: EventEmitter, config: SentinelConfig) -> Self {
        Self {
            jobs,
            emitter,
            classifier: ErrorClassifier::new(),
            config,
        }
    }

    /// Scan every job table. `suppressed` is the systemic signature set for
    /// this tick. Storage errors degrade per table, never abort the scan.
    pub async fn scan(&self, suppressed: &HashSet<String>) -> ScanOutcome {
        let mut outcome = ScanOutcome::default();

        for source in JobSource::ALL {
            if let Err(e) = self.scan_stuck(source, &mut outcome).await {
                self.note_table_error(source, e, &mut outcome, "stuck scan");
            }
            if let Err(e) = self.scan_failed(source, suppressed, &mut outcome).await {
                self.note_table_error(source, e, &mut outcome, "failed scan");
            }
        }

        outcome
    }

    fn note_table_error(
        &self,
        source: JobSource,
        e: StorageError,
        outcome: &mut ScanOutcome,
        pass: &str,
    ) {
        if e.is_schema_mismatch() {
            // Optional column/table absent: degrade, don't fail the tick.
            warn!(table = source.table(), error = %e, "Skipping table with schema mismatch");
            if !outcome.skipped_tables.contains(&source.table()) {
                outcome.skipped_tables.push(source.table());
            }
        } else {
            outcome
                .errors
                .push(format!("{} on {}: {e}", pass, source.table()));
        }
    }

    /// Pass 1: release leases abandoned past the stuck threshold.
    async fn scan_stuck(
        &self,
        source: JobSource,
        outcome: &mut ScanOutcome,
    ) -> Result<(), StorageError> {
        let now = Utc::now();
        let cutoff = now
            - chrono::Duration::from_std(self.config.scan.stuck)
                .unwrap_or_else(|_| chrono::Duration::minutes(10));

        let stuck = self
            .jobs
            .list_stuck_running(source, cutoff, self.config.batch_size)
            .await?;

        for job in stuck {
            outcome.stuck_seen += 1;

            let released = self.jobs.release_lease(source, &job.id).await?;
            if !released {
                // Already released (or completed) by another writer.
                continue;
            }
            outcome.leases_released += 1;

            info!(
                table = source.table(),
                job_id = %job.id,
                minutes_stuck = job.minutes_stuck(now),
                "Released expired lease"
            );

            let mut event = SystemEvent::new(
                EventType::LeaseExpired,
                "job_scanner",
                format!(
                    "Lease expired on {} job {} ({} min past expiry); requeued",
                    source.table(),
                    job.id,
                    job.minutes_stuck(now)
                ),
            )
            .with_job(&job.id, source.table())
            .with_resolution(ResolutionStatus::Retrying);
            if let Some(deal_id) = &job.deal_id {
                event = event.with_deal(deal_id.clone());
            }
            if let Some(owner) = &job.lease_owner {
                event = event.with_payload(serde_json::json!({ "lease_owner": owner }));
            }
            if self.emitter.emit(event).await.ok {
                outcome.events_emitted += 1;
            }
        }

        Ok(())
    }

    /// Pass 2: triage failed jobs.
    async fn scan_failed(
        &self,
        source: JobSource,
        suppressed: &HashSet<String>,
        outcome: &mut ScanOutcome,
    ) -> Result<(), StorageError> {
        let failed = self
            .jobs
            .list_failed(source, self.config.batch_size)
            .await?;

        for job in failed {
            outcome.failed_seen += 1;

            let classification = self
                .classifier
                .classify(job.last_error.as_deref().unwrap_or(""));
            let is_suppressed = suppressed.contains(&classification.signature);
            let decision = decide(
                &classification,
                job.attempt,
                job.max_attempts,
                self.config.max_auto_retry,
                is_suppressed,
            );

            match decision {
                JobDecision::Suppress => {
                    outcome.suppressed += 1;
                    let event = self
                        .failed_job_event(EventType::Suppressed, &job, source, &classification)
                        .with_resolution(ResolutionStatus::Suppressed)
                        .with_note("systemic outage active; retry withheld");
                    if self.emitter.emit(event).await.ok {
                        outcome.events_emitted += 1;
                    }
                }
                JobDecision::Retry { delay } => {
                    let next_run_at = Utc::now()
                        + chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::hours(1));
                    if !self.jobs.schedule_retry(source, &job.id, next_run_at).await? {
                        continue;
                    }
                    outcome.retried += 1;
                    info!(
                        table = source.table(),
                        job_id = %job.id,
                        class = %classification.class,
                        attempt = job.attempt,
                        delay_secs = delay.as_secs(),
                        "Scheduled retry"
                    );
                    let event = self
                        .failed_job_event(EventType::Retry, &job, source, &classification)
                        .with_resolution(ResolutionStatus::Retrying)
                        .with_retry(job.attempt, job.max_attempts, next_run_at);
                    if self.emitter.emit(event).await.ok {
                        outcome.events_emitted += 1;
                    }
                }
                JobDecision::MarkDead { reason } => {
                    if !self.jobs.mark_dead(source, &job.id).await? {
                        continue;
                    }
                    outcome.marked_dead += 1;
                    warn!(
                        table = source.table(),
                        job_id = %job.id,
                        class = %classification.class,
                        reason,
                        "Marked job dead"
                    );
                    let severity = if classification.class == classify::ErrorClass::Auth {
                        Severity::Critical
                    } else {
                        Severity::Error
                    };
                    let event = self
                        .failed_job_event(EventType::Error, &job, source, &classification)
                        .with_severity(severity)
                        .with_resolution(ResolutionStatus::Dead)
                        .with_note(reason);
                    if self.emitter.emit(event).await.ok {
                        outcome.events_emitted += 1;
                    }
                }
            }
        }

        Ok(())
    }

    fn failed_job_event(
        &self,
        event_type: EventType,
        job: &JobRecord,
        source: JobSource,
        classification: &Classification,
    ) -> SystemEvent {
        let mut event = SystemEvent::new(
            event_type,
            "job_scanner",
            classification.message.clone(),
        )
        .with_job(&job.id, source.table())
        .with_classification(classification);
        if let Some(deal_id) = &job.deal_id {
            event = event.with_deal(deal_id.clone());
        }
        if let Some(document_id) = &job.document_id {
            event = event.with_document(document_id.clone());
        }
        event
    }
}
