//! The sentinel tick — one full observation pass.
//!
//! Fixed phase order per invocation:
//! 0. systemic failure detection (later phases consult its signature set)
//! 1. job scan (stuck + failed)
//! 2. invariant checks
//! 3. dead-worker reaping
//! 4. the sentinel's own heartbeat, written unconditionally
//!
//! A phase failure is recorded in `TickReport::errors` and the remaining
//! phases still run; `run_tick` itself never returns an error. Overlapping
//! ticks are safe because every mutation is CAS-guarded at the store.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{error, info};

use crate::checks::{CheckContext, CheckCounters};
use crate::config::SentinelConfig;
use crate::events::emitter::EventEmitter;
use crate::events::model::{EventType, ResolutionStatus, Severity, SystemEvent};
use crate::jobs::scanner::JobHealthScanner;
use crate::store::traits::{
    JobStore, LedgerStore, PipelineStore, SentinelStore, SignatureAggregate, WorkerStore,
};
use crate::systemic::SystemicFailureDetector;
use crate::workers::reaper::DeadWorkerReaper;

/// What the tick looked at.
#[derive(Debug, Default, Clone)]
pub struct ScannedCounts {
    pub stuck: u64,
    pub failed: u64,
    pub dead_workers: u64,
}

/// What the tick did.
#[derive(Debug, Default, Clone)]
pub struct ActionCounts {
    pub retried: u64,
    pub marked_dead: u64,
    pub suppressed: u64,
    pub workers_marked_dead: u64,
    pub systemic_failures_detected: u64,
    pub events_emitted: u64,
}

/// The only value the tick hands back to its scheduler.
#[derive(Debug, Default)]
pub struct TickReport {
    pub ok: bool,
    pub scanned: ScannedCounts,
    pub actions: ActionCounts,
    pub systemic_failures: Vec<SignatureAggregate>,
    pub checks: CheckCounters,
    pub errors: Vec<String>,
}

/// The observer. Holds one narrow store handle per capability so tests can
/// substitute any seam independently.
pub struct Sentinel {
    config: SentinelConfig,
    jobs: Arc<dyn JobStore>,
    workers: Arc<dyn WorkerStore>,
    ledger: Arc<dyn LedgerStore>,
    pipeline: Arc<dyn PipelineStore>,
    emitter: EventEmitter,
}

impl Sentinel {
    pub fn new(
        config: SentinelConfig,
        jobs: Arc<dyn JobStore>,
        workers: Arc<dyn WorkerStore>,
        ledger: Arc<dyn LedgerStore>,
        pipeline: Arc<dyn PipelineStore>,
    ) -> Self {
        let emitter = EventEmitter::new(Arc::clone(&ledger), &config);
        Self {
            config,
            jobs,
            workers,
            ledger,
            pipeline,
            emitter,
        }
    }

    /// Convenience constructor over one backend implementing every
    /// capability (the usual case).
    pub fn with_store<S: SentinelStore + 'static>(store: Arc<S>, config: SentinelConfig) -> Self {
        Self::new(
            config,
            Arc::clone(&store) as Arc<dyn JobStore>,
            Arc::clone(&store) as Arc<dyn WorkerStore>,
            Arc::clone(&store) as Arc<dyn LedgerStore>,
            store as Arc<dyn PipelineStore>,
        )
    }

    pub fn emitter(&self) -> &EventEmitter {
        &self.emitter
    }

    /// Run one tick. Never returns an error; partial failures land in
    /// `TickReport::errors` and flip `ok` to false.
    pub async fn run_tick(&self) -> TickReport {
        let started = std::time::Instant::now();
        let mut report = TickReport::default();

        // Phase 0: systemic detection. On failure the scanner proceeds with
        // an empty suppressed set; retries may then fire during an outage,
        // the lesser evil versus skipping recovery entirely.
        let suppressed: HashSet<String> = {
            let detector = SystemicFailureDetector::new(
                Arc::clone(&self.ledger),
                self.emitter.clone(),
                self.config.systemic.clone(),
            );
            match detector.detect().await {
                Ok(sweep) => {
                    report.actions.systemic_failures_detected = sweep.failures.len() as u64;
                    report.actions.events_emitted += sweep.events_emitted;
                    let signatures = sweep.signatures();
                    report.systemic_failures = sweep.failures;
                    signatures
                }
                Err(e) => {
                    error!(error = %e, "Systemic detection failed");
                    report.errors.push(format!("systemic detection: {e}"));
                    HashSet::new()
                }
            }
        };

        // Phase 1: job scan.
        {
            let scanner = JobHealthScanner::new(
                Arc::clone(&self.jobs),
                self.emitter.clone(),
                self.config.clone(),
            );
            let outcome = scanner.scan(&suppressed).await;
            report.scanned.stuck = outcome.stuck_seen;
            report.scanned.failed = outcome.failed_seen;
            report.actions.retried = outcome.retried;
            report.actions.marked_dead = outcome.marked_dead;
            report.actions.suppressed = outcome.suppressed;
            report.actions.events_emitted += outcome.events_emitted;
            report.errors.extend(outcome.errors);
        }

        // Phase 2: invariant checks.
        {
            let ctx = CheckContext {
                jobs: Arc::clone(&self.jobs),
                workers: Arc::clone(&self.workers),
                ledger: Arc::clone(&self.ledger),
                pipeline: Arc::clone(&self.pipeline),
                emitter: self.emitter.clone(),
                config: self.config.clone(),
            };
            let (counters, errors) = ctx.run_all().await;
            report.actions.events_emitted += counters.events_emitted;
            report.checks = counters;
            report.errors.extend(errors);
        }

        // Phase 3: dead-worker reaping.
        {
            let reaper = DeadWorkerReaper::new(
                Arc::clone(&self.workers),
                self.emitter.clone(),
                self.config.scan.dead_worker,
            );
            match reaper.reap().await {
                Ok(outcome) => {
                    report.scanned.dead_workers = outcome.scanned;
                    report.actions.workers_marked_dead = outcome.marked_dead;
                    report.actions.events_emitted += outcome.events_emitted;
                }
                Err(e) => {
                    error!(error = %e, "Worker reaping failed");
                    report.errors.push(format!("worker reaping: {e}"));
                }
            }
        }

        report.ok = report.errors.is_empty();

        // Phase 4: own heartbeat, unconditionally.
        let severity = if report.ok { Severity::Info } else { Severity::Warning };
        let heartbeat = SystemEvent::new(
            EventType::Heartbeat,
            "sentinel",
            format!(
                "Tick complete in {} ms: {} retried, {} dead, {} suppressed, {} errors",
                started.elapsed().as_millis(),
                report.actions.retried,
                report.actions.marked_dead,
                report.actions.suppressed,
                report.errors.len()
            ),
        )
        .with_severity(severity)
        // Heartbeats are status, not findings; born terminal.
        .with_resolution(ResolutionStatus::Resolved)
        .with_payload(serde_json::json!({
            "scanned": {
                "stuck": report.scanned.stuck,
                "failed": report.scanned.failed,
                "dead_workers": report.scanned.dead_workers,
            },
            "errors": report.errors.clone(),
        }));
        if self.emitter.emit(heartbeat).await.ok {
            report.actions.events_emitted += 1;
        }

        info!(
            ok = report.ok,
            retried = report.actions.retried,
            marked_dead = report.actions.marked_dead,
            suppressed = report.actions.suppressed,
            systemic = report.actions.systemic_failures_detected,
            workers_reaped = report.actions.workers_marked_dead,
            events = report.actions.events_emitted,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Sentinel tick finished"
        );

        report
    }

    /// Stamp a deployment into the ledger so dashboards can correlate
    /// regressions by release.
    pub async fn record_deploy(&self, note: &str) {
        self.emitter
            .emit(
                SystemEvent::new(EventType::Deploy, "sentinel", note.to_string())
                    .with_resolution(ResolutionStatus::Resolved),
            )
            .await;
    }
}
