//! End-to-end sentinel scenarios against an in-memory store.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};

use pipeline_sentinel::classify::ErrorClassifier;
use pipeline_sentinel::config::SentinelConfig;
use pipeline_sentinel::events::model::{EventType, ResolutionStatus, Severity, SystemEvent};
use pipeline_sentinel::events::{EventEmitter, Reconciler};
use pipeline_sentinel::jobs::model::{JobRecord, JobSource, JobStatus};
use pipeline_sentinel::store::traits::{
    DocumentRecord, DocumentStatus, LedgerStore, PipelineStore, ReportRecord, ReportStatus,
    WorkerStore,
};
use pipeline_sentinel::store::LibSqlStore;
use pipeline_sentinel::tick::Sentinel;
use pipeline_sentinel::workers::model::WorkerStatus;
use pipeline_sentinel::workers::WorkerRegistry;

async fn test_store() -> Arc<LibSqlStore> {
    Arc::new(LibSqlStore::new_memory().await.unwrap())
}

fn sentinel(store: &Arc<LibSqlStore>) -> Sentinel {
    Sentinel::with_store(Arc::clone(store), SentinelConfig::default())
}

fn job(id: &str, source: JobSource, status: JobStatus) -> JobRecord {
    let now = Utc::now();
    JobRecord {
        id: id.to_string(),
        source,
        deal_id: Some("deal-1".to_string()),
        document_id: None,
        status,
        attempt: 0,
        max_attempts: 5,
        last_error: None,
        leased_until: None,
        lease_owner: None,
        next_run_at: None,
        created_at: now,
        updated_at: now,
    }
}

// ── Scenario A: transient failure retries with backoff ──────────────

#[tokio::test]
async fn transient_failure_is_retried_with_backoff() {
    let store = test_store().await;
    let mut failed = job("j1", JobSource::Ocr, JobStatus::Failed);
    failed.attempt = 1;
    failed.last_error = Some("ECONNRESET".to_string());
    store.insert_job(&failed).await.unwrap();

    let before = Utc::now();
    let report = sentinel(&store).run_tick().await;

    assert!(report.ok, "errors: {:?}", report.errors);
    assert_eq!(report.scanned.failed, 1);
    assert_eq!(report.actions.retried, 1);
    assert_eq!(report.actions.marked_dead, 0);

    let fetched = store.get_job(JobSource::Ocr, "j1").await.unwrap().unwrap();
    assert_eq!(fetched.status, JobStatus::Queued);
    // 30s * 2^1 = 60s backoff.
    let delay = (fetched.next_run_at.unwrap() - before).num_seconds();
    assert!((55..=70).contains(&delay), "unexpected delay {delay}s");
    // Retry is not lease recovery: attempt untouched by the sentinel.
    assert_eq!(fetched.attempt, 1);

    let retries = store.list_events_by_type(EventType::Retry, 10).await.unwrap();
    assert_eq!(retries.len(), 1);
    assert_eq!(retries[0].resolution_status, ResolutionStatus::Retrying);
    assert_eq!(retries[0].job_id.as_deref(), Some("j1"));
    assert!(retries[0].next_retry_at.is_some());
}

// ── Scenario B: auth failures die immediately ───────────────────────

#[tokio::test]
async fn auth_failure_is_marked_dead_and_critical() {
    let store = test_store().await;
    let mut failed = job("j1", JobSource::Classify, JobStatus::Failed);
    failed.last_error = Some("403 Forbidden: invalid credentials".to_string());
    store.insert_job(&failed).await.unwrap();

    let report = sentinel(&store).run_tick().await;
    assert_eq!(report.actions.marked_dead, 1);
    assert_eq!(report.actions.retried, 0);

    let fetched = store.get_job(JobSource::Classify, "j1").await.unwrap().unwrap();
    assert_eq!(fetched.status, JobStatus::Dead);

    let errors = store.list_events_by_type(EventType::Error, 10).await.unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].severity, Severity::Critical);
    assert_eq!(errors[0].resolution_status, ResolutionStatus::Dead);

    // Dead jobs are out of scope for later ticks: nothing new happens.
    let report = sentinel(&store).run_tick().await;
    assert_eq!(report.scanned.failed, 0);
    assert_eq!(store.list_events_by_type(EventType::Error, 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn retry_exhaustion_is_terminal() {
    let store = test_store().await;
    let mut failed = job("j1", JobSource::Extract, JobStatus::Failed);
    failed.attempt = 5;
    failed.last_error = Some("request timed out".to_string());
    store.insert_job(&failed).await.unwrap();

    let report = sentinel(&store).run_tick().await;
    assert_eq!(report.actions.marked_dead, 1);
    assert_eq!(report.actions.retried, 0);

    let errors = store.list_events_by_type(EventType::Error, 10).await.unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(
        errors[0].resolution_note.as_deref(),
        Some("max retries exceeded")
    );
}

// ── Scenario C: systemic outage suppression ─────────────────────────

#[tokio::test]
async fn systemic_outage_suppresses_retries() {
    let store = test_store().await;
    let message = "fetch failed: ECONNREFUSED api.example.com";
    let signature = ErrorClassifier::new().classify(message).signature;

    // Six distinct deals already hit the same wall this window.
    for i in 0..6 {
        let event = SystemEvent::new(EventType::Error, "job_scanner", message)
            .with_signature(signature.clone())
            .with_deal(format!("deal-{i}"));
        store.insert_event(&event).await.unwrap();
    }

    // The seventh occurrence: a failed job that would otherwise retry.
    let mut failed = job("j7", JobSource::Ocr, JobStatus::Failed);
    failed.attempt = 1;
    failed.last_error = Some(message.to_string());
    store.insert_job(&failed).await.unwrap();

    let report = sentinel(&store).run_tick().await;

    assert_eq!(report.actions.systemic_failures_detected, 1);
    assert_eq!(report.systemic_failures[0].signature, signature);
    assert_eq!(report.systemic_failures[0].distinct_deals, 6);
    assert_eq!(report.actions.suppressed, 1);
    assert_eq!(report.actions.retried, 0);

    // The job was not touched.
    let fetched = store.get_job(JobSource::Ocr, "j7").await.unwrap().unwrap();
    assert_eq!(fetched.status, JobStatus::Failed);
    assert!(fetched.next_run_at.is_none());

    // One summary event plus the per-job suppression record.
    let suppressed_events = store
        .list_events_by_type(EventType::Suppressed, 20)
        .await
        .unwrap();
    assert_eq!(suppressed_events.len(), 2);

    // All six seeded findings were bulk-suppressed.
    let still_open = store
        .list_events_by_resolution(ResolutionStatus::Open, 50)
        .await
        .unwrap();
    assert!(
        still_open.iter().all(|e| e.signature.as_deref() != Some(signature.as_str())),
        "no open finding with the outage signature may remain"
    );
}

// ── Stuck lease recovery ────────────────────────────────────────────

#[tokio::test]
async fn expired_lease_is_released_once() {
    let store = test_store().await;
    let now = Utc::now();
    let mut running = job("j1", JobSource::Extract, JobStatus::Running);
    running.leased_until = Some(now - Duration::minutes(20));
    running.lease_owner = Some("w1".to_string());
    running.attempt = 2;
    store.insert_job(&running).await.unwrap();

    let report = sentinel(&store).run_tick().await;
    assert_eq!(report.scanned.stuck, 1);

    let fetched = store.get_job(JobSource::Extract, "j1").await.unwrap().unwrap();
    assert_eq!(fetched.status, JobStatus::Queued);
    assert!(fetched.lease_owner.is_none());
    // Lease recovery does not consume an attempt.
    assert_eq!(fetched.attempt, 2);

    let lease_events = store
        .list_events_by_type(EventType::LeaseExpired, 10)
        .await
        .unwrap();
    assert_eq!(lease_events.len(), 1);
    assert_eq!(lease_events[0].resolution_status, ResolutionStatus::Retrying);

    // Second tick: already queued, no duplicate event.
    sentinel(&store).run_tick().await;
    let lease_events = store
        .list_events_by_type(EventType::LeaseExpired, 10)
        .await
        .unwrap();
    assert_eq!(lease_events.len(), 1);
}

// ── Scenario D: dead worker reaping ─────────────────────────────────

#[tokio::test]
async fn silent_worker_is_reaped_once() {
    let store = test_store().await;
    store
        .upsert_heartbeat("w1", "ocr", WorkerStatus::Alive)
        .await
        .unwrap();

    // Zero threshold stands in for a 20-minute-old heartbeat.
    let mut config = SentinelConfig::default();
    config.scan.dead_worker = StdDuration::ZERO;
    let sentinel = Sentinel::with_store(Arc::clone(&store), config);

    let report = sentinel.run_tick().await;
    assert_eq!(report.actions.workers_marked_dead, 1);

    let worker = store.get_worker("w1").await.unwrap().unwrap();
    assert_eq!(worker.status, WorkerStatus::Dead);
    let warnings = store.list_events_by_type(EventType::StuckJob, 10).await.unwrap();
    assert_eq!(warnings.len(), 1);

    // Re-running immediately emits nothing further for w1.
    let report = sentinel.run_tick().await;
    assert_eq!(report.actions.workers_marked_dead, 0);
    assert_eq!(store.list_events_by_type(EventType::StuckJob, 10).await.unwrap().len(), 1);
}

// ── Invariant checks ────────────────────────────────────────────────

#[tokio::test]
async fn stalled_report_is_flagged_then_healed_once() {
    let store = test_store().await;
    let now = Utc::now();

    // Past warn, short of critical: flagged, not healed.
    store
        .upsert_report(&ReportRecord {
            id: "r-warn".to_string(),
            deal_id: "deal-1".to_string(),
            status: ReportStatus::Generating,
            started_generating_at: Some(now - Duration::minutes(15)),
            updated_at: now,
        })
        .await
        .unwrap();
    // Past critical: auto-healed.
    store
        .upsert_report(&ReportRecord {
            id: "r-crit".to_string(),
            deal_id: "deal-2".to_string(),
            status: ReportStatus::Generating,
            started_generating_at: Some(now - Duration::minutes(45)),
            updated_at: now,
        })
        .await
        .unwrap();

    let s = sentinel(&store);
    let report = s.run_tick().await;
    assert_eq!(report.checks.reports_flagged, 1);
    assert_eq!(report.checks.reports_healed, 1);

    // Healed report is reset so the pipeline can regenerate.
    let generating = store
        .list_generating_reports(now, 50)
        .await
        .unwrap();
    assert_eq!(generating.len(), 1);
    assert_eq!(generating[0].id, "r-warn");

    // Second tick: warn finding deduped, heal cannot re-fire.
    let report = s.run_tick().await;
    assert_eq!(report.checks.reports_flagged, 0);
    assert_eq!(report.checks.reports_healed, 0);
}

#[tokio::test]
async fn job_with_unknown_owner_is_requeued() {
    let store = test_store().await;
    let now = Utc::now();
    // Lease still valid, but the owner never registered a heartbeat.
    let mut running = job("j1", JobSource::Ocr, JobStatus::Running);
    running.leased_until = Some(now + Duration::minutes(5));
    running.lease_owner = Some("ghost-worker".to_string());
    store.insert_job(&running).await.unwrap();

    let report = sentinel(&store).run_tick().await;
    assert_eq!(report.checks.orphans_requeued, 1);

    let fetched = store.get_job(JobSource::Ocr, "j1").await.unwrap().unwrap();
    assert_eq!(fetched.status, JobStatus::Queued);

    let lease_events = store
        .list_events_by_type(EventType::LeaseExpired, 10)
        .await
        .unwrap();
    assert_eq!(lease_events.len(), 1);
    assert_eq!(lease_events[0].error_code.as_deref(), Some("orphaned_job"));
}

#[tokio::test]
async fn running_job_with_live_owner_is_left_alone() {
    let store = test_store().await;
    store
        .upsert_heartbeat("w1", "ocr", WorkerStatus::Alive)
        .await
        .unwrap();
    let mut running = job("j1", JobSource::Ocr, JobStatus::Running);
    running.leased_until = Some(Utc::now() + Duration::minutes(5));
    running.lease_owner = Some("w1".to_string());
    store.insert_job(&running).await.unwrap();

    let report = sentinel(&store).run_tick().await;
    assert_eq!(report.checks.orphans_requeued, 0);
    assert_eq!(
        store.get_job(JobSource::Ocr, "j1").await.unwrap().unwrap().status,
        JobStatus::Running
    );
}

#[tokio::test]
async fn blocked_deal_is_flagged_once() {
    let store = test_store().await;
    let now = Utc::now();

    // The report service recently refused to generate for this deal.
    let rejection = SystemEvent::new(
        EventType::Warning,
        "report_service",
        "report requested but documents still processing",
    )
    .with_code("report_blocked")
    .with_deal("deal-1")
    .with_resolution(ResolutionStatus::Resolved);
    store.insert_event(&rejection).await.unwrap();

    // Upstream job sitting queued for half an hour.
    let mut stale = job("j1", JobSource::Extract, JobStatus::Queued);
    stale.updated_at = now - Duration::minutes(30);
    store.insert_job(&stale).await.unwrap();

    let s = sentinel(&store);
    let report = s.run_tick().await;
    assert_eq!(report.checks.blocked_deals_flagged, 1);

    let warnings = store.list_events_by_type(EventType::Warning, 20).await.unwrap();
    assert!(
        warnings
            .iter()
            .any(|e| e.error_code.as_deref() == Some("pipeline_blocked"))
    );

    // Open finding dedupes the next tick.
    let report = s.run_tick().await;
    assert_eq!(report.checks.blocked_deals_flagged, 0);
}

#[tokio::test]
async fn stale_document_status_is_flagged() {
    let store = test_store().await;
    let now = Utc::now();
    store
        .upsert_document(&DocumentRecord {
            id: "doc-1".to_string(),
            deal_id: "deal-1".to_string(),
            status: DocumentStatus::Processing,
            updated_at: now,
        })
        .await
        .unwrap();

    for id in ["e1", "e2"] {
        let mut done = job(id, JobSource::Extract, JobStatus::Succeeded);
        done.document_id = Some("doc-1".to_string());
        store.insert_job(&done).await.unwrap();
    }

    let s = sentinel(&store);
    let report = s.run_tick().await;
    assert_eq!(report.checks.stale_documents, 1);

    let warnings = store.list_events_by_type(EventType::Warning, 20).await.unwrap();
    let finding = warnings
        .iter()
        .find(|e| e.error_code.as_deref() == Some("document_status_stale"))
        .expect("stale status finding");
    assert_eq!(finding.severity, Severity::Critical);
    assert_eq!(finding.document_id.as_deref(), Some("doc-1"));

    // The check never writes document status; it only re-flags after the
    // open finding clears, and dedupes meanwhile.
    let report = s.run_tick().await;
    assert_eq!(report.checks.stale_documents, 0);
}

#[tokio::test]
async fn unsurfaced_dead_subjob_is_linked() {
    let store = test_store().await;
    store
        .upsert_document(&DocumentRecord {
            id: "doc-1".to_string(),
            deal_id: "deal-1".to_string(),
            status: DocumentStatus::Processing,
            updated_at: Utc::now(),
        })
        .await
        .unwrap();

    // A sub-job that died without any ledger trace (e.g. killed before the
    // sentinel existed).
    let mut dead = job("e1", JobSource::Extract, JobStatus::Dead);
    dead.document_id = Some("doc-1".to_string());
    dead.last_error = Some("worker crashed".to_string());
    store.insert_job(&dead).await.unwrap();

    let report = sentinel(&store).run_tick().await;
    assert_eq!(report.checks.silent_failures, 1);

    let errors = store.list_events_by_type(EventType::Error, 20).await.unwrap();
    let finding = errors
        .iter()
        .find(|e| e.error_code.as_deref() == Some("silent_failure"))
        .expect("silent failure finding");
    assert_eq!(finding.job_id.as_deref(), Some("e1"));
    assert_eq!(finding.document_id.as_deref(), Some("doc-1"));
}

// ── Ledger behavior ─────────────────────────────────────────────────

#[tokio::test]
async fn tick_always_emits_heartbeat() {
    let store = test_store().await;
    let report = sentinel(&store).run_tick().await;
    assert!(report.ok);
    assert!(report.actions.events_emitted >= 1);

    let heartbeats = store.list_events_by_type(EventType::Heartbeat, 10).await.unwrap();
    assert_eq!(heartbeats.len(), 1);
    assert_eq!(heartbeats[0].severity, Severity::Info);
    // Heartbeats are born terminal so no sweep ever reopens them.
    assert_eq!(heartbeats[0].resolution_status, ResolutionStatus::Resolved);
}

#[tokio::test]
async fn events_carry_deployment_tags() {
    let store = test_store().await;
    let mut config = SentinelConfig::default();
    config.environment = "staging".to_string();
    config.release = "2026.08.0".to_string();
    let sentinel = Sentinel::with_store(Arc::clone(&store), config);
    sentinel.record_deploy("pipeline-sentinel 2026.08.0 started").await;
    sentinel.run_tick().await;

    let heartbeats = store.list_events_by_type(EventType::Heartbeat, 10).await.unwrap();
    assert_eq!(heartbeats[0].environment, "staging");
    assert_eq!(heartbeats[0].release, "2026.08.0");

    let deploys = store.list_events_by_type(EventType::Deploy, 10).await.unwrap();
    assert_eq!(deploys.len(), 1);
    assert_eq!(deploys[0].resolution_status, ResolutionStatus::Resolved);
}

#[tokio::test]
async fn worker_registry_updates_counters_and_never_errors() {
    let store = test_store().await;
    let registry = WorkerRegistry::new(Arc::clone(&store) as Arc<dyn WorkerStore>);

    registry.heartbeat("w1", "ocr", None).await;
    registry.record_completion("w1", false, None).await;
    registry.record_completion("w1", true, Some("malformed PDF header")).await;

    let worker = store.get_worker("w1").await.unwrap().unwrap();
    assert_eq!(worker.status, WorkerStatus::Alive);
    assert_eq!(worker.jobs_processed, 1);
    assert_eq!(worker.jobs_failed, 1);
    assert_eq!(worker.consecutive_failures, 1);

    // Unknown worker: swallowed, no panic.
    registry.record_completion("ghost", true, None).await;
}

#[tokio::test]
async fn oversized_payloads_are_truncated() {
    let store = test_store().await;
    let s = sentinel(&store);

    let event = SystemEvent::new(EventType::Warning, "test", "big payload")
        .with_payload(serde_json::json!({ "blob": "x".repeat(9000) }));
    let outcome = s.emitter().emit(event).await;
    assert!(outcome.ok);

    let fetched = store.get_event(outcome.id.unwrap()).await.unwrap().unwrap();
    let payload = fetched.payload.unwrap();
    assert_eq!(payload["truncated"], serde_json::json!(true));
    assert!(payload["original_bytes"].as_u64().unwrap() > 8 * 1024);
}

#[tokio::test]
async fn reconciler_resolves_and_records_recovery() {
    let store = test_store().await;
    let emitter = EventEmitter::new(
        Arc::clone(&store) as Arc<dyn LedgerStore>,
        &SentinelConfig::default(),
    );
    let reconciler = Reconciler::new(Arc::clone(&store) as Arc<dyn LedgerStore>, emitter);

    let finding = SystemEvent::new(EventType::Warning, "invariant_checks", "blocked")
        .with_code("pipeline_blocked")
        .with_deal("deal-1");
    store.insert_event(&finding).await.unwrap();

    let resolved = reconciler
        .resolve_for_deal("deal-1", "pipeline_blocked", "status_hook")
        .await
        .unwrap();
    assert_eq!(resolved, 1);

    let recoveries = store.list_events_by_type(EventType::Recovery, 10).await.unwrap();
    assert_eq!(recoveries.len(), 1);

    // Nothing left to resolve: no second recovery event.
    let resolved = reconciler
        .resolve_for_deal("deal-1", "pipeline_blocked", "status_hook")
        .await
        .unwrap();
    assert_eq!(resolved, 0);
    assert_eq!(store.list_events_by_type(EventType::Recovery, 10).await.unwrap().len(), 1);
}
