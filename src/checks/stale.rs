//! Rule 4: stale-status / silent-failure cross-check.
//!
//! Second-opinion pass over data the primary pipeline already wrote:
//! re-derives a document's expected status from the actual terminal states
//! of its extraction sub-jobs. Disagreements are only ever *flagged* — this
//! rule writes ledger findings, never job or document status.

use crate::checks::{CheckContext, CheckCounters};
use crate::error::StorageError;
use crate::events::model::{EventType, Severity, SystemEvent};
use crate::jobs::model::{JobSource, JobStatus};
use crate::store::traits::DocumentStatus;

const CODE_STALE: &str = "document_status_stale";
const CODE_SILENT: &str = "silent_failure";

pub(super) async fn run(
    ctx: &CheckContext,
    counters: &mut CheckCounters,
) -> Result<(), StorageError> {
    let documents = ctx
        .pipeline
        .list_unsettled_documents(ctx.config.batch_size)
        .await?;

    for doc in documents {
        let subjobs = ctx.jobs.list_for_document(JobSource::Extract, &doc.id).await?;
        if subjobs.is_empty() {
            continue;
        }

        let all_succeeded = subjobs.iter().all(|j| j.status == JobStatus::Succeeded);
        if all_succeeded && doc.status != DocumentStatus::Ready {
            if !ctx.ledger.has_open_finding(CODE_STALE, &doc.id).await? {
                counters.stale_documents += 1;
                tracing::warn!(
                    document_id = %doc.id,
                    status = doc.status.as_str(),
                    subjobs = subjobs.len(),
                    "Document status stale: all sub-jobs succeeded"
                );
                let event = SystemEvent::new(
                    EventType::Warning,
                    "invariant_checks",
                    format!(
                        "Document {} is '{}' but all {} extraction sub-jobs succeeded",
                        doc.id,
                        doc.status.as_str(),
                        subjobs.len()
                    ),
                )
                .with_severity(Severity::Critical)
                .with_code(CODE_STALE)
                .with_job(&doc.id, "documents")
                .with_document(doc.id.clone())
                .with_deal(doc.deal_id.clone());
                if ctx.emitter.emit(event).await.ok {
                    counters.events_emitted += 1;
                }
            }
            continue;
        }

        // Failed sub-jobs nobody surfaced: link the failure to the document
        // so the downstream symptom has a cause attached.
        for job in subjobs
            .iter()
            .filter(|j| matches!(j.status, JobStatus::Failed | JobStatus::Dead))
        {
            if ctx.ledger.has_any_event_for_job(&job.id).await? {
                continue;
            }
            counters.silent_failures += 1;
            tracing::warn!(
                document_id = %doc.id,
                job_id = %job.id,
                "Sub-job failed without any ledger trace"
            );
            let mut event = SystemEvent::new(
                EventType::Error,
                "invariant_checks",
                format!(
                    "Extraction job {} for document {} failed with no recorded finding: {}",
                    job.id,
                    doc.id,
                    job.last_error.as_deref().unwrap_or("(no error text)")
                ),
            )
            .with_code(CODE_SILENT)
            .with_job(&job.id, JobSource::Extract.table())
            .with_document(doc.id.clone())
            .with_deal(doc.deal_id.clone());
            if let Some(error) = &job.last_error {
                event = event.with_payload(serde_json::json!({ "last_error": error }));
            }
            if ctx.emitter.emit(event).await.ok {
                counters.events_emitted += 1;
            }
        }
    }

    Ok(())
}
