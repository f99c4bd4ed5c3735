//! Rule 3: blocked downstream detection.
//!
//! Correlates recent report-rejection events ("report requested but inputs
//! not ready") against upstream jobs for the same deal still non-terminal
//! past the staleness threshold. Flags only — deciding whether to force the
//! report or fix the stuck inputs needs a human.

use chrono::Utc;

use crate::checks::{CheckContext, CheckCounters};
use crate::error::StorageError;
use crate::events::model::{EventType, Severity, SystemEvent};

/// Emitted by the report service when it refuses to generate.
const CODE_REJECTED: &str = "report_blocked";
/// Our correlated finding.
const CODE_BLOCKED: &str = "pipeline_blocked";

pub(super) async fn run(
    ctx: &CheckContext,
    counters: &mut CheckCounters,
) -> Result<(), StorageError> {
    let now = Utc::now();
    let window_start = now - duration(ctx.config.checks.rejection_window);
    let staleness_cutoff = now - duration(ctx.config.checks.blocked_staleness);

    let rejections = ctx
        .ledger
        .list_recent_by_code(CODE_REJECTED, window_start, ctx.config.batch_size)
        .await?;

    let mut seen_deals = Vec::new();
    for rejection in rejections {
        let Some(deal_id) = rejection.deal_id else {
            continue;
        };
        if seen_deals.contains(&deal_id) {
            continue;
        }
        seen_deals.push(deal_id.clone());

        if ctx
            .ledger
            .has_open_finding_for_deal(CODE_BLOCKED, &deal_id)
            .await?
        {
            continue;
        }

        let stale = ctx
            .jobs
            .list_stale_active_for_deal(&deal_id, staleness_cutoff)
            .await?;
        if stale.is_empty() {
            continue;
        }
        counters.blocked_deals_flagged += 1;

        let job_refs: Vec<String> = stale
            .iter()
            .map(|j| format!("{}/{}", j.source.table(), j.id))
            .collect();
        tracing::warn!(deal_id = %deal_id, stale_jobs = stale.len(), "Deal blocked by stale upstream jobs");

        let event = SystemEvent::new(
            EventType::Warning,
            "invariant_checks",
            format!(
                "Report for deal {} rejected while {} upstream job(s) sit stale",
                deal_id,
                stale.len()
            ),
        )
        .with_severity(Severity::Error)
        .with_code(CODE_BLOCKED)
        .with_deal(deal_id)
        .with_payload(serde_json::json!({ "stale_jobs": job_refs }));
        if ctx.emitter.emit(event).await.ok {
            counters.events_emitted += 1;
        }
    }

    Ok(())
}

fn duration(d: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::minutes(30))
}
