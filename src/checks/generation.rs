//! Rule 1: report generation stalls.
//!
//! A report stuck in `generating` past the warn threshold gets a warning
//! finding (deduped against an existing open finding for the same report).
//! Past the critical threshold it is auto-healed to `error` so the pipeline
//! regenerates it — the `generating`-guarded CAS doubles as the fire-once
//! guard: a healed report no longer matches, so the heal cannot repeat.

use chrono::Utc;

use crate::checks::{CheckContext, CheckCounters};
use crate::error::StorageError;
use crate::events::model::{EventType, ResolutionStatus, Severity, SystemEvent};

const CODE_STALLED: &str = "report_generation_stalled";

pub(super) async fn run(
    ctx: &CheckContext,
    counters: &mut CheckCounters,
) -> Result<(), StorageError> {
    let now = Utc::now();
    let warn_cutoff = now - duration(ctx.config.checks.report_warn);
    let critical_cutoff = now - duration(ctx.config.checks.report_critical);

    let reports = ctx
        .pipeline
        .list_generating_reports(warn_cutoff, ctx.config.batch_size)
        .await?;

    for report in reports {
        let Some(started) = report.started_generating_at else {
            continue;
        };
        let stalled_min = (now - started).num_minutes();

        if started <= critical_cutoff {
            if !ctx.pipeline.heal_report(&report.id).await? {
                continue;
            }
            counters.reports_healed += 1;
            tracing::warn!(report_id = %report.id, deal_id = %report.deal_id, stalled_min, "Auto-healed stalled report");

            let event = SystemEvent::new(
                EventType::Warning,
                "invariant_checks",
                format!(
                    "Report {} generating for {} min; reset to error for regeneration",
                    report.id, stalled_min
                ),
            )
            .with_severity(Severity::Critical)
            .with_code(CODE_STALLED)
            .with_job(&report.id, "reports")
            .with_deal(report.deal_id.clone())
            .with_resolution(ResolutionStatus::Resolved)
            .with_note("auto-healed: status reset to error");
            if ctx.emitter.emit(event).await.ok {
                counters.events_emitted += 1;
            }
            continue;
        }

        // Warn-level: flag once while the breach is open.
        if ctx.ledger.has_open_finding(CODE_STALLED, &report.id).await? {
            continue;
        }
        counters.reports_flagged += 1;

        let event = SystemEvent::new(
            EventType::Warning,
            "invariant_checks",
            format!("Report {} generating for {} min", report.id, stalled_min),
        )
        .with_code(CODE_STALLED)
        .with_job(&report.id, "reports")
        .with_deal(report.deal_id.clone())
        .with_payload(serde_json::json!({ "started_generating_at": started.to_rfc3339() }));
        if ctx.emitter.emit(event).await.ok {
            counters.events_emitted += 1;
        }
    }

    Ok(())
}

fn duration(d: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::minutes(30))
}
