//! Cross-record invariant checks.
//!
//! Four reconciliation rules run in fixed order, each fault-isolated: one
//! rule's storage error is recorded and the next rule still runs. The order
//! matters — rule 2 (orphans) assumes the scanner's stuck pass already ran
//! this tick, and rule 4 reads sub-job states rules 1–2 may have just
//! repaired.

pub mod blocked;
pub mod generation;
pub mod orphans;
pub mod stale;

use std::sync::Arc;

use tracing::warn;

use crate::config::SentinelConfig;
use crate::events::emitter::EventEmitter;
use crate::store::traits::{JobStore, LedgerStore, PipelineStore, WorkerStore};

/// Findings/heals per rule, aggregated by the tick without interpretation.
#[derive(Debug, Default, Clone)]
pub struct CheckCounters {
    pub reports_flagged: u64,
    pub reports_healed: u64,
    pub orphans_requeued: u64,
    pub blocked_deals_flagged: u64,
    pub stale_documents: u64,
    pub silent_failures: u64,
    pub events_emitted: u64,
}

/// Shared dependencies for the rules.
pub struct CheckContext {
    pub jobs: Arc<dyn JobStore>,
    pub workers: Arc<dyn WorkerStore>,
    pub ledger: Arc<dyn LedgerStore>,
    pub pipeline: Arc<dyn PipelineStore>,
    pub emitter: EventEmitter,
    pub config: SentinelConfig,
}

impl CheckContext {
    /// Run all rules in order. Returns counters plus the error strings of
    /// any rule that failed outright.
    pub async fn run_all(&self) -> (CheckCounters, Vec<String>) {
        let mut counters = CheckCounters::default();
        let mut errors = Vec::new();

        if let Err(e) = generation::run(self, &mut counters).await {
            warn!(error = %e, "Generation check failed");
            errors.push(format!("generation check: {e}"));
        }
        if let Err(e) = orphans::run(self, &mut counters).await {
            warn!(error = %e, "Orphan check failed");
            errors.push(format!("orphan check: {e}"));
        }
        if let Err(e) = blocked::run(self, &mut counters).await {
            warn!(error = %e, "Blocked-downstream check failed");
            errors.push(format!("blocked check: {e}"));
        }
        if let Err(e) = stale::run(self, &mut counters).await {
            warn!(error = %e, "Stale-status check failed");
            errors.push(format!("stale check: {e}"));
        }

        (counters, errors)
    }
}
