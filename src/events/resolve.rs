//! Reconciliation hooks for closing ledger findings.
//!
//! The generic scans never touch terminal findings; these narrowly-scoped
//! sweeps are the only way a finding becomes `resolved`. Downstream status
//! hooks call them once the real-world condition clears (e.g. a deal's
//! documents all land, so open `pipeline_blocked` findings are closed).

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::error::StorageError;
use crate::events::emitter::EventEmitter;
use crate::events::model::{EventType, ResolutionStatus, SystemEvent};
use crate::store::traits::LedgerStore;

/// Closes findings by correlation once their condition clears.
pub struct Reconciler {
    ledger: Arc<dyn LedgerStore>,
    emitter: EventEmitter,
}

impl Reconciler {
    pub fn new(ledger: Arc<dyn LedgerStore>, emitter: EventEmitter) -> Self {
        Self { ledger, emitter }
    }

    /// Resolve every open/retrying/suppressed finding for a deal + code.
    /// Emits a single `recovery` event when anything actually closed.
    pub async fn resolve_for_deal(
        &self,
        deal_id: &str,
        code: &str,
        resolved_by: &str,
    ) -> Result<usize, StorageError> {
        let resolved = self
            .ledger
            .resolve_open_for_deal(deal_id, code, resolved_by)
            .await?;

        if resolved > 0 {
            info!(deal_id, code, resolved, "Resolved findings for deal");
            self.emitter
                .emit(
                    SystemEvent::new(
                        EventType::Recovery,
                        "reconciler",
                        format!("{resolved} finding(s) for code '{code}' resolved"),
                    )
                    .with_deal(deal_id)
                    .with_code(code)
                    // Born terminal: a recovery record must never match a
                    // later open-finding query for the same deal + code.
                    .with_resolution(ResolutionStatus::Resolved),
                )
                .await;
        }

        Ok(resolved)
    }

    /// Resolve an explicit set of findings by id. Open/retrying only; a
    /// suppressed finding stays suppressed until its deal-level sweep.
    pub async fn resolve_by_ids(
        &self,
        ids: &[Uuid],
        resolved_by: &str,
    ) -> Result<usize, StorageError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let resolved = self.ledger.resolve_by_ids(ids, resolved_by).await?;
        if resolved > 0 {
            info!(resolved, resolved_by, "Resolved findings by id");
            self.emitter
                .emit(
                    SystemEvent::new(
                        EventType::Recovery,
                        "reconciler",
                        format!("{resolved} finding(s) resolved by {resolved_by}"),
                    )
                    .with_resolution(ResolutionStatus::Resolved),
                )
                .await;
        }
        Ok(resolved)
    }
}
