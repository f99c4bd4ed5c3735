//! Systemic failure detection.
//!
//! One deal retrying itself is a bug; many deals hitting the same wall is
//! an outage. Aggregates recent ledger signatures and, for each signature
//! clearing both thresholds (hit count AND distinct deals), emits a single
//! summary event and bulk-suppresses the matching open findings. The
//! returned signature set lets the scanner skip retry scheduling for the
//! same failures in the same tick, which is what prevents a retry storm
//! while the outage is live.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{info, warn};

use crate::config::SystemicThresholds;
use crate::error::StorageError;
use crate::events::emitter::EventEmitter;
use crate::events::model::{EventType, ResolutionStatus, Severity, SystemEvent};
use crate::store::traits::{LedgerStore, SignatureAggregate};

/// Result of one detection sweep.
#[derive(Debug, Default)]
pub struct SystemicSweep {
    /// Signatures that qualified this tick.
    pub failures: Vec<SignatureAggregate>,
    /// Open findings flipped to `suppressed`.
    pub events_suppressed: usize,
    /// Summary events successfully written.
    pub events_emitted: u64,
}

impl SystemicSweep {
    /// The suppressed-signature set the scanner consults.
    pub fn signatures(&self) -> HashSet<String> {
        self.failures.iter().map(|f| f.signature.clone()).collect()
    }
}

/// Detects widespread outages from ledger signature clusters.
pub struct SystemicFailureDetector {
    ledger: Arc<dyn LedgerStore>,
    emitter: EventEmitter,
    thresholds: SystemicThresholds,
}

impl SystemicFailureDetector {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        emitter: EventEmitter,
        thresholds: SystemicThresholds,
    ) -> Self {
        Self {
            ledger,
            emitter,
            thresholds,
        }
    }

    /// Run one sweep. Aggregation errors abort the sweep; per-signature
    /// suppression errors are logged and skipped so one bad signature does
    /// not block the rest.
    pub async fn detect(&self) -> Result<SystemicSweep, StorageError> {
        let window = Duration::from_std(self.thresholds.window)
            .unwrap_or_else(|_| Duration::minutes(60));
        let since = Utc::now() - window;

        let failures = self
            .ledger
            .aggregate_open_signatures(since, self.thresholds.min_count, self.thresholds.min_entities)
            .await?;

        let mut sweep = SystemicSweep::default();

        for failure in &failures {
            info!(
                signature = %failure.signature,
                hits = failure.hits,
                deals = failure.distinct_deals,
                "Systemic failure detected"
            );

            let summary = SystemEvent::new(
                EventType::Suppressed,
                "systemic_detector",
                format!(
                    "Systemic failure: {} hits across {} deals ({})",
                    failure.hits, failure.distinct_deals, failure.sample_message
                ),
            )
            .with_severity(Severity::Error)
            .with_signature(failure.signature.clone())
            .with_code(failure.error_code.clone().unwrap_or_else(|| "unknown".to_string()))
            // The summary is a record of the suppression itself, not a new
            // finding; born suppressed so sweeps never re-handle it.
            .with_resolution(ResolutionStatus::Suppressed)
            .with_payload(serde_json::json!({
                "hits": failure.hits,
                "distinct_deals": failure.distinct_deals,
                "first_seen": failure.first_seen.to_rfc3339(),
                "last_seen": failure.last_seen.to_rfc3339(),
            }));

            if self.emitter.emit(summary).await.ok {
                sweep.events_emitted += 1;
            }

            match self
                .ledger
                .suppress_open_by_signature(&failure.signature, "systemic outage suppression")
                .await
            {
                Ok(count) => sweep.events_suppressed += count,
                Err(e) => {
                    warn!(signature = %failure.signature, error = %e, "Suppression sweep failed");
                }
            }
        }

        sweep.failures = failures;
        Ok(sweep)
    }
}
