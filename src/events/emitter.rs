//! Fire-and-forget ledger writer.
//!
//! Observability must never be load-bearing: a failed write is logged and
//! reported as `ok = false`, never raised. Callers must not depend on the
//! write having happened, and failed writes are never retried (retrying
//! during a storage outage only amplifies it).

use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::SentinelConfig;
use crate::events::model::SystemEvent;
use crate::store::traits::LedgerStore;

/// Payload budget per event. Anything larger is replaced, not rejected.
pub const MAX_PAYLOAD_BYTES: usize = 8 * 1024;

/// Result of an emit attempt.
#[derive(Debug, Clone, Copy)]
pub struct EmitOutcome {
    pub ok: bool,
    pub id: Option<Uuid>,
}

/// Writes events to the ledger, stamping deployment tags.
#[derive(Clone)]
pub struct EventEmitter {
    ledger: Arc<dyn LedgerStore>,
    environment: String,
    release: String,
}

impl EventEmitter {
    pub fn new(ledger: Arc<dyn LedgerStore>, config: &SentinelConfig) -> Self {
        Self {
            ledger,
            environment: config.environment.clone(),
            release: config.release.clone(),
        }
    }

    /// Append one event. Never returns an error and never panics.
    pub async fn emit(&self, mut event: SystemEvent) -> EmitOutcome {
        event.environment = self.environment.clone();
        event.release = self.release.clone();

        if let Some(payload) = event.payload.take() {
            event.payload = Some(cap_payload(payload));
        }

        match self.ledger.insert_event(&event).await {
            Ok(id) => {
                debug!(event_type = %event.event_type, source = %event.source, "Event recorded");
                EmitOutcome { ok: true, id: Some(id) }
            }
            Err(e) => {
                warn!(
                    event_type = %event.event_type,
                    source = %event.source,
                    error = %e,
                    "Dropped ledger event"
                );
                EmitOutcome { ok: false, id: None }
            }
        }
    }
}

/// Replace payloads over budget with a stub noting the original size.
fn cap_payload(payload: serde_json::Value) -> serde_json::Value {
    let size = serde_json::to_string(&payload).map(|s| s.len()).unwrap_or(0);
    if size > MAX_PAYLOAD_BYTES {
        serde_json::json!({ "truncated": true, "original_bytes": size })
    } else {
        payload
    }
}
