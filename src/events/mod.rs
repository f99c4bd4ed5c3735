//! System event ledger: model, fire-and-forget writer, reconciliation.

pub mod emitter;
pub mod model;
pub mod resolve;

pub use emitter::{EmitOutcome, EventEmitter, MAX_PAYLOAD_BYTES};
pub use model::{EventType, ResolutionStatus, Severity, SystemEvent};
pub use resolve::Reconciler;
