//! Job records and the health scanner.

pub mod model;
pub mod scanner;

pub use model::{JobRecord, JobSource, JobStatus};
pub use scanner::{JobDecision, JobHealthScanner, ScanOutcome};
