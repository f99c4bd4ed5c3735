//! Persistence layer — libSQL-backed storage behind capability traits.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlStore;
pub use traits::{
    DocumentRecord, DocumentStatus, JobStore, LedgerStore, PipelineStore, ReportRecord,
    ReportStatus, SentinelStore, SignatureAggregate, WorkerStore,
};
