//! Pipeline Sentinel — autonomous health observer for the document pipeline.
//!
//! An external scheduler invokes [`tick::Sentinel::run_tick`] on a fixed
//! interval. Each tick detects systemic failures, recovers stuck and failed
//! jobs, runs cross-record invariant checks, reaps dead workers, and records
//! every decision in the append-only event ledger. The sentinel never
//! executes pipeline business logic and never lets a fault escape to its
//! caller.

pub mod checks;
pub mod classify;
pub mod config;
pub mod error;
pub mod events;
pub mod jobs;
pub mod store;
pub mod systemic;
pub mod tick;
pub mod workers;

pub use config::SentinelConfig;
pub use error::{Error, Result, StorageError};
pub use tick::{Sentinel, TickReport};
