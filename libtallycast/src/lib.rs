//! Tallycast - social analytics ingestion
//!
//! This library fetches posts and engagement metrics from a set of social
//! networks, reconciles them against stored state, appends engagement
//! snapshots and keeps per-source averages up to date.

pub mod config;
pub mod credentials;
pub mod db;
pub mod error;
pub mod logging;
pub mod normalize;
pub mod pacing;
pub mod reconcile;
pub mod sources;
pub mod stats;
pub mod sync;
pub mod transport;
pub mod types;
pub mod urls;

// Re-export commonly used types
pub use config::Config;
pub use credentials::{CredentialStore, DatabaseCredentialStore, MemoryCredentialStore, SourceToken};
pub use db::Database;
pub use error::{FetchError, Result, TallyError};
pub use sources::{AdapterRegistry, FetchContext, SourceAdapter};
pub use sync::{SourceOutcome, SyncService};
pub use transport::Transports;
pub use types::{Network, Post, ReactionSnapshot, RunReport, Source, StatsSummary, SyncStatus};
