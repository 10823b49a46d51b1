//! # Sync Engine
//!
//! Runs balance and transaction syncs for linked exchange credentials.
//!
//! - [`SyncOrchestrator`] owns one run: probe, balance snapshot, bounded
//!   fan-out of history items with retry and backoff, aggregation, and a
//!   single end-of-run write of the credential's status.
//! - [`ExchangeSyncService`] is the facade callers use: connect, sync,
//!   sync everything, disconnect and list.

pub mod classify;
pub mod error;
pub mod orchestrator;
pub mod retry;
pub mod service;
pub mod valuation;

pub use error::EngineError;
pub use orchestrator::{OrchestratorSettings, SyncOrchestrator};
pub use retry::RetryPolicy;
pub use service::ExchangeSyncService;
pub use tokio_util::sync::CancellationToken;
