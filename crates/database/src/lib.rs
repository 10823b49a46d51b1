//! # Credential Store
//!
//! Persistence for encrypted exchange credentials. The vault talks to the
//! [`CredentialStore`] trait; this crate provides a PostgreSQL
//! implementation and an in-memory one.
//!
//! ## Architectural Principles
//!
//! - **Envelopes only:** records carry sealed envelopes, never plaintext.
//!   Each envelope is stored as IV, ciphertext and tag bytes plus its
//!   algorithm identifier.
//! - **One row per `(user, exchange)`:** `save` is an upsert that keeps the
//!   record id, so a reconnect replaces secrets in place.
//! - **Hard delete:** `delete` removes the row; nothing is archived.
//! - **Atomic sync outcome:** `update_sync_state` writes status, last sync
//!   time and last error in one statement, keyed by id so a record deleted
//!   mid-sync is not brought back.
//!
//! ## Public API
//!
//! - `connect` / `run_migrations`: pool setup from `DATABASE_URL`.
//! - `PgCredentialStore`, `MemoryCredentialStore`: the two stores.
//! - `ExchangeCredential`, `SyncStateUpdate`: the stored record and its
//!   end-of-run update.

// Declare the modules that constitute this crate.
pub mod connection;
pub mod error;
pub mod memory;
pub mod postgres;
pub mod record;
pub mod store;

// Re-export the key components to create a clean, public-facing API.
pub use connection::{connect, run_migrations};
pub use error::DbError;
pub use memory::MemoryCredentialStore;
pub use postgres::PgCredentialStore;
pub use record::{ExchangeCredential, SyncStateUpdate};
pub use store::CredentialStore;
