pub mod enums;
pub mod error;
pub mod structs;

// Re-export the core types to provide a clean public API.
pub use enums::{
    CredentialStatus, Exchange, PayloadKind, Permission, SyncErrorKind, SyncPhase, SyncStatus,
    TransactionType,
};
pub use error::CoreError;
pub use structs::{
    Balance, BalanceSyncResult, CredentialSummary, RawPayload, SyncItemError, TradingPair,
    Transaction, TransactionFilter, TransactionSyncResult,
};
