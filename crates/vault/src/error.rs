use core_types::{Exchange, Permission};
use database::DbError;
use envelope::EnvelopeError;
use thiserror::Error;

/// Why a credential was refused at connect time. Nothing is persisted when
/// any of these is returned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerificationError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("The key cannot read account data")]
    ReadAccessMissing,

    #[error("The key is not read-only; it also grants: {}", describe(.0))]
    PermissionEscalation(Vec<Permission>),

    #[error("The exchange rejected the key: {0}")]
    Rejected(String),

    #[error("Permission probe failed: {0}")]
    ProbeFailed(String),
}

fn describe(permissions: &[Permission]) -> String {
    permissions
        .iter()
        .map(|p| p.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Credential verification failed: {0}")]
    Verification(#[from] VerificationError),

    #[error("No {exchange} credential is connected for user {user_id}")]
    NotConnected { user_id: String, exchange: Exchange },

    #[error("Stored credential cannot be decrypted; reconnect required: {0}")]
    Decryption(#[from] EnvelopeError),

    #[error("Decrypted credential is not valid UTF-8; reconnect required")]
    CorruptSecret,

    #[error("Credential storage error: {0}")]
    Storage(#[from] DbError),
}
