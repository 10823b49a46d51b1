//! Maps component errors onto the caller-facing [`SyncErrorKind`] taxonomy and
//! decides what a credential-fatal error does to the stored status.

use api_client::ApiError;
use core_types::{CredentialStatus, SyncErrorKind};
use normalizer::NormalizeError;
use vault::VaultError;

pub fn api_error_kind(error: &ApiError) -> SyncErrorKind {
    match error {
        ApiError::Network(_) | ApiError::Timeout | ApiError::RequestBuild(_) => {
            SyncErrorKind::Network
        }
        ApiError::RateLimited { .. } | ApiError::BudgetExhausted(_) => SyncErrorKind::RateLimited,
        ApiError::Authentication(_) | ApiError::KeyRevoked(_) | ApiError::PermissionDenied(_) => {
            SyncErrorKind::Authentication
        }
        ApiError::Signing(_) => SyncErrorKind::Signing,
        ApiError::Exchange { status, .. } if *status >= 500 => SyncErrorKind::Network,
        ApiError::Exchange { .. } | ApiError::Deserialization(_) | ApiError::InvalidData(_) => {
            SyncErrorKind::InvalidResponse
        }
    }
}

pub fn normalize_error_kind(_error: &NormalizeError) -> SyncErrorKind {
    SyncErrorKind::InvalidResponse
}

pub fn vault_error_kind(error: &VaultError) -> SyncErrorKind {
    match error {
        VaultError::Decryption(_) | VaultError::CorruptSecret => SyncErrorKind::Decryption,
        VaultError::NotConnected { .. } => SyncErrorKind::Unavailable,
        VaultError::Verification(_) => SyncErrorKind::PermissionEscalationDetected,
        VaultError::Storage(_) => SyncErrorKind::InvalidResponse,
    }
}

/// The stored status a credential-fatal error leaves behind.
pub fn fatal_status(error: &ApiError) -> CredentialStatus {
    match error {
        ApiError::KeyRevoked(_) => CredentialStatus::Revoked,
        _ => CredentialStatus::Error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use api_client::SigningError;
    use std::time::Duration;

    #[test]
    fn transient_errors_keep_their_class() {
        assert_eq!(
            api_error_kind(&ApiError::RateLimited { retry_after: None }),
            SyncErrorKind::RateLimited
        );
        assert_eq!(
            api_error_kind(&ApiError::BudgetExhausted(Duration::from_secs(1))),
            SyncErrorKind::RateLimited
        );
        assert_eq!(api_error_kind(&ApiError::Timeout), SyncErrorKind::Network);
        let outage = ApiError::Exchange {
            status: 502,
            code: None,
            message: "bad gateway".into(),
        };
        assert_eq!(api_error_kind(&outage), SyncErrorKind::Network);
    }

    #[test]
    fn fatal_errors_are_credential_fatal_kinds() {
        for error in [
            ApiError::Authentication("bad key".into()),
            ApiError::KeyRevoked("gone".into()),
            ApiError::Signing(SigningError::MissingNonce),
        ] {
            assert!(api_error_kind(&error).is_credential_fatal(), "{error}");
        }
    }

    #[test]
    fn revoked_keys_are_marked_revoked() {
        assert_eq!(
            fatal_status(&ApiError::KeyRevoked("Invalid Api-Key ID.".into())),
            CredentialStatus::Revoked
        );
        assert_eq!(
            fatal_status(&ApiError::Authentication("signature".into())),
            CredentialStatus::Error
        );
    }
}
