use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The exchanges a user can link. Each one speaks a different signing protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
pub enum Exchange {
    Binance,
    Kraken,
    Coinbase,
}

impl Exchange {
    pub const ALL: [Exchange; 3] = [Exchange::Binance, Exchange::Kraken, Exchange::Coinbase];

    pub fn as_str(&self) -> &'static str {
        match self {
            Exchange::Binance => "binance",
            Exchange::Kraken => "kraken",
            Exchange::Coinbase => "coinbase",
        }
    }

    /// Whether every private call must carry a strictly increasing nonce.
    /// Such exchanges get a serialized lane per credential.
    pub fn requires_nonce(&self) -> bool {
        matches!(self, Exchange::Kraken)
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Exchange {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "binance" => Ok(Exchange::Binance),
            "kraken" => Ok(Exchange::Kraken),
            "coinbase" => Ok(Exchange::Coinbase),
            other => Err(CoreError::UnsupportedExchange(other.to_string())),
        }
    }
}

/// A capability an API key has been granted by the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Permission {
    Read,
    Trade,
    Withdraw,
    Transfer,
    Margin,
    Futures,
}

impl Permission {
    /// Anything other than `Read` can move or put funds at risk.
    pub fn is_destructive(&self) -> bool {
        !matches!(self, Permission::Read)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Read => "read",
            Permission::Trade => "trade",
            Permission::Withdraw => "withdraw",
            Permission::Transfer => "transfer",
            Permission::Margin => "margin",
            Permission::Futures => "futures",
        }
    }
}

impl FromStr for Permission {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(Permission::Read),
            "trade" => Ok(Permission::Trade),
            "withdraw" => Ok(Permission::Withdraw),
            "transfer" => Ok(Permission::Transfer),
            "margin" => Ok(Permission::Margin),
            "futures" => Ok(Permission::Futures),
            other => Err(CoreError::InvalidInput("permission".into(), other.into())),
        }
    }
}

/// Lifecycle status of a stored credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CredentialStatus {
    Active,
    Error,
    Revoked,
}

impl CredentialStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialStatus::Active => "active",
            CredentialStatus::Error => "error",
            CredentialStatus::Revoked => "revoked",
        }
    }
}

impl fmt::Display for CredentialStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CredentialStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(CredentialStatus::Active),
            "error" => Ok(CredentialStatus::Error),
            "revoked" => Ok(CredentialStatus::Revoked),
            other => Err(CoreError::InvalidInput("credential status".into(), other.into())),
        }
    }
}

/// The closed set of transaction types every exchange vocabulary is folded into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Buy,
    Sell,
    Deposit,
    Withdrawal,
    Other,
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransactionType::Buy => "buy",
            TransactionType::Sell => "sell",
            TransactionType::Deposit => "deposit",
            TransactionType::Withdrawal => "withdrawal",
            TransactionType::Other => "other",
        };
        f.write_str(s)
    }
}

/// Which response shape a raw payload carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadKind {
    Balances,
    Trades,
    Deposits,
    Withdrawals,
    Ledger,
    AccountTransactions,
}

/// Overall outcome of one sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    Succeeded,
    PartialSuccess,
    Failed,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncStatus::Succeeded => "succeeded",
            SyncStatus::PartialSuccess => "partial success",
            SyncStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// States of a single sync run: `Idle -> Probing -> Fetching -> {terminal}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncPhase {
    Idle,
    Probing,
    Fetching,
    Succeeded,
    PartialSuccess,
    Failed,
}

impl SyncPhase {
    /// Returns whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(&self, next: SyncPhase) -> bool {
        use SyncPhase::*;
        matches!(
            (self, next),
            (Idle, Probing)
                | (Probing, Fetching)
                | (Probing, Failed)
                | (Fetching, Succeeded)
                | (Fetching, PartialSuccess)
                | (Fetching, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SyncPhase::Succeeded | SyncPhase::PartialSuccess | SyncPhase::Failed
        )
    }
}

impl From<SyncStatus> for SyncPhase {
    fn from(status: SyncStatus) -> Self {
        match status {
            SyncStatus::Succeeded => SyncPhase::Succeeded,
            SyncStatus::PartialSuccess => SyncPhase::PartialSuccess,
            SyncStatus::Failed => SyncPhase::Failed,
        }
    }
}

/// Error taxonomy surfaced to callers for every failed item or run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncErrorKind {
    /// Stored secret is corrupted or the master key changed. Reconnect required.
    Decryption,
    /// Malformed credential or clock skew.
    Signing,
    /// The key can do more than read. Reconnect with a read-only key required.
    PermissionEscalationDetected,
    /// Key rejected, revoked, or lacking read access.
    Authentication,
    RateLimited,
    Network,
    InvalidResponse,
    DeadlineExceeded,
    Cancelled,
    /// Skipped because a credential-level failure stopped the run.
    Aborted,
    /// The credential is not `Active`; nothing was fetched.
    Unavailable,
}

impl SyncErrorKind {
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncErrorKind::RateLimited | SyncErrorKind::Network)
    }

    /// Fatal for the whole credential, not just the item.
    pub fn is_credential_fatal(&self) -> bool {
        matches!(
            self,
            SyncErrorKind::Decryption
                | SyncErrorKind::Signing
                | SyncErrorKind::PermissionEscalationDetected
                | SyncErrorKind::Authentication
        )
    }
}

impl fmt::Display for SyncErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exchange_parses_case_insensitively() {
        assert_eq!("Kraken".parse::<Exchange>().unwrap(), Exchange::Kraken);
        assert_eq!(" BINANCE ".parse::<Exchange>().unwrap(), Exchange::Binance);
        assert!("bitmex".parse::<Exchange>().is_err());
    }

    #[test]
    fn only_kraken_needs_a_nonce_lane() {
        assert!(Exchange::Kraken.requires_nonce());
        assert!(!Exchange::Binance.requires_nonce());
        assert!(!Exchange::Coinbase.requires_nonce());
    }

    #[test]
    fn sync_phase_transitions() {
        assert!(SyncPhase::Idle.can_transition_to(SyncPhase::Probing));
        assert!(SyncPhase::Probing.can_transition_to(SyncPhase::Failed));
        assert!(!SyncPhase::Probing.can_transition_to(SyncPhase::Succeeded));
        assert!(!SyncPhase::Idle.can_transition_to(SyncPhase::Fetching));
        assert!(!SyncPhase::Failed.can_transition_to(SyncPhase::Probing));
        assert!(SyncPhase::PartialSuccess.is_terminal());
    }

    #[test]
    fn read_is_the_only_safe_permission() {
        assert!(!Permission::Read.is_destructive());
        assert!(Permission::Trade.is_destructive());
        assert!(Permission::Withdraw.is_destructive());
    }
}
