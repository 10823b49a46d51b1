//! The sync run: `Idle -> Probing -> Fetching -> {Succeeded | PartialSuccess | Failed}`.
//!
//! A run first checks that the stored credential is still `Active`, decrypts
//! it and re-probes its permissions. Only a read-only key reaches `Fetching`.
//! The balance payload is the run's anchor: if it cannot be fetched the run
//! fails, otherwise history items are fanned out with bounded concurrency and
//! every item succeeds or fails on its own. Within an item, rows that cannot
//! be normalized are reported one by one next to the rows that could.
//!
//! The credential's stored status is written once, when the run is over.
//! A cancelled run writes nothing.

use crate::classify::{api_error_kind, fatal_status, normalize_error_kind, vault_error_kind};
use crate::error::EngineError;
use crate::retry::RetryPolicy;
use crate::valuation::{top_assets, total_value, value_balances};
use api_client::{
    ApiError, DecryptedCredential, ExchangeConnector, FetchItem, PriceOracle, SkippedSource,
};
use chrono::Utc;
use configuration::SyncSettings;
use core_types::{
    Balance, BalanceSyncResult, CredentialStatus, Exchange, RawPayload, SyncErrorKind,
    SyncItemError, SyncPhase, SyncStatus, Transaction, TransactionFilter, TransactionSyncResult,
};
use database::{ExchangeCredential, SyncStateUpdate};
use futures::stream::{self, StreamExt};
use normalizer::{NormalizeError, RejectedRow};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{Instant, sleep_until, timeout_at};
use tokio_util::sync::CancellationToken;
use vault::{CredentialVault, VaultError};

/// Orchestrator knobs taken from the sync configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub max_pairs: usize,
    pub max_concurrency: usize,
    pub deadline: Duration,
    pub retry: RetryPolicy,
}

impl From<&SyncSettings> for OrchestratorSettings {
    fn from(settings: &SyncSettings) -> Self {
        Self {
            max_pairs: settings.max_pairs.max(1),
            max_concurrency: settings.max_concurrency.max(1),
            deadline: settings.sync_deadline(),
            retry: RetryPolicy::from(settings),
        }
    }
}

/// Tracks the phase of one run and refuses to skip states.
#[derive(Debug)]
pub(crate) struct RunTracker {
    exchange: Exchange,
    phase: SyncPhase,
}

impl RunTracker {
    fn new(exchange: Exchange) -> Self {
        Self {
            exchange,
            phase: SyncPhase::Idle,
        }
    }

    fn advance(&mut self, next: SyncPhase) {
        debug_assert!(
            self.phase.can_transition_to(next),
            "illegal sync transition {:?} -> {next:?}",
            self.phase
        );
        tracing::debug!(
            exchange = %self.exchange,
            from = ?self.phase,
            to = ?next,
            "Sync phase changed."
        );
        self.phase = next;
    }

    fn finish(&mut self, status: SyncStatus) {
        self.advance(SyncPhase::from(status));
    }

    pub(crate) fn phase(&self) -> SyncPhase {
        self.phase
    }
}

/// Why a run stopped before producing a result, and what it leaves behind.
struct Stop {
    error: SyncItemError,
    /// `None` leaves the stored record untouched.
    update: Option<SyncStateUpdate>,
}

impl Stop {
    fn cancelled() -> Self {
        Self {
            error: SyncItemError::new("sync", SyncErrorKind::Cancelled, "sync cancelled by caller"),
            update: None,
        }
    }

    fn deadline() -> Self {
        let message = "sync deadline passed before the account could be read";
        Self {
            error: SyncItemError::new("sync", SyncErrorKind::DeadlineExceeded, message),
            update: Some(SyncStateUpdate::failed(CredentialStatus::Active, Utc::now(), message)),
        }
    }

    fn unavailable(status: CredentialStatus) -> Self {
        Self {
            error: SyncItemError::new(
                "credential",
                SyncErrorKind::Unavailable,
                format!("credential is {status}; reconnect required"),
            ),
            update: None,
        }
    }

    fn from_vault(error: VaultError) -> Self {
        let message = error.to_string();
        Self {
            error: SyncItemError::new("credential", vault_error_kind(&error), message.clone()),
            update: Some(SyncStateUpdate::failed(CredentialStatus::Error, Utc::now(), message)),
        }
    }

    fn from_api(item: &str, error: ApiError) -> Self {
        let message = error.to_string();
        let status = if error.is_credential_fatal() {
            fatal_status(&error)
        } else {
            CredentialStatus::Active
        };
        Self {
            error: SyncItemError::new(item, api_error_kind(&error), message.clone()),
            update: Some(SyncStateUpdate::failed(status, Utc::now(), message)),
        }
    }

    fn invalid(item: &str, error: NormalizeError) -> Self {
        let message = error.to_string();
        Self {
            error: SyncItemError::new(item, normalize_error_kind(&error), message.clone()),
            update: Some(SyncStateUpdate::failed(CredentialStatus::Active, Utc::now(), message)),
        }
    }

    fn refused(kind: SyncErrorKind, message: String) -> Self {
        Self {
            error: SyncItemError::new("permission probe", kind, message.clone()),
            update: Some(SyncStateUpdate::failed(CredentialStatus::Error, Utc::now(), message)),
        }
    }
}

/// A credential that passed probing, ready for fetches.
struct Session {
    credential: DecryptedCredential,
    connector: Arc<dyn ExchangeConnector>,
}

/// The account snapshot every run starts from.
struct Snapshot {
    payload: RawPayload,
    balances: Vec<Balance>,
    unpriced: Vec<String>,
    /// Balance rows that could not be normalized.
    rejected: Vec<SyncItemError>,
}

/// What one history item produced: its transactions and its unreadable rows.
type ItemBatch = (Vec<Transaction>, Vec<SyncItemError>);

fn rejected_row(item: &str, row: RejectedRow) -> SyncItemError {
    SyncItemError::new(
        format!("{item} row {}", row.reference),
        normalize_error_kind(&row.error),
        row.error.to_string(),
    )
}

fn skipped_source(source: SkippedSource) -> SyncItemError {
    SyncItemError::new(source.label, api_error_kind(&source.error), source.error.to_string())
}

/// The `last_error` a run with item failures leaves behind.
fn history_summary(failed_items: usize, attempted: usize, bad_rows: usize) -> String {
    match (failed_items, bad_rows) {
        (0, rows) => format!("{rows} history rows could not be read"),
        (failed, 0) => format!("{failed} of {attempted} history items failed"),
        (failed, rows) => format!(
            "{failed} of {attempted} history items failed; {rows} history rows could not be read"
        ),
    }
}

/// Shared by the fan-out: tripped by the first credential-fatal error so the
/// remaining items stop.
struct AbortSignal {
    token: CancellationToken,
    cause: Mutex<Option<(CredentialStatus, String)>>,
}

impl AbortSignal {
    fn new(parent: &CancellationToken) -> Self {
        Self {
            token: parent.child_token(),
            cause: Mutex::new(None),
        }
    }

    fn trip(&self, error: &ApiError) {
        if let Ok(mut cause) = self.cause.lock() {
            cause.get_or_insert_with(|| (fatal_status(error), error.to_string()));
        }
        self.token.cancel();
    }

    fn cause(&self) -> Option<(CredentialStatus, String)> {
        self.cause.lock().ok().and_then(|cause| cause.clone())
    }
}

enum ItemFailure {
    Api(ApiError),
    Normalize(NormalizeError),
}

pub struct SyncOrchestrator {
    vault: Arc<CredentialVault>,
    oracle: Arc<dyn PriceOracle>,
    settings: OrchestratorSettings,
}

impl SyncOrchestrator {
    pub fn new(
        vault: Arc<CredentialVault>,
        oracle: Arc<dyn PriceOracle>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            vault,
            oracle,
            settings,
        }
    }

    /// Fetches, normalizes and values the account's balances.
    pub async fn sync_balances(
        &self,
        user_id: &str,
        exchange: Exchange,
        cancel: &CancellationToken,
    ) -> Result<BalanceSyncResult, EngineError> {
        let record = self.vault.load(user_id, exchange).await?;
        let deadline = Instant::now() + self.settings.deadline;
        let mut run = RunTracker::new(exchange);
        run.advance(SyncPhase::Probing);

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Stop::cancelled()),
            result = timeout_at(deadline, self.snapshot(&record, &mut run)) => {
                result.unwrap_or_else(|_| Err(Stop::deadline()))
            }
        };

        let result = match outcome {
            Ok((_, mut snapshot)) => {
                let status = if snapshot.rejected.is_empty() {
                    SyncStatus::Succeeded
                } else {
                    SyncStatus::PartialSuccess
                };
                run.finish(status);
                snapshot.balances.sort_by(|a, b| {
                    b.value_usd.cmp(&a.value_usd).then_with(|| a.asset.cmp(&b.asset))
                });
                let now = Utc::now();
                let update = if snapshot.rejected.is_empty() {
                    SyncStateUpdate::healthy(now)
                } else {
                    SyncStateUpdate::failed(
                        CredentialStatus::Active,
                        now,
                        format!("{} balance rows could not be read", snapshot.rejected.len()),
                    )
                };
                self.persist(&record, update).await;
                BalanceSyncResult {
                    exchange,
                    status,
                    total_value_usd: total_value(&snapshot.balances),
                    balances: snapshot.balances,
                    errors: snapshot.rejected,
                    unpriced_assets: snapshot.unpriced,
                    synced_at: now,
                }
            }
            Err(stop) => self.stopped(&record, &mut run, stop, BalanceSyncResult::failed).await,
        };

        tracing::info!(
            %user_id,
            %exchange,
            status = %result.status,
            balances = result.balances.len(),
            unpriced = result.unpriced_assets.len(),
            "Balance sync finished."
        );
        Ok(result)
    }

    /// Fetches the history of the account's most valuable holdings plus its
    /// deposits and withdrawals, tolerating per-item failures.
    pub async fn sync_transactions(
        &self,
        user_id: &str,
        exchange: Exchange,
        filter: &TransactionFilter,
        cancel: &CancellationToken,
    ) -> Result<TransactionSyncResult, EngineError> {
        let record = self.vault.load(user_id, exchange).await?;
        let deadline = Instant::now() + self.settings.deadline;
        let mut run = RunTracker::new(exchange);
        run.advance(SyncPhase::Probing);

        // 1. Probe and read the account. Failing here fails the run.
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Stop::cancelled()),
            result = timeout_at(deadline, self.snapshot(&record, &mut run)) => {
                result.unwrap_or_else(|_| Err(Stop::deadline()))
            }
        };
        let (session, snapshot) = match outcome {
            Ok(ready) => ready,
            Err(stop) => {
                let failed = self
                    .stopped(&record, &mut run, stop, TransactionSyncResult::failed)
                    .await;
                return Ok(failed);
            }
        };

        // 2. Plan the fan-out over the top holdings. Sources that cannot be
        // planned count as failed items.
        let held = top_assets(&snapshot.balances, self.settings.max_pairs);
        let plan = match session.connector.plan_history(&held, &snapshot.payload, filter) {
            Ok(plan) => plan,
            Err(e) => {
                let stop = Stop::from_api("history plan", e);
                let failed = self
                    .stopped(&record, &mut run, stop, TransactionSyncResult::failed)
                    .await;
                return Ok(failed);
            }
        };
        tracing::debug!(
            %exchange,
            held = held.len(),
            items = plan.items.len(),
            skipped = plan.skipped.len(),
            "History fan-out planned."
        );

        // 3. Fan out. Each item reports on its own.
        let abort = AbortSignal::new(cancel);
        let outcomes: Vec<Result<ItemBatch, SyncItemError>> = stream::iter(plan.items.iter())
            .map(|item| self.fetch_item(&session, item, &abort, cancel, deadline))
            .buffer_unordered(self.settings.max_concurrency)
            .collect()
            .await;

        // 4. Aggregate.
        let attempted = outcomes.len() + plan.skipped.len();
        let mut transactions = Vec::new();
        let mut errors: Vec<SyncItemError> =
            plan.skipped.into_iter().map(skipped_source).collect();
        let mut failed_items = errors.len();
        let mut bad_rows = 0;
        for outcome in outcomes {
            match outcome {
                Ok((batch, rejected)) => {
                    transactions.extend(batch);
                    bad_rows += rejected.len();
                    errors.extend(rejected);
                }
                Err(error) => {
                    failed_items += 1;
                    errors.push(error);
                }
            }
        }
        let mut seen = HashSet::new();
        transactions.retain(|tx| filter.matches(tx) && seen.insert(tx.id.clone()));
        transactions.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.id.cmp(&b.id)));

        let status = if errors.is_empty() {
            SyncStatus::Succeeded
        } else {
            SyncStatus::PartialSuccess
        };
        run.finish(status);

        // 5. One state write for the whole run, unless the caller cancelled.
        if cancel.is_cancelled() {
            tracing::info!(
                %user_id,
                %exchange,
                "Transaction sync cancelled; credential state untouched."
            );
        } else {
            let now = Utc::now();
            let update = match abort.cause() {
                Some((status, message)) => SyncStateUpdate::failed(status, now, message),
                None if errors.is_empty() => SyncStateUpdate::healthy(now),
                None => SyncStateUpdate::failed(
                    CredentialStatus::Active,
                    now,
                    history_summary(failed_items, attempted, bad_rows),
                ),
            };
            self.persist(&record, update).await;
        }

        tracing::info!(
            %user_id,
            %exchange,
            %status,
            items = attempted,
            failed = failed_items,
            bad_rows,
            transactions = transactions.len(),
            "Transaction sync finished."
        );
        Ok(TransactionSyncResult {
            exchange,
            status,
            transactions,
            errors,
            synced_at: Utc::now(),
        })
    }

    /// `Probing` then the start of `Fetching`: credential check, decrypt,
    /// permission probe, balances, valuation.
    async fn snapshot(
        &self,
        record: &ExchangeCredential,
        run: &mut RunTracker,
    ) -> Result<(Session, Snapshot), Stop> {
        let session = self.probe(record).await?;
        run.advance(SyncPhase::Fetching);

        let retry = &self.settings.retry;
        let connector = &session.connector;
        let credential = &session.credential;
        let payload = retry
            .run("balances", || connector.fetch_balances(credential))
            .await
            .map_err(|e| Stop::from_api("balances", e))?;
        let normalized =
            normalizer::normalize_balances(&payload).map_err(|e| Stop::invalid("balances", e))?;
        let rejected = normalized
            .rejected
            .into_iter()
            .map(|row| rejected_row("balances", row))
            .collect();
        let mut balances = normalized.rows;
        let unpriced = value_balances(self.oracle.as_ref(), &mut balances).await;

        Ok((
            session,
            Snapshot {
                payload,
                balances,
                unpriced,
                rejected,
            },
        ))
    }

    async fn probe(&self, record: &ExchangeCredential) -> Result<Session, Stop> {
        if !record.is_active() {
            return Err(Stop::unavailable(record.status));
        }
        let credential = self.vault.decrypt_for_use(record).map_err(Stop::from_vault)?;
        let connector = self
            .vault
            .connectors()
            .connector_for(record.exchange, record.id);

        let probe = self
            .settings
            .retry
            .run("permission probe", || connector.probe_permissions(&credential))
            .await
            .map_err(|e| Stop::from_api("permission probe", e))?;

        if !probe.can_read() {
            return Err(Stop::refused(
                SyncErrorKind::Authentication,
                "key can no longer read account data".to_string(),
            ));
        }
        let escalations = probe.escalations();
        if !escalations.is_empty() {
            let granted: Vec<&str> = escalations.iter().map(|p| p.as_str()).collect();
            tracing::error!(
                exchange = %record.exchange,
                credential_id = %record.id,
                granted = ?granted,
                "Credential is no longer read-only; blocking it."
            );
            return Err(Stop::refused(
                SyncErrorKind::PermissionEscalationDetected,
                format!("key now also grants: {}", granted.join(", ")),
            ));
        }

        Ok(Session {
            credential,
            connector,
        })
    }

    async fn fetch_item(
        &self,
        session: &Session,
        item: &FetchItem,
        abort: &AbortSignal,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<ItemBatch, SyncItemError> {
        let label = item.label();
        let skipped = |label: String| {
            if cancel.is_cancelled() {
                SyncItemError::new(label, SyncErrorKind::Cancelled, "sync cancelled by caller")
            } else {
                SyncItemError::new(
                    label,
                    SyncErrorKind::Aborted,
                    "skipped after a credential-level failure",
                )
            }
        };
        if abort.token.is_cancelled() {
            return Err(skipped(label));
        }

        let work = async {
            let payload = self
                .settings
                .retry
                .run(&label, || session.connector.fetch_history(&session.credential, item))
                .await
                .map_err(ItemFailure::Api)?;
            normalizer::normalize_transactions(&payload).map_err(ItemFailure::Normalize)
        };

        let outcome = tokio::select! {
            biased;
            _ = abort.token.cancelled() => return Err(skipped(label.clone())),
            _ = sleep_until(deadline) => {
                return Err(SyncItemError::new(
                    label.clone(),
                    SyncErrorKind::DeadlineExceeded,
                    "sync deadline passed before this item completed",
                ));
            }
            outcome = work => outcome,
        };

        match outcome {
            Ok(batch) => {
                let rejected = batch
                    .rejected
                    .into_iter()
                    .map(|row| rejected_row(&label, row))
                    .collect();
                Ok((batch.rows, rejected))
            }
            Err(ItemFailure::Api(e)) => {
                if e.is_credential_fatal() {
                    tracing::warn!(
                        item = %label,
                        error = %e,
                        "Credential-level failure; aborting remaining items."
                    );
                    abort.trip(&e);
                }
                Err(SyncItemError::new(label, api_error_kind(&e), e.to_string()))
            }
            Err(ItemFailure::Normalize(e)) => {
                Err(SyncItemError::new(label, normalize_error_kind(&e), e.to_string()))
            }
        }
    }

    async fn stopped<R>(
        &self,
        record: &ExchangeCredential,
        run: &mut RunTracker,
        stop: Stop,
        failed: impl FnOnce(Exchange, SyncItemError) -> R,
    ) -> R {
        run.finish(SyncStatus::Failed);
        tracing::warn!(
            exchange = %record.exchange,
            kind = %stop.error.kind,
            error = %stop.error.message,
            "Sync run failed."
        );
        if let Some(update) = stop.update {
            self.persist(record, update).await;
        }
        failed(record.exchange, stop.error)
    }

    async fn persist(&self, record: &ExchangeCredential, update: SyncStateUpdate) {
        if let Err(e) = self.vault.record_sync_outcome(record, &update).await {
            tracing::error!(
                credential_id = %record.id,
                error = %e,
                "Failed to record sync outcome."
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_walks_the_happy_path() {
        let mut run = RunTracker::new(Exchange::Binance);
        run.advance(SyncPhase::Probing);
        run.advance(SyncPhase::Fetching);
        run.finish(SyncStatus::PartialSuccess);
        assert_eq!(run.phase(), SyncPhase::PartialSuccess);
        assert!(run.phase().is_terminal());
    }

    #[test]
    fn probing_may_fail_directly() {
        let mut run = RunTracker::new(Exchange::Kraken);
        run.advance(SyncPhase::Probing);
        run.finish(SyncStatus::Failed);
        assert_eq!(run.phase(), SyncPhase::Failed);
    }

    #[test]
    fn fatal_api_errors_change_the_stored_status() {
        let stop = Stop::from_api("balances", ApiError::KeyRevoked("Invalid Api-Key ID.".into()));
        assert_eq!(stop.error.kind, SyncErrorKind::Authentication);
        assert_eq!(stop.update.map(|u| u.status), Some(CredentialStatus::Revoked));

        let stop = Stop::from_api("balances", ApiError::Timeout);
        assert_eq!(stop.update.map(|u| u.status), Some(CredentialStatus::Active));
    }

    #[test]
    fn history_summary_counts_items_and_rows() {
        assert_eq!(history_summary(1, 5, 0), "1 of 5 history items failed");
        assert_eq!(history_summary(0, 5, 2), "2 history rows could not be read");
        assert_eq!(
            history_summary(2, 4, 1),
            "2 of 4 history items failed; 1 history rows could not be read"
        );
    }

    #[test]
    fn rejected_rows_name_their_item() {
        let row = RejectedRow {
            reference: "42".into(),
            error: NormalizeError::InvalidTimestamp("soon".into()),
        };
        let error = rejected_row("trades BTCUSDT", row);
        assert_eq!(error.item, "trades BTCUSDT row 42");
        assert_eq!(error.kind, SyncErrorKind::InvalidResponse);
    }

    #[test]
    fn cancellation_leaves_the_record_alone() {
        assert!(Stop::cancelled().update.is_none());
        assert!(Stop::unavailable(CredentialStatus::Error).update.is_none());
    }

    #[test]
    fn first_fatal_cause_wins() {
        let parent = CancellationToken::new();
        let abort = AbortSignal::new(&parent);
        abort.trip(&ApiError::KeyRevoked("gone".into()));
        abort.trip(&ApiError::Authentication("later".into()));
        assert!(abort.token.is_cancelled());
        assert!(!parent.is_cancelled());
        assert_eq!(abort.cause().map(|c| c.0), Some(CredentialStatus::Revoked));
    }
}
