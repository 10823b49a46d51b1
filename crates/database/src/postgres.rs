use crate::error::DbError;
use crate::record::{ExchangeCredential, SyncStateUpdate};
use crate::store::CredentialStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use core_types::{CredentialStatus, Exchange, Permission};
use envelope::{Envelope, EnvelopeAlgorithm};
use sqlx::postgres::PgPool;
use sqlx::FromRow;
use std::collections::BTreeSet;
use uuid::Uuid;

const SELECT_COLUMNS: &str = r#"
    id, user_id, exchange,
    api_key_algorithm, api_key_iv, api_key_ciphertext, api_key_tag,
    api_secret_algorithm, api_secret_iv, api_secret_ciphertext, api_secret_tag,
    permissions, status, last_sync_at, last_error, created_at, updated_at
"#;

/// A row of the `exchange_credentials` table exactly as stored.
#[derive(FromRow, Debug, Clone)]
struct DbCredentialRow {
    id: Uuid,
    user_id: String,
    exchange: String,
    api_key_algorithm: String,
    api_key_iv: Vec<u8>,
    api_key_ciphertext: Vec<u8>,
    api_key_tag: Vec<u8>,
    api_secret_algorithm: String,
    api_secret_iv: Vec<u8>,
    api_secret_ciphertext: Vec<u8>,
    api_secret_tag: Vec<u8>,
    permissions: Vec<String>,
    status: String,
    last_sync_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

fn envelope(
    algorithm: &str,
    iv: Vec<u8>,
    ciphertext: Vec<u8>,
    tag: Vec<u8>,
) -> Result<Envelope, DbError> {
    let algorithm = algorithm
        .parse::<EnvelopeAlgorithm>()
        .map_err(|e| DbError::InvalidRecord(e.to_string()))?;
    Ok(Envelope {
        algorithm,
        iv,
        ciphertext,
        auth_tag: tag,
    })
}

impl TryFrom<DbCredentialRow> for ExchangeCredential {
    type Error = DbError;

    fn try_from(row: DbCredentialRow) -> Result<Self, Self::Error> {
        let exchange = row
            .exchange
            .parse::<Exchange>()
            .map_err(|e| DbError::InvalidRecord(e.to_string()))?;
        let status = row
            .status
            .parse::<CredentialStatus>()
            .map_err(|e| DbError::InvalidRecord(e.to_string()))?;
        let permissions = row
            .permissions
            .iter()
            .map(|p| p.parse::<Permission>())
            .collect::<Result<BTreeSet<_>, _>>()
            .map_err(|e| DbError::InvalidRecord(e.to_string()))?;

        Ok(ExchangeCredential {
            id: row.id,
            user_id: row.user_id,
            exchange,
            api_key: envelope(
                &row.api_key_algorithm,
                row.api_key_iv,
                row.api_key_ciphertext,
                row.api_key_tag,
            )?,
            api_secret: envelope(
                &row.api_secret_algorithm,
                row.api_secret_iv,
                row.api_secret_ciphertext,
                row.api_secret_tag,
            )?,
            permissions,
            status,
            last_sync_at: row.last_sync_at,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// The PostgreSQL-backed credential store.
#[derive(Debug, Clone)]
pub struct PgCredentialStore {
    pool: PgPool,
}

impl PgCredentialStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CredentialStore for PgCredentialStore {
    async fn load(
        &self,
        user_id: &str,
        exchange: Exchange,
    ) -> Result<Option<ExchangeCredential>, DbError> {
        let query = format!(
            "SELECT {SELECT_COLUMNS} FROM exchange_credentials WHERE user_id = $1 AND exchange = $2"
        );
        let row = sqlx::query_as::<_, DbCredentialRow>(&query)
            .bind(user_id)
            .bind(exchange.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(ExchangeCredential::try_from).transpose()
    }

    async fn save(&self, record: &ExchangeCredential) -> Result<ExchangeCredential, DbError> {
        let permissions: Vec<String> = record
            .permissions
            .iter()
            .map(|p| p.as_str().to_string())
            .collect();

        // On reconnect the existing row keeps its id and creation time.
        let query = format!(
            r#"
            INSERT INTO exchange_credentials (
                id, user_id, exchange,
                api_key_algorithm, api_key_iv, api_key_ciphertext, api_key_tag,
                api_secret_algorithm, api_secret_iv, api_secret_ciphertext, api_secret_tag,
                permissions, status, last_sync_at, last_error, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ON CONFLICT (user_id, exchange) DO UPDATE SET
                api_key_algorithm = EXCLUDED.api_key_algorithm,
                api_key_iv = EXCLUDED.api_key_iv,
                api_key_ciphertext = EXCLUDED.api_key_ciphertext,
                api_key_tag = EXCLUDED.api_key_tag,
                api_secret_algorithm = EXCLUDED.api_secret_algorithm,
                api_secret_iv = EXCLUDED.api_secret_iv,
                api_secret_ciphertext = EXCLUDED.api_secret_ciphertext,
                api_secret_tag = EXCLUDED.api_secret_tag,
                permissions = EXCLUDED.permissions,
                status = EXCLUDED.status,
                last_sync_at = EXCLUDED.last_sync_at,
                last_error = EXCLUDED.last_error,
                updated_at = EXCLUDED.updated_at
            RETURNING {SELECT_COLUMNS}
            "#
        );

        let row = sqlx::query_as::<_, DbCredentialRow>(&query)
            .bind(record.id)
            .bind(&record.user_id)
            .bind(record.exchange.as_str())
            .bind(record.api_key.algorithm.as_str())
            .bind(&record.api_key.iv)
            .bind(&record.api_key.ciphertext)
            .bind(&record.api_key.auth_tag)
            .bind(record.api_secret.algorithm.as_str())
            .bind(&record.api_secret.iv)
            .bind(&record.api_secret.ciphertext)
            .bind(&record.api_secret.auth_tag)
            .bind(&permissions)
            .bind(record.status.as_str())
            .bind(record.last_sync_at)
            .bind(&record.last_error)
            .bind(record.created_at)
            .bind(record.updated_at)
            .fetch_one(&self.pool)
            .await?;

        tracing::debug!(
            credential_id = %row.id,
            exchange = %record.exchange,
            "Credential record saved."
        );
        ExchangeCredential::try_from(row)
    }

    async fn delete(&self, user_id: &str, exchange: Exchange) -> Result<bool, DbError> {
        let result = sqlx::query("DELETE FROM exchange_credentials WHERE user_id = $1 AND exchange = $2")
            .bind(user_id)
            .bind(exchange.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<ExchangeCredential>, DbError> {
        let query = format!(
            "SELECT {SELECT_COLUMNS} FROM exchange_credentials WHERE user_id = $1 ORDER BY exchange ASC"
        );
        let rows = sqlx::query_as::<_, DbCredentialRow>(&query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(ExchangeCredential::try_from).collect()
    }

    async fn update_sync_state(&self, id: Uuid, update: &SyncStateUpdate) -> Result<bool, DbError> {
        // Single statement, so readers never see a half-applied outcome.
        let result = sqlx::query(
            r#"
            UPDATE exchange_credentials
            SET status = $2, last_sync_at = $3, last_error = $4, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(update.status.as_str())
        .bind(update.last_sync_at)
        .bind(&update.last_error)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
