//! Append-only execution history, consulted by rate-limit checks.
//!
//! Writes go through the stored `record_rule_execution` SQL function so the
//! row shape stays owned by the database alongside its quorum counterpart.

use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use crate::error::ApiError;
use crate::types::{StellarAddress, TxHash};

/// Number of recorded executions for `(rule, public_key)` inside the trailing
/// window. Reads committed state without locks; an occasional over-grant is
/// bounded by the on-chain balance check.
#[instrument(skip(pool), err)]
pub async fn execution_count_within(
    pool: &PgPool,
    rule_id: i64,
    public_key: &StellarAddress,
    window_seconds: i64,
) -> Result<i64, ApiError> {
    let row = sqlx::query(
        "SELECT COUNT(*) AS count FROM rule_execution_history \
         WHERE rule_id = $1 AND public_key = $2 \
           AND executed_at > now() - make_interval(secs => $3)",
    )
    .bind(rule_id)
    .bind(public_key.as_str())
    .bind(window_seconds as f64)
    .fetch_one(pool)
    .await?;
    row.try_get::<i64, _>("count").map_err(ApiError::from)
}

/// Appends a history entry inside the caller's transaction.
pub async fn record_execution(
    tx: &mut Transaction<'_, Postgres>,
    rule_id: i64,
    public_key: &StellarAddress,
    transaction_hash: Option<&TxHash>,
    summary: &serde_json::Value,
) -> Result<(), ApiError> {
    sqlx::query("SELECT record_rule_execution($1, $2, $3, $4)")
        .bind(rule_id)
        .bind(public_key.as_str())
        .bind(transaction_hash.map(TxHash::as_str))
        .bind(summary)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Appends a history entry outside any transaction (inline auto-execution).
pub async fn record_execution_pool(
    pool: &PgPool,
    rule_id: i64,
    public_key: &StellarAddress,
    transaction_hash: Option<&TxHash>,
    summary: &serde_json::Value,
) -> Result<(), ApiError> {
    sqlx::query("SELECT record_rule_execution($1, $2, $3, $4)")
        .bind(rule_id)
        .bind(public_key.as_str())
        .bind(transaction_hash.map(TxHash::as_str))
        .bind(summary)
        .execute(pool)
        .await?;
    Ok(())
}
