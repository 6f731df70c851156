//! The durable execution queue.
//!
//! Every ingested location update becomes one row holding a positional
//! `execution_results` array, one element per matched rule, in rule
//! evaluation order. Element ordinality is part of identity: projections and
//! the completion manager address results by `(row, position)`. Once an
//! element turns terminal (`completed` or `rejected`) it never regresses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use crate::error::ApiError;
use crate::geo::GeoPoint;
use crate::types::{StellarAddress, TxHash};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateStatus {
    Pending,
    Matched,
    Processing,
    Executed,
    Failed,
}

impl UpdateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateStatus::Pending => "pending",
            UpdateStatus::Matched => "matched",
            UpdateStatus::Processing => "processing",
            UpdateStatus::Executed => "executed",
            UpdateStatus::Failed => "failed",
        }
    }
}

/// Why a matched rule was not executed inline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    RequiresWebauthn,
    RateLimited,
    QuorumUnmet,
    BalanceLow,
    RequiresConfirmation,
    ExecutionFailed,
}

/// One element of a row's positional results array.
///
/// Flags are optional on the wire so absent and `false` read the same; the
/// accessors below are the only places that interpret combinations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ExecutionResult {
    pub rule_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<SkipReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejected: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejected_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_hash: Option<TxHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_confirmation: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_public_key: Option<StellarAddress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_parameters: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direct_execution: Option<bool>,
}

impl ExecutionResult {
    fn empty(rule_id: i64) -> Self {
        ExecutionResult {
            rule_id,
            skipped: None,
            reason: None,
            rejected: None,
            rejected_at: None,
            completed: None,
            completed_at: None,
            transaction_hash: None,
            success: None,
            pending_confirmation: None,
            matched_public_key: None,
            execution_parameters: None,
            direct_execution: None,
        }
    }

    /// A rule skipped at dispatch time.
    pub fn skipped(rule_id: i64, reason: SkipReason, matched_public_key: StellarAddress) -> Self {
        ExecutionResult {
            skipped: Some(true),
            reason: Some(reason),
            matched_public_key: Some(matched_public_key),
            ..ExecutionResult::empty(rule_id)
        }
    }

    /// A terminal completion, from inline auto-execution or a confirmed
    /// user-initiated execution.
    pub fn completed(
        rule_id: i64,
        transaction_hash: TxHash,
        success: bool,
        matched_public_key: StellarAddress,
        execution_parameters: Option<serde_json::Value>,
        pending_confirmation: bool,
        now: DateTime<Utc>,
    ) -> Self {
        ExecutionResult {
            completed: Some(true),
            completed_at: Some(now),
            transaction_hash: Some(transaction_hash),
            success: Some(success),
            pending_confirmation: pending_confirmation.then_some(true),
            matched_public_key: Some(matched_public_key),
            execution_parameters,
            ..ExecutionResult::empty(rule_id)
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completed == Some(true)
    }

    pub fn is_rejected(&self) -> bool {
        self.rejected == Some(true)
    }

    /// Terminal elements never change again.
    pub fn is_terminal(&self) -> bool {
        self.is_completed() || self.is_rejected()
    }

    /// An actionable placeholder: awaiting a WebAuthn-signed execution and
    /// not yet resolved either way.
    pub fn is_pending_webauthn(&self) -> bool {
        self.skipped == Some(true)
            && self.reason == Some(SkipReason::RequiresWebauthn)
            && !self.is_completed()
            && !self.is_rejected()
    }

    /// A rejected placeholder, as exposed by the rejected projection.
    pub fn is_rejected_entry(&self) -> bool {
        self.skipped == Some(true) && self.is_rejected()
    }
}

/// A queue row: one ingested location update and its per-rule results.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationUpdate {
    pub id: i64,
    pub user_id: i64,
    pub public_key: StellarAddress,
    pub latitude: f64,
    pub longitude: f64,
    pub received_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
    pub status: UpdateStatus,
    pub matched_rule_ids: Vec<i64>,
    pub execution_results: Vec<ExecutionResult>,
}

impl LocationUpdate {
    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.latitude, self.longitude)
    }

    /// Whether any result element is terminal.
    pub fn has_terminal_result(&self) -> bool {
        self.execution_results.iter().any(ExecutionResult::is_terminal)
    }

    /// Whether any result element is a confirmed completion.
    pub fn has_completed_result(&self) -> bool {
        self.execution_results.iter().any(ExecutionResult::is_completed)
    }
}

pub(crate) fn row_to_update(row: &PgRow) -> Result<LocationUpdate, sqlx::Error> {
    let status: String = row.try_get("status")?;
    let public_key: String = row.try_get("public_key")?;
    let results: serde_json::Value = row.try_get("execution_results")?;
    Ok(LocationUpdate {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        public_key: StellarAddress::parse(&public_key)
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        received_at: row.try_get("received_at")?,
        processed_at: row.try_get("processed_at")?,
        status: serde_json::from_value(serde_json::Value::String(status))
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        matched_rule_ids: row.try_get("matched_rule_ids")?,
        execution_results: serde_json::from_value(results)
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
    })
}

const UPDATE_COLUMNS: &str = "id, user_id, public_key, latitude, longitude, received_at, \
     processed_at, status, matched_rule_ids, execution_results";

/// Inserts a freshly-matched row.
#[instrument(skip_all, err, fields(user_id = user_id, public_key = %public_key))]
pub async fn insert_matched(
    pool: &PgPool,
    user_id: i64,
    public_key: &StellarAddress,
    point: GeoPoint,
    matched_rule_ids: &[i64],
    execution_results: &[ExecutionResult],
) -> Result<LocationUpdate, ApiError> {
    let row = sqlx::query(&format!(
        "INSERT INTO location_update_queue \
           (user_id, public_key, latitude, longitude, status, matched_rule_ids, \
            execution_results) \
         VALUES ($1, $2, $3, $4, 'matched', $5, $6) \
         RETURNING {UPDATE_COLUMNS}"
    ))
    .bind(user_id)
    .bind(public_key.as_str())
    .bind(point.latitude)
    .bind(point.longitude)
    .bind(matched_rule_ids)
    .bind(serde_json::to_value(execution_results).unwrap_or_default())
    .fetch_one(pool)
    .await?;
    Ok(row_to_update(&row)?)
}

/// Rewrites a row's results and status after dispatch or completion.
pub async fn write_results(
    tx: &mut Transaction<'_, Postgres>,
    id: i64,
    status: UpdateStatus,
    results: &[ExecutionResult],
    mark_processed: bool,
) -> Result<(), ApiError> {
    let processed_clause = if mark_processed {
        ", processed_at = COALESCE(processed_at, now())"
    } else {
        ""
    };
    sqlx::query(&format!(
        "UPDATE location_update_queue \
         SET status = $2, execution_results = $3{processed_clause} \
         WHERE id = $1"
    ))
    .bind(id)
    .bind(status.as_str())
    .bind(serde_json::to_value(results).unwrap_or_default())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Loads every queue row visible to the actor, newest first. Multi-role
/// actors see rows keyed by either identity.
pub async fn load_for_actor(
    pool: &PgPool,
    user_id: i64,
    public_key: Option<&StellarAddress>,
) -> Result<Vec<LocationUpdate>, ApiError> {
    let rows = match public_key {
        Some(public_key) => {
            sqlx::query(&format!(
                "SELECT {UPDATE_COLUMNS} FROM location_update_queue \
                 WHERE user_id = $1 OR public_key = $2 \
                 ORDER BY received_at DESC"
            ))
            .bind(user_id)
            .bind(public_key.as_str())
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query(&format!(
                "SELECT {UPDATE_COLUMNS} FROM location_update_queue \
                 WHERE user_id = $1 ORDER BY received_at DESC"
            ))
            .bind(user_id)
            .fetch_all(pool)
            .await?
        }
    };
    rows.iter()
        .map(|r| row_to_update(r).map_err(ApiError::from))
        .collect()
}

/// Loads and locks the actor's rows inside a transaction, newest first.
pub async fn load_for_actor_locked(
    tx: &mut Transaction<'_, Postgres>,
    user_id: i64,
    public_key: Option<&StellarAddress>,
) -> Result<Vec<LocationUpdate>, ApiError> {
    let rows = match public_key {
        Some(public_key) => {
            sqlx::query(&format!(
                "SELECT {UPDATE_COLUMNS} FROM location_update_queue \
                 WHERE user_id = $1 OR public_key = $2 \
                 ORDER BY received_at DESC FOR UPDATE"
            ))
            .bind(user_id)
            .bind(public_key.as_str())
            .fetch_all(&mut **tx)
            .await?
        }
        None => {
            sqlx::query(&format!(
                "SELECT {UPDATE_COLUMNS} FROM location_update_queue \
                 WHERE user_id = $1 ORDER BY received_at DESC FOR UPDATE"
            ))
            .bind(user_id)
            .fetch_all(&mut **tx)
            .await?
        }
    };
    rows.iter()
        .map(|r| row_to_update(r).map_err(ApiError::from))
        .collect()
}

/// Fetches a single row by id, scoped to its owner.
pub async fn get_for_user(
    pool: &PgPool,
    id: i64,
    user_id: i64,
) -> Result<LocationUpdate, ApiError> {
    let row = sqlx::query(&format!(
        "SELECT {UPDATE_COLUMNS} FROM location_update_queue WHERE id = $1 AND user_id = $2"
    ))
    .bind(id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| ApiError::not_found("location update"))?;
    Ok(row_to_update(&row)?)
}

/// Deletes the given rows. Called only by the completion manager's cleanup,
/// inside its transaction.
pub async fn delete_rows(
    tx: &mut Transaction<'_, Postgres>,
    ids: &[i64],
) -> Result<u64, ApiError> {
    if ids.is_empty() {
        return Ok(0);
    }
    let result = sqlx::query("DELETE FROM location_update_queue WHERE id = ANY($1)")
        .bind(ids)
        .execute(&mut **tx)
        .await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pk(tail: char) -> StellarAddress {
        let body: String = std::iter::repeat_n(tail, 55).collect();
        StellarAddress::parse(&format!("G{body}")).unwrap()
    }

    fn hash() -> TxHash {
        TxHash::parse(&"ab".repeat(32)).unwrap()
    }

    #[test]
    fn test_skipped_placeholder_is_actionable_not_terminal() {
        let result = ExecutionResult::skipped(1, SkipReason::RequiresWebauthn, pk('A'));
        assert!(result.is_pending_webauthn());
        assert!(!result.is_terminal());
        assert!(!result.is_rejected_entry());
    }

    #[test]
    fn test_non_webauthn_skip_is_not_pending() {
        let result = ExecutionResult::skipped(1, SkipReason::RateLimited, pk('A'));
        assert!(!result.is_pending_webauthn());
        assert!(!result.is_terminal());
    }

    #[test]
    fn test_completed_is_terminal() {
        let result =
            ExecutionResult::completed(1, hash(), true, pk('A'), None, false, Utc::now());
        assert!(result.is_terminal());
        assert!(result.is_completed());
        assert!(!result.is_pending_webauthn());
        assert_eq!(result.pending_confirmation, None);
    }

    #[test]
    fn test_pending_confirmation_flag_survives() {
        let result = ExecutionResult::completed(1, hash(), true, pk('A'), None, true, Utc::now());
        assert_eq!(result.pending_confirmation, Some(true));
        assert!(result.is_terminal());
    }

    #[test]
    fn test_serde_omits_absent_flags() {
        let result = ExecutionResult::skipped(7, SkipReason::RequiresWebauthn, pk('B'));
        let value = serde_json::to_value(&result).unwrap();
        let object = value.as_object().unwrap();
        assert!(object.contains_key("rule_id"));
        assert!(object.contains_key("skipped"));
        assert!(object.contains_key("reason"));
        assert!(!object.contains_key("completed"));
        assert!(!object.contains_key("rejected"));
        assert_eq!(value["reason"], "requires_webauthn");
    }

    #[test]
    fn test_result_round_trip() {
        let result =
            ExecutionResult::completed(3, hash(), true, pk('C'), Some(serde_json::json!({"amount": "10000000"})), false, Utc::now());
        let json = serde_json::to_string(&result).unwrap();
        let back: ExecutionResult = serde_json::from_str(&json).unwrap();
        assert_eq!(result, back);
    }
}
