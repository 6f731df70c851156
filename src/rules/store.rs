//! Persistence for execution rules.
//!
//! Updates are partial: only fields present in the patch overwrite stored
//! values. Deletion is hard, unlike contracts, since queue rows keep their
//! own copy of everything they need.

use serde::Deserialize;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;

use super::{ExecutionRule, QuorumType, RuleType, TriggerOn, validate_rule_shape};
use crate::error::ApiError;
use crate::geo::GeoPoint;
use crate::types::StellarAddress;

/// Caller-supplied fields for rule creation.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleInput {
    pub contract_id: i64,
    pub rule_name: String,
    pub rule_type: RuleType,
    #[serde(default)]
    pub center: Option<GeoPoint>,
    #[serde(default)]
    pub radius_meters: Option<f64>,
    #[serde(default)]
    pub geofence_id: Option<i64>,
    pub function_name: String,
    #[serde(default)]
    pub function_parameters: serde_json::Value,
    pub trigger_on: TriggerOn,
    #[serde(default)]
    pub auto_execute: bool,
    #[serde(default = "default_true")]
    pub requires_confirmation: bool,
    #[serde(default)]
    pub target_wallet_public_key: Option<StellarAddress>,
    #[serde(default)]
    pub required_wallet_public_keys: Vec<StellarAddress>,
    #[serde(default)]
    pub minimum_wallet_count: Option<i32>,
    #[serde(default)]
    pub quorum_type: QuorumType,
    #[serde(default)]
    pub max_executions_per_public_key: Option<i32>,
    #[serde(default)]
    pub execution_time_window_seconds: Option<i64>,
    #[serde(default)]
    pub min_location_duration_seconds: Option<i64>,
    #[serde(default)]
    pub auto_deactivate_on_balance_threshold: bool,
    #[serde(default)]
    pub balance_threshold_xlm: Option<f64>,
    #[serde(default)]
    pub balance_check_asset_address: Option<StellarAddress>,
    #[serde(default)]
    pub use_smart_wallet_balance: bool,
    #[serde(default)]
    pub submit_readonly_to_ledger: bool,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

/// Partial update: absent fields keep their stored values.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RulePatch {
    pub rule_name: Option<String>,
    pub rule_type: Option<RuleType>,
    pub center: Option<GeoPoint>,
    pub radius_meters: Option<f64>,
    pub geofence_id: Option<i64>,
    pub function_name: Option<String>,
    pub function_parameters: Option<serde_json::Value>,
    pub trigger_on: Option<TriggerOn>,
    pub auto_execute: Option<bool>,
    pub requires_confirmation: Option<bool>,
    pub target_wallet_public_key: Option<StellarAddress>,
    pub required_wallet_public_keys: Option<Vec<StellarAddress>>,
    pub minimum_wallet_count: Option<i32>,
    pub quorum_type: Option<QuorumType>,
    pub max_executions_per_public_key: Option<i32>,
    pub execution_time_window_seconds: Option<i64>,
    pub min_location_duration_seconds: Option<i64>,
    pub auto_deactivate_on_balance_threshold: Option<bool>,
    pub balance_threshold_xlm: Option<f64>,
    pub balance_check_asset_address: Option<StellarAddress>,
    pub use_smart_wallet_balance: Option<bool>,
    pub submit_readonly_to_ledger: Option<bool>,
    pub is_active: Option<bool>,
}

impl RulePatch {
    /// Applies this patch over a stored rule, returning the merged rule.
    pub fn apply(&self, mut rule: ExecutionRule) -> ExecutionRule {
        macro_rules! patch {
            ($field:ident) => {
                if let Some(value) = &self.$field {
                    rule.$field = value.clone();
                }
            };
            (opt $field:ident) => {
                if self.$field.is_some() {
                    rule.$field = self.$field.clone();
                }
            };
        }
        patch!(rule_name);
        patch!(rule_type);
        patch!(opt center);
        patch!(opt radius_meters);
        patch!(opt geofence_id);
        patch!(function_name);
        if let Some(params) = &self.function_parameters {
            rule.function_parameters = params.clone();
        }
        patch!(trigger_on);
        patch!(auto_execute);
        patch!(requires_confirmation);
        patch!(opt target_wallet_public_key);
        patch!(required_wallet_public_keys);
        patch!(opt minimum_wallet_count);
        patch!(quorum_type);
        patch!(opt max_executions_per_public_key);
        patch!(opt execution_time_window_seconds);
        patch!(opt min_location_duration_seconds);
        patch!(auto_deactivate_on_balance_threshold);
        patch!(opt balance_threshold_xlm);
        patch!(opt balance_check_asset_address);
        patch!(use_smart_wallet_balance);
        patch!(submit_readonly_to_ledger);
        patch!(is_active);
        rule
    }
}

pub(crate) fn row_to_rule(row: &PgRow) -> Result<ExecutionRule, sqlx::Error> {
    let decode = |e: Box<dyn std::error::Error + Send + Sync>| sqlx::Error::Decode(e);
    let rule_type: String = row.try_get("rule_type")?;
    let trigger_on: String = row.try_get("trigger_on")?;
    let quorum_type: String = row.try_get("quorum_type")?;
    let center = match (
        row.try_get::<Option<f64>, _>("center_latitude")?,
        row.try_get::<Option<f64>, _>("center_longitude")?,
    ) {
        (Some(latitude), Some(longitude)) => Some(GeoPoint::new(latitude, longitude)),
        _ => None,
    };
    let parse_address = |s: String| {
        StellarAddress::parse(&s).map_err(|e| decode(Box::new(e)))
    };
    let required: Vec<String> = row.try_get("required_wallet_public_keys")?;

    Ok(ExecutionRule {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        contract_id: row.try_get("contract_id")?,
        rule_name: row.try_get("rule_name")?,
        rule_type: serde_json::from_value(serde_json::Value::String(rule_type))
            .map_err(|e| decode(Box::new(e)))?,
        center,
        radius_meters: row.try_get("radius_meters")?,
        geofence_id: row.try_get("geofence_id")?,
        function_name: row.try_get("function_name")?,
        function_parameters: row
            .try_get::<Option<serde_json::Value>, _>("function_parameters")?
            .unwrap_or(serde_json::Value::Null),
        trigger_on: serde_json::from_value(serde_json::Value::String(trigger_on))
            .map_err(|e| decode(Box::new(e)))?,
        auto_execute: row.try_get("auto_execute")?,
        requires_confirmation: row.try_get("requires_confirmation")?,
        target_wallet_public_key: row
            .try_get::<Option<String>, _>("target_wallet_public_key")?
            .map(parse_address)
            .transpose()?,
        required_wallet_public_keys: required
            .into_iter()
            .map(parse_address)
            .collect::<Result<_, _>>()?,
        minimum_wallet_count: row.try_get("minimum_wallet_count")?,
        quorum_type: serde_json::from_value(serde_json::Value::String(quorum_type))
            .map_err(|e| decode(Box::new(e)))?,
        max_executions_per_public_key: row.try_get("max_executions_per_public_key")?,
        execution_time_window_seconds: row.try_get("execution_time_window_seconds")?,
        min_location_duration_seconds: row.try_get("min_location_duration_seconds")?,
        auto_deactivate_on_balance_threshold: row
            .try_get("auto_deactivate_on_balance_threshold")?,
        balance_threshold_xlm: row.try_get("balance_threshold_xlm")?,
        balance_check_asset_address: row
            .try_get::<Option<String>, _>("balance_check_asset_address")?
            .map(parse_address)
            .transpose()?,
        use_smart_wallet_balance: row.try_get("use_smart_wallet_balance")?,
        submit_readonly_to_ledger: row.try_get("submit_readonly_to_ledger")?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

const RULE_COLUMNS: &str = "id, user_id, contract_id, rule_name, rule_type, center_latitude, \
     center_longitude, radius_meters, geofence_id, function_name, function_parameters, \
     trigger_on, auto_execute, requires_confirmation, target_wallet_public_key, \
     required_wallet_public_keys, minimum_wallet_count, quorum_type, \
     max_executions_per_public_key, execution_time_window_seconds, \
     min_location_duration_seconds, auto_deactivate_on_balance_threshold, \
     balance_threshold_xlm, balance_check_asset_address, use_smart_wallet_balance, \
     submit_readonly_to_ledger, is_active, created_at, updated_at";

#[instrument(skip_all, err, fields(user_id = user_id, rule_name = %input.rule_name))]
pub async fn create(
    pool: &PgPool,
    user_id: i64,
    input: &RuleInput,
) -> Result<ExecutionRule, ApiError> {
    validate_rule_shape(
        input.rule_type,
        input.center,
        input.radius_meters,
        input.geofence_id,
        &input.required_wallet_public_keys,
        input.minimum_wallet_count,
    )?;

    // The parent contract must exist, be active, and be visible to the caller.
    let contract_exists = sqlx::query(
        "SELECT 1 FROM custom_contracts WHERE id = $1 AND is_active",
    )
    .bind(input.contract_id)
    .fetch_optional(pool)
    .await?
    .is_some();
    if !contract_exists {
        return Err(ApiError::not_found("contract"));
    }

    let required: Vec<String> = input
        .required_wallet_public_keys
        .iter()
        .map(|a| a.as_str().to_string())
        .collect();

    let row = sqlx::query(&format!(
        "INSERT INTO contract_execution_rules \
           (user_id, contract_id, rule_name, rule_type, center_latitude, center_longitude, \
            radius_meters, geofence_id, function_name, function_parameters, trigger_on, \
            auto_execute, requires_confirmation, target_wallet_public_key, \
            required_wallet_public_keys, minimum_wallet_count, quorum_type, \
            max_executions_per_public_key, execution_time_window_seconds, \
            min_location_duration_seconds, auto_deactivate_on_balance_threshold, \
            balance_threshold_xlm, balance_check_asset_address, use_smart_wallet_balance, \
            submit_readonly_to_ledger, is_active) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, \
                 $18, $19, $20, $21, $22, $23, $24, $25, $26) \
         RETURNING {RULE_COLUMNS}"
    ))
    .bind(user_id)
    .bind(input.contract_id)
    .bind(&input.rule_name)
    .bind(input.rule_type.as_str())
    .bind(input.center.map(|c| c.latitude))
    .bind(input.center.map(|c| c.longitude))
    .bind(input.radius_meters)
    .bind(input.geofence_id)
    .bind(&input.function_name)
    .bind(&input.function_parameters)
    .bind(input.trigger_on.as_str())
    .bind(input.auto_execute)
    .bind(input.requires_confirmation)
    .bind(input.target_wallet_public_key.as_ref().map(StellarAddress::as_str))
    .bind(&required)
    .bind(input.minimum_wallet_count)
    .bind(input.quorum_type.as_str())
    .bind(input.max_executions_per_public_key)
    .bind(input.execution_time_window_seconds)
    .bind(input.min_location_duration_seconds)
    .bind(input.auto_deactivate_on_balance_threshold)
    .bind(input.balance_threshold_xlm)
    .bind(input.balance_check_asset_address.as_ref().map(StellarAddress::as_str))
    .bind(input.use_smart_wallet_balance)
    .bind(input.submit_readonly_to_ledger)
    .bind(input.is_active)
    .fetch_one(pool)
    .await?;

    Ok(row_to_rule(&row)?)
}

/// Applies a partial update. Re-validates the merged rule before writing.
#[instrument(skip_all, err, fields(rule_id = id, user_id = user_id))]
pub async fn update(
    pool: &PgPool,
    id: i64,
    user_id: i64,
    patch: &RulePatch,
) -> Result<ExecutionRule, ApiError> {
    let existing = get_owned(pool, id, user_id).await?;
    let merged = patch.apply(existing);

    validate_rule_shape(
        merged.rule_type,
        merged.center,
        merged.radius_meters,
        merged.geofence_id,
        &merged.required_wallet_public_keys,
        merged.minimum_wallet_count,
    )?;

    let required: Vec<String> = merged
        .required_wallet_public_keys
        .iter()
        .map(|a| a.as_str().to_string())
        .collect();

    let row = sqlx::query(&format!(
        "UPDATE contract_execution_rules SET \
           rule_name = $3, rule_type = $4, center_latitude = $5, center_longitude = $6, \
           radius_meters = $7, geofence_id = $8, function_name = $9, \
           function_parameters = $10, trigger_on = $11, auto_execute = $12, \
           requires_confirmation = $13, target_wallet_public_key = $14, \
           required_wallet_public_keys = $15, minimum_wallet_count = $16, quorum_type = $17, \
           max_executions_per_public_key = $18, execution_time_window_seconds = $19, \
           min_location_duration_seconds = $20, auto_deactivate_on_balance_threshold = $21, \
           balance_threshold_xlm = $22, balance_check_asset_address = $23, \
           use_smart_wallet_balance = $24, submit_readonly_to_ledger = $25, is_active = $26, \
           updated_at = now() \
         WHERE id = $1 AND user_id = $2 \
         RETURNING {RULE_COLUMNS}"
    ))
    .bind(id)
    .bind(user_id)
    .bind(&merged.rule_name)
    .bind(merged.rule_type.as_str())
    .bind(merged.center.map(|c| c.latitude))
    .bind(merged.center.map(|c| c.longitude))
    .bind(merged.radius_meters)
    .bind(merged.geofence_id)
    .bind(&merged.function_name)
    .bind(&merged.function_parameters)
    .bind(merged.trigger_on.as_str())
    .bind(merged.auto_execute)
    .bind(merged.requires_confirmation)
    .bind(merged.target_wallet_public_key.as_ref().map(StellarAddress::as_str))
    .bind(&required)
    .bind(merged.minimum_wallet_count)
    .bind(merged.quorum_type.as_str())
    .bind(merged.max_executions_per_public_key)
    .bind(merged.execution_time_window_seconds)
    .bind(merged.min_location_duration_seconds)
    .bind(merged.auto_deactivate_on_balance_threshold)
    .bind(merged.balance_threshold_xlm)
    .bind(merged.balance_check_asset_address.as_ref().map(StellarAddress::as_str))
    .bind(merged.use_smart_wallet_balance)
    .bind(merged.submit_readonly_to_ledger)
    .bind(merged.is_active)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| ApiError::not_found("rule"))?;

    Ok(row_to_rule(&row)?)
}

/// Hard delete.
pub async fn delete(pool: &PgPool, id: i64, user_id: i64) -> Result<(), ApiError> {
    let result = sqlx::query("DELETE FROM contract_execution_rules WHERE id = $1 AND user_id = $2")
        .bind(id)
        .bind(user_id)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(ApiError::not_found("rule"));
    }
    Ok(())
}

pub async fn get_owned(pool: &PgPool, id: i64, user_id: i64) -> Result<ExecutionRule, ApiError> {
    let row = sqlx::query(&format!(
        "SELECT {RULE_COLUMNS} FROM contract_execution_rules WHERE id = $1 AND user_id = $2"
    ))
    .bind(id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| ApiError::not_found("rule"))?;
    Ok(row_to_rule(&row)?)
}

/// Fetches any active rule by id, regardless of owner.
pub async fn get_active(pool: &PgPool, id: i64) -> Result<ExecutionRule, ApiError> {
    let row = sqlx::query(&format!(
        "SELECT {RULE_COLUMNS} FROM contract_execution_rules WHERE id = $1 AND is_active"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| ApiError::not_found("rule"))?;
    Ok(row_to_rule(&row)?)
}

pub async fn list_mine(pool: &PgPool, user_id: i64) -> Result<Vec<ExecutionRule>, ApiError> {
    let rows = sqlx::query(&format!(
        "SELECT {RULE_COLUMNS} FROM contract_execution_rules \
         WHERE user_id = $1 ORDER BY created_at DESC"
    ))
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    rows.iter()
        .map(|r| row_to_rule(r).map_err(ApiError::from))
        .collect()
}

pub async fn list_public_active(pool: &PgPool) -> Result<Vec<ExecutionRule>, ApiError> {
    let rows = sqlx::query(&format!(
        "SELECT r.* FROM (SELECT {RULE_COLUMNS} FROM contract_execution_rules) r \
         JOIN custom_contracts c ON c.id = r.contract_id \
         WHERE r.is_active AND c.is_active ORDER BY r.created_at DESC"
    ))
    .fetch_all(pool)
    .await?;
    rows.iter()
        .map(|r| row_to_rule(r).map_err(ApiError::from))
        .collect()
}

/// Lightweight rows for map rendering: id, name, geometry, activity.
#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleLocation {
    pub id: i64,
    pub rule_name: String,
    pub rule_type: RuleType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub center: Option<GeoPoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub radius_meters: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geofence_id: Option<i64>,
    pub is_active: bool,
}

pub async fn list_locations(
    pool: &PgPool,
    user_id: Option<i64>,
) -> Result<Vec<RuleLocation>, ApiError> {
    let rows = match user_id {
        Some(user_id) => {
            sqlx::query(
                "SELECT id, rule_name, rule_type, center_latitude, center_longitude, \
                        radius_meters, geofence_id, is_active \
                 FROM contract_execution_rules WHERE user_id = $1 ORDER BY id",
            )
            .bind(user_id)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query(
                "SELECT r.id, r.rule_name, r.rule_type, r.center_latitude, r.center_longitude, \
                        r.radius_meters, r.geofence_id, r.is_active \
                 FROM contract_execution_rules r \
                 JOIN custom_contracts c ON c.id = r.contract_id \
                 WHERE r.is_active AND c.is_active ORDER BY r.id",
            )
            .fetch_all(pool)
            .await?
        }
    };

    rows.iter()
        .map(|row| {
            let rule_type: String = row.try_get("rule_type")?;
            let center = match (
                row.try_get::<Option<f64>, _>("center_latitude")?,
                row.try_get::<Option<f64>, _>("center_longitude")?,
            ) {
                (Some(latitude), Some(longitude)) => Some(GeoPoint::new(latitude, longitude)),
                _ => None,
            };
            Ok(RuleLocation {
                id: row.try_get("id")?,
                rule_name: row.try_get("rule_name")?,
                rule_type: serde_json::from_value(serde_json::Value::String(rule_type))
                    .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
                center,
                radius_meters: row.try_get("radius_meters")?,
                geofence_id: row.try_get("geofence_id")?,
                is_active: row.try_get("is_active")?,
            })
        })
        .collect::<Result<Vec<_>, sqlx::Error>>()
        .map_err(ApiError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn base_rule() -> ExecutionRule {
        ExecutionRule {
            id: 9,
            user_id: 1,
            contract_id: 2,
            rule_name: "original".into(),
            rule_type: RuleType::Location,
            center: Some(GeoPoint::new(10.0, 20.0)),
            radius_meters: Some(50.0),
            geofence_id: None,
            function_name: "ping".into(),
            function_parameters: serde_json::Value::Null,
            trigger_on: TriggerOn::Enter,
            auto_execute: false,
            requires_confirmation: true,
            target_wallet_public_key: None,
            required_wallet_public_keys: Vec::new(),
            minimum_wallet_count: None,
            quorum_type: QuorumType::Any,
            max_executions_per_public_key: None,
            execution_time_window_seconds: None,
            min_location_duration_seconds: None,
            auto_deactivate_on_balance_threshold: false,
            balance_threshold_xlm: None,
            balance_check_asset_address: None,
            use_smart_wallet_balance: false,
            submit_readonly_to_ledger: false,
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_patch_overwrites_only_provided_fields() {
        let patch = RulePatch {
            rule_name: Some("renamed".into()),
            radius_meters: Some(120.0),
            ..RulePatch::default()
        };
        let merged = patch.apply(base_rule());
        assert_eq!(merged.rule_name, "renamed");
        assert_eq!(merged.radius_meters, Some(120.0));
        // Untouched fields survive.
        assert_eq!(merged.function_name, "ping");
        assert_eq!(merged.center, Some(GeoPoint::new(10.0, 20.0)));
        assert!(merged.is_active);
    }

    #[test]
    fn test_empty_patch_is_identity() {
        let before = base_rule();
        let after = RulePatch::default().apply(before.clone());
        assert_eq!(after.rule_name, before.rule_name);
        assert_eq!(after.radius_meters, before.radius_meters);
        assert_eq!(after.auto_execute, before.auto_execute);
    }
}
