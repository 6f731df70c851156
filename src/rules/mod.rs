//! Execution rules: geofenced triggers over registered contracts.
//!
//! A rule binds a contract function to a spatial condition (circle or stored
//! geofence polygon), an execution policy (auto-execute vs confirm), optional
//! wallet quorum, per-key rate limits, and a balance-based kill switch.

pub mod quorum;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::geo::GeoPoint;
use crate::types::StellarAddress;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleType {
    Location,
    Proximity,
    Geofence,
}

impl RuleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleType::Location => "location",
            RuleType::Proximity => "proximity",
            RuleType::Geofence => "geofence",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerOn {
    Enter,
    Exit,
    Dwell,
}

impl TriggerOn {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerOn::Enter => "enter",
            TriggerOn::Exit => "exit",
            TriggerOn::Dwell => "dwell",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QuorumType {
    #[default]
    Any,
    All,
    Threshold,
}

impl QuorumType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuorumType::Any => "any",
            QuorumType::All => "all",
            QuorumType::Threshold => "threshold",
        }
    }
}

/// A stored execution rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRule {
    pub id: i64,
    pub user_id: i64,
    pub contract_id: i64,
    pub rule_name: String,
    pub rule_type: RuleType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub center: Option<GeoPoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub radius_meters: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geofence_id: Option<i64>,
    pub function_name: String,
    #[serde(default)]
    pub function_parameters: serde_json::Value,
    pub trigger_on: TriggerOn,
    #[serde(default)]
    pub auto_execute: bool,
    #[serde(default)]
    pub requires_confirmation: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_wallet_public_key: Option<StellarAddress>,
    #[serde(default)]
    pub required_wallet_public_keys: Vec<StellarAddress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum_wallet_count: Option<i32>,
    #[serde(default)]
    pub quorum_type: QuorumType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_executions_per_public_key: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time_window_seconds: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_location_duration_seconds: Option<i64>,
    #[serde(default)]
    pub auto_deactivate_on_balance_threshold: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance_threshold_xlm: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance_check_asset_address: Option<StellarAddress>,
    #[serde(default)]
    pub use_smart_wallet_balance: bool,
    #[serde(default)]
    pub submit_readonly_to_ledger: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionRule {
    /// Whether this rule constrains execution to a wallet quorum.
    pub fn has_quorum(&self) -> bool {
        !self.required_wallet_public_keys.is_empty()
    }

    /// Whether a per-public-key rate limit is configured.
    pub fn rate_limit(&self) -> Option<(i32, i64)> {
        match (
            self.max_executions_per_public_key,
            self.execution_time_window_seconds,
        ) {
            (Some(max), Some(window)) if max > 0 && window > 0 => Some((max, window)),
            _ => None,
        }
    }
}

/// Validates the cross-field invariants shared by create and update.
/// Collects every violation before failing.
pub fn validate_rule_shape(
    rule_type: RuleType,
    center: Option<GeoPoint>,
    radius_meters: Option<f64>,
    geofence_id: Option<i64>,
    required_wallet_public_keys: &[StellarAddress],
    minimum_wallet_count: Option<i32>,
) -> Result<(), ApiError> {
    let mut violations = Vec::new();

    match rule_type {
        RuleType::Location | RuleType::Proximity => {
            match center {
                None => violations.push(format!(
                    "{} rules require a center point",
                    rule_type.as_str()
                )),
                Some(point) if !point.is_valid() => {
                    violations.push("center coordinates are out of range".to_string());
                }
                _ => {}
            }
            match radius_meters {
                None => violations.push(format!(
                    "{} rules require radiusMeters",
                    rule_type.as_str()
                )),
                Some(radius) if radius <= 0.0 || !radius.is_finite() => {
                    violations.push("radiusMeters must be a positive number".to_string());
                }
                _ => {}
            }
        }
        RuleType::Geofence => {
            if geofence_id.is_none() {
                violations.push("geofence rules require geofenceId".to_string());
            }
        }
    }

    if !required_wallet_public_keys.is_empty() {
        let len = required_wallet_public_keys.len() as i32;
        match minimum_wallet_count {
            None => violations.push(
                "minimumWalletCount is required when requiredWalletPublicKeys is set".to_string(),
            ),
            Some(min) if min < 1 || min > len => violations.push(format!(
                "minimumWalletCount must be between 1 and {len}, got {min}"
            )),
            _ => {}
        }
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(ApiError::validation_all(
            format!("{} rule violation(s)", violations.len()),
            violations,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pk(tail: char) -> StellarAddress {
        let body: String = std::iter::repeat_n(tail, 55).collect();
        StellarAddress::parse(&format!("G{body}")).unwrap()
    }

    #[test]
    fn test_location_rule_requires_center_and_radius() {
        let err = validate_rule_shape(RuleType::Location, None, None, None, &[], None).unwrap_err();
        match err {
            ApiError::Validation { violations, .. } => {
                assert_eq!(violations.len(), 2);
            }
            other => panic!("unexpected error: {other:?}"),
        }

        assert!(
            validate_rule_shape(
                RuleType::Location,
                Some(GeoPoint::new(34.0, -118.0)),
                Some(100.0),
                None,
                &[],
                None,
            )
            .is_ok()
        );
    }

    #[test]
    fn test_geofence_rule_requires_geofence_id() {
        assert!(validate_rule_shape(RuleType::Geofence, None, None, None, &[], None).is_err());
        assert!(validate_rule_shape(RuleType::Geofence, None, None, Some(7), &[], None).is_ok());
    }

    #[test]
    fn test_quorum_bounds() {
        let wallets = vec![pk('A'), pk('B')];
        assert!(
            validate_rule_shape(RuleType::Geofence, None, None, Some(1), &wallets, None).is_err()
        );
        assert!(
            validate_rule_shape(RuleType::Geofence, None, None, Some(1), &wallets, Some(0))
                .is_err()
        );
        assert!(
            validate_rule_shape(RuleType::Geofence, None, None, Some(1), &wallets, Some(3))
                .is_err()
        );
        for valid in 1..=2 {
            assert!(
                validate_rule_shape(
                    RuleType::Geofence,
                    None,
                    None,
                    Some(1),
                    &wallets,
                    Some(valid)
                )
                .is_ok()
            );
        }
    }

    #[test]
    fn test_rate_limit_requires_both_fields() {
        let mut rule = sample_rule();
        assert!(rule.rate_limit().is_none());
        rule.max_executions_per_public_key = Some(3);
        assert!(rule.rate_limit().is_none());
        rule.execution_time_window_seconds = Some(3600);
        assert_eq!(rule.rate_limit(), Some((3, 3600)));
    }

    fn sample_rule() -> ExecutionRule {
        ExecutionRule {
            id: 1,
            user_id: 1,
            contract_id: 1,
            rule_name: "test".into(),
            rule_type: RuleType::Location,
            center: Some(GeoPoint::new(34.0, -118.0)),
            radius_meters: Some(100.0),
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
}
