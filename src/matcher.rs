//! Location matching: which active rules does a point fall inside, and which
//! rules are near a point.
//!
//! Circle rules (`location`/`proximity`) match by great-circle distance on
//! the WGS-84 sphere; `geofence` rules match by polygon containment in
//! PostGIS. The matcher is read-only and idempotent: it never mutates queue
//! state.

use serde::Serialize;
use sqlx::PgPool;
use tracing::instrument;

use crate::error::ApiError;
use crate::geo::{GeoPoint, haversine_m};
use crate::rules::ExecutionRule;
use crate::rules::store::row_to_rule;

/// A rule near a queried point, annotated with its distance.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NearbyRule {
    #[serde(flatten)]
    pub rule: ExecutionRule,
    pub distance_meters: f64,
}

const ACTIVE_RULE_QUERY: &str = "SELECT r.id, r.user_id, r.contract_id, r.rule_name, \
     r.rule_type, r.center_latitude, r.center_longitude, r.radius_meters, r.geofence_id, \
     r.function_name, r.function_parameters, r.trigger_on, r.auto_execute, \
     r.requires_confirmation, r.target_wallet_public_key, r.required_wallet_public_keys, \
     r.minimum_wallet_count, r.quorum_type, r.max_executions_per_public_key, \
     r.execution_time_window_seconds, r.min_location_duration_seconds, \
     r.auto_deactivate_on_balance_threshold, r.balance_threshold_xlm, \
     r.balance_check_asset_address, r.use_smart_wallet_balance, r.submit_readonly_to_ledger, \
     r.is_active, r.created_at, r.updated_at \
     FROM contract_execution_rules r \
     JOIN custom_contracts c ON c.id = r.contract_id \
     WHERE r.is_active AND c.is_active";

/// Active rules whose trigger region contains `point`, in stored order.
///
/// Circle rules use `ST_DWithin` over geography against their own radius;
/// geofence rules use polygon containment.
#[instrument(skip(pool), err, fields(latitude = point.latitude, longitude = point.longitude))]
pub async fn match_rules(pool: &PgPool, point: GeoPoint) -> Result<Vec<ExecutionRule>, ApiError> {
    let sql = format!(
        "{ACTIVE_RULE_QUERY} AND ( \
           (r.rule_type IN ('location', 'proximity') \
              AND r.center_latitude IS NOT NULL \
              AND ST_DWithin( \
                    ST_MakePoint(r.center_longitude, r.center_latitude)::geography, \
                    ST_MakePoint($1, $2)::geography, \
                    r.radius_meters)) \
           OR (r.rule_type = 'geofence' AND EXISTS ( \
                 SELECT 1 FROM geofences g \
                 WHERE g.id = r.geofence_id \
                   AND ST_Contains(g.boundary, ST_SetSRID(ST_MakePoint($1, $2), 4326)))) \
         ) ORDER BY r.id"
    );
    let rows = sqlx::query(&sql)
        .bind(point.longitude)
        .bind(point.latitude)
        .fetch_all(pool)
        .await?;
    rows.iter()
        .map(|r| row_to_rule(r).map_err(ApiError::from))
        .collect()
}

/// Active circle rules whose center lies within `radius_meters` of `point`,
/// sorted by ascending great-circle distance.
#[instrument(skip(pool), err, fields(latitude = point.latitude, longitude = point.longitude, radius = radius_meters))]
pub async fn nearby(
    pool: &PgPool,
    point: GeoPoint,
    radius_meters: f64,
) -> Result<Vec<NearbyRule>, ApiError> {
    let sql = format!(
        "{ACTIVE_RULE_QUERY} AND r.center_latitude IS NOT NULL \
         AND ST_DWithin( \
               ST_MakePoint(r.center_longitude, r.center_latitude)::geography, \
               ST_MakePoint($1, $2)::geography, \
               $3)"
    );
    let rows = sqlx::query(&sql)
        .bind(point.longitude)
        .bind(point.latitude)
        .bind(radius_meters)
        .fetch_all(pool)
        .await?;

    let mut nearby: Vec<NearbyRule> = rows
        .iter()
        .map(|r| row_to_rule(r).map_err(ApiError::from))
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .filter_map(|rule| {
            let center = rule.center?;
            let distance_meters = haversine_m(center, point);
            Some(NearbyRule {
                rule,
                distance_meters,
            })
        })
        // The index uses a spheroid; re-check against the sphere so the
        // distances we return never exceed the caller's radius.
        .filter(|n| n.distance_meters <= radius_meters)
        .collect();

    nearby.sort_by(|a, b| {
        a.distance_meters
            .partial_cmp(&b.distance_meters)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    Ok(nearby)
}
