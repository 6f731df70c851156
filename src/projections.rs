//! Pending / Completed / Rejected projections over the execution queue.
//!
//! Each projection filters the positional results arrays, de-duplicates by
//! its own stable key, and reports a count computed over the full deduped set
//! before any limit — so paging never skews totals. Multi-role actors are
//! matched by user id OR public key.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::PgPool;
use std::collections::{BTreeMap, HashSet};
use tracing::instrument;

use crate::auth::Actor;
use crate::contracts::store as contract_store;
use crate::error::ApiError;
use crate::executor::params::{ParamContext, canonicalize_parameters};
use crate::queue::{self, LocationUpdate};
use crate::rules::ExecutionRule;
use crate::rules::store as rule_store;
use crate::types::{StellarAddress, TxHash};

/// One actionable pending execution.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingExecution {
    pub rule_id: i64,
    pub rule_name: String,
    pub contract_id: i64,
    pub function_name: String,
    pub update_id: i64,
    pub ordinality: usize,
    pub matched_public_key: StellarAddress,
    pub received_at: DateTime<Utc>,
    pub parameters: Value,
    pub requires_webauthn: bool,
    pub use_smart_wallet: bool,
}

/// One confirmed completion.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedExecution {
    pub rule_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_name: Option<String>,
    pub update_id: i64,
    pub ordinality: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_public_key: Option<StellarAddress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_hash: Option<TxHash>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_confirmation: Option<bool>,
    pub parameters: Value,
}

/// One rejected placeholder.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedExecution {
    pub rule_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_name: Option<String>,
    pub update_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_public_key: Option<StellarAddress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejected_at: Option<DateTime<Utc>>,
}

/// A projection page plus its stable pre-limit count.
#[derive(Debug, Serialize)]
pub struct ProjectionPage<T> {
    pub items: Vec<T>,
    pub count: usize,
}

/// Positional reference into a row's results array.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRef {
    pub update_id: i64,
    pub ordinality: usize,
    pub rule_id: i64,
    pub matched_public_key: Option<StellarAddress>,
    pub row_public_key: StellarAddress,
    pub received_at: DateTime<Utc>,
}

fn refs_of(rows: &[LocationUpdate]) -> impl Iterator<Item = (ResultRef, &LocationUpdate, usize)> {
    rows.iter().flat_map(|row| {
        row.execution_results
            .iter()
            .enumerate()
            .map(move |(ordinality, result)| {
                (
                    ResultRef {
                        update_id: row.id,
                        ordinality,
                        rule_id: result.rule_id,
                        matched_public_key: result.matched_public_key.clone(),
                        row_public_key: row.public_key.clone(),
                        received_at: row.received_at,
                    },
                    row,
                    ordinality,
                )
            })
    })
}

/// Pending refs, deduped by `(rule_id, matched_public_key ?? row key)`,
/// newest first. Rows are expected newest-first on input.
pub fn collect_pending(rows: &[LocationUpdate]) -> Vec<ResultRef> {
    let mut seen: HashSet<(i64, String)> = HashSet::new();
    let mut out = Vec::new();
    for (reference, row, ordinality) in refs_of(rows) {
        let result = &row.execution_results[ordinality];
        if !result.is_pending_webauthn() {
            continue;
        }
        let key_pk = reference
            .matched_public_key
            .clone()
            .unwrap_or_else(|| reference.row_public_key.clone());
        if seen.insert((reference.rule_id, key_pk.as_str().to_string())) {
            out.push(reference);
        }
    }
    out
}

/// Completed refs, deduped by the full positional identity
/// `(rule_id, transaction_hash, update_id, matched_public_key, ordinality)`.
pub fn collect_completed(rows: &[LocationUpdate]) -> Vec<ResultRef> {
    let mut seen: HashSet<(i64, Option<String>, i64, Option<String>, usize)> = HashSet::new();
    let mut out = Vec::new();
    for (reference, row, ordinality) in refs_of(rows) {
        let result = &row.execution_results[ordinality];
        if !result.is_completed() {
            continue;
        }
        let key = (
            reference.rule_id,
            result.transaction_hash.as_ref().map(|h| h.as_str().to_string()),
            reference.update_id,
            reference
                .matched_public_key
                .as_ref()
                .map(|pk| pk.as_str().to_string()),
            ordinality,
        );
        if seen.insert(key) {
            out.push(reference);
        }
    }
    out
}

/// Rejected refs, deduped by `(rule_id, rejected_at)`, falling back to
/// `(rule_id, update_id)` when no timestamp was recorded.
pub fn collect_rejected(rows: &[LocationUpdate]) -> Vec<ResultRef> {
    let mut seen: HashSet<(i64, String)> = HashSet::new();
    let mut out = Vec::new();
    for (reference, row, ordinality) in refs_of(rows) {
        let result = &row.execution_results[ordinality];
        if !result.is_rejected_entry() {
            continue;
        }
        let discriminator = match result.rejected_at {
            Some(at) => at.to_rfc3339(),
            None => format!("update:{}", reference.update_id),
        };
        if seen.insert((reference.rule_id, discriminator)) {
            out.push(reference);
        }
    }
    out
}

async fn load_rows(pool: &PgPool, actor: &Actor) -> Result<Vec<LocationUpdate>, ApiError> {
    queue::load_for_actor(pool, actor.user_id, actor.public_key.as_ref()).await
}

async fn rules_by_id(
    pool: &PgPool,
    refs: &[ResultRef],
) -> Result<BTreeMap<i64, ExecutionRule>, ApiError> {
    let mut rules = BTreeMap::new();
    for reference in refs {
        if rules.contains_key(&reference.rule_id) {
            continue;
        }
        match rule_store::get_active(pool, reference.rule_id).await {
            Ok(rule) => {
                rules.insert(reference.rule_id, rule);
            }
            Err(ApiError::NotFound(_)) => {}
            Err(other) => return Err(other),
        }
    }
    Ok(rules)
}

/// The pending projection: actionable WebAuthn placeholders with their
/// parameters populated from the rule's mapping — destination resolved to
/// the matched key, the actor's own key as signer, WebAuthn fields shown as
/// engine-filled.
#[instrument(skip_all, err, fields(user_id = actor.user_id))]
pub async fn pending_view(
    pool: &PgPool,
    actor: &Actor,
    limit: usize,
) -> Result<ProjectionPage<PendingExecution>, ApiError> {
    let rows = load_rows(pool, actor).await?;
    let refs = collect_pending(&rows);
    let count = refs.len();
    let rules = rules_by_id(pool, &refs).await?;

    let mut items = Vec::new();
    for reference in refs.into_iter().take(limit) {
        let Some(rule) = rules.get(&reference.rule_id) else {
            continue;
        };
        let contract = match contract_store::get_active(pool, rule.contract_id).await {
            Ok(contract) => contract,
            Err(ApiError::NotFound(_)) => continue,
            Err(other) => return Err(other),
        };
        let matched = reference
            .matched_public_key
            .clone()
            .unwrap_or_else(|| reference.row_public_key.clone());

        let row = rows.iter().find(|r| r.id == reference.update_id);
        let parameters = populate_parameters(rule, &contract, actor, &matched, row);

        items.push(PendingExecution {
            rule_id: rule.id,
            rule_name: rule.rule_name.clone(),
            contract_id: rule.contract_id,
            function_name: rule.function_name.clone(),
            update_id: reference.update_id,
            ordinality: reference.ordinality,
            matched_public_key: matched,
            received_at: reference.received_at,
            parameters,
            requires_webauthn: contract.requires_webauthn,
            use_smart_wallet: contract.use_smart_wallet,
        });
    }
    Ok(ProjectionPage { items, count })
}

fn populate_parameters(
    rule: &ExecutionRule,
    contract: &crate::contracts::CustomContract,
    actor: &Actor,
    matched: &StellarAddress,
    row: Option<&LocationUpdate>,
) -> Value {
    let raw: BTreeMap<String, Value> = rule
        .function_parameters
        .as_object()
        .map(|object| object.clone().into_iter().collect())
        .unwrap_or_default();
    let Some(mapping) = contract.mapping_or_derived(&rule.function_name) else {
        return rule.function_parameters.clone();
    };
    let ctx = ParamContext {
        network: Some(contract.network),
        user_public_key: actor.public_key.clone(),
        matched_public_key: Some(matched.clone()),
        latitude: row.map(|r| r.latitude),
        longitude: row.map(|r| r.longitude),
    };
    match canonicalize_parameters(&mapping, &raw, &ctx) {
        Ok(params) => {
            let mut object = serde_json::Map::new();
            for (name, value) in params {
                object.insert(name, value);
            }
            Value::Object(object)
        }
        // A template that cannot canonicalize yet still renders raw; the
        // execute call will surface the violations.
        Err(_) => rule.function_parameters.clone(),
    }
}

/// The completed projection. Recorded execution parameters win over the
/// rule's template.
#[instrument(skip_all, err, fields(user_id = actor.user_id))]
pub async fn completed_view(
    pool: &PgPool,
    actor: &Actor,
    limit: usize,
) -> Result<ProjectionPage<CompletedExecution>, ApiError> {
    let rows = load_rows(pool, actor).await?;
    let refs = collect_completed(&rows);
    let count = refs.len();
    let rules = rules_by_id(pool, &refs).await?;

    let mut items = Vec::new();
    for reference in refs.into_iter().take(limit) {
        let Some(row) = rows.iter().find(|r| r.id == reference.update_id) else {
            continue;
        };
        let result = &row.execution_results[reference.ordinality];
        let rule = rules.get(&reference.rule_id);
        let parameters = result
            .execution_parameters
            .clone()
            .or_else(|| rule.map(|r| r.function_parameters.clone()))
            .unwrap_or(Value::Null);
        items.push(CompletedExecution {
            rule_id: reference.rule_id,
            rule_name: rule.map(|r| r.rule_name.clone()),
            update_id: reference.update_id,
            ordinality: reference.ordinality,
            matched_public_key: reference.matched_public_key.clone(),
            transaction_hash: result.transaction_hash.clone(),
            completed_at: result.completed_at,
            success: result.success.unwrap_or(true),
            pending_confirmation: result.pending_confirmation,
            parameters,
        });
    }
    Ok(ProjectionPage { items, count })
}

/// The rejected projection.
#[instrument(skip_all, err, fields(user_id = actor.user_id))]
pub async fn rejected_view(
    pool: &PgPool,
    actor: &Actor,
    limit: usize,
) -> Result<ProjectionPage<RejectedExecution>, ApiError> {
    let rows = load_rows(pool, actor).await?;
    let refs = collect_rejected(&rows);
    let count = refs.len();
    let rules = rules_by_id(pool, &refs).await?;

    let items = refs
        .into_iter()
        .take(limit)
        .filter_map(|reference| {
            let row = rows.iter().find(|r| r.id == reference.update_id)?;
            let result = &row.execution_results[reference.ordinality];
            Some(RejectedExecution {
                rule_id: reference.rule_id,
                rule_name: rules.get(&reference.rule_id).map(|r| r.rule_name.clone()),
                update_id: reference.update_id,
                matched_public_key: reference.matched_public_key.clone(),
                rejected_at: result.rejected_at,
            })
        })
        .collect();
    Ok(ProjectionPage { items, count })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{ExecutionResult, SkipReason, UpdateStatus};
    use chrono::Duration;

    fn pk(tail: char) -> StellarAddress {
        let body: String = std::iter::repeat_n(tail, 55).collect();
        StellarAddress::parse(&format!("G{body}")).unwrap()
    }

    fn hash(seed: &str) -> TxHash {
        let mut h = seed.repeat(64);
        h.truncate(64);
        TxHash::parse(&h).unwrap()
    }

    fn row(
        id: i64,
        age_minutes: i64,
        public_key: &StellarAddress,
        results: Vec<ExecutionResult>,
    ) -> LocationUpdate {
        LocationUpdate {
            id,
            user_id: 1,
            public_key: public_key.clone(),
            latitude: 34.0,
            longitude: -118.0,
            received_at: Utc::now() - Duration::minutes(age_minutes),
            processed_at: None,
            status: UpdateStatus::Matched,
            matched_rule_ids: results.iter().map(|r| r.rule_id).collect(),
            execution_results: results,
        }
    }

    #[test]
    fn test_pending_dedups_by_rule_and_key() {
        let key = pk('A');
        let pending = ExecutionResult::skipped(5, SkipReason::RequiresWebauthn, key.clone());
        let rows = vec![
            row(30, 0, &key, vec![pending.clone()]),
            row(20, 5, &key, vec![pending.clone()]),
            // Same rule, different matched key: its own entry.
            row(
                10,
                10,
                &key,
                vec![ExecutionResult::skipped(
                    5,
                    SkipReason::RequiresWebauthn,
                    pk('B'),
                )],
            ),
        ];
        let refs = collect_pending(&rows);
        assert_eq!(refs.len(), 2);
        // Newest row wins for the duplicated key.
        assert_eq!(refs[0].update_id, 30);
        assert_eq!(refs[1].update_id, 10);
    }

    #[test]
    fn test_pending_excludes_terminal_and_other_skips() {
        let key = pk('A');
        let rows = vec![row(
            30,
            0,
            &key,
            vec![
                ExecutionResult::skipped(1, SkipReason::RequiresWebauthn, key.clone()),
                ExecutionResult::skipped(2, SkipReason::RateLimited, key.clone()),
                ExecutionResult::completed(3, hash("ab"), true, key.clone(), None, false, Utc::now()),
            ],
        )];
        let refs = collect_pending(&rows);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].rule_id, 1);
    }

    #[test]
    fn test_completed_keeps_distinct_positions() {
        let key = pk('A');
        let completion =
            ExecutionResult::completed(5, hash("ab"), true, key.clone(), None, false, Utc::now());
        // The same logical completion in two rows (replayed write) dedups by
        // update id remaining distinct; identical positional identities
        // collapse.
        let rows = vec![row(30, 0, &key, vec![completion.clone(), completion.clone()])];
        let refs = collect_completed(&rows);
        assert_eq!(refs.len(), 2, "distinct ordinality stays distinct");
    }

    #[test]
    fn test_rejected_dedups_by_timestamp() {
        let key = pk('A');
        let at = Utc::now();
        let mut rejected = ExecutionResult::skipped(5, SkipReason::RequiresWebauthn, key.clone());
        rejected.rejected = Some(true);
        rejected.rejected_at = Some(at);
        // Same rejection surfaced twice (two rows sharing the timestamp).
        let rows = vec![
            row(30, 0, &key, vec![rejected.clone()]),
            row(20, 5, &key, vec![rejected.clone()]),
        ];
        let refs = collect_rejected(&rows);
        assert_eq!(refs.len(), 1);

        // Without a timestamp, the update id separates them.
        let mut no_ts = rejected.clone();
        no_ts.rejected_at = None;
        let rows = vec![
            row(30, 0, &key, vec![no_ts.clone()]),
            row(20, 5, &key, vec![no_ts]),
        ];
        assert_eq!(collect_rejected(&rows).len(), 2);
    }

    #[test]
    fn test_projections_are_pairwise_disjoint() {
        let key = pk('A');
        let pending = ExecutionResult::skipped(1, SkipReason::RequiresWebauthn, key.clone());
        let completed =
            ExecutionResult::completed(2, hash("ab"), true, key.clone(), None, false, Utc::now());
        let mut rejected = ExecutionResult::skipped(3, SkipReason::RequiresWebauthn, key.clone());
        rejected.rejected = Some(true);
        rejected.rejected_at = Some(Utc::now());

        let rows = vec![row(30, 0, &key, vec![pending, completed, rejected])];
        let pending_refs = collect_pending(&rows);
        let completed_refs = collect_completed(&rows);
        let rejected_refs = collect_rejected(&rows);

        assert_eq!(pending_refs.len(), 1);
        assert_eq!(completed_refs.len(), 1);
        assert_eq!(rejected_refs.len(), 1);

        let all: Vec<(i64, usize)> = pending_refs
            .iter()
            .chain(&completed_refs)
            .chain(&rejected_refs)
            .map(|r| (r.update_id, r.ordinality))
            .collect();
        let unique: HashSet<_> = all.iter().collect();
        assert_eq!(all.len(), unique.len(), "no element in two projections");
    }
}
