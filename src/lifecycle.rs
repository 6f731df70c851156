//! Completion and rejection of queued execution results.
//!
//! This module is the only writer of terminal states. Its invariants:
//!
//! - For any `(rule, matched key)` at most one terminal element exists across
//!   the queue, and it belongs to exactly one of the pending / completed /
//!   rejected projections.
//! - `mark_completed` and `mark_rejected` are idempotent.
//! - Cleanup never deletes a row carrying any completed element, and never
//!   the target row itself.
//!
//! The target search, in-place rewrite, and cleanup predicate are pure
//! functions over loaded rows; the transactional wrappers lock the rows with
//! `SELECT … FOR UPDATE`, apply the pure mutation, and persist everything —
//! cleanup included — in the same transaction.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use tracing::instrument;

use crate::error::ApiError;
use crate::history;
use crate::queue::{self, ExecutionResult, LocationUpdate, UpdateStatus};
use crate::types::{StellarAddress, TxHash};

/// Inputs to `mark_completed`.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub rule_id: i64,
    pub user_id: i64,
    pub update_id: Option<i64>,
    pub matched_public_key: Option<StellarAddress>,
    pub transaction_hash: TxHash,
    pub execution_parameters: Option<Value>,
    pub pending_confirmation: bool,
}

/// What `mark_completed` did.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionOutcome {
    pub update_id: i64,
    /// The call was a replay: the key was already terminal and nothing
    /// changed.
    pub already_terminal: bool,
    pub cleaned_up_rows: u64,
}

/// What `mark_rejected` did.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectionOutcome {
    pub rejected_count: usize,
    pub already_rejected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejected_at: Option<DateTime<Utc>>,
}

/// Whether `result` is addressed by the request's logical key.
fn matches_key(result: &ExecutionResult, rule_id: i64, matched: Option<&StellarAddress>) -> bool {
    if result.rule_id != rule_id {
        return false;
    }
    match matched {
        Some(matched) => result
            .matched_public_key
            .as_ref()
            .map(|pk| pk == matched)
            // An element that never recorded a matched key is still
            // addressable by any key; the rewrite injects it.
            .unwrap_or(true),
        None => true,
    }
}

/// Finds an element already terminal under the request's logical key.
/// Re-invocations land here and become no-ops.
pub fn find_existing_terminal(
    rows: &[LocationUpdate],
    rule_id: i64,
    matched: Option<&StellarAddress>,
) -> Option<(usize, usize)> {
    for (row_idx, row) in rows.iter().enumerate() {
        for (res_idx, result) in row.execution_results.iter().enumerate() {
            if result.is_terminal() && matches_key(result, rule_id, matched) {
                return Some((row_idx, res_idx));
            }
        }
    }
    None
}

/// Locates the pending placeholder to convert, by the most specific key
/// available: `(user, update_id)`, else `(user, matched_public_key)`, else
/// `(user, rule_id)`. Rows are expected newest-first.
pub fn locate_pending_target(
    rows: &[LocationUpdate],
    rule_id: i64,
    update_id: Option<i64>,
    matched: Option<&StellarAddress>,
) -> Option<(usize, usize)> {
    if let Some(update_id) = update_id {
        if let Some(row_idx) = rows.iter().position(|r| r.id == update_id) {
            let row = &rows[row_idx];
            if let Some(res_idx) = row
                .execution_results
                .iter()
                .position(|r| r.is_pending_webauthn() && matches_key(r, rule_id, matched))
            {
                return Some((row_idx, res_idx));
            }
        }
    }

    if let Some(matched) = matched {
        for (row_idx, row) in rows.iter().enumerate() {
            if let Some(res_idx) = row
                .execution_results
                .iter()
                .position(|r| r.is_pending_webauthn() && matches_key(r, rule_id, Some(matched)))
            {
                return Some((row_idx, res_idx));
            }
        }
    }

    for (row_idx, row) in rows.iter().enumerate() {
        if let Some(res_idx) = row
            .execution_results
            .iter()
            .position(|r| r.is_pending_webauthn() && r.rule_id == rule_id)
        {
            return Some((row_idx, res_idx));
        }
    }
    None
}

/// Rewrites a pending placeholder into its completed form. The matched key is
/// preserved when present and injected otherwise; the skip reason is removed.
pub fn complete_in_place(
    result: &mut ExecutionResult,
    request: &CompletionRequest,
    fallback_matched: &StellarAddress,
    now: DateTime<Utc>,
) {
    let matched = result
        .matched_public_key
        .take()
        .or_else(|| request.matched_public_key.clone())
        .unwrap_or_else(|| fallback_matched.clone());
    *result = ExecutionResult {
        rule_id: request.rule_id,
        skipped: Some(false),
        reason: None,
        rejected: result.rejected,
        rejected_at: result.rejected_at,
        completed: Some(true),
        completed_at: Some(now),
        transaction_hash: Some(request.transaction_hash.clone()),
        success: Some(true),
        pending_confirmation: request.pending_confirmation.then_some(true),
        matched_public_key: Some(matched),
        execution_parameters: request.execution_parameters.clone(),
        direct_execution: Some(true),
    };
}

/// The cleanup predicate: which rows become redundant once `target` carries
/// the completion for `(rule_id, matched)`.
///
/// A candidate is deleted iff all of:
/// - it was received no later than the target row,
/// - it belongs to the same `(user_id, public_key)` as the target row,
/// - it holds a pending placeholder for the same rule and matched key,
/// - it carries no completed element of its own,
/// - it is not the target row.
pub fn cleanup_candidates(
    rows: &[LocationUpdate],
    target_row_idx: usize,
    rule_id: i64,
    matched: &StellarAddress,
) -> Vec<i64> {
    let target = &rows[target_row_idx];
    rows.iter()
        .enumerate()
        .filter(|(idx, candidate)| {
            *idx != target_row_idx
                && candidate.id != target.id
                && candidate.received_at <= target.received_at
                && candidate.user_id == target.user_id
                && candidate.public_key == target.public_key
                && candidate
                    .execution_results
                    .iter()
                    .any(|r| r.is_pending_webauthn() && matches_key(r, rule_id, Some(matched)))
                // A row holding any completion is never deleted.
                && !candidate.has_completed_result()
        })
        .map(|(_, candidate)| candidate.id)
        .collect()
}

/// Marks all pending placeholders for the key as rejected. Already-rejected
/// elements keep their original `rejected_at` so repeat calls are stable.
pub fn reject_pending(
    rows: &mut [LocationUpdate],
    rule_id: i64,
    matched: Option<&StellarAddress>,
    now: DateTime<Utc>,
) -> RejectionOutcome {
    let mut rejected_count = 0;
    let mut already = None;
    let mut touched_at = None;
    for row in rows.iter_mut() {
        for result in row.execution_results.iter_mut() {
            if !matches_key(result, rule_id, matched) {
                continue;
            }
            if result.is_rejected_entry() {
                already = already.or(result.rejected_at);
                continue;
            }
            if result.is_pending_webauthn() {
                result.rejected = Some(true);
                result.rejected_at = Some(now);
                rejected_count += 1;
                touched_at = Some(now);
            }
        }
    }
    RejectionOutcome {
        rejected_count,
        already_rejected: rejected_count == 0 && already.is_some(),
        rejected_at: touched_at.or(already),
    }
}

/// Idempotently converts the pending placeholder for the request's key into
/// a completion, then cleans up superseded rows — all in one transaction.
#[instrument(skip_all, err, fields(rule_id = request.rule_id, user_id = request.user_id))]
pub async fn mark_completed(
    pool: &PgPool,
    actor_public_key: Option<&StellarAddress>,
    request: &CompletionRequest,
) -> Result<CompletionOutcome, ApiError> {
    let now = Utc::now();
    let mut tx = pool.begin().await?;
    let mut rows =
        queue::load_for_actor_locked(&mut tx, request.user_id, actor_public_key).await?;

    // Replay: the key is already terminal. Nothing changes.
    if let Some((row_idx, _)) = find_existing_terminal(
        &rows,
        request.rule_id,
        request.matched_public_key.as_ref(),
    ) {
        let update_id = rows[row_idx].id;
        tx.commit().await?;
        return Ok(CompletionOutcome {
            update_id,
            already_terminal: true,
            cleaned_up_rows: 0,
        });
    }

    let located = locate_pending_target(
        &rows,
        request.rule_id,
        request.update_id,
        request.matched_public_key.as_ref(),
    );

    let (row_idx, matched_key) = match located {
        Some((row_idx, res_idx)) => {
            let fallback = rows[row_idx].public_key.clone();
            complete_in_place(
                &mut rows[row_idx].execution_results[res_idx],
                request,
                &fallback,
                now,
            );
            let matched = rows[row_idx].execution_results[res_idx]
                .matched_public_key
                .clone()
                .unwrap_or(fallback);
            (row_idx, matched)
        }
        None => {
            // Direct execution with no placeholder anywhere: append to the
            // newest row, or create one when the queue is empty.
            let matched = request
                .matched_public_key
                .clone()
                .or_else(|| actor_public_key.cloned());
            let matched = match matched {
                Some(matched) => matched,
                None => {
                    return Err(ApiError::validation_all(
                        "Cannot record completion",
                        vec!["matched_public_key is required when no queue row exists"
                            .to_string()],
                    ));
                }
            };
            let completed = ExecutionResult::completed(
                request.rule_id,
                request.transaction_hash.clone(),
                true,
                matched.clone(),
                request.execution_parameters.clone(),
                request.pending_confirmation,
                now,
            );
            if rows.is_empty() {
                let row = queue::insert_matched(
                    pool,
                    request.user_id,
                    &matched,
                    crate::geo::GeoPoint::new(0.0, 0.0),
                    &[request.rule_id],
                    std::slice::from_ref(&completed),
                )
                .await?;
                rows.insert(0, row);
            } else {
                rows[0].execution_results.push(completed);
            }
            (0, matched)
        }
    };

    let update_id = rows[row_idx].id;
    queue::write_results(
        &mut tx,
        update_id,
        UpdateStatus::Executed,
        &rows[row_idx].execution_results,
        true,
    )
    .await?;

    let doomed = cleanup_candidates(&rows, row_idx, request.rule_id, &matched_key);
    let cleaned_up_rows = queue::delete_rows(&mut tx, &doomed).await?;

    let summary = serde_json::json!({
        "ruleId": request.rule_id,
        "matchedPublicKey": matched_key.as_str(),
        "directExecution": true,
    });
    history::record_execution(
        &mut tx,
        request.rule_id,
        &matched_key,
        Some(&request.transaction_hash),
        &summary,
    )
    .await?;

    tx.commit().await?;
    Ok(CompletionOutcome {
        update_id,
        already_terminal: false,
        cleaned_up_rows,
    })
}

/// Idempotently rejects the pending placeholder(s) for the key. No cleanup.
#[instrument(skip_all, err, fields(rule_id = rule_id, user_id = user_id))]
pub async fn mark_rejected(
    pool: &PgPool,
    user_id: i64,
    actor_public_key: Option<&StellarAddress>,
    rule_id: i64,
    matched_public_key: Option<&StellarAddress>,
) -> Result<RejectionOutcome, ApiError> {
    let now = Utc::now();
    let mut tx = pool.begin().await?;
    let mut rows = queue::load_for_actor_locked(&mut tx, user_id, actor_public_key).await?;

    let outcome = reject_pending(&mut rows, rule_id, matched_public_key, now);
    if outcome.rejected_count > 0 {
        for row in &rows {
            if row
                .execution_results
                .iter()
                .any(|r| r.is_rejected_entry() && r.rule_id == rule_id)
            {
                queue::write_results(&mut tx, row.id, row.status, &row.execution_results, false)
                    .await?;
            }
        }
    }
    tx.commit().await?;
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::SkipReason;
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

    fn request(rule_id: i64, matched: Option<StellarAddress>) -> CompletionRequest {
        CompletionRequest {
            rule_id,
            user_id: 1,
            update_id: None,
            matched_public_key: matched,
            transaction_hash: hash("ab"),
            execution_parameters: None,
            pending_confirmation: false,
        }
    }

    #[test]
    fn test_locate_prefers_update_id() {
        let key = pk('A');
        let pending = ExecutionResult::skipped(5, SkipReason::RequiresWebauthn, key.clone());
        let rows = vec![
            row(30, 0, &key, vec![pending.clone()]),
            row(20, 10, &key, vec![pending.clone()]),
        ];
        // With an update id, the older row is addressed directly.
        assert_eq!(
            locate_pending_target(&rows, 5, Some(20), Some(&key)),
            Some((1, 0))
        );
        // Without, the newest pending row wins.
        assert_eq!(locate_pending_target(&rows, 5, None, Some(&key)), Some((0, 0)));
    }

    #[test]
    fn test_locate_by_matched_key_skips_other_keys() {
        let mine = pk('A');
        let theirs = pk('B');
        let rows = vec![
            row(
                30,
                0,
                &mine,
                vec![ExecutionResult::skipped(
                    5,
                    SkipReason::RequiresWebauthn,
                    theirs.clone(),
                )],
            ),
            row(
                20,
                5,
                &mine,
                vec![ExecutionResult::skipped(
                    5,
                    SkipReason::RequiresWebauthn,
                    mine.clone(),
                )],
            ),
        ];
        assert_eq!(
            locate_pending_target(&rows, 5, None, Some(&mine)),
            Some((1, 0))
        );
    }

    #[test]
    fn test_locate_ignores_terminal_and_non_webauthn() {
        let key = pk('A');
        let completed =
            ExecutionResult::completed(5, hash("cd"), true, key.clone(), None, false, Utc::now());
        let rate_limited = ExecutionResult::skipped(5, SkipReason::RateLimited, key.clone());
        let rows = vec![row(30, 0, &key, vec![completed, rate_limited])];
        assert_eq!(locate_pending_target(&rows, 5, None, Some(&key)), None);
    }

    #[test]
    fn test_complete_in_place_rewrites_fully() {
        let key = pk('A');
        let mut result = ExecutionResult::skipped(5, SkipReason::RequiresWebauthn, key.clone());
        let req = request(5, Some(key.clone()));
        complete_in_place(&mut result, &req, &key, Utc::now());

        assert!(result.is_completed());
        assert_eq!(result.skipped, Some(false));
        assert_eq!(result.reason, None);
        assert_eq!(result.direct_execution, Some(true));
        assert_eq!(result.success, Some(true));
        assert_eq!(result.transaction_hash, Some(hash("ab")));
        assert_eq!(result.matched_public_key, Some(key));
    }

    #[test]
    fn test_completion_is_idempotent_on_replay() {
        let key = pk('A');
        let mut result = ExecutionResult::skipped(5, SkipReason::RequiresWebauthn, key.clone());
        complete_in_place(&mut result, &request(5, Some(key.clone())), &key, Utc::now());
        let rows = vec![row(30, 0, &key, vec![result])];
        // A second invocation finds the terminal element instead of a target.
        assert!(find_existing_terminal(&rows, 5, Some(&key)).is_some());
        assert_eq!(locate_pending_target(&rows, 5, None, Some(&key)), None);
    }

    #[test]
    fn test_projection_disjointness_after_transitions() {
        let key = pk('A');
        let mut pending = ExecutionResult::skipped(5, SkipReason::RequiresWebauthn, key.clone());
        assert!(pending.is_pending_webauthn());
        assert!(!pending.is_completed() && !pending.is_rejected_entry());

        complete_in_place(&mut pending, &request(5, Some(key.clone())), &key, Utc::now());
        assert!(pending.is_completed());
        assert!(!pending.is_pending_webauthn());
        assert!(!pending.is_rejected_entry());

        let mut rejected = ExecutionResult::skipped(5, SkipReason::RequiresWebauthn, key.clone());
        let mut rows = vec![row(30, 0, &key, vec![rejected.clone()])];
        reject_pending(&mut rows, 5, Some(&key), Utc::now());
        rejected = rows[0].execution_results[0].clone();
        assert!(rejected.is_rejected_entry());
        assert!(!rejected.is_pending_webauthn());
        assert!(!rejected.is_completed());
    }

    #[test]
    fn test_cleanup_spares_rows_with_completions() {
        let key = pk('A');
        let pending = ExecutionResult::skipped(5, SkipReason::RequiresWebauthn, key.clone());
        let completed_other =
            ExecutionResult::completed(9, hash("ef"), true, key.clone(), None, false, Utc::now());

        let mut target_results = vec![pending.clone()];
        complete_in_place(
            &mut target_results[0],
            &request(5, Some(key.clone())),
            &key,
            Utc::now(),
        );

        let rows = vec![
            row(40, 0, &key, target_results),
            // Older duplicate placeholder: eligible.
            row(30, 5, &key, vec![pending.clone()]),
            // Older placeholder but carries a completion for another rule:
            // must survive.
            row(20, 10, &key, vec![pending.clone(), completed_other]),
            // Different public key: must survive.
            row(10, 15, &pk('B'), vec![pending.clone()]),
        ];
        let doomed = cleanup_candidates(&rows, 0, 5, &key);
        assert_eq!(doomed, vec![30]);
    }

    #[test]
    fn test_cleanup_never_deletes_target_or_newer_rows() {
        let key = pk('A');
        let pending = ExecutionResult::skipped(5, SkipReason::RequiresWebauthn, key.clone());
        let mut completed = pending.clone();
        complete_in_place(&mut completed, &request(5, Some(key.clone())), &key, Utc::now());

        let rows = vec![
            // Newer than target: survives.
            row(50, 0, &key, vec![pending.clone()]),
            row(40, 5, &key, vec![completed]),
            row(30, 10, &key, vec![pending.clone()]),
        ];
        let doomed = cleanup_candidates(&rows, 1, 5, &key);
        assert_eq!(doomed, vec![30]);
        assert!(!doomed.contains(&40), "target row must never be deleted");
        assert!(!doomed.contains(&50), "newer rows must never be deleted");
    }

    #[test]
    fn test_reject_is_idempotent_with_stable_timestamp() {
        let key = pk('A');
        let pending = ExecutionResult::skipped(5, SkipReason::RequiresWebauthn, key.clone());
        let mut rows = vec![row(30, 0, &key, vec![pending])];

        let first = reject_pending(&mut rows, 5, Some(&key), Utc::now());
        assert_eq!(first.rejected_count, 1);
        assert!(!first.already_rejected);
        let first_at = first.rejected_at.unwrap();

        let second = reject_pending(&mut rows, 5, Some(&key), Utc::now() + Duration::seconds(90));
        assert_eq!(second.rejected_count, 0);
        assert!(second.already_rejected);
        assert_eq!(second.rejected_at, Some(first_at));
        assert_eq!(rows[0].execution_results[0].rejected_at, Some(first_at));
    }

    #[test]
    fn test_reject_missing_key_is_a_noop_not_an_error() {
        let key = pk('A');
        let mut rows = vec![row(30, 0, &key, vec![])];
        let outcome = reject_pending(&mut rows, 5, Some(&key), Utc::now());
        assert_eq!(outcome.rejected_count, 0);
        assert!(!outcome.already_rejected);
        assert_eq!(outcome.rejected_at, None);
    }
}
