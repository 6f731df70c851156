//! The dispatcher: what happens to each rule a location update matched.
//!
//! The decision ladder runs in a fixed order — rate limit, quorum, balance
//! kill switch, WebAuthn gate, auto-execution — and its outcome is recorded
//! positionally in the row's results array. The ladder itself is a pure
//! function over pre-fetched facts so every branch is testable without a
//! database.

use serde_json::Value;
use sqlx::PgPool;
use std::collections::BTreeMap;
use tracing::instrument;

use crate::chain::{ChainRegistry, ContractCall, ScValue};
use crate::contracts::{CustomContract, store as contract_store};
use crate::error::ApiError;
use crate::executor::{ExecuteRequest, Executor};
use crate::geo::GeoPoint;
use crate::history;
use crate::matcher;
use crate::queue::{self, ExecutionResult, LocationUpdate, SkipReason, UpdateStatus};
use crate::rules::{ExecutionRule, quorum};
use crate::types::{STROOPS_PER_XLM, StellarAddress};

/// Per-rule facts the decision ladder consumes.
#[derive(Debug, Clone, Default)]
pub struct DispatchFacts {
    /// `(current_count, max)` when the rule carries a rate limit.
    pub rate: Option<(i64, i64)>,
    /// Quorum verdict when the rule requires one.
    pub quorum_met: Option<bool>,
    /// Balance verdict when the auto-deactivate kill switch is armed.
    pub balance_low: Option<bool>,
    /// The contract demands WebAuthn material the backend does not hold.
    pub requires_webauthn: bool,
    pub auto_execute: bool,
}

/// The ladder's verdict for one matched rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchDecision {
    Skip(SkipReason),
    /// Skip and also deactivate the rule (balance kill switch fired).
    SkipAndDeactivate(SkipReason),
    AutoExecute,
}

/// The decision ladder. Order is significant: a rate-limited rule is
/// reported as rate-limited even when its quorum is also unmet.
pub fn decide(facts: &DispatchFacts) -> DispatchDecision {
    if let Some((count, max)) = facts.rate {
        if count >= max {
            return DispatchDecision::Skip(SkipReason::RateLimited);
        }
    }
    if facts.quorum_met == Some(false) {
        return DispatchDecision::Skip(SkipReason::QuorumUnmet);
    }
    if facts.balance_low == Some(true) {
        return DispatchDecision::SkipAndDeactivate(SkipReason::BalanceLow);
    }
    if facts.requires_webauthn {
        return DispatchDecision::Skip(SkipReason::RequiresWebauthn);
    }
    if facts.auto_execute {
        return DispatchDecision::AutoExecute;
    }
    DispatchDecision::Skip(SkipReason::RequiresConfirmation)
}

/// Ingests one device location update: match, enqueue, dispatch.
#[instrument(skip(pool, chains, executor), err, fields(user_id = user_id, public_key = %public_key))]
pub async fn ingest_location_update(
    pool: &PgPool,
    chains: &ChainRegistry,
    executor: &Executor,
    user_id: i64,
    public_key: &StellarAddress,
    point: GeoPoint,
) -> Result<LocationUpdate, ApiError> {
    let matched = matcher::match_rules(pool, point).await?;
    let rule_ids: Vec<i64> = matched.iter().map(|r| r.id).collect();

    // The row exists before any execution so inline runs can reference it.
    let placeholders: Vec<ExecutionResult> = matched
        .iter()
        .map(|rule| {
            ExecutionResult::skipped(rule.id, SkipReason::RequiresConfirmation, public_key.clone())
        })
        .collect();
    let row = queue::insert_matched(pool, user_id, public_key, point, &rule_ids, &placeholders)
        .await?;
    if matched.is_empty() {
        return Ok(row);
    }

    let mut results = Vec::with_capacity(matched.len());
    for rule in &matched {
        let result =
            dispatch_rule(pool, chains, executor, &row, rule, user_id, public_key).await;
        results.push(result);
    }

    let status = if results.iter().any(ExecutionResult::is_terminal) {
        UpdateStatus::Executed
    } else {
        UpdateStatus::Matched
    };
    let mut tx = pool.begin().await?;
    queue::write_results(&mut tx, row.id, status, &results, true).await?;
    tx.commit().await?;

    Ok(LocationUpdate {
        status,
        execution_results: results,
        ..row
    })
}

/// Evaluates and (when warranted) executes one matched rule, producing its
/// result element. Failures never poison the rest of the row.
async fn dispatch_rule(
    pool: &PgPool,
    chains: &ChainRegistry,
    executor: &Executor,
    row: &LocationUpdate,
    rule: &ExecutionRule,
    user_id: i64,
    public_key: &StellarAddress,
) -> ExecutionResult {
    let contract = match contract_store::get_active(pool, rule.contract_id).await {
        Ok(contract) => contract,
        Err(e) => {
            tracing::warn!(rule_id = rule.id, error = %e, "contract lookup failed at dispatch");
            return ExecutionResult::skipped(
                rule.id,
                SkipReason::ExecutionFailed,
                public_key.clone(),
            );
        }
    };

    let facts = match gather_facts(pool, chains, rule, &contract, public_key).await {
        Ok(facts) => facts,
        Err(e) => {
            tracing::warn!(rule_id = rule.id, error = %e, "dispatch fact gathering failed");
            return ExecutionResult::skipped(
                rule.id,
                SkipReason::ExecutionFailed,
                public_key.clone(),
            );
        }
    };

    match decide(&facts) {
        DispatchDecision::Skip(reason) => {
            ExecutionResult::skipped(rule.id, reason, public_key.clone())
        }
        DispatchDecision::SkipAndDeactivate(reason) => {
            if let Err(e) = deactivate_rule(pool, rule.id).await {
                tracing::error!(rule_id = rule.id, error = %e, "rule deactivation failed");
            }
            ExecutionResult::skipped(rule.id, reason, public_key.clone())
        }
        DispatchDecision::AutoExecute => {
            auto_execute(pool, executor, row, rule, &contract, user_id, public_key).await
        }
    }
}

async fn gather_facts(
    pool: &PgPool,
    chains: &ChainRegistry,
    rule: &ExecutionRule,
    contract: &CustomContract,
    public_key: &StellarAddress,
) -> Result<DispatchFacts, ApiError> {
    let rate = match rule.rate_limit() {
        Some((max, window)) => {
            let count =
                history::execution_count_within(pool, rule.id, public_key, window).await?;
            Some((count, max as i64))
        }
        None => None,
    };

    let quorum_met = if rule.has_quorum() {
        Some(quorum::check_quorum(pool, rule.id).await?.quorum_met)
    } else {
        None
    };

    let balance_low = balance_kill_switch(chains, rule, contract, public_key).await;

    // The backend never holds WebAuthn credentials; a contract that demands
    // them always waits for a user-initiated execution.
    let requires_webauthn = contract.requires_webauthn;

    Ok(DispatchFacts {
        rate,
        quorum_met,
        balance_low,
        requires_webauthn,
        auto_execute: rule.auto_execute,
    })
}

/// Evaluates the balance kill switch, when armed. `None` means not armed or
/// not evaluable; only a definite low reading trips the switch.
async fn balance_kill_switch(
    chains: &ChainRegistry,
    rule: &ExecutionRule,
    contract: &CustomContract,
    public_key: &StellarAddress,
) -> Option<bool> {
    if !rule.auto_deactivate_on_balance_threshold {
        return None;
    }
    let threshold_xlm = rule.balance_threshold_xlm?;
    let threshold_stroops = (threshold_xlm * STROOPS_PER_XLM as f64) as i128;

    if !rule.use_smart_wallet_balance {
        tracing::debug!(rule_id = rule.id, "balance switch armed without smart wallet source");
        return None;
    }
    let smart_wallet = contract.smart_wallet_contract_id.as_ref()?;
    let rpc = chains.by_network(contract.network)?;
    let holder = rule
        .target_wallet_public_key
        .as_ref()
        .unwrap_or(public_key);
    let asset = rule
        .balance_check_asset_address
        .clone()
        .unwrap_or_else(|| contract.network.native_sac());

    let call = ContractCall {
        network: contract.network,
        contract: smart_wallet.clone(),
        function: "get_balance".to_string(),
        args: vec![
            (
                "user_address".to_string(),
                ScValue::Address(holder.as_str().to_string()),
            ),
            (
                "asset".to_string(),
                ScValue::Address(asset.as_str().to_string()),
            ),
        ],
    };
    match rpc.simulate(&call).await {
        Ok(ScValue::I128(balance)) => Some(balance < threshold_stroops),
        Ok(other) => {
            tracing::warn!(rule_id = rule.id, result = ?other, "unexpected balance result");
            None
        }
        Err(e) => {
            tracing::warn!(rule_id = rule.id, error = %e, "balance check failed");
            None
        }
    }
}

async fn deactivate_rule(pool: &PgPool, rule_id: i64) -> Result<(), ApiError> {
    sqlx::query(
        "UPDATE contract_execution_rules SET is_active = false, updated_at = now() WHERE id = $1",
    )
    .bind(rule_id)
    .execute(pool)
    .await?;
    tracing::info!(rule_id = rule_id, "rule deactivated by balance threshold");
    Ok(())
}

async fn auto_execute(
    pool: &PgPool,
    executor: &Executor,
    row: &LocationUpdate,
    rule: &ExecutionRule,
    contract: &CustomContract,
    user_id: i64,
    public_key: &StellarAddress,
) -> ExecutionResult {
    let parameters: BTreeMap<String, Value> = rule
        .function_parameters
        .as_object()
        .map(|object| object.clone().into_iter().collect())
        .unwrap_or_default();
    let request = ExecuteRequest {
        function_name: rule.function_name.clone(),
        parameters,
        user_public_key: Some(public_key.clone()),
        rule_id: Some(rule.id),
        update_id: Some(row.id),
        matched_public_key: Some(public_key.clone()),
        ..ExecuteRequest::default()
    };

    match executor.execute(user_id, contract, &request).await {
        Ok(outcome) => {
            let result = match outcome.transaction_hash {
                Some(hash) => {
                    let summary = serde_json::json!({
                        "ruleId": rule.id,
                        "functionName": rule.function_name,
                        "autoExecuted": true,
                        "success": outcome.success,
                    });
                    if let Err(e) = history::record_execution_pool(
                        pool,
                        rule.id,
                        public_key,
                        Some(&hash),
                        &summary,
                    )
                    .await
                    {
                        tracing::error!(rule_id = rule.id, error = %e, "history append failed");
                    }
                    ExecutionResult::completed(
                        rule.id,
                        hash,
                        outcome.success,
                        public_key.clone(),
                        Some(Value::Object(
                            outcome
                                .executed_parameters
                                .into_iter()
                                .collect::<serde_json::Map<String, Value>>(),
                        )),
                        outcome.pending_confirmation,
                        chrono::Utc::now(),
                    )
                }
                // Simulation-only outcomes leave no terminal trace.
                None => ExecutionResult::skipped(
                    rule.id,
                    SkipReason::RequiresConfirmation,
                    public_key.clone(),
                ),
            };
            result
        }
        Err(e) => {
            tracing::warn!(rule_id = rule.id, error = %e, "auto-execution failed");
            ExecutionResult::skipped(rule.id, SkipReason::ExecutionFailed, public_key.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ladder_order_rate_limit_first() {
        // Every gate would fire; rate limit wins.
        let facts = DispatchFacts {
            rate: Some((3, 3)),
            quorum_met: Some(false),
            balance_low: Some(true),
            requires_webauthn: true,
            auto_execute: true,
        };
        assert_eq!(
            decide(&facts),
            DispatchDecision::Skip(SkipReason::RateLimited)
        );
    }

    #[test]
    fn test_under_limit_falls_through() {
        let facts = DispatchFacts {
            rate: Some((2, 3)),
            quorum_met: Some(true),
            balance_low: Some(false),
            requires_webauthn: false,
            auto_execute: true,
        };
        assert_eq!(decide(&facts), DispatchDecision::AutoExecute);
    }

    #[test]
    fn test_quorum_gate() {
        let facts = DispatchFacts {
            quorum_met: Some(false),
            auto_execute: true,
            ..DispatchFacts::default()
        };
        assert_eq!(
            decide(&facts),
            DispatchDecision::Skip(SkipReason::QuorumUnmet)
        );
    }

    #[test]
    fn test_balance_switch_deactivates() {
        let facts = DispatchFacts {
            balance_low: Some(true),
            auto_execute: true,
            ..DispatchFacts::default()
        };
        assert_eq!(
            decide(&facts),
            DispatchDecision::SkipAndDeactivate(SkipReason::BalanceLow)
        );
    }

    #[test]
    fn test_webauthn_contracts_wait_for_user() {
        let facts = DispatchFacts {
            requires_webauthn: true,
            auto_execute: true,
            ..DispatchFacts::default()
        };
        assert_eq!(
            decide(&facts),
            DispatchDecision::Skip(SkipReason::RequiresWebauthn)
        );
    }

    #[test]
    fn test_default_is_confirmation_skip() {
        let facts = DispatchFacts::default();
        assert_eq!(
            decide(&facts),
            DispatchDecision::Skip(SkipReason::RequiresConfirmation)
        );
    }
}
