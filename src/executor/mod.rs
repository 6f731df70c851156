//! The executor: builds, signs, submits, and confirms contract invocations.
//!
//! Two routing sub-paths share the same preparation pipeline. The direct
//! path canonicalizes parameters against the function's mapping and invokes
//! the target contract itself; the smart-wallet path funnels payments through
//! the configured wallet contract's `execute_payment`, gated by a WebAuthn
//! passkey consistency check and a canonical signature payload.

pub mod params;
pub mod payload;
pub mod smart_wallet;
pub mod webauthn;

use base64::Engine;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::instrument;

use crate::chain::{ChainRegistry, ContractCall, ScValue, SignerKey, SorobanRpc, TxStatus};
use crate::contracts::{CustomContract, store as contract_store};
use crate::error::ApiError;
use crate::executor::params::{ParamContext, apply_webauthn_gate, canonicalize_parameters};
use crate::executor::payload::{PaymentFields, resolve_payload};
use crate::executor::smart_wallet::SmartWalletPayment;
use crate::queue;
use crate::rules::quorum;
use crate::types::{StellarAddress, StroopAmount, TxHash};

const PAYMENT_NAME_HINTS: [&str; 6] = ["transfer", "payment", "send", "pay", "withdraw", "deposit"];
const DESTINATION_KEYS: [&str; 4] = ["destination", "recipient", "to", "to_address"];
const AMOUNT_KEYS: [&str; 4] = ["amount", "amount_xlm", "amount_stroops", "value"];
const READ_ONLY_PREFIXES: [&str; 8] = [
    "get_", "is_", "has_", "check_", "query_", "view_", "read_", "fetch_",
];

/// True when the function looks like a payment: a payment-ish name, or a
/// parameter set that names both a destination-like and an amount-like key.
pub fn is_payment_function<'a, I>(name: &str, param_names: I) -> bool
where
    I: IntoIterator<Item = &'a str>,
{
    let lower = name.to_ascii_lowercase();
    if PAYMENT_NAME_HINTS.iter().any(|hint| lower.contains(hint)) {
        return true;
    }
    let mut has_destination = false;
    let mut has_amount = false;
    for param in param_names {
        let param = param.to_ascii_lowercase();
        has_destination |= DESTINATION_KEYS.contains(&param.as_str());
        has_amount |= AMOUNT_KEYS.contains(&param.as_str());
    }
    has_destination && has_amount
}

/// Name-prefix heuristic for read-only functions.
pub fn is_read_only(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    READ_ONLY_PREFIXES
        .iter()
        .any(|prefix| lower.starts_with(prefix))
}

/// The routing predicate: explicit opt-in via `payment_source`, or a
/// smart-wallet contract executing one of its payment functions.
pub fn routes_through_smart_wallet<'a, I>(
    payment_source: Option<&str>,
    contract: &CustomContract,
    function_name: &str,
    param_names: I,
) -> bool
where
    I: IntoIterator<Item = &'a str>,
{
    if payment_source == Some("smart-wallet") {
        return true;
    }
    contract.use_smart_wallet
        && contract.smart_wallet_contract_id.is_some()
        && is_payment_function(function_name, param_names)
}

/// A user- or dispatcher-initiated execution request.
#[derive(Debug, Clone, Default)]
pub struct ExecuteRequest {
    pub function_name: String,
    pub parameters: BTreeMap<String, Value>,
    pub user_public_key: Option<StellarAddress>,
    pub user_secret_key: Option<String>,
    pub rule_id: Option<i64>,
    pub update_id: Option<i64>,
    pub matched_public_key: Option<StellarAddress>,
    pub payment_source: Option<String>,
    pub passkey_spki: Option<String>,
    pub webauthn_signature: Option<String>,
    pub webauthn_authenticator_data: Option<String>,
    pub webauthn_client_data: Option<String>,
    pub signature_payload: Option<Value>,
    pub submit_to_ledger: bool,
}

/// What an execution produced.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub transaction_hash: Option<TxHash>,
    pub simulated_only: bool,
    pub routed_through_smart_wallet: bool,
    pub contract_return_value: Option<Value>,
    pub pending_confirmation: bool,
    pub executed_parameters: Vec<(String, Value)>,
}

/// Execution engine bound to the database and RPC registry.
#[derive(Clone)]
pub struct Executor {
    pool: sqlx::PgPool,
    chains: ChainRegistry,
    poll_attempts: u32,
    poll_interval: Duration,
}

fn decode_bytes(label: &str, input: &str) -> Result<Vec<u8>, ApiError> {
    base64::engine::general_purpose::STANDARD
        .decode(input)
        .or_else(|_| base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(input))
        .or_else(|_| hex::decode(input).map_err(|_| base64::DecodeError::InvalidPadding))
        .map_err(|_| {
            ApiError::validation_all(
                format!("Invalid {label}"),
                vec![format!("{label} must be base64 or hex")],
            )
        })
}

impl Executor {
    pub fn new(
        pool: sqlx::PgPool,
        chains: ChainRegistry,
        poll_attempts: u32,
        poll_interval: Duration,
    ) -> Self {
        Executor {
            pool,
            chains,
            poll_attempts,
            poll_interval,
        }
    }

    fn rpc(&self, contract: &CustomContract) -> Result<std::sync::Arc<dyn SorobanRpc>, ApiError> {
        self.chains
            .by_network(contract.network)
            .ok_or_else(|| ApiError::Chain(format!("no RPC configured for {}", contract.network)))
    }

    /// Executes `request.function_name` on `contract` for `user_id`.
    #[instrument(skip_all, err, fields(
        contract_id = contract.id,
        function = %request.function_name,
        rule_id = request.rule_id,
    ))]
    pub async fn execute(
        &self,
        user_id: i64,
        contract: &CustomContract,
        request: &ExecuteRequest,
    ) -> Result<ExecutionOutcome, ApiError> {
        let rpc = self.rpc(contract)?;

        // A caller binding this execution to a rule accepts its quorum gate.
        let rule = match request.rule_id {
            Some(rule_id) => {
                let rule = crate::rules::store::get_active(&self.pool, rule_id).await?;
                if rule.has_quorum() {
                    quorum::check_quorum(&self.pool, rule_id)
                        .await?
                        .require_met()?;
                }
                Some(rule)
            }
            None => None,
        };

        let mapping = contract
            .mapping_or_derived(&request.function_name)
            .ok_or_else(|| {
                ApiError::not_found(format!(
                    "function {} on contract {}",
                    request.function_name, contract.id
                ))
            })?;
        // First sight of this function: remember the derived mapping.
        if !contract.function_mappings.contains_key(&request.function_name) {
            contract_store::persist_derived_mapping(
                &self.pool,
                contract.id,
                &request.function_name,
                &mapping,
            )
            .await?;
        }

        let (matched_public_key, update_point) = self
            .resolve_match_context(user_id, request)
            .await?;

        let ctx = ParamContext {
            network: Some(contract.network),
            user_public_key: request.user_public_key.clone(),
            matched_public_key: matched_public_key.clone(),
            latitude: update_point.map(|p| p.latitude),
            longitude: update_point.map(|p| p.longitude),
        };
        let canonical = canonicalize_parameters(&mapping, &request.parameters, &ctx)
            .map_err(|violations| {
                ApiError::validation_all(
                    format!("{} parameter violation(s)", violations.len()),
                    violations,
                )
            })?;
        let canonical = apply_webauthn_gate(canonical, contract.includes_webauthn_parameters());

        let submit_requested = request.submit_to_ledger
            || rule
                .as_ref()
                .map(|r| r.submit_readonly_to_ledger)
                .unwrap_or(false);

        let param_names = mapping.parameters.iter().map(|p| p.name.as_str());
        if routes_through_smart_wallet(
            request.payment_source.as_deref(),
            contract,
            &request.function_name,
            param_names,
        ) {
            self.execute_smart_wallet(contract, request, &canonical, rpc.as_ref())
                .await
        } else {
            self.execute_direct(contract, request, canonical, submit_requested, rpc.as_ref())
                .await
        }
    }

    /// Validation and simulation only: canonicalizes parameters, builds the
    /// call, and simulates it. Never signs, never submits.
    #[instrument(skip_all, err, fields(contract_id = contract.id, function = %request.function_name))]
    pub async fn test_function(
        &self,
        contract: &CustomContract,
        request: &ExecuteRequest,
    ) -> Result<ExecutionOutcome, ApiError> {
        let rpc = self.rpc(contract)?;
        let mapping = contract
            .mapping_or_derived(&request.function_name)
            .ok_or_else(|| {
                ApiError::not_found(format!(
                    "function {} on contract {}",
                    request.function_name, contract.id
                ))
            })?;
        let ctx = ParamContext {
            network: Some(contract.network),
            user_public_key: request.user_public_key.clone(),
            matched_public_key: request.matched_public_key.clone(),
            latitude: None,
            longitude: None,
        };
        let canonical = canonicalize_parameters(&mapping, &request.parameters, &ctx)
            .map_err(|violations| {
                ApiError::validation_all(
                    format!("{} parameter violation(s)", violations.len()),
                    violations,
                )
            })?;
        let canonical = apply_webauthn_gate(canonical, contract.includes_webauthn_parameters());
        let call = self.build_call(contract, &request.function_name, &canonical)?;
        let value = rpc
            .simulate(&call)
            .await
            .map_err(|e| ApiError::Chain(e.to_string()))?;
        Ok(ExecutionOutcome {
            success: true,
            transaction_hash: None,
            simulated_only: true,
            routed_through_smart_wallet: false,
            contract_return_value: Some(value.to_plain_json()),
            pending_confirmation: false,
            executed_parameters: canonical,
        })
    }

    /// Resolves the matched public key and triggering coordinates from the
    /// queue row referenced by the request, when any.
    async fn resolve_match_context(
        &self,
        user_id: i64,
        request: &ExecuteRequest,
    ) -> Result<(Option<StellarAddress>, Option<crate::geo::GeoPoint>), ApiError> {
        if let Some(update_id) = request.update_id {
            let update = queue::get_for_user(&self.pool, update_id, user_id).await?;
            let matched = request.matched_public_key.clone().or_else(|| {
                request
                    .rule_id
                    .and_then(|rule_id| {
                        update
                            .execution_results
                            .iter()
                            .find(|r| r.rule_id == rule_id)
                            .and_then(|r| r.matched_public_key.clone())
                    })
                    .or_else(|| Some(update.public_key.clone()))
            });
            return Ok((matched, Some(update.point())));
        }

        if request.matched_public_key.is_some() {
            return Ok((request.matched_public_key.clone(), None));
        }

        // Fall back to the newest pending placeholder for the rule.
        if let Some(rule_id) = request.rule_id {
            let rows = queue::load_for_actor(
                &self.pool,
                user_id,
                request.user_public_key.as_ref(),
            )
            .await?;
            for row in &rows {
                if let Some(result) = row
                    .execution_results
                    .iter()
                    .find(|r| r.rule_id == rule_id && r.is_pending_webauthn())
                {
                    let matched = result
                        .matched_public_key
                        .clone()
                        .unwrap_or_else(|| row.public_key.clone());
                    return Ok((Some(matched), Some(row.point())));
                }
            }
        }
        Ok((request.user_public_key.clone(), None))
    }

    async fn execute_direct(
        &self,
        contract: &CustomContract,
        request: &ExecuteRequest,
        canonical: Vec<(String, Value)>,
        submit_requested: bool,
        rpc: &dyn SorobanRpc,
    ) -> Result<ExecutionOutcome, ApiError> {
        let call = self.build_call(contract, &request.function_name, &canonical)?;

        let read_only = is_read_only(&request.function_name);
        if read_only && !submit_requested {
            // Simulation only; no signature involved.
            let value = rpc
                .simulate(&call)
                .await
                .map_err(|e| ApiError::Chain(e.to_string()))?;
            return Ok(ExecutionOutcome {
                success: true,
                transaction_hash: None,
                simulated_only: true,
                routed_through_smart_wallet: false,
                contract_return_value: Some(value.to_plain_json()),
                pending_confirmation: false,
                executed_parameters: canonical,
            });
        }

        // Forcing a read-only function onto the ledger is an explicit act and
        // needs the caller's own credentials.
        let signer = request
            .user_secret_key
            .as_ref()
            .map(|secret| SignerKey::new(secret.clone()));
        if read_only && signer.is_none() {
            return Err(ApiError::validation_all(
                "Missing credentials",
                vec!["user_secret_key is required to submit a read-only call to the ledger"
                    .to_string()],
            ));
        }

        rpc.simulate(&call)
            .await
            .map_err(|e| ApiError::Chain(e.to_string()))?;
        let hash = rpc
            .submit(&call, signer.as_ref())
            .await
            .map_err(|e| ApiError::Chain(e.to_string()))?;

        let (status, pending) = self.poll(rpc, &hash).await?;
        match status {
            TxStatus::Success { return_value } => {
                if let Some(value) = &return_value {
                    if value.is_false() {
                        return Err(ApiError::ExecutionFailed(format!(
                            "{} returned false (transaction {hash})",
                            request.function_name
                        )));
                    }
                }
                Ok(ExecutionOutcome {
                    success: true,
                    transaction_hash: Some(hash),
                    simulated_only: false,
                    routed_through_smart_wallet: false,
                    contract_return_value: return_value.map(|v| v.to_plain_json()),
                    pending_confirmation: false,
                    executed_parameters: canonical,
                })
            }
            TxStatus::Failed { reason } => Err(ApiError::ExecutionFailed(format!(
                "transaction {hash} failed: {}",
                reason.unwrap_or_else(|| "unknown".to_string())
            ))),
            TxStatus::Pending | TxStatus::NotFound if pending => Ok(ExecutionOutcome {
                success: true,
                transaction_hash: Some(hash),
                simulated_only: false,
                routed_through_smart_wallet: false,
                contract_return_value: None,
                pending_confirmation: true,
                executed_parameters: canonical,
            }),
            TxStatus::Pending | TxStatus::NotFound => Err(ApiError::Chain(format!(
                "transaction {hash} disappeared during confirmation"
            ))),
        }
    }

    async fn execute_smart_wallet(
        &self,
        contract: &CustomContract,
        request: &ExecuteRequest,
        canonical: &[(String, Value)],
        rpc: &dyn SorobanRpc,
    ) -> Result<ExecutionOutcome, ApiError> {
        let smart_wallet = contract
            .smart_wallet_contract_id
            .clone()
            .ok_or_else(|| {
                ApiError::validation_all(
                    "Smart wallet not configured",
                    vec!["contract has no smartWalletContractId".to_string()],
                )
            })?;

        let destination_value = canonical
            .iter()
            .find(|(name, _)| DESTINATION_KEYS.contains(&name.as_str()))
            .and_then(|(_, v)| v.as_str());
        let amount_value = canonical
            .iter()
            .find(|(name, _)| AMOUNT_KEYS.contains(&name.as_str()))
            .map(|(_, v)| v);

        let (signer, destination_value, amount_value, signature_b64, spki) = match (
            request.user_public_key.clone(),
            destination_value,
            amount_value,
            request.webauthn_signature.clone(),
            request.passkey_spki.clone(),
        ) {
            (Some(signer), Some(dest), Some(amount), Some(sig), Some(spki)) => {
                (signer, dest, amount, sig, spki)
            }
            (signer, dest, amount, sig, spki) => {
                let mut violations = Vec::new();
                if signer.is_none() {
                    violations.push("user_public_key is required".to_string());
                }
                if dest.is_none() {
                    violations.push("a destination parameter is required".to_string());
                }
                if amount.is_none() {
                    violations.push("an amount parameter is required".to_string());
                }
                if sig.is_none() {
                    violations.push("webauthnSignature is required".to_string());
                }
                if spki.is_none() {
                    violations.push("passkeyPublicKeySPKI is required".to_string());
                }
                return Err(ApiError::validation_all(
                    format!("{} smart wallet violation(s)", violations.len()),
                    violations,
                ));
            }
        };
        let destination = StellarAddress::parse(destination_value)
            .map_err(|e| ApiError::validation_all("Invalid destination", vec![e.to_string()]))?;
        let amount = StroopAmount::canonicalize(amount_value)
            .map_err(|e| ApiError::validation_all("Invalid amount", vec![e.to_string()]))?;

        let asset = canonical
            .iter()
            .find(|(name, _)| name == "asset")
            .and_then(|(_, v)| v.as_str())
            .map(StellarAddress::parse)
            .transpose()
            .map_err(|e| ApiError::validation_all("Invalid asset", vec![e.to_string()]))?
            .unwrap_or_else(|| contract.network.native_sac());

        let spki_bytes = decode_bytes("passkeyPublicKeySPKI", &spki)?;
        smart_wallet::preflight_passkey(
            rpc,
            contract.network,
            &smart_wallet,
            &signer,
            &spki_bytes,
        )
        .await?;
        smart_wallet::log_balance(
            rpc,
            contract.network,
            &smart_wallet,
            &signer,
            &asset,
            amount,
        )
        .await;

        let payload_bytes = resolve_payload(
            request.signature_payload.as_ref(),
            request.webauthn_signature.is_some(),
            &PaymentFields {
                source: &signer,
                destination: &destination,
                amount,
                asset: &asset,
                memo: None,
            },
        )?;

        let signature_raw = webauthn::normalize_signature(&decode_bytes(
            "webauthnSignature",
            &signature_b64,
        )?)
        .map_err(|e| ApiError::validation_all("Invalid WebAuthn signature", vec![e.to_string()]))?;
        let authenticator_data = match &request.webauthn_authenticator_data {
            Some(data) => decode_bytes("webauthnAuthenticatorData", data)?,
            None => Vec::new(),
        };
        let client_data = match &request.webauthn_client_data {
            Some(data) => decode_bytes("webauthnClientData", data)?,
            None => Vec::new(),
        };

        let payment = SmartWalletPayment {
            network: contract.network,
            smart_wallet,
            signer,
            destination,
            amount,
            asset,
            payload_bytes,
            signature_raw,
            authenticator_data,
            client_data,
        };
        let call = smart_wallet::build_execute_payment(&payment);

        // Simulation catches rejections before fees are spent.
        let simulated = rpc
            .simulate(&call)
            .await
            .map_err(|e| ApiError::Chain(e.to_string()))?;
        smart_wallet::interpret_return(&simulated)?;

        let signer_key = request
            .user_secret_key
            .as_ref()
            .map(|secret| SignerKey::new(secret.clone()));
        let hash = rpc
            .submit(&call, signer_key.as_ref())
            .await
            .map_err(|e| ApiError::Chain(e.to_string()))?;

        let (status, pending) = self.poll(rpc, &hash).await?;
        let executed_parameters: Vec<(String, Value)> = call
            .args
            .iter()
            .map(|(name, value)| (name.clone(), value.to_plain_json()))
            .collect();
        match status {
            TxStatus::Success { return_value } => {
                if let Some(value) = &return_value {
                    smart_wallet::interpret_return(value)?;
                }
                Ok(ExecutionOutcome {
                    success: true,
                    transaction_hash: Some(hash),
                    simulated_only: false,
                    routed_through_smart_wallet: true,
                    contract_return_value: return_value.map(|v| v.to_plain_json()),
                    pending_confirmation: false,
                    executed_parameters,
                })
            }
            TxStatus::Failed { reason } => Err(ApiError::ExecutionFailed(format!(
                "transaction {hash} failed: {}",
                reason.unwrap_or_else(|| "unknown".to_string())
            ))),
            TxStatus::Pending | TxStatus::NotFound if pending => Ok(ExecutionOutcome {
                success: true,
                transaction_hash: Some(hash),
                simulated_only: false,
                routed_through_smart_wallet: true,
                contract_return_value: None,
                pending_confirmation: true,
                executed_parameters,
            }),
            TxStatus::Pending | TxStatus::NotFound => Err(ApiError::Chain(format!(
                "transaction {hash} disappeared during confirmation"
            ))),
        }
    }

    fn build_call(
        &self,
        contract: &CustomContract,
        function: &str,
        canonical: &[(String, Value)],
    ) -> Result<ContractCall, ApiError> {
        let types: BTreeMap<String, String> = contract
            .mapping_or_derived(function)
            .map(|m| {
                m.parameters
                    .into_iter()
                    .map(|p| (p.name, p.param_type))
                    .collect()
            })
            .unwrap_or_default();

        let mut args = Vec::with_capacity(canonical.len());
        let mut violations = Vec::new();
        for (name, value) in canonical {
            let param_type = types.get(name).map(String::as_str).unwrap_or("string");
            match ScValue::coerce(param_type, value) {
                Ok(coerced) => args.push((name.clone(), coerced)),
                Err(e) => violations.push(format!("parameter {name}: {e}")),
            }
        }
        if !violations.is_empty() {
            return Err(ApiError::validation_all(
                format!("{} parameter encoding violation(s)", violations.len()),
                violations,
            ));
        }
        Ok(ContractCall {
            network: contract.network,
            contract: contract.address.clone(),
            function: function.to_string(),
            args,
        })
    }

    /// Polls the transaction until terminal or attempts exhaust. Returns the
    /// last status and whether the loop timed out while still pending.
    async fn poll(
        &self,
        rpc: &dyn SorobanRpc,
        hash: &TxHash,
    ) -> Result<(TxStatus, bool), ApiError> {
        let mut last = TxStatus::Pending;
        for attempt in 0..self.poll_attempts {
            last = rpc
                .transaction_status(hash)
                .await
                .map_err(|e| ApiError::Chain(e.to_string()))?;
            if matches!(last, TxStatus::Success { .. } | TxStatus::Failed { .. }) {
                return Ok((last, false));
            }
            if attempt + 1 < self.poll_attempts {
                tokio::time::sleep(self.poll_interval).await;
            }
        }
        tracing::warn!(hash = %hash, attempts = self.poll_attempts, "confirmation poll exhausted");
        Ok((last, true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_only_heuristic() {
        for name in [
            "get_balance",
            "is_signer_registered",
            "has_role",
            "check_quorum",
            "query_state",
            "view_config",
            "read_entry",
            "fetch_price",
        ] {
            assert!(is_read_only(name), "{name} should be read-only");
        }
        for name in ["transfer", "execute_payment", "register_signer", "getter"] {
            assert!(!is_read_only(name), "{name} should not be read-only");
        }
    }

    #[test]
    fn test_payment_detection_by_name() {
        for name in [
            "transfer",
            "execute_payment",
            "send_funds",
            "pay_out",
            "withdraw",
            "deposit",
        ] {
            assert!(is_payment_function(name, []), "{name}");
        }
        assert!(!is_payment_function("register_signer", []));
    }

    #[test]
    fn test_payment_detection_by_parameters() {
        assert!(is_payment_function("move_it", ["destination", "amount"]));
        assert!(is_payment_function("move_it", ["recipient", "value"]));
        // One of the pair alone is not enough.
        assert!(!is_payment_function("move_it", ["destination"]));
        assert!(!is_payment_function("move_it", ["amount"]));
    }

    #[test]
    fn test_smart_wallet_routing() {
        let mut contract = sample_contract();
        // Explicit payment source always routes.
        assert!(routes_through_smart_wallet(
            Some("smart-wallet"),
            &contract,
            "anything",
            []
        ));
        // Configured wallet + payment function routes.
        assert!(routes_through_smart_wallet(None, &contract, "transfer", []));
        // Non-payment function does not.
        assert!(!routes_through_smart_wallet(
            None,
            &contract,
            "register_signer",
            []
        ));
        // Without a wallet id, never.
        contract.smart_wallet_contract_id = None;
        assert!(!routes_through_smart_wallet(None, &contract, "transfer", []));
    }

    fn sample_contract() -> CustomContract {
        use chrono::Utc;
        CustomContract {
            id: 1,
            user_id: 1,
            address: StellarAddress::parse(&format!("C{}", "A".repeat(55))).unwrap(),
            network: crate::types::Network::Testnet,
            name: None,
            description: None,
            discovered_functions: Default::default(),
            function_mappings: Default::default(),
            use_smart_wallet: true,
            smart_wallet_contract_id: Some(
                StellarAddress::parse(&format!("C{}", "B".repeat(55))).unwrap(),
            ),
            payment_function_name: Some("execute_payment".to_string()),
            requires_webauthn: true,
            webauthn_verifier_contract_id: None,
            wasm_meta: None,
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }
}
