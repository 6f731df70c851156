//! Contract discovery: verify a contract exists on the requested network and
//! derive its default function mappings and rule proposals.

use serde::Serialize;
use std::collections::BTreeMap;
use tracing::instrument;

use super::{FunctionMapping, derive_default_mapping, mapping_uses_location};
use crate::chain::{ChainError, ChainRegistry, FunctionSig};
use crate::error::ApiError;
use crate::types::{Network, StellarAddress};

/// A suggested, inactive location rule for a function whose mapping consumes
/// the triggering coordinates.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DefaultRuleProposal {
    pub rule_name: String,
    pub rule_type: &'static str,
    pub function_name: String,
    pub trigger_on: &'static str,
    pub radius_meters: f64,
    pub auto_execute: bool,
    pub requires_confirmation: bool,
    pub is_active: bool,
}

/// Result of a successful discovery.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryResult {
    pub address: StellarAddress,
    pub network: Network,
    pub functions: BTreeMap<String, FunctionSig>,
    pub default_function_mappings: BTreeMap<String, FunctionMapping>,
    pub default_rules: Vec<DefaultRuleProposal>,
}

/// Verifies the contract on-chain and derives defaults from its interface.
#[instrument(skip(chains), err, fields(address = %address, network = %network))]
pub async fn discover(
    chains: &ChainRegistry,
    address: &str,
    network: Network,
) -> Result<DiscoveryResult, ApiError> {
    let address = StellarAddress::parse(address)
        .map_err(|e| ApiError::validation_all("Invalid contract address", vec![e.to_string()]))?;
    // Right shape but an undecodable strkey cannot exist on any network.
    if address.decode_strkey().is_err() {
        return Err(ApiError::not_found(format!("contract {address}")));
    }
    let rpc = chains
        .by_network(network)
        .ok_or_else(|| ApiError::Chain(format!("no RPC configured for {network}")))?;

    let signatures = match rpc.contract_functions(&address).await {
        Ok(signatures) => signatures,
        Err(ChainError::ContractNotFound(_)) => {
            return Err(ApiError::not_found(format!(
                "contract {address} on {network}"
            )));
        }
        Err(other) => return Err(ApiError::Chain(other.to_string())),
    };

    let functions: BTreeMap<String, FunctionSig> = signatures
        .into_iter()
        .map(|sig| (sig.name.clone(), sig))
        .collect();
    let default_function_mappings: BTreeMap<String, FunctionMapping> = functions
        .iter()
        .map(|(name, sig)| (name.clone(), derive_default_mapping(sig)))
        .collect();
    let default_rules = default_function_mappings
        .iter()
        .filter(|(_, mapping)| mapping_uses_location(mapping))
        .map(|(name, _)| DefaultRuleProposal {
            rule_name: format!("{name} at location"),
            rule_type: "location",
            function_name: name.clone(),
            trigger_on: "enter",
            radius_meters: 100.0,
            auto_execute: false,
            requires_confirmation: true,
            is_active: false,
        })
        .collect();

    Ok(DiscoveryResult {
        address,
        network,
        functions,
        default_function_mappings,
        default_rules,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::mock::MockSoroban;
    use crate::contracts::signature;
    use std::sync::Arc;

    fn test_address() -> StellarAddress {
        StellarAddress::parse("CDLZFC3SYJYDZT7K67VZ75HPJVIEUVNIXF47ZG2FB2RMQQVU2HHGCYSC").unwrap()
    }

    #[tokio::test]
    async fn test_discover_derives_mappings_and_rules() {
        let address = test_address();
        let mock = MockSoroban::new().with_functions(
            &address,
            vec![
                signature("ping", &[], Some("Bool")),
                signature(
                    "log_visit",
                    &[("latitude", "I64"), ("longitude", "I64")],
                    Some("Bool"),
                ),
            ],
        );
        let chains = ChainRegistry::single(Network::Testnet, Arc::new(mock));

        let result = discover(&chains, address.as_str(), Network::Testnet)
            .await
            .unwrap();
        assert_eq!(result.functions.len(), 2);
        assert!(!result.default_function_mappings["ping"].auto_execute);

        // Only the location-consuming function gets a proposed rule, and the
        // proposal starts inactive.
        assert_eq!(result.default_rules.len(), 1);
        let proposal = &result.default_rules[0];
        assert_eq!(proposal.function_name, "log_visit");
        assert!(!proposal.is_active);
    }

    #[tokio::test]
    async fn test_discover_absent_contract_is_not_found() {
        let chains =
            ChainRegistry::single(Network::Testnet, Arc::new(MockSoroban::new()));
        let err = discover(&chains, test_address().as_str(), Network::Testnet)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_discover_rejects_malformed_address() {
        let chains =
            ChainRegistry::single(Network::Testnet, Arc::new(MockSoroban::new()));
        let err = discover(&chains, "not-an-address", Network::Testnet)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Validation { .. }));
    }
}
