//! Contract registry: registered external contracts, their discovered
//! function signatures, and the parameter mappings that drive execution.
//!
//! `discovered_functions` is normalized to a name-keyed map on every write;
//! callers may submit either the map form or a plain signature array. The
//! parameter-source inference table lives here because it is applied at three
//! points with identical semantics: on discovery, on save when a mapping is
//! absent, and on execution as a fallback.

pub mod discovery;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::chain::{FunctionSig, ParameterSig};
use crate::types::{Network, StellarAddress};

/// Where a contract-call parameter's value comes from when the engine fills
/// it in automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappedFrom {
    /// The executing actor's own public key.
    UserPublicKey,
    /// The public key whose location update matched the rule.
    MatchedPublicKey,
    /// The native XLM Stellar Asset Contract address for the network.
    NativeAsset,
    /// A caller-provided amount, canonicalized to stroops.
    AmountStroops,
    /// The triggering location update's latitude.
    Latitude,
    /// The triggering location update's longitude.
    Longitude,
    /// Filled by the engine at execution time (WebAuthn material).
    SystemGenerated,
    /// Supplied verbatim by the caller.
    Manual,
}

/// A single parameter of a mapped function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappedParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: String,
    #[serde(rename = "mappedFrom")]
    pub mapped_from: MappedFrom,
}

/// How a discovered function is invoked: parameter sources plus execution
/// policy flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionMapping {
    pub parameters: Vec<MappedParameter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_type: Option<String>,
    #[serde(default)]
    pub auto_execute: bool,
    #[serde(default = "default_true")]
    pub requires_confirmation: bool,
}

fn default_true() -> bool {
    true
}

/// Metadata about an uploaded WASM blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WasmMeta {
    pub sha256: String,
    pub size_bytes: i64,
    pub uploaded_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<WasmVerification>,
}

/// Result of comparing the uploaded WASM hash against the chain. A mismatch
/// is reported, never enforced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WasmVerification {
    pub verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_hash: Option<String>,
}

/// A registered external contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomContract {
    pub id: i64,
    pub user_id: i64,
    pub address: StellarAddress,
    pub network: Network,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub discovered_functions: BTreeMap<String, FunctionSig>,
    #[serde(default)]
    pub function_mappings: BTreeMap<String, FunctionMapping>,
    #[serde(default)]
    pub use_smart_wallet: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smart_wallet_contract_id: Option<StellarAddress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_function_name: Option<String>,
    #[serde(default)]
    pub requires_webauthn: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webauthn_verifier_contract_id: Option<StellarAddress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wasm_meta: Option<WasmMeta>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CustomContract {
    /// The mapping for `function`, falling back to one derived on the spot
    /// from the discovered signature.
    pub fn mapping_or_derived(&self, function: &str) -> Option<FunctionMapping> {
        if let Some(mapping) = self.function_mappings.get(function) {
            return Some(mapping.clone());
        }
        self.discovered_functions
            .get(function)
            .map(derive_default_mapping)
    }

    /// Whether outgoing calls to this contract carry WebAuthn material.
    pub fn includes_webauthn_parameters(&self) -> bool {
        self.requires_webauthn || self.use_smart_wallet
    }
}

const DESTINATION_NAMES: [&str; 4] = ["destination", "recipient", "to", "to_address"];

fn is_address_type(param_type: &str) -> bool {
    param_type.eq_ignore_ascii_case("address")
}

fn is_numeric_type(param_type: &str) -> bool {
    matches!(
        param_type.to_ascii_lowercase().as_str(),
        "i128" | "u128" | "i64" | "u64" | "i32" | "u32" | "i256" | "u256"
    )
}

/// Infers the value source for one parameter from its name and type.
pub fn infer_mapped_from(name: &str, param_type: &str) -> MappedFrom {
    let lower = name.to_ascii_lowercase();
    if lower.starts_with("webauthn_") || lower == "signature_payload" {
        return MappedFrom::SystemGenerated;
    }
    if is_address_type(param_type) {
        if lower == "signer_address" {
            return MappedFrom::UserPublicKey;
        }
        if DESTINATION_NAMES.contains(&lower.as_str()) {
            return MappedFrom::MatchedPublicKey;
        }
        if lower == "asset" {
            return MappedFrom::NativeAsset;
        }
    }
    if is_numeric_type(param_type) {
        if lower == "amount" {
            return MappedFrom::AmountStroops;
        }
        if lower.contains("latitude") {
            return MappedFrom::Latitude;
        }
        if lower.contains("longitude") {
            return MappedFrom::Longitude;
        }
    }
    MappedFrom::Manual
}

/// Builds the default mapping for a discovered signature: inferred parameter
/// sources, manual confirmation required, no auto-execution.
pub fn derive_default_mapping(sig: &FunctionSig) -> FunctionMapping {
    FunctionMapping {
        parameters: sig
            .parameters
            .iter()
            .map(|p| MappedParameter {
                name: p.name.clone(),
                param_type: p.param_type.clone(),
                mapped_from: infer_mapped_from(&p.name, &p.param_type),
            })
            .collect(),
        return_type: sig.return_type.clone(),
        auto_execute: false,
        requires_confirmation: true,
    }
}

/// True when the derived mapping pulls any parameter from the triggering
/// location, which makes the function a candidate for a default rule.
pub fn mapping_uses_location(mapping: &FunctionMapping) -> bool {
    mapping
        .parameters
        .iter()
        .any(|p| matches!(p.mapped_from, MappedFrom::Latitude | MappedFrom::Longitude))
}

/// Normalizes caller-submitted function signatures into the canonical
/// name-keyed map. Accepts either the map form or a plain array.
pub fn normalize_functions(
    raw: &serde_json::Value,
) -> Result<BTreeMap<String, FunctionSig>, serde_json::Error> {
    match raw {
        serde_json::Value::Array(_) => {
            let list: Vec<FunctionSig> = serde_json::from_value(raw.clone())?;
            Ok(list.into_iter().map(|f| (f.name.clone(), f)).collect())
        }
        _ => {
            let map: BTreeMap<String, FunctionSig> = serde_json::from_value(raw.clone())?;
            // Re-key by the embedded name in case callers used stale keys.
            Ok(map.into_values().map(|f| (f.name.clone(), f)).collect())
        }
    }
}

/// Convenience constructor used by discovery and tests.
pub fn signature(name: &str, params: &[(&str, &str)], return_type: Option<&str>) -> FunctionSig {
    FunctionSig {
        name: name.to_string(),
        parameters: params
            .iter()
            .map(|(n, t)| ParameterSig {
                name: n.to_string(),
                param_type: t.to_string(),
            })
            .collect(),
        return_type: return_type.map(str::to_string),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_inference_table() {
        assert_eq!(
            infer_mapped_from("signer_address", "Address"),
            MappedFrom::UserPublicKey
        );
        for name in ["destination", "recipient", "to", "to_address"] {
            assert_eq!(
                infer_mapped_from(name, "Address"),
                MappedFrom::MatchedPublicKey
            );
        }
        assert_eq!(infer_mapped_from("asset", "Address"), MappedFrom::NativeAsset);
        assert_eq!(infer_mapped_from("amount", "I128"), MappedFrom::AmountStroops);
        assert_eq!(
            infer_mapped_from("target_latitude", "I64"),
            MappedFrom::Latitude
        );
        assert_eq!(
            infer_mapped_from("target_longitude", "I64"),
            MappedFrom::Longitude
        );
        assert_eq!(
            infer_mapped_from("webauthn_signature", "Bytes"),
            MappedFrom::SystemGenerated
        );
        assert_eq!(
            infer_mapped_from("signature_payload", "Bytes"),
            MappedFrom::SystemGenerated
        );
        // Name matches but type does not: stays manual.
        assert_eq!(infer_mapped_from("destination", "String"), MappedFrom::Manual);
        assert_eq!(infer_mapped_from("memo", "String"), MappedFrom::Manual);
    }

    #[test]
    fn test_default_mapping_is_conservative() {
        let sig = signature(
            "transfer",
            &[
                ("signer_address", "Address"),
                ("destination", "Address"),
                ("amount", "I128"),
            ],
            Some("Bool"),
        );
        let mapping = derive_default_mapping(&sig);
        assert!(!mapping.auto_execute);
        assert!(mapping.requires_confirmation);
        assert_eq!(mapping.parameters.len(), 3);
        assert_eq!(mapping.parameters[1].mapped_from, MappedFrom::MatchedPublicKey);
    }

    #[test]
    fn test_location_mapping_detection() {
        let located = derive_default_mapping(&signature(
            "checkpoint",
            &[("latitude", "I64"), ("longitude", "I64")],
            None,
        ));
        assert!(mapping_uses_location(&located));

        let plain = derive_default_mapping(&signature("ping", &[], Some("Bool")));
        assert!(!mapping_uses_location(&plain));
    }

    #[test]
    fn test_normalize_functions_from_array() {
        let raw = json!([
            {"name": "ping", "parameters": [], "returnType": "Bool"},
            {"name": "transfer", "parameters": [{"name": "amount", "type": "I128"}]},
        ]);
        let normalized = normalize_functions(&raw).unwrap();
        assert_eq!(normalized.len(), 2);
        assert!(normalized.contains_key("ping"));
        assert_eq!(normalized["transfer"].parameters[0].name, "amount");
    }

    #[test]
    fn test_normalize_functions_rekeys_map() {
        let raw = json!({
            "stale_key": {"name": "ping", "parameters": [], "returnType": "Bool"},
        });
        let normalized = normalize_functions(&raw).unwrap();
        assert!(normalized.contains_key("ping"));
        assert!(!normalized.contains_key("stale_key"));
    }
}
