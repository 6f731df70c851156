//! Parameter canonicalization for outgoing contract calls.
//!
//! One pure function owns every coercion that used to be scattered across
//! call sites: placeholder destinations become the matched public key,
//! `XLM`/`native` assets become the network's SAC address, human amounts
//! become stroops, and missing auto-populated values are filled from context.
//! Violations are collected and reported together rather than one at a time.

use serde_json::Value;
use std::collections::BTreeMap;

use crate::contracts::{FunctionMapping, MappedFrom};
use crate::types::{Network, StellarAddress, StroopAmount};

/// Placeholder text shown for engine-filled WebAuthn parameters in pending
/// projections, and recognized (alongside empty values) when canonicalizing.
pub const SYSTEM_GENERATED: &str = "system-generated";

/// The four parameter names that carry WebAuthn material.
pub const WEBAUTHN_PARAMETERS: [&str; 4] = [
    "signature_payload",
    "webauthn_signature",
    "webauthn_authenticator_data",
    "webauthn_client_data",
];

/// Values the engine fills in when canonicalizing.
#[derive(Debug, Clone, Default)]
pub struct ParamContext {
    pub network: Option<Network>,
    pub user_public_key: Option<StellarAddress>,
    pub matched_public_key: Option<StellarAddress>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

fn is_placeholder(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => {
            let lower = s.trim().to_ascii_lowercase();
            lower.is_empty()
                || lower == "matched_public_key"
                || lower == SYSTEM_GENERATED
        }
        _ => false,
    }
}

fn is_native_asset_alias(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => {
            let lower = s.trim().to_ascii_lowercase();
            lower.is_empty() || lower == "xlm" || lower == "native"
        }
        _ => false,
    }
}

/// Canonicalizes caller parameters against a function mapping.
///
/// Output preserves the mapping's parameter order (the positional order of
/// the on-chain signature). On failure, returns every violation found.
pub fn canonicalize_parameters(
    mapping: &FunctionMapping,
    raw: &BTreeMap<String, Value>,
    ctx: &ParamContext,
) -> Result<Vec<(String, Value)>, Vec<String>> {
    let mut violations = Vec::new();
    let mut out = Vec::with_capacity(mapping.parameters.len());
    let known: Vec<&str> = mapping.parameters.iter().map(|p| p.name.as_str()).collect();

    for name in raw.keys() {
        if !known.contains(&name.as_str()) {
            violations.push(format!("unknown parameter: {name}"));
        }
    }

    for param in &mapping.parameters {
        let provided = raw.get(&param.name);
        let value = match param.mapped_from {
            MappedFrom::UserPublicKey => match provided.filter(|v| !is_placeholder(v)) {
                Some(value) => Some(value.clone()),
                None => ctx
                    .user_public_key
                    .as_ref()
                    .map(|pk| Value::String(pk.as_str().to_string())),
            },
            MappedFrom::MatchedPublicKey => match provided.filter(|v| !is_placeholder(v)) {
                Some(value) => Some(value.clone()),
                None => ctx
                    .matched_public_key
                    .as_ref()
                    .map(|pk| Value::String(pk.as_str().to_string())),
            },
            MappedFrom::NativeAsset => match provided.filter(|v| !is_native_asset_alias(v)) {
                Some(value) => Some(value.clone()),
                None => ctx
                    .network
                    .map(|network| Value::String(network.native_sac().as_str().to_string())),
            },
            MappedFrom::AmountStroops => match provided {
                Some(value) => match StroopAmount::canonicalize(value) {
                    Ok(amount) => Some(Value::String(amount.as_payload_string())),
                    Err(e) => {
                        violations.push(format!("parameter {}: {e}", param.name));
                        continue;
                    }
                },
                None => None,
            },
            MappedFrom::Latitude => match provided {
                Some(value) => Some(value.clone()),
                None => ctx.latitude.map(Value::from),
            },
            MappedFrom::Longitude => match provided {
                Some(value) => Some(value.clone()),
                None => ctx.longitude.map(Value::from),
            },
            MappedFrom::SystemGenerated => match provided.filter(|v| !is_placeholder(v)) {
                Some(value) => Some(value.clone()),
                None => Some(Value::String(SYSTEM_GENERATED.to_string())),
            },
            MappedFrom::Manual => provided.cloned(),
        };

        match value {
            Some(value) => out.push((param.name.clone(), value)),
            None => violations.push(format!("missing required parameter: {}", param.name)),
        }
    }

    if violations.is_empty() {
        Ok(out)
    } else {
        Err(violations)
    }
}

/// Applies the WebAuthn inclusion gate: keeps the four WebAuthn-named
/// parameters only when the contract carries WebAuthn or routes through the
/// smart wallet, and strips them otherwise.
pub fn apply_webauthn_gate(
    params: Vec<(String, Value)>,
    include_webauthn: bool,
) -> Vec<(String, Value)> {
    if include_webauthn {
        params
    } else {
        params
            .into_iter()
            .filter(|(name, _)| !WEBAUTHN_PARAMETERS.contains(&name.as_str()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::{derive_default_mapping, signature};
    use serde_json::json;

    fn pk(tail: char) -> StellarAddress {
        let body: String = std::iter::repeat_n(tail, 55).collect();
        StellarAddress::parse(&format!("G{body}")).unwrap()
    }

    fn transfer_mapping() -> FunctionMapping {
        derive_default_mapping(&signature(
            "transfer",
            &[
                ("signer_address", "Address"),
                ("destination", "Address"),
                ("amount", "I128"),
                ("asset", "Address"),
            ],
            Some("Bool"),
        ))
    }

    fn ctx() -> ParamContext {
        ParamContext {
            network: Some(Network::Testnet),
            user_public_key: Some(pk('A')),
            matched_public_key: Some(pk('B')),
            latitude: Some(34.0164),
            longitude: Some(-118.4951),
        }
    }

    fn get<'a>(params: &'a [(String, Value)], name: &str) -> &'a Value {
        &params.iter().find(|(n, _)| n == name).unwrap().1
    }

    #[test]
    fn test_placeholders_filled_from_context() {
        let raw: BTreeMap<String, Value> = [
            ("destination".to_string(), json!("")),
            ("amount".to_string(), json!(1)),
            ("asset".to_string(), json!("XLM")),
        ]
        .into();
        let params = canonicalize_parameters(&transfer_mapping(), &raw, &ctx()).unwrap();

        assert_eq!(get(&params, "signer_address"), &json!(pk('A').as_str()));
        assert_eq!(get(&params, "destination"), &json!(pk('B').as_str()));
        assert_eq!(get(&params, "amount"), &json!("10000000"));
        assert_eq!(
            get(&params, "asset"),
            &json!(Network::Testnet.native_sac().as_str())
        );
    }

    #[test]
    fn test_explicit_values_win_over_context() {
        let other = pk('Z');
        let raw: BTreeMap<String, Value> = [
            ("destination".to_string(), json!(other.as_str())),
            ("amount".to_string(), json!("25000000")),
            ("asset".to_string(), json!("CAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA")),
        ]
        .into();
        let params = canonicalize_parameters(&transfer_mapping(), &raw, &ctx()).unwrap();
        assert_eq!(get(&params, "destination"), &json!(other.as_str()));
        assert_eq!(get(&params, "amount"), &json!("25000000"));
        assert_eq!(
            get(&params, "asset"),
            &json!("CAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA")
        );
    }

    #[test]
    fn test_all_violations_reported_together() {
        let mapping = transfer_mapping();
        let raw: BTreeMap<String, Value> = [
            ("amount".to_string(), json!("-1")),
            ("bogus".to_string(), json!(1)),
        ]
        .into();
        let empty = ParamContext::default();
        let violations = canonicalize_parameters(&mapping, &raw, &empty).unwrap_err();
        // Unknown name, bad amount, missing signer, destination and asset.
        assert_eq!(violations.len(), 5, "{violations:?}");
        assert!(violations.iter().any(|v| v.contains("bogus")));
        assert!(violations.iter().any(|v| v.contains("amount")));
    }

    #[test]
    fn test_location_parameters_autofill() {
        let mapping = derive_default_mapping(&signature(
            "log_visit",
            &[("latitude", "I64"), ("longitude", "I64")],
            Some("Bool"),
        ));
        let params =
            canonicalize_parameters(&mapping, &BTreeMap::new(), &ctx()).unwrap();
        assert_eq!(get(&params, "latitude"), &json!(34.0164));
        assert_eq!(get(&params, "longitude"), &json!(-118.4951));
    }

    #[test]
    fn test_webauthn_gate_strips_when_not_required() {
        let params = vec![
            ("destination".to_string(), json!("G")),
            ("signature_payload".to_string(), json!("x")),
            ("webauthn_signature".to_string(), json!("y")),
            ("webauthn_authenticator_data".to_string(), json!("z")),
            ("webauthn_client_data".to_string(), json!("w")),
        ];
        let stripped = apply_webauthn_gate(params.clone(), false);
        assert_eq!(stripped.len(), 1);
        assert_eq!(stripped[0].0, "destination");

        let kept = apply_webauthn_gate(params, true);
        assert_eq!(kept.len(), 5);
    }

    #[test]
    fn test_webauthn_fields_default_to_system_generated() {
        let mapping = derive_default_mapping(&signature(
            "execute_payment",
            &[
                ("signer_address", "Address"),
                ("signature_payload", "Bytes"),
                ("webauthn_signature", "Bytes"),
            ],
            Some("Bool"),
        ));
        let params =
            canonicalize_parameters(&mapping, &BTreeMap::new(), &ctx()).unwrap();
        assert_eq!(get(&params, "signature_payload"), &json!(SYSTEM_GENERATED));
        assert_eq!(get(&params, "webauthn_signature"), &json!(SYSTEM_GENERATED));
    }
}
