//! Canonical signature payloads for smart-wallet payments.
//!
//! The bytes a WebAuthn signature commits to must be a deterministic JSON
//! object with exactly the keys `source`, `destination`, `amount`, `asset`,
//! `memo`, `timestamp` — in that order, amount in stroops as a string, asset
//! as the SAC contract address. Building and normalizing that object is kept
//! separate from the should-include decision: a payload is never rebuilt once
//! a signature is attached to it, because new bytes would invalidate the
//! signature.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ApiError;
use crate::types::{StellarAddress, StroopAmount};

/// The canonical payment payload. Field order is the serialized key order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignaturePayload {
    pub source: String,
    pub destination: String,
    pub amount: String,
    pub asset: String,
    pub memo: String,
    pub timestamp: i64,
}

impl SignaturePayload {
    pub fn new(
        source: &StellarAddress,
        destination: &StellarAddress,
        amount: StroopAmount,
        asset: &StellarAddress,
        memo: Option<&str>,
        timestamp: i64,
    ) -> Self {
        SignaturePayload {
            source: source.as_str().to_string(),
            destination: destination.as_str().to_string(),
            amount: amount.as_payload_string(),
            asset: asset.as_str().to_string(),
            memo: memo.unwrap_or_default().to_string(),
            timestamp,
        }
    }

    /// Deterministic byte encoding fed to the contract and hashed by the
    /// authenticator.
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// A payload in the pre-canonical shape keyed by `function`/`contract_id`.
/// Recognized for compatibility; only ever passed through, never produced.
pub fn is_legacy_shape(value: &Value) -> bool {
    match value.as_object() {
        Some(object) => object.contains_key("function") && object.contains_key("contract_id"),
        None => false,
    }
}

/// Inputs for payload resolution, all already canonicalized.
#[derive(Debug, Clone)]
pub struct PaymentFields<'a> {
    pub source: &'a StellarAddress,
    pub destination: &'a StellarAddress,
    pub amount: StroopAmount,
    pub asset: &'a StellarAddress,
    pub memo: Option<&'a str>,
}

/// Resolves the signature payload bytes for a smart-wallet payment.
///
/// - A caller payload with a signature attached is passed through verbatim:
///   the signature commits to those exact bytes. The one exception is a
///   legacy-shaped payload — authenticators in this flow sign the canonical
///   shape, so a signature never commits to the legacy template and the
///   canonical bytes are reconstructed, keeping the template's `timestamp`.
/// - A caller payload without a signature is normalized into the canonical
///   shape, keeping the caller's `timestamp` when it has one.
/// - With no caller payload, the canonical shape is built from the payment
///   fields with the current time.
pub fn resolve_payload(
    caller_payload: Option<&Value>,
    signature_attached: bool,
    fields: &PaymentFields<'_>,
) -> Result<Vec<u8>, ApiError> {
    match caller_payload {
        Some(payload) if signature_attached && !is_legacy_shape(payload) => {
            // Bytes are frozen by the signature; serialize exactly what the
            // caller sent.
            serde_json::to_vec(payload)
                .map_err(|e| ApiError::validation_all("Unserializable payload", vec![e.to_string()]))
        }
        Some(payload) => {
            let timestamp = payload
                .get("timestamp")
                .and_then(Value::as_i64)
                .unwrap_or_else(|| Utc::now().timestamp());
            let canonical = SignaturePayload::new(
                fields.source,
                fields.destination,
                fields.amount,
                fields.asset,
                fields
                    .memo
                    .or_else(|| payload.get("memo").and_then(Value::as_str)),
                timestamp,
            );
            Ok(canonical.to_bytes())
        }
        None => {
            let canonical = SignaturePayload::new(
                fields.source,
                fields.destination,
                fields.amount,
                fields.asset,
                fields.memo,
                Utc::now().timestamp(),
            );
            Ok(canonical.to_bytes())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn addr(first: char) -> StellarAddress {
        let body: String = std::iter::repeat_n('A', 55).collect();
        StellarAddress::parse(&format!("{first}{body}")).unwrap()
    }

    fn fields<'a>(
        source: &'a StellarAddress,
        destination: &'a StellarAddress,
        asset: &'a StellarAddress,
    ) -> PaymentFields<'a> {
        PaymentFields {
            source,
            destination,
            amount: StroopAmount(10_000_000),
            asset,
            memo: None,
        }
    }

    #[test]
    fn test_canonical_key_order() {
        let source = addr('G');
        let destination = addr('G');
        let asset = addr('C');
        let payload = SignaturePayload::new(&source, &destination, StroopAmount(10_000_000), &asset, None, 1_700_000_000);
        let text = String::from_utf8(payload.to_bytes()).unwrap();

        let keys: Vec<&str> = ["source", "destination", "amount", "asset", "memo", "timestamp"]
            .into_iter()
            .collect();
        let mut last = 0;
        for key in &keys {
            let pos = text.find(&format!("\"{key}\"")).expect("key present");
            assert!(pos >= last, "key {key} out of order in {text}");
            last = pos;
        }
        let parsed: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.as_object().unwrap().len(), keys.len());
        assert_eq!(parsed["amount"], json!("10000000"));
    }

    #[test]
    fn test_signed_payload_passes_through_verbatim() {
        let source = addr('G');
        let destination = addr('G');
        let asset = addr('C');
        let caller = json!({
            "source": source.as_str(),
            "destination": destination.as_str(),
            "amount": "99999999",
            "asset": asset.as_str(),
            "memo": "lunch",
            "timestamp": 1_699_999_999,
        });
        let bytes =
            resolve_payload(Some(&caller), true, &fields(&source, &destination, &asset)).unwrap();
        let back: Value = serde_json::from_slice(&bytes).unwrap();
        // Even fields that disagree with the canonicalized parameters stay
        // untouched; the signature commits to these exact bytes.
        assert_eq!(back, caller);
        assert_eq!(back["amount"], json!("99999999"));
    }

    #[test]
    fn test_signed_legacy_payload_is_rebuilt_canonical() {
        let source = addr('G');
        let destination = addr('G');
        let asset = addr('C');
        let caller = json!({
            "function": "execute_payment",
            "contract_id": asset.as_str(),
            "timestamp": 1_699_999_999,
        });
        // The signature was produced over the canonical shape, never the
        // legacy template, so the canonical bytes are reconstructed.
        let bytes =
            resolve_payload(Some(&caller), true, &fields(&source, &destination, &asset)).unwrap();
        let back: Value = serde_json::from_slice(&bytes).unwrap();
        assert!(back.get("function").is_none());
        assert_eq!(back.as_object().unwrap().len(), 6);
        assert_eq!(back["timestamp"], json!(1_699_999_999));
        assert_eq!(back["amount"], json!("10000000"));
    }

    #[test]
    fn test_unsigned_payload_is_normalized_keeping_timestamp() {
        let source = addr('G');
        let destination = addr('G');
        let asset = addr('C');
        let caller = json!({
            "function": "execute_payment",
            "contract_id": asset.as_str(),
            "timestamp": 1_699_999_999,
        });
        let bytes =
            resolve_payload(Some(&caller), false, &fields(&source, &destination, &asset)).unwrap();
        let back: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back["timestamp"], json!(1_699_999_999));
        assert_eq!(back["amount"], json!("10000000"));
        assert!(back.get("function").is_none());
        assert_eq!(back.as_object().unwrap().len(), 6);
    }

    #[test]
    fn test_legacy_shape_detection() {
        assert!(is_legacy_shape(&json!({"function": "f", "contract_id": "c"})));
        assert!(!is_legacy_shape(&json!({"source": "s", "destination": "d"})));
        assert!(!is_legacy_shape(&json!("text")));
    }

    #[test]
    fn test_built_payload_uses_current_time() {
        let source = addr('G');
        let destination = addr('G');
        let asset = addr('C');
        let before = Utc::now().timestamp();
        let bytes = resolve_payload(None, false, &fields(&source, &destination, &asset)).unwrap();
        let after = Utc::now().timestamp();
        let back: Value = serde_json::from_slice(&bytes).unwrap();
        let ts = back["timestamp"].as_i64().unwrap();
        assert!((before..=after).contains(&ts));
    }
}
