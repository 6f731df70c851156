//! Chain access layer.
//!
//! The engine talks to Soroban through the [`SorobanRpc`] trait: simulate a
//! host-function invocation, submit it signed, and poll its status. The
//! production implementation ([`rpc::HttpSoroban`]) speaks JSON-RPC to a
//! Soroban gateway; tests substitute [`mock::MockSoroban`]. Everything above
//! this module is chain-agnostic over the trait.

pub mod rpc;

#[cfg(test)]
pub mod mock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::config::Config;
use crate::types::{Network, StellarAddress, TxHash};

/// A Soroban host value, JSON-encoded in its externally-tagged form
/// (`{"bool": true}`, `{"i128": "123"}`, `{"address": "C…"}`, …).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScValue {
    Void,
    Bool(bool),
    U32(u32),
    I32(i32),
    U64(u64),
    I64(i64),
    I128(#[serde(with = "i128_string")] i128),
    Bytes(#[serde(with = "hex_bytes")] Vec<u8>),
    Address(String),
    Symbol(String),
    String(String),
    Vec(Vec<ScValue>),
    Map(Vec<(ScValue, ScValue)>),
}

mod i128_string {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(value: &i128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i128, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse::<i128>().map_err(Error::custom)
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(Error::custom)
    }
}

impl ScValue {
    /// True when this is the boolean `false` — the convention Soroban
    /// contracts in this ecosystem use to report a domain-level rejection.
    pub fn is_false(&self) -> bool {
        matches!(self, ScValue::Bool(false))
    }

    /// Coerces a caller-supplied JSON value into the host type named by a
    /// discovered parameter signature. Byte parameters accept base64 (the
    /// WebAuthn wire form) with a hex fallback.
    pub fn coerce(param_type: &str, raw: &serde_json::Value) -> Result<ScValue, ChainError> {
        use base64::Engine;
        let type_lower = param_type.to_ascii_lowercase();
        let value = match type_lower.as_str() {
            "address" => {
                let s = raw
                    .as_str()
                    .ok_or_else(|| ChainError::Decode(format!("address must be a string: {raw}")))?;
                ScValue::Address(s.to_string())
            }
            "i128" | "i256" => {
                let v = match raw {
                    serde_json::Value::Number(n) => n.to_string(),
                    serde_json::Value::String(s) => s.clone(),
                    other => return Err(ChainError::Decode(format!("bad i128 value: {other}"))),
                };
                ScValue::I128(
                    v.parse::<i128>()
                        .map_err(|_| ChainError::Decode(format!("bad i128 value: {v}")))?,
                )
            }
            "u32" => ScValue::U32(
                raw.as_u64()
                    .and_then(|v| u32::try_from(v).ok())
                    .ok_or_else(|| ChainError::Decode(format!("bad u32 value: {raw}")))?,
            ),
            "i32" => ScValue::I32(
                raw.as_i64()
                    .and_then(|v| i32::try_from(v).ok())
                    .ok_or_else(|| ChainError::Decode(format!("bad i32 value: {raw}")))?,
            ),
            "u64" => ScValue::U64(
                raw.as_u64()
                    .ok_or_else(|| ChainError::Decode(format!("bad u64 value: {raw}")))?,
            ),
            "i64" => ScValue::I64(
                raw.as_i64()
                    .ok_or_else(|| ChainError::Decode(format!("bad i64 value: {raw}")))?,
            ),
            "bool" => ScValue::Bool(
                raw.as_bool()
                    .ok_or_else(|| ChainError::Decode(format!("bad bool value: {raw}")))?,
            ),
            "bytes" | "bytesn" => {
                let s = raw
                    .as_str()
                    .ok_or_else(|| ChainError::Decode(format!("bytes must be a string: {raw}")))?;
                let decoded = base64::engine::general_purpose::STANDARD
                    .decode(s)
                    .or_else(|_| base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(s))
                    .or_else(|_| hex::decode(s).map_err(|_| base64::DecodeError::InvalidPadding))
                    .map_err(|_| {
                        ChainError::Decode("bytes value is neither base64 nor hex".to_string())
                    })?;
                ScValue::Bytes(decoded)
            }
            "symbol" => ScValue::Symbol(
                raw.as_str()
                    .ok_or_else(|| ChainError::Decode(format!("symbol must be a string: {raw}")))?
                    .to_string(),
            ),
            "string" => ScValue::String(
                raw.as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| raw.to_string()),
            ),
            _ => {
                // Numeric-looking inputs fall back to i128, everything else
                // to a string value.
                match raw {
                    serde_json::Value::Number(n) => ScValue::I128(
                        n.to_string()
                            .parse::<i128>()
                            .map_err(|_| ChainError::Decode(format!("bad numeric value: {n}")))?,
                    ),
                    serde_json::Value::Bool(b) => ScValue::Bool(*b),
                    serde_json::Value::String(s) => ScValue::String(s.clone()),
                    other => return Err(ChainError::Decode(format!("unsupported value: {other}"))),
                }
            }
        };
        Ok(value)
    }

    /// Renders the value back to plain JSON for API responses.
    pub fn to_plain_json(&self) -> serde_json::Value {
        use serde_json::json;
        match self {
            ScValue::Void => serde_json::Value::Null,
            ScValue::Bool(b) => json!(b),
            ScValue::U32(v) => json!(v),
            ScValue::I32(v) => json!(v),
            ScValue::U64(v) => json!(v),
            ScValue::I64(v) => json!(v),
            ScValue::I128(v) => json!(v.to_string()),
            ScValue::Bytes(b) => json!(hex::encode(b)),
            ScValue::Address(a) => json!(a),
            ScValue::Symbol(s) => json!(s),
            ScValue::String(s) => json!(s),
            ScValue::Vec(items) => {
                serde_json::Value::Array(items.iter().map(ScValue::to_plain_json).collect())
            }
            ScValue::Map(entries) => {
                let mut map = serde_json::Map::new();
                for (k, v) in entries {
                    let key = match k {
                        ScValue::Symbol(s) | ScValue::String(s) => s.clone(),
                        other => other.to_plain_json().to_string(),
                    };
                    map.insert(key, v.to_plain_json());
                }
                serde_json::Value::Object(map)
            }
        }
    }
}

/// A discovered public function signature of a contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionSig {
    pub name: String,
    #[serde(default)]
    pub parameters: Vec<ParameterSig>,
    #[serde(default, rename = "returnType")]
    pub return_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSig {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: String,
}

/// A fully-assembled host function invocation: contract, function, and
/// positionally-ordered named arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct ContractCall {
    pub network: Network,
    pub contract: StellarAddress,
    pub function: String,
    pub args: Vec<(String, ScValue)>,
}

impl ContractCall {
    pub fn arg_values(&self) -> Vec<&ScValue> {
        self.args.iter().map(|(_, v)| v).collect()
    }
}

/// Raw ed25519 signing secret (`S…` strkey). Debug output is redacted so the
/// secret cannot leak through instrumented spans.
#[derive(Clone)]
pub struct SignerKey(String);

impl SignerKey {
    pub fn new(secret: String) -> Self {
        SignerKey(secret)
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SignerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SignerKey(<redacted>)")
    }
}

/// Status of a submitted transaction, as reported by the RPC.
#[derive(Debug, Clone, PartialEq)]
pub enum TxStatus {
    NotFound,
    Pending,
    Success { return_value: Option<ScValue> },
    Failed { reason: Option<String> },
}

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    /// The RPC answered with an error object.
    #[error("RPC error: {0}")]
    Rpc(String),
    /// The contract does not exist on the queried network.
    #[error("Contract {0} not found on chain")]
    ContractNotFound(StellarAddress),
    /// Transport-level failure reaching the RPC.
    #[error("RPC transport error: {0}")]
    Transport(#[from] reqwest::Error),
    /// The RPC answered with a payload we could not interpret.
    #[error("Failed to decode RPC response: {0}")]
    Decode(String),
}

/// The engine's view of a Soroban RPC endpoint.
#[async_trait]
pub trait SorobanRpc: Send + Sync {
    /// Lists the public function signatures of a deployed contract.
    /// Fails with [`ChainError::ContractNotFound`] when the contract is
    /// absent on this network.
    async fn contract_functions(
        &self,
        contract: &StellarAddress,
    ) -> Result<Vec<FunctionSig>, ChainError>;

    /// SHA-256 of the contract's installed WASM, hex-encoded, if resolvable.
    async fn contract_wasm_hash(
        &self,
        contract: &StellarAddress,
    ) -> Result<Option<String>, ChainError>;

    /// Simulates the call without submitting; returns the decoded result.
    async fn simulate(&self, call: &ContractCall) -> Result<ScValue, ChainError>;

    /// Signs and submits the call; returns the transaction hash immediately,
    /// before confirmation. Without a signer the gateway's fee account signs;
    /// authorization then rests entirely on in-call credentials (the
    /// WebAuthn bundle on smart-wallet payments).
    async fn submit(
        &self,
        call: &ContractCall,
        signer: Option<&SignerKey>,
    ) -> Result<TxHash, ChainError>;

    /// Looks up the current status of a submitted transaction.
    async fn transaction_status(&self, hash: &TxHash) -> Result<TxStatus, ChainError>;
}

/// Per-network registry of RPC clients, built once at startup.
#[derive(Clone)]
pub struct ChainRegistry {
    clients: HashMap<Network, Arc<dyn SorobanRpc>>,
}

impl ChainRegistry {
    pub fn from_config(config: &Config) -> Self {
        let mut clients: HashMap<Network, Arc<dyn SorobanRpc>> = HashMap::new();
        for network in [Network::Testnet, Network::Mainnet] {
            let client = rpc::HttpSoroban::new(network, config.rpc_url(network).clone());
            clients.insert(network, Arc::new(client));
        }
        ChainRegistry { clients }
    }

    #[cfg(test)]
    pub fn single(network: Network, client: Arc<dyn SorobanRpc>) -> Self {
        let mut clients: HashMap<Network, Arc<dyn SorobanRpc>> = HashMap::new();
        clients.insert(network, client);
        ChainRegistry { clients }
    }

    pub fn by_network(&self, network: Network) -> Option<Arc<dyn SorobanRpc>> {
        self.clients.get(&network).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scvalue_json_round_trip() {
        let value = ScValue::Map(vec![
            (ScValue::Symbol("amount".into()), ScValue::I128(10_000_000)),
            (ScValue::Symbol("ok".into()), ScValue::Bool(true)),
        ]);
        let encoded = serde_json::to_string(&value).unwrap();
        let decoded: ScValue = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value, decoded);
    }

    #[test]
    fn test_i128_serializes_as_string() {
        let encoded = serde_json::to_value(ScValue::I128(10_000_000)).unwrap();
        assert_eq!(encoded, json!({"i128": "10000000"}));
    }

    #[test]
    fn test_coerce_address_and_amount() {
        let addr = ScValue::coerce("Address", &json!("GAAA")).unwrap();
        assert_eq!(addr, ScValue::Address("GAAA".into()));

        let amount = ScValue::coerce("I128", &json!("10000000")).unwrap();
        assert_eq!(amount, ScValue::I128(10_000_000));

        assert!(ScValue::coerce("I128", &json!(true)).is_err());
    }

    #[test]
    fn test_coerce_bytes_accepts_base64_and_hex() {
        let b64 = ScValue::coerce("Bytes", &json!("aGVsbG8=")).unwrap();
        assert_eq!(b64, ScValue::Bytes(b"hello".to_vec()));

        let hexed = ScValue::coerce("Bytes", &json!("68656c6c6f")).unwrap();
        assert_eq!(hexed, ScValue::Bytes(b"hello".to_vec()));
    }

    #[test]
    fn test_false_detection() {
        assert!(ScValue::Bool(false).is_false());
        assert!(!ScValue::Bool(true).is_false());
        assert!(!ScValue::Void.is_false());
    }
}
