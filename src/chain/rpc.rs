//! JSON-RPC client for a Soroban gateway.
//!
//! The gateway terminates XDR assembly and transaction signing transport;
//! this client exchanges host-function invocations in their JSON form. One
//! client instance exists per configured network.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::instrument;
use url::Url;

use super::{
    ChainError, ContractCall, FunctionSig, ScValue, SignerKey, SorobanRpc, TxStatus,
};
use crate::types::{Network, StellarAddress, TxHash};

const RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Production [`SorobanRpc`] implementation over HTTP.
#[derive(Debug, Clone)]
pub struct HttpSoroban {
    network: Network,
    endpoint: Url,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct JsonRpcEnvelope {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

impl HttpSoroban {
    pub fn new(network: Network, endpoint: Url) -> Self {
        let http = reqwest::Client::builder()
            .timeout(RPC_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        HttpSoroban {
            network,
            endpoint,
            http,
        }
    }

    #[instrument(skip_all, err, fields(network = %self.network, method = method))]
    async fn call_rpc(&self, method: &str, params: Value) -> Result<Value, ChainError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        let response = self
            .http
            .post(self.endpoint.clone())
            .json(&body)
            .send()
            .await?;
        let envelope: JsonRpcEnvelope = response.json().await?;
        if let Some(error) = envelope.error {
            return Err(ChainError::Rpc(format!(
                "{} (code {})",
                error.message, error.code
            )));
        }
        envelope
            .result
            .ok_or_else(|| ChainError::Decode("missing result in RPC response".to_string()))
    }

    fn call_params(call: &ContractCall) -> Value {
        let args: Vec<Value> = call
            .args
            .iter()
            .map(|(name, value)| {
                json!({
                    "name": name,
                    "value": serde_json::to_value(value).unwrap_or(Value::Null),
                })
            })
            .collect();
        json!({
            "contractId": call.contract.as_str(),
            "function": call.function,
            "args": args,
        })
    }
}

#[async_trait]
impl SorobanRpc for HttpSoroban {
    async fn contract_functions(
        &self,
        contract: &StellarAddress,
    ) -> Result<Vec<FunctionSig>, ChainError> {
        let result = self
            .call_rpc(
                "getContractSpec",
                json!({ "contractId": contract.as_str() }),
            )
            .await;
        let result = match result {
            Ok(value) => value,
            Err(ChainError::Rpc(message)) if message.contains("not found") => {
                return Err(ChainError::ContractNotFound(contract.clone()));
            }
            Err(other) => return Err(other),
        };
        let functions = result
            .get("functions")
            .cloned()
            .ok_or_else(|| ChainError::Decode("missing functions in contract spec".to_string()))?;
        serde_json::from_value(functions).map_err(|e| ChainError::Decode(e.to_string()))
    }

    async fn contract_wasm_hash(
        &self,
        contract: &StellarAddress,
    ) -> Result<Option<String>, ChainError> {
        let result = self
            .call_rpc(
                "getContractWasmHash",
                json!({ "contractId": contract.as_str() }),
            )
            .await?;
        Ok(result
            .get("wasmHash")
            .and_then(Value::as_str)
            .map(str::to_lowercase))
    }

    #[instrument(skip_all, err, fields(contract = %call.contract, function = %call.function))]
    async fn simulate(&self, call: &ContractCall) -> Result<ScValue, ChainError> {
        let result = self
            .call_rpc("simulateTransaction", Self::call_params(call))
            .await?;
        if let Some(error) = result.get("error").and_then(Value::as_str) {
            return Err(ChainError::Rpc(error.to_string()));
        }
        match result.get("returnValue") {
            None | Some(Value::Null) => Ok(ScValue::Void),
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| ChainError::Decode(e.to_string())),
        }
    }

    #[instrument(skip_all, err, fields(contract = %call.contract, function = %call.function))]
    async fn submit(
        &self,
        call: &ContractCall,
        signer: Option<&SignerKey>,
    ) -> Result<TxHash, ChainError> {
        let mut params = Self::call_params(call);
        if let (Value::Object(map), Some(signer)) = (&mut params, signer) {
            map.insert("signerSecret".to_string(), json!(signer.expose()));
        }
        let result = self.call_rpc("sendTransaction", params).await?;
        let hash = result
            .get("hash")
            .and_then(Value::as_str)
            .ok_or_else(|| ChainError::Decode("missing hash in sendTransaction".to_string()))?;
        TxHash::parse(hash).map_err(|e| ChainError::Decode(e.to_string()))
    }

    async fn transaction_status(&self, hash: &TxHash) -> Result<TxStatus, ChainError> {
        let result = self
            .call_rpc("getTransaction", json!({ "hash": hash.as_str() }))
            .await?;
        let status = result
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("NOT_FOUND");
        let status = match status {
            "SUCCESS" => {
                let return_value = match result.get("returnValue") {
                    None | Some(Value::Null) => None,
                    Some(value) => Some(
                        serde_json::from_value(value.clone())
                            .map_err(|e| ChainError::Decode(e.to_string()))?,
                    ),
                };
                TxStatus::Success { return_value }
            }
            "FAILED" => TxStatus::Failed {
                reason: result
                    .get("resultXdr")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            },
            "NOT_FOUND" => TxStatus::NotFound,
            _ => TxStatus::Pending,
        };
        Ok(status)
    }
}
