//! Scriptable [`SorobanRpc`] double for unit tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use super::{
    ChainError, ContractCall, FunctionSig, ScValue, SignerKey, SorobanRpc, TxStatus,
};
use crate::types::{StellarAddress, TxHash};

/// In-memory chain: function specs per contract, scripted simulate results
/// per `function` name, and a record of every submitted call.
#[derive(Default)]
pub struct MockSoroban {
    pub functions: Mutex<HashMap<String, Vec<FunctionSig>>>,
    pub simulate_results: Mutex<HashMap<String, ScValue>>,
    pub submit_results: Mutex<HashMap<String, TxHash>>,
    pub statuses: Mutex<HashMap<String, TxStatus>>,
    pub submitted: Mutex<Vec<ContractCall>>,
    pub simulated: Mutex<Vec<ContractCall>>,
}

impl MockSoroban {
    pub fn new() -> Self {
        MockSoroban::default()
    }

    pub fn with_functions(self, contract: &StellarAddress, sigs: Vec<FunctionSig>) -> Self {
        self.functions
            .lock()
            .unwrap()
            .insert(contract.as_str().to_string(), sigs);
        self
    }

    pub fn with_simulate(self, function: &str, result: ScValue) -> Self {
        self.simulate_results
            .lock()
            .unwrap()
            .insert(function.to_string(), result);
        self
    }

    pub fn with_submit(self, function: &str, hash: TxHash) -> Self {
        self.submit_results
            .lock()
            .unwrap()
            .insert(function.to_string(), hash);
        self
    }

    pub fn with_status(self, hash: &TxHash, status: TxStatus) -> Self {
        self.statuses
            .lock()
            .unwrap()
            .insert(hash.as_str().to_string(), status);
        self
    }

    pub fn submitted_calls(&self) -> Vec<ContractCall> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn simulated_calls(&self) -> Vec<ContractCall> {
        self.simulated.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Network;

    #[tokio::test]
    async fn test_scripted_submit_and_status() {
        let contract =
            StellarAddress::parse(&format!("C{}", "A".repeat(55))).unwrap();
        let hash = TxHash::parse(&"ab".repeat(32)).unwrap();
        let mock = MockSoroban::new()
            .with_submit("ping", hash.clone())
            .with_status(
                &hash,
                TxStatus::Success {
                    return_value: Some(ScValue::Bool(true)),
                },
            );
        let call = ContractCall {
            network: Network::Testnet,
            contract,
            function: "ping".to_string(),
            args: vec![],
        };
        let submitted = mock.submit(&call, None).await.unwrap();
        assert_eq!(submitted, hash);
        assert_eq!(mock.submitted_calls().len(), 1);
        assert!(mock.simulated_calls().is_empty());
        match mock.transaction_status(&hash).await.unwrap() {
            TxStatus::Success { return_value } => {
                assert_eq!(return_value, Some(ScValue::Bool(true)));
            }
            other => panic!("unexpected status: {other:?}"),
        }
    }
}

#[async_trait]
impl SorobanRpc for MockSoroban {
    async fn contract_functions(
        &self,
        contract: &StellarAddress,
    ) -> Result<Vec<FunctionSig>, ChainError> {
        self.functions
            .lock()
            .unwrap()
            .get(contract.as_str())
            .cloned()
            .ok_or_else(|| ChainError::ContractNotFound(contract.clone()))
    }

    async fn contract_wasm_hash(
        &self,
        _contract: &StellarAddress,
    ) -> Result<Option<String>, ChainError> {
        Ok(None)
    }

    async fn simulate(&self, call: &ContractCall) -> Result<ScValue, ChainError> {
        self.simulated.lock().unwrap().push(call.clone());
        self.simulate_results
            .lock()
            .unwrap()
            .get(&call.function)
            .cloned()
            .ok_or_else(|| ChainError::Rpc(format!("no scripted simulation for {}", call.function)))
    }

    async fn submit(
        &self,
        call: &ContractCall,
        _signer: Option<&SignerKey>,
    ) -> Result<TxHash, ChainError> {
        self.submitted.lock().unwrap().push(call.clone());
        self.submit_results
            .lock()
            .unwrap()
            .get(&call.function)
            .cloned()
            .ok_or_else(|| ChainError::Rpc(format!("no scripted submission for {}", call.function)))
    }

    async fn transaction_status(&self, hash: &TxHash) -> Result<TxStatus, ChainError> {
        Ok(self
            .statuses
            .lock()
            .unwrap()
            .get(hash.as_str())
            .cloned()
            .unwrap_or(TxStatus::NotFound))
    }
}
