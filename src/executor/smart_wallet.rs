//! Smart-wallet payment path.
//!
//! Payments routed through the smart wallet call a single on-chain method:
//! `execute_payment(signer, destination, amount, asset, signature_payload,
//! webauthn_signature, webauthn_authenticator_data, webauthn_client_data)`.
//! Before submission we verify the caller's passkey matches the one the
//! wallet stores for this signer — the wallet keeps one passkey per address,
//! so two users sharing a public key can clobber each other's registration —
//! and read the wallet balance for the log.

use tracing::instrument;

use super::webauthn::{check_passkey_consistency, extract_public_key_point};
use crate::chain::{ContractCall, ScValue, SorobanRpc};
use crate::error::ApiError;
use crate::types::{Network, StellarAddress, StroopAmount};

/// Everything needed to assemble an `execute_payment` call.
#[derive(Debug)]
pub struct SmartWalletPayment {
    pub network: Network,
    pub smart_wallet: StellarAddress,
    pub signer: StellarAddress,
    pub destination: StellarAddress,
    pub amount: StroopAmount,
    pub asset: StellarAddress,
    pub payload_bytes: Vec<u8>,
    pub signature_raw: [u8; 64],
    pub authenticator_data: Vec<u8>,
    pub client_data: Vec<u8>,
}

/// Candidate causes reported when the wallet returns `false`; the contract
/// does not say which one applied.
pub const REJECTION_CAUSES: [&str; 4] = [
    "insufficient balance",
    "invalid webauthn signature",
    "bad parameter",
    "other",
];

/// Simulates `get_passkey_pubkey(signer)` and compares the stored key with
/// the caller's SPKI-extracted point.
#[instrument(skip_all, err, fields(smart_wallet = %smart_wallet, signer = %signer))]
pub async fn preflight_passkey(
    rpc: &dyn SorobanRpc,
    network: Network,
    smart_wallet: &StellarAddress,
    signer: &StellarAddress,
    provided_spki: &[u8],
) -> Result<(), ApiError> {
    let provided_point = extract_public_key_point(provided_spki)
        .map_err(|e| ApiError::validation_all("Invalid passkey public key", vec![e.to_string()]))?;

    let call = ContractCall {
        network,
        contract: smart_wallet.clone(),
        function: "get_passkey_pubkey".to_string(),
        args: vec![(
            "signer_address".to_string(),
            ScValue::Address(signer.as_str().to_string()),
        )],
    };
    let result = rpc
        .simulate(&call)
        .await
        .map_err(|e| ApiError::Chain(e.to_string()))?;

    let registered = match result {
        ScValue::Bytes(bytes) => bytes,
        ScValue::Void => {
            return Err(ApiError::PasskeyMismatch {
                registered_prefix: "(none registered)".to_string(),
                provided_prefix: hex::encode(&provided_point[..8]),
            });
        }
        other => {
            return Err(ApiError::Chain(format!(
                "unexpected get_passkey_pubkey result: {other:?}"
            )));
        }
    };

    check_passkey_consistency(&registered, &provided_point).map_err(
        |(registered_prefix, provided_prefix)| ApiError::PasskeyMismatch {
            registered_prefix,
            provided_prefix,
        },
    )
}

/// Simulates `get_balance(signer, asset)` and logs sufficiency. Never blocks
/// the payment: the contract's own balance check is authoritative.
#[instrument(skip_all, fields(smart_wallet = %smart_wallet, signer = %signer))]
pub async fn log_balance(
    rpc: &dyn SorobanRpc,
    network: Network,
    smart_wallet: &StellarAddress,
    signer: &StellarAddress,
    asset: &StellarAddress,
    amount: StroopAmount,
) {
    let call = ContractCall {
        network,
        contract: smart_wallet.clone(),
        function: "get_balance".to_string(),
        args: vec![
            (
                "user_address".to_string(),
                ScValue::Address(signer.as_str().to_string()),
            ),
            (
                "asset".to_string(),
                ScValue::Address(asset.as_str().to_string()),
            ),
        ],
    };
    match rpc.simulate(&call).await {
        Ok(ScValue::I128(balance)) => {
            if balance < amount.0 {
                tracing::warn!(
                    balance = balance,
                    required = amount.0,
                    "smart wallet balance below payment amount"
                );
            } else {
                tracing::info!(balance = balance, required = amount.0, "balance sufficient");
            }
        }
        Ok(other) => tracing::warn!(result = ?other, "unexpected get_balance result"),
        Err(e) => tracing::warn!(error = %e, "balance preflight failed"),
    }
}

/// Assembles the `execute_payment` invocation in the wallet's parameter
/// order.
pub fn build_execute_payment(payment: &SmartWalletPayment) -> ContractCall {
    ContractCall {
        network: payment.network,
        contract: payment.smart_wallet.clone(),
        function: "execute_payment".to_string(),
        args: vec![
            (
                "signer_address".to_string(),
                ScValue::Address(payment.signer.as_str().to_string()),
            ),
            (
                "destination".to_string(),
                ScValue::Address(payment.destination.as_str().to_string()),
            ),
            ("amount".to_string(), ScValue::I128(payment.amount.0)),
            (
                "asset".to_string(),
                ScValue::Address(payment.asset.as_str().to_string()),
            ),
            (
                "signature_payload".to_string(),
                ScValue::Bytes(payment.payload_bytes.clone()),
            ),
            (
                "webauthn_signature".to_string(),
                ScValue::Bytes(payment.signature_raw.to_vec()),
            ),
            (
                "webauthn_authenticator_data".to_string(),
                ScValue::Bytes(payment.authenticator_data.clone()),
            ),
            (
                "webauthn_client_data".to_string(),
                ScValue::Bytes(payment.client_data.clone()),
            ),
        ],
    }
}

/// Maps a smart-wallet boolean return to the payment outcome: `false` is a
/// contract-level rejection, distinct from a chain error.
pub fn interpret_return(value: &ScValue) -> Result<(), ApiError> {
    if value.is_false() {
        Err(ApiError::PaymentRejected {
            causes: REJECTION_CAUSES.iter().map(|s| s.to_string()).collect(),
        })
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::mock::MockSoroban;

    fn addr(first: char) -> StellarAddress {
        let body: String = std::iter::repeat_n('A', 55).collect();
        StellarAddress::parse(&format!("{first}{body}")).unwrap()
    }

    fn point(seed: u8) -> [u8; 65] {
        let mut p = [seed; 65];
        p[0] = 0x04;
        p
    }

    fn payment() -> SmartWalletPayment {
        SmartWalletPayment {
            network: Network::Testnet,
            smart_wallet: addr('C'),
            signer: addr('G'),
            destination: addr('G'),
            amount: StroopAmount(10_000_000),
            asset: Network::Testnet.native_sac(),
            payload_bytes: b"{}".to_vec(),
            signature_raw: [1u8; 64],
            authenticator_data: vec![2u8; 37],
            client_data: b"{\"type\":\"webauthn.get\"}".to_vec(),
        }
    }

    #[test]
    fn test_execute_payment_parameter_order() {
        let call = build_execute_payment(&payment());
        let names: Vec<&str> = call.args.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "signer_address",
                "destination",
                "amount",
                "asset",
                "signature_payload",
                "webauthn_signature",
                "webauthn_authenticator_data",
                "webauthn_client_data",
            ]
        );
        assert_eq!(call.function, "execute_payment");
        match &call.args[2].1 {
            ScValue::I128(amount) => assert_eq!(*amount, 10_000_000),
            other => panic!("unexpected amount encoding: {other:?}"),
        }
    }

    #[test]
    fn test_false_return_is_payment_rejected() {
        let err = interpret_return(&ScValue::Bool(false)).unwrap_err();
        match err {
            ApiError::PaymentRejected { causes } => {
                assert_eq!(causes.len(), REJECTION_CAUSES.len());
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(interpret_return(&ScValue::Bool(true)).is_ok());
    }

    #[tokio::test]
    async fn test_preflight_accepts_matching_passkey() {
        let wallet = addr('C');
        let registered = point(7);
        let rpc = MockSoroban::new()
            .with_simulate("get_passkey_pubkey", ScValue::Bytes(registered.to_vec()));
        let result = preflight_passkey(
            &rpc,
            Network::Testnet,
            &wallet,
            &addr('G'),
            &registered,
        )
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_preflight_rejects_mismatched_passkey() {
        let wallet = addr('C');
        let rpc = MockSoroban::new()
            .with_simulate("get_passkey_pubkey", ScValue::Bytes(point(7).to_vec()));
        let err = preflight_passkey(
            &rpc,
            Network::Testnet,
            &wallet,
            &addr('G'),
            &point(9),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ApiError::PasskeyMismatch { .. }));
    }

    #[tokio::test]
    async fn test_preflight_flags_unregistered_signer() {
        let wallet = addr('C');
        let rpc = MockSoroban::new().with_simulate("get_passkey_pubkey", ScValue::Void);
        let err = preflight_passkey(
            &rpc,
            Network::Testnet,
            &wallet,
            &addr('G'),
            &point(7),
        )
        .await
        .unwrap_err();
        match err {
            ApiError::PasskeyMismatch {
                registered_prefix, ..
            } => assert_eq!(registered_prefix, "(none registered)"),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
