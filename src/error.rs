//! Error taxonomy exposed over HTTP.
//!
//! Every handler funnels failures into [`ApiError`], which renders the wire
//! shape `{error, message, details?, suggestions?}`. Chain-level failures are
//! kept distinct from contract-level rejections: a transaction that landed
//! on-chain and returned `false` is not an RPC error, and an exhausted
//! confirmation poll is not a failure at all.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::json;

use crate::types::TxHash;

/// Application-level error, one variant per taxonomy entry.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Bad input shape, missing required parameter, or inconsistent quorum
    /// configuration. `violations` carries every problem found, not just the
    /// first.
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        violations: Vec<String>,
    },
    /// Contract or rule absent, soft-deleted, or not owned by the caller.
    #[error("{0} not found")]
    NotFound(String),
    /// Neither a JWT bearer token nor an API key resolved to a user.
    #[error("Authentication required")]
    AuthRequired,
    /// A rule's wallet quorum is not currently satisfied.
    #[error("Quorum not met: {count_in_range} of {minimum_required} required wallets in range")]
    QuorumUnmet {
        wallets_in_range: Vec<String>,
        wallets_out_of_range: Vec<String>,
        count_in_range: i64,
        minimum_required: i64,
    },
    /// Per-public-key execution cap reached inside the rule's time window.
    #[error("Rate limit reached: {current_count} executions in the last {window_seconds}s")]
    RateLimited {
        window_seconds: i64,
        current_count: i64,
        max_executions: i64,
    },
    /// The caller's passkey does not match the one registered on-chain for
    /// this signer address.
    #[error("Passkey mismatch for signer: registered {registered_prefix}…, provided {provided_prefix}…")]
    PasskeyMismatch {
        registered_prefix: String,
        provided_prefix: String,
    },
    /// The smart-wallet contract returned `false` from `execute_payment`.
    #[error("Smart wallet rejected the payment")]
    PaymentRejected { causes: Vec<String> },
    /// The chain reported `FAILED`, or a direct contract call returned
    /// boolean `false`.
    #[error("Contract execution failed: {0}")]
    ExecutionFailed(String),
    /// Submitted but the confirmation poll exhausted its attempts. The hash
    /// is surfaced so callers can reconcile later.
    #[error("Transaction submitted, confirmation pending: {hash}")]
    PendingConfirmation { hash: TxHash },
    /// RPC or network failure below the contract layer.
    #[error("Chain RPC error: {0}")]
    Chain(String),
    /// Anything else. The source is logged, never sent to clients.
    #[error("Internal error")]
    Internal(String),
}

impl ApiError {
    pub fn validation<M: Into<String>>(message: M) -> Self {
        ApiError::Validation {
            message: message.into(),
            violations: Vec::new(),
        }
    }

    pub fn validation_all<M: Into<String>>(message: M, violations: Vec<String>) -> Self {
        ApiError::Validation {
            message: message.into(),
            violations,
        }
    }

    pub fn not_found<M: Into<String>>(what: M) -> Self {
        ApiError::NotFound(what.into())
    }

    pub fn internal<E: std::fmt::Display>(source: E) -> Self {
        ApiError::Internal(source.to_string())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation { .. } => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::AuthRequired => StatusCode::UNAUTHORIZED,
            ApiError::QuorumUnmet { .. } => StatusCode::FORBIDDEN,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::PasskeyMismatch { .. } => StatusCode::CONFLICT,
            ApiError::PaymentRejected { .. } => StatusCode::PAYMENT_REQUIRED,
            ApiError::ExecutionFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::PendingConfirmation { .. } => StatusCode::ACCEPTED,
            ApiError::Chain(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            ApiError::Validation { .. } => "ValidationError",
            ApiError::NotFound(_) => "NotFound",
            ApiError::AuthRequired => "AuthRequired",
            ApiError::QuorumUnmet { .. } => "QuorumUnmet",
            ApiError::RateLimited { .. } => "RateLimited",
            ApiError::PasskeyMismatch { .. } => "PasskeyMismatch",
            ApiError::PaymentRejected { .. } => "PaymentRejected",
            ApiError::ExecutionFailed(_) => "ExecutionFailed",
            ApiError::PendingConfirmation { .. } => "PendingConfirmation",
            ApiError::Chain(_) => "ChainError",
            ApiError::Internal(_) => "Internal",
        }
    }

    fn details(&self) -> Option<serde_json::Value> {
        match self {
            ApiError::Validation { violations, .. } if !violations.is_empty() => {
                Some(json!({ "violations": violations }))
            }
            ApiError::QuorumUnmet {
                wallets_in_range,
                wallets_out_of_range,
                count_in_range,
                minimum_required,
            } => Some(json!({
                "walletsInRange": wallets_in_range,
                "walletsOutOfRange": wallets_out_of_range,
                "countInRange": count_in_range,
                "minimumRequired": minimum_required,
            })),
            ApiError::RateLimited {
                window_seconds,
                current_count,
                max_executions,
            } => Some(json!({
                "windowSeconds": window_seconds,
                "currentCount": current_count,
                "maxExecutions": max_executions,
            })),
            ApiError::PasskeyMismatch {
                registered_prefix,
                provided_prefix,
            } => Some(json!({
                "registered": registered_prefix,
                "provided": provided_prefix,
                "canAutoRegister": true,
            })),
            ApiError::PaymentRejected { causes } => Some(json!({ "candidateCauses": causes })),
            ApiError::PendingConfirmation { hash } => Some(json!({
                "transactionHash": hash,
                "pendingConfirmation": true,
            })),
            _ => None,
        }
    }

    fn suggestions(&self) -> Option<Vec<&'static str>> {
        match self {
            ApiError::PasskeyMismatch { .. } => Some(vec![
                "Re-register the passkey for this signer address and retry",
            ]),
            ApiError::PaymentRejected { .. } => Some(vec![
                "Check the smart wallet balance and deposit before retrying",
                "Verify the WebAuthn signature was produced over the exact payload",
            ]),
            ApiError::RateLimited { .. } => {
                Some(vec!["Wait for the execution window to roll over"])
            }
            _ => None,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    suggestions: Option<Vec<&'a str>>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = ?self, "request failed");
        }
        let body = ErrorBody {
            error: self.error_code(),
            message: self.to_string(),
            details: self.details(),
            suggestions: self.suggestions(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => ApiError::not_found("record"),
            other => ApiError::internal(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError::validation("bad").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::AuthRequired.status_code(),
            StatusCode::UNAUTHORIZED
        );
        let quorum = ApiError::QuorumUnmet {
            wallets_in_range: vec![],
            wallets_out_of_range: vec![],
            count_in_range: 1,
            minimum_required: 2,
        };
        assert_eq!(quorum.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(quorum.error_code(), "QuorumUnmet");
    }

    #[test]
    fn test_passkey_mismatch_advertises_auto_register() {
        let err = ApiError::PasskeyMismatch {
            registered_prefix: "04ab".into(),
            provided_prefix: "04cd".into(),
        };
        let details = err.details().unwrap();
        assert_eq!(details["canAutoRegister"], serde_json::json!(true));
        assert!(err.suggestions().is_some());
    }

    #[test]
    fn test_validation_reports_all_violations() {
        let err = ApiError::validation_all(
            "2 violations",
            vec!["missing amount".into(), "unknown parameter foo".into()],
        );
        let details = err.details().unwrap();
        assert_eq!(details["violations"].as_array().unwrap().len(), 2);
    }
}
