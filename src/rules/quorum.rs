//! Wallet quorum evaluation.
//!
//! The spatial predicate lives in the database: `validate_quorum_for_rule`
//! resolves each required wallet's most recent location against the rule's
//! geofence inside a freshness window. This module wraps its row contract and
//! decides pass/fail.

use serde::Serialize;
use sqlx::{PgPool, Row};
use tracing::instrument;

use crate::error::ApiError;

/// Snapshot of a rule's quorum at evaluation time.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuorumStatus {
    pub quorum_met: bool,
    pub wallets_in_range: Vec<String>,
    pub wallets_out_of_range: Vec<String>,
    pub count_in_range: i64,
    pub minimum_required: i64,
}

impl QuorumStatus {
    /// Converts an unmet quorum into the error surfaced to callers.
    pub fn require_met(&self) -> Result<(), ApiError> {
        if self.quorum_met {
            Ok(())
        } else {
            Err(ApiError::QuorumUnmet {
                wallets_in_range: self.wallets_in_range.clone(),
                wallets_out_of_range: self.wallets_out_of_range.clone(),
                count_in_range: self.count_in_range,
                minimum_required: self.minimum_required,
            })
        }
    }
}

/// Evaluates the quorum for a rule via the stored SQL function.
#[instrument(skip(pool), err)]
pub async fn check_quorum(pool: &PgPool, rule_id: i64) -> Result<QuorumStatus, ApiError> {
    let row = sqlx::query("SELECT * FROM validate_quorum_for_rule($1)")
        .bind(rule_id)
        .fetch_one(pool)
        .await?;

    Ok(QuorumStatus {
        quorum_met: row.try_get("quorum_met").map_err(ApiError::from)?,
        wallets_in_range: row
            .try_get::<Vec<String>, _>("wallets_in_range")
            .map_err(ApiError::from)?,
        wallets_out_of_range: row
            .try_get::<Vec<String>, _>("wallets_out_of_range")
            .map_err(ApiError::from)?,
        count_in_range: row.try_get("count_in_range").map_err(ApiError::from)?,
        minimum_required: row.try_get("minimum_required").map_err(ApiError::from)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unmet_quorum_becomes_forbidden_error() {
        let status = QuorumStatus {
            quorum_met: false,
            wallets_in_range: vec!["GAX".into()],
            wallets_out_of_range: vec!["GAY".into()],
            count_in_range: 1,
            minimum_required: 2,
        };
        let err = status.require_met().unwrap_err();
        match err {
            ApiError::QuorumUnmet {
                count_in_range,
                minimum_required,
                wallets_in_range,
                wallets_out_of_range,
            } => {
                assert_eq!(count_in_range, 1);
                assert_eq!(minimum_required, 2);
                assert_eq!(wallets_in_range, vec!["GAX".to_string()]);
                assert_eq!(wallets_out_of_range, vec!["GAY".to_string()]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_met_quorum_passes() {
        let status = QuorumStatus {
            quorum_met: true,
            wallets_in_range: vec!["GAX".into(), "GAY".into()],
            wallets_out_of_range: vec![],
            count_in_range: 2,
            minimum_required: 2,
        };
        assert!(status.require_met().is_ok());
    }
}
