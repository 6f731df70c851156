//! Persistence for registered contracts.
//!
//! Create-or-update is an upsert keyed on `(user_id, address)`; deletion is a
//! soft `is_active=false` so rules referencing the contract keep resolving.

use serde::Deserialize;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::collections::BTreeMap;
use tracing::instrument;

use super::{CustomContract, FunctionMapping, WasmMeta, normalize_functions};
use crate::error::ApiError;
use crate::types::{Network, StellarAddress};

/// Caller-supplied contract fields, shared by create and update.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractInput {
    pub address: String,
    pub network: Network,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Map or array form; normalized to a name-keyed map on write.
    #[serde(default)]
    pub discovered_functions: Option<serde_json::Value>,
    #[serde(default)]
    pub function_mappings: Option<BTreeMap<String, FunctionMapping>>,
    #[serde(default)]
    pub use_smart_wallet: bool,
    #[serde(default)]
    pub smart_wallet_contract_id: Option<String>,
    #[serde(default)]
    pub payment_function_name: Option<String>,
    #[serde(default)]
    pub requires_webauthn: bool,
    #[serde(default)]
    pub webauthn_verifier_contract_id: Option<String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

fn validated_address(raw: &str, label: &str) -> Result<StellarAddress, ApiError> {
    StellarAddress::parse(raw)
        .map_err(|e| ApiError::validation_all(format!("Invalid {label}"), vec![e.to_string()]))
}

pub(crate) fn row_to_contract(row: &PgRow) -> Result<CustomContract, sqlx::Error> {
    let decode = |e: serde_json::Error| sqlx::Error::Decode(Box::new(e));
    let network: String = row.try_get("network")?;
    let address: String = row.try_get("address")?;
    Ok(CustomContract {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        address: StellarAddress::parse(&address)
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        network: network
            .parse::<Network>()
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        discovered_functions: serde_json::from_value(row.try_get("discovered_functions")?)
            .map_err(decode)?,
        function_mappings: serde_json::from_value(row.try_get("function_mappings")?)
            .map_err(decode)?,
        use_smart_wallet: row.try_get("use_smart_wallet")?,
        smart_wallet_contract_id: row
            .try_get::<Option<String>, _>("smart_wallet_contract_id")?
            .map(|s| StellarAddress::parse(&s).map_err(|e| sqlx::Error::Decode(Box::new(e))))
            .transpose()?,
        payment_function_name: row.try_get("payment_function_name")?,
        requires_webauthn: row.try_get("requires_webauthn")?,
        webauthn_verifier_contract_id: row
            .try_get::<Option<String>, _>("webauthn_verifier_contract_id")?
            .map(|s| StellarAddress::parse(&s).map_err(|e| sqlx::Error::Decode(Box::new(e))))
            .transpose()?,
        wasm_meta: row
            .try_get::<Option<serde_json::Value>, _>("wasm_meta")?
            .map(serde_json::from_value)
            .transpose()
            .map_err(decode)?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

const CONTRACT_COLUMNS: &str = "id, user_id, address, network, name, description, \
     discovered_functions, function_mappings, use_smart_wallet, smart_wallet_contract_id, \
     payment_function_name, requires_webauthn, webauthn_verifier_contract_id, wasm_meta, \
     is_active, created_at, updated_at";

/// Creates or updates a contract, keyed on `(user_id, address)`.
#[instrument(skip_all, err, fields(user_id = user_id, address = %input.address))]
pub async fn upsert(
    pool: &PgPool,
    user_id: i64,
    input: &ContractInput,
) -> Result<CustomContract, ApiError> {
    let address = validated_address(&input.address, "contract address")?;
    let smart_wallet = input
        .smart_wallet_contract_id
        .as_deref()
        .map(|s| validated_address(s, "smart wallet contract id"))
        .transpose()?;
    let verifier = input
        .webauthn_verifier_contract_id
        .as_deref()
        .map(|s| validated_address(s, "webauthn verifier contract id"))
        .transpose()?;

    let discovered = match &input.discovered_functions {
        Some(raw) => normalize_functions(raw)
            .map_err(|e| ApiError::validation_all("Invalid function list", vec![e.to_string()]))?,
        None => BTreeMap::new(),
    };
    // Absent mappings are derived from the discovered signatures.
    let mappings: BTreeMap<String, FunctionMapping> = match &input.function_mappings {
        Some(given) => given.clone(),
        None => discovered
            .iter()
            .map(|(name, sig)| (name.clone(), super::derive_default_mapping(sig)))
            .collect(),
    };

    let row = sqlx::query(&format!(
        "INSERT INTO custom_contracts \
           (user_id, address, network, name, description, discovered_functions, \
            function_mappings, use_smart_wallet, smart_wallet_contract_id, \
            payment_function_name, requires_webauthn, webauthn_verifier_contract_id, is_active) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) \
         ON CONFLICT (user_id, address) DO UPDATE SET \
           network = EXCLUDED.network, \
           name = COALESCE(EXCLUDED.name, custom_contracts.name), \
           description = COALESCE(EXCLUDED.description, custom_contracts.description), \
           discovered_functions = EXCLUDED.discovered_functions, \
           function_mappings = EXCLUDED.function_mappings, \
           use_smart_wallet = EXCLUDED.use_smart_wallet, \
           smart_wallet_contract_id = EXCLUDED.smart_wallet_contract_id, \
           payment_function_name = EXCLUDED.payment_function_name, \
           requires_webauthn = EXCLUDED.requires_webauthn, \
           webauthn_verifier_contract_id = EXCLUDED.webauthn_verifier_contract_id, \
           is_active = EXCLUDED.is_active, \
           updated_at = now() \
         RETURNING {CONTRACT_COLUMNS}"
    ))
    .bind(user_id)
    .bind(address.as_str())
    .bind(input.network.as_str())
    .bind(&input.name)
    .bind(&input.description)
    .bind(serde_json::to_value(&discovered).unwrap_or_default())
    .bind(serde_json::to_value(&mappings).unwrap_or_default())
    .bind(input.use_smart_wallet)
    .bind(smart_wallet.as_ref().map(StellarAddress::as_str))
    .bind(&input.payment_function_name)
    .bind(input.requires_webauthn)
    .bind(verifier.as_ref().map(StellarAddress::as_str))
    .bind(input.is_active)
    .fetch_one(pool)
    .await?;

    Ok(row_to_contract(&row)?)
}

/// Fetches a contract owned by `user_id`. Soft-deleted and foreign rows both
/// read as absent.
pub async fn get_owned(
    pool: &PgPool,
    id: i64,
    user_id: i64,
) -> Result<CustomContract, ApiError> {
    let row = sqlx::query(&format!(
        "SELECT {CONTRACT_COLUMNS} FROM custom_contracts \
         WHERE id = $1 AND user_id = $2 AND is_active"
    ))
    .bind(id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| ApiError::not_found("contract"))?;
    Ok(row_to_contract(&row)?)
}

/// Fetches any active contract by id, regardless of owner. Used by public
/// listings and rule resolution.
pub async fn get_active(pool: &PgPool, id: i64) -> Result<CustomContract, ApiError> {
    let row = sqlx::query(&format!(
        "SELECT {CONTRACT_COLUMNS} FROM custom_contracts WHERE id = $1 AND is_active"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| ApiError::not_found("contract"))?;
    Ok(row_to_contract(&row)?)
}

pub async fn list_mine(pool: &PgPool, user_id: i64) -> Result<Vec<CustomContract>, ApiError> {
    let rows = sqlx::query(&format!(
        "SELECT {CONTRACT_COLUMNS} FROM custom_contracts \
         WHERE user_id = $1 AND is_active ORDER BY created_at DESC"
    ))
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    rows.iter()
        .map(|r| row_to_contract(r).map_err(ApiError::from))
        .collect()
}

pub async fn list_public_active(pool: &PgPool) -> Result<Vec<CustomContract>, ApiError> {
    let rows = sqlx::query(&format!(
        "SELECT {CONTRACT_COLUMNS} FROM custom_contracts \
         WHERE is_active ORDER BY created_at DESC"
    ))
    .fetch_all(pool)
    .await?;
    rows.iter()
        .map(|r| row_to_contract(r).map_err(ApiError::from))
        .collect()
}

/// Soft-deletes a contract.
#[instrument(skip_all, err, fields(contract_id = id, user_id = user_id))]
pub async fn deactivate(pool: &PgPool, id: i64, user_id: i64) -> Result<(), ApiError> {
    let result = sqlx::query(
        "UPDATE custom_contracts SET is_active = false, updated_at = now() \
         WHERE id = $1 AND user_id = $2 AND is_active",
    )
    .bind(id)
    .bind(user_id)
    .execute(pool)
    .await?;
    if result.rows_affected() == 0 {
        return Err(ApiError::not_found("contract"));
    }
    Ok(())
}

/// Replaces the function mappings wholesale.
pub async fn update_mappings(
    pool: &PgPool,
    id: i64,
    user_id: i64,
    mappings: &BTreeMap<String, FunctionMapping>,
) -> Result<CustomContract, ApiError> {
    let row = sqlx::query(&format!(
        "UPDATE custom_contracts SET function_mappings = $3, updated_at = now() \
         WHERE id = $1 AND user_id = $2 AND is_active \
         RETURNING {CONTRACT_COLUMNS}"
    ))
    .bind(id)
    .bind(user_id)
    .bind(serde_json::to_value(mappings).unwrap_or_default())
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| ApiError::not_found("contract"))?;
    Ok(row_to_contract(&row)?)
}

/// Persists a mapping derived on the fly during execution, so subsequent
/// calls hit the stored copy.
pub async fn persist_derived_mapping(
    pool: &PgPool,
    id: i64,
    function: &str,
    mapping: &FunctionMapping,
) -> Result<(), ApiError> {
    sqlx::query(
        "UPDATE custom_contracts \
         SET function_mappings = jsonb_set(function_mappings, ARRAY[$2], $3, true), \
             updated_at = now() \
         WHERE id = $1",
    )
    .bind(id)
    .bind(function)
    .bind(serde_json::to_value(mapping).unwrap_or_default())
    .execute(pool)
    .await?;
    Ok(())
}

/// Stores uploaded WASM bytes alongside their metadata.
pub async fn attach_wasm(
    pool: &PgPool,
    id: i64,
    user_id: i64,
    bytes: &[u8],
    meta: &WasmMeta,
) -> Result<(), ApiError> {
    let result = sqlx::query(
        "UPDATE custom_contracts SET wasm = $3, wasm_meta = $4, updated_at = now() \
         WHERE id = $1 AND user_id = $2 AND is_active",
    )
    .bind(id)
    .bind(user_id)
    .bind(bytes)
    .bind(serde_json::to_value(meta).unwrap_or_default())
    .execute(pool)
    .await?;
    if result.rows_affected() == 0 {
        return Err(ApiError::not_found("contract"));
    }
    Ok(())
}

/// Reads back stored WASM bytes.
pub async fn wasm_bytes(pool: &PgPool, id: i64, user_id: i64) -> Result<Vec<u8>, ApiError> {
    let row = sqlx::query(
        "SELECT wasm FROM custom_contracts WHERE id = $1 AND user_id = $2 AND is_active",
    )
    .bind(id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| ApiError::not_found("contract"))?;
    let bytes: Option<Vec<u8>> = row.try_get("wasm").map_err(ApiError::from)?;
    bytes.ok_or_else(|| ApiError::not_found("contract WASM"))
}
