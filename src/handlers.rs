//! HTTP endpoints of the geotrigger engine.
//!
//! All routes are JSON. Authentication is a JWT bearer token or an
//! `X-API-Key` header; the [`Actor`] extractor resolves either into the
//! `(user_id, public_key)` pair that scopes every query. The `/contracts`
//! prefix mirrors the public API surface: registry, rules, nearby lookup,
//! the pending/completed/rejected projections, and execution.

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::Router;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::instrument;

use crate::auth::Actor;
use crate::contracts::store::ContractInput;
use crate::contracts::{FunctionMapping, WasmMeta, WasmVerification, discovery, store as contract_store};
use crate::dispatch;
use crate::error::ApiError;
use crate::executor::ExecuteRequest;
use crate::geo::GeoPoint;
use crate::lifecycle::{self, CompletionRequest};
use crate::matcher;
use crate::projections;
use crate::rules::store::{RuleInput, RulePatch};
use crate::rules::{quorum, store as rule_store};
use crate::state::AppState;
use crate::types::{Network, StellarAddress, TxHash};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(get_root))
        .route("/health", get(get_health))
        // Registry
        .route("/contracts/discover", post(post_discover))
        .route("/contracts", post(post_contract))
        .route("/contracts", get(get_contracts))
        .route("/contracts/public", get(get_contracts_public))
        .route("/contracts/nearby", get(get_nearby))
        .route("/contracts/upload-wasm", post(post_upload_wasm_unbound))
        // Rules (static segments before `{id}`)
        .route("/contracts/rules", post(post_rule))
        .route("/contracts/rules", get(get_rules))
        .route("/contracts/rules/public", get(get_rules_public))
        .route("/contracts/rules/pending", get(get_pending))
        .route("/contracts/rules/completed", get(get_completed))
        .route("/contracts/rules/rejected", get(get_rejected))
        .route(
            "/contracts/rules/pending/{rule_id}/reject",
            post(post_reject),
        )
        .route(
            "/contracts/rules/pending/{rule_id}/complete",
            post(post_complete),
        )
        .route("/contracts/rules/{id}", put(put_rule))
        .route("/contracts/rules/{id}", delete(delete_rule))
        .route("/contracts/rules/{id}", get(get_rule))
        .route("/contracts/rules/{id}/quorum", get(get_rule_quorum))
        .route(
            "/contracts/execution-rules/locations",
            get(get_rule_locations),
        )
        .route(
            "/contracts/execution-rules/locations/public",
            get(get_rule_locations_public),
        )
        // Location ingest
        .route("/location/update", post(post_location_update))
        // Per-contract
        .route("/contracts/{id}", put(put_contract))
        .route("/contracts/{id}", get(get_contract))
        .route("/contracts/{id}", delete(delete_contract))
        .route("/contracts/{id}/mappings", put(put_mappings))
        .route("/contracts/{id}/upload-wasm", post(post_upload_wasm))
        .route("/contracts/{id}/wasm", get(get_wasm))
        .route("/contracts/{id}/execute", post(post_execute))
        .route("/contracts/{id}/test-function", post(post_test_function))
}

#[instrument(skip_all)]
async fn get_root() -> impl IntoResponse {
    let pkg_name = env!("CARGO_PKG_NAME");
    (StatusCode::OK, format!("Hello from {pkg_name}!"))
}

#[instrument(skip_all)]
async fn get_health(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    sqlx::query("SELECT 1").execute(&state.db).await?;
    Ok(Json(json!({ "status": "ok" })))
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct DiscoverBody {
    address: String,
    network: Network,
}

#[instrument(skip_all)]
async fn post_discover(
    State(state): State<AppState>,
    _actor: Actor,
    Json(body): Json<DiscoverBody>,
) -> Result<impl IntoResponse, ApiError> {
    let result = discovery::discover(&state.chains, &body.address, body.network).await?;
    Ok(Json(json!({
        "functions": result.functions,
        "defaultFunctionMappings": result.default_function_mappings,
        "defaultRules": result.default_rules,
    })))
}

#[instrument(skip_all)]
async fn post_contract(
    State(state): State<AppState>,
    actor: Actor,
    Json(input): Json<ContractInput>,
) -> Result<impl IntoResponse, ApiError> {
    let contract = contract_store::upsert(&state.db, actor.user_id, &input).await?;
    Ok((StatusCode::CREATED, Json(contract)))
}

#[instrument(skip_all)]
async fn put_contract(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<i64>,
    Json(input): Json<ContractInput>,
) -> Result<impl IntoResponse, ApiError> {
    // The path id scopes ownership; the upsert key remains (user, address).
    contract_store::get_owned(&state.db, id, actor.user_id).await?;
    let contract = contract_store::upsert(&state.db, actor.user_id, &input).await?;
    Ok(Json(contract))
}

#[instrument(skip_all)]
async fn get_contracts(
    State(state): State<AppState>,
    actor: Actor,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(
        contract_store::list_mine(&state.db, actor.user_id).await?,
    ))
}

#[instrument(skip_all)]
async fn get_contracts_public(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(contract_store::list_public_active(&state.db).await?))
}

#[instrument(skip_all)]
async fn get_contract(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(
        contract_store::get_owned(&state.db, id, actor.user_id).await?,
    ))
}

#[instrument(skip_all)]
async fn delete_contract(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    contract_store::deactivate(&state.db, id, actor.user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip_all)]
async fn put_mappings(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<i64>,
    Json(mappings): Json<BTreeMap<String, FunctionMapping>>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(
        contract_store::update_mappings(&state.db, id, actor.user_id, &mappings).await?,
    ))
}

// ---------------------------------------------------------------------------
// WASM
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct WasmQuery {
    #[serde(default)]
    verify_wasm: bool,
    #[serde(default)]
    contract_id: Option<i64>,
}

async fn store_wasm(
    state: &AppState,
    actor: &Actor,
    contract_id: i64,
    verify: bool,
    bytes: Bytes,
) -> Result<Json<Value>, ApiError> {
    if bytes.is_empty() {
        return Err(ApiError::validation("empty WASM body"));
    }
    let contract = contract_store::get_owned(&state.db, contract_id, actor.user_id).await?;

    let sha256 = hex::encode(Sha256::digest(&bytes));
    let verification = if verify {
        let rpc = state
            .chains
            .by_network(contract.network)
            .ok_or_else(|| ApiError::Chain(format!("no RPC configured for {}", contract.network)))?;
        let chain_hash = rpc
            .contract_wasm_hash(&contract.address)
            .await
            .map_err(|e| ApiError::Chain(e.to_string()))?;
        // A mismatch is reported, not enforced.
        Some(WasmVerification {
            verified: chain_hash.as_deref() == Some(sha256.as_str()),
            chain_hash,
        })
    } else {
        None
    };

    let meta = WasmMeta {
        sha256: sha256.clone(),
        size_bytes: bytes.len() as i64,
        uploaded_at: Utc::now(),
        verification: verification.clone(),
    };
    contract_store::attach_wasm(&state.db, contract_id, actor.user_id, &bytes, &meta).await?;

    Ok(Json(json!({
        "sha256": sha256,
        "sizeBytes": bytes.len(),
        "wasmVerification": verification,
    })))
}

#[instrument(skip_all)]
async fn post_upload_wasm(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<i64>,
    Query(query): Query<WasmQuery>,
    bytes: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    store_wasm(&state, &actor, id, query.verify_wasm, bytes).await
}

#[instrument(skip_all)]
async fn post_upload_wasm_unbound(
    State(state): State<AppState>,
    actor: Actor,
    Query(query): Query<WasmQuery>,
    bytes: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let contract_id = query.contract_id.ok_or_else(|| {
        ApiError::validation_all(
            "Missing contract",
            vec!["contract_id query parameter is required".to_string()],
        )
    })?;
    store_wasm(&state, &actor, contract_id, query.verify_wasm, bytes).await
}

#[instrument(skip_all)]
async fn get_wasm(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<i64>,
) -> Result<Response, ApiError> {
    let bytes = contract_store::wasm_bytes(&state.db, id, actor.user_id).await?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/wasm")],
        bytes,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
async fn post_rule(
    State(state): State<AppState>,
    actor: Actor,
    Json(input): Json<RuleInput>,
) -> Result<impl IntoResponse, ApiError> {
    let rule = rule_store::create(&state.db, actor.user_id, &input).await?;
    Ok((StatusCode::CREATED, Json(rule)))
}

#[instrument(skip_all)]
async fn put_rule(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<i64>,
    Json(patch): Json<RulePatch>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(
        rule_store::update(&state.db, id, actor.user_id, &patch).await?,
    ))
}

#[instrument(skip_all)]
async fn delete_rule(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    rule_store::delete(&state.db, id, actor.user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip_all)]
async fn get_rule(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(
        rule_store::get_owned(&state.db, id, actor.user_id).await?,
    ))
}

#[instrument(skip_all)]
async fn get_rules(
    State(state): State<AppState>,
    actor: Actor,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(rule_store::list_mine(&state.db, actor.user_id).await?))
}

#[instrument(skip_all)]
async fn get_rules_public(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(rule_store::list_public_active(&state.db).await?))
}

#[instrument(skip_all)]
async fn get_rule_quorum(
    State(state): State<AppState>,
    _actor: Actor,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    rule_store::get_active(&state.db, id).await?;
    Ok(Json(quorum::check_quorum(&state.db, id).await?))
}

#[instrument(skip_all)]
async fn get_rule_locations(
    State(state): State<AppState>,
    actor: Actor,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(
        rule_store::list_locations(&state.db, Some(actor.user_id)).await?,
    ))
}

#[instrument(skip_all)]
async fn get_rule_locations_public(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(rule_store::list_locations(&state.db, None).await?))
}

// ---------------------------------------------------------------------------
// Nearby
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct NearbyQuery {
    latitude: f64,
    longitude: f64,
    #[serde(default = "default_nearby_radius")]
    radius: f64,
}

fn default_nearby_radius() -> f64 {
    1000.0
}

#[instrument(skip_all)]
async fn get_nearby(
    State(state): State<AppState>,
    Query(query): Query<NearbyQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let point = GeoPoint::new(query.latitude, query.longitude);
    if !point.is_valid() {
        return Err(ApiError::validation("latitude/longitude out of range"));
    }
    Ok(Json(matcher::nearby(&state.db, point, query.radius).await?))
}

// ---------------------------------------------------------------------------
// Location ingest
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct LocationUpdateBody {
    latitude: f64,
    longitude: f64,
    #[serde(default)]
    public_key: Option<StellarAddress>,
}

#[instrument(skip_all)]
async fn post_location_update(
    State(state): State<AppState>,
    actor: Actor,
    Json(body): Json<LocationUpdateBody>,
) -> Result<impl IntoResponse, ApiError> {
    let point = GeoPoint::new(body.latitude, body.longitude);
    if !point.is_valid() {
        return Err(ApiError::validation("latitude/longitude out of range"));
    }
    let public_key = body
        .public_key
        .or_else(|| actor.public_key.clone())
        .ok_or_else(|| {
            ApiError::validation_all(
                "Missing public key",
                vec!["public_key is required when the session has none".to_string()],
            )
        })?;
    let update = dispatch::ingest_location_update(
        &state.db,
        &state.chains,
        &state.executor,
        actor.user_id,
        &public_key,
        point,
    )
    .await?;
    Ok((StatusCode::CREATED, Json(update)))
}

// ---------------------------------------------------------------------------
// Projections
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct LimitQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    50
}

#[instrument(skip_all)]
async fn get_pending(
    State(state): State<AppState>,
    actor: Actor,
    Query(query): Query<LimitQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let page = projections::pending_view(&state.db, &actor, query.limit).await?;
    Ok(Json(json!({ "pending": page.items, "count": page.count })))
}

#[instrument(skip_all)]
async fn get_completed(
    State(state): State<AppState>,
    actor: Actor,
    Query(query): Query<LimitQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let page = projections::completed_view(&state.db, &actor, query.limit).await?;
    Ok(Json(json!({ "completed": page.items, "count": page.count })))
}

#[instrument(skip_all)]
async fn get_rejected(
    State(state): State<AppState>,
    actor: Actor,
    Query(query): Query<LimitQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let page = projections::rejected_view(&state.db, &actor, query.limit).await?;
    Ok(Json(json!({ "rejected": page.items, "count": page.count })))
}

// ---------------------------------------------------------------------------
// Completion / rejection
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RejectBody {
    #[serde(default)]
    matched_public_key: Option<StellarAddress>,
}

#[instrument(skip_all)]
async fn post_reject(
    State(state): State<AppState>,
    actor: Actor,
    Path(rule_id): Path<i64>,
    Json(body): Json<RejectBody>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = lifecycle::mark_rejected(
        &state.db,
        actor.user_id,
        actor.public_key.as_ref(),
        rule_id,
        body.matched_public_key.as_ref(),
    )
    .await?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
struct CompleteBody {
    #[serde(default)]
    matched_public_key: Option<StellarAddress>,
    #[serde(default)]
    transaction_hash: Option<TxHash>,
    #[serde(default)]
    update_id: Option<i64>,
}

/// Recovery endpoint: records a completion observed outside the engine.
#[instrument(skip_all)]
async fn post_complete(
    State(state): State<AppState>,
    actor: Actor,
    Path(rule_id): Path<i64>,
    Json(body): Json<CompleteBody>,
) -> Result<impl IntoResponse, ApiError> {
    let transaction_hash = body.transaction_hash.ok_or_else(|| {
        ApiError::validation_all(
            "Missing transaction hash",
            vec!["transaction_hash is required to record a completion".to_string()],
        )
    })?;
    let outcome = lifecycle::mark_completed(
        &state.db,
        actor.public_key.as_ref(),
        &CompletionRequest {
            rule_id,
            user_id: actor.user_id,
            update_id: body.update_id,
            matched_public_key: body.matched_public_key,
            transaction_hash,
            execution_parameters: None,
            pending_confirmation: false,
        },
    )
    .await?;
    Ok(Json(outcome))
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ExecuteBody {
    function_name: String,
    #[serde(default)]
    parameters: BTreeMap<String, Value>,
    #[serde(default)]
    user_public_key: Option<StellarAddress>,
    #[serde(default)]
    user_secret_key: Option<String>,
    #[serde(default)]
    rule_id: Option<i64>,
    #[serde(default)]
    update_id: Option<i64>,
    #[serde(default)]
    matched_public_key: Option<StellarAddress>,
    #[serde(default)]
    payment_source: Option<String>,
    #[serde(default, alias = "passkeyPublicKeySPKI")]
    passkey_public_key_spki: Option<String>,
    #[serde(default, alias = "webauthnSignature")]
    webauthn_signature: Option<String>,
    #[serde(default, alias = "webauthnAuthenticatorData")]
    webauthn_authenticator_data: Option<String>,
    #[serde(default, alias = "webauthnClientData")]
    webauthn_client_data: Option<String>,
    #[serde(default, alias = "signaturePayload")]
    signature_payload: Option<Value>,
    #[serde(default)]
    submit_to_ledger: bool,
}

impl ExecuteBody {
    fn into_request(self, actor: &Actor) -> ExecuteRequest {
        ExecuteRequest {
            function_name: self.function_name,
            parameters: self.parameters,
            user_public_key: self.user_public_key.or_else(|| actor.public_key.clone()),
            user_secret_key: self.user_secret_key,
            rule_id: self.rule_id,
            update_id: self.update_id,
            matched_public_key: self.matched_public_key,
            payment_source: self.payment_source,
            passkey_spki: self.passkey_public_key_spki,
            webauthn_signature: self.webauthn_signature,
            webauthn_authenticator_data: self.webauthn_authenticator_data,
            webauthn_client_data: self.webauthn_client_data,
            signature_payload: self.signature_payload,
            submit_to_ledger: self.submit_to_ledger,
        }
    }
}

#[instrument(skip_all, fields(contract_id = id))]
async fn post_execute(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<i64>,
    Json(body): Json<ExecuteBody>,
) -> Result<impl IntoResponse, ApiError> {
    let contract = contract_store::get_active(&state.db, id).await?;
    let request = body.into_request(&actor);
    let rule_id = request.rule_id;
    let update_id = request.update_id;
    let matched_public_key = request.matched_public_key.clone();

    let outcome = state.executor.execute(actor.user_id, &contract, &request).await?;

    // A confirmed submission tied to a rule flows into the lifecycle
    // manager. Its failure must not mask the successful chain submission.
    let mut update_warning = None;
    if let (Some(rule_id), Some(hash)) = (rule_id, outcome.transaction_hash.clone()) {
        let completion = CompletionRequest {
            rule_id,
            user_id: actor.user_id,
            update_id,
            matched_public_key,
            transaction_hash: hash,
            execution_parameters: Some(Value::Object(
                outcome
                    .executed_parameters
                    .iter()
                    .cloned()
                    .collect::<serde_json::Map<String, Value>>(),
            )),
            pending_confirmation: outcome.pending_confirmation,
        };
        if let Err(e) =
            lifecycle::mark_completed(&state.db, actor.public_key.as_ref(), &completion).await
        {
            tracing::error!(error = %e, "post-execution lifecycle update failed");
            update_warning = Some(format!("execution recorded on-chain but not in queue: {e}"));
        }
    }

    let stellar_expert_url = outcome.transaction_hash.as_ref().map(|hash| {
        format!("{}/tx/{}", contract.network.explorer_base(), hash)
    });
    Ok(Json(json!({
        "success": outcome.success,
        "transaction_hash": outcome.transaction_hash,
        "simulated_only": outcome.simulated_only,
        "stellar_expert_url": stellar_expert_url,
        "routed_through_smart_wallet": outcome.routed_through_smart_wallet,
        "contract_return_value": outcome.contract_return_value,
        "pending_confirmation": outcome.pending_confirmation,
        "update_warning": update_warning,
    })))
}

#[instrument(skip_all, fields(contract_id = id))]
async fn post_test_function(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<i64>,
    Json(body): Json<ExecuteBody>,
) -> Result<impl IntoResponse, ApiError> {
    let contract = contract_store::get_active(&state.db, id).await?;
    let request = body.into_request(&actor);
    let outcome = state.executor.test_function(&contract, &request).await?;
    Ok(Json(json!({
        "success": outcome.success,
        "simulated_only": true,
        "contract_return_value": outcome.contract_return_value,
        "parameters": Value::Object(
            outcome
                .executed_parameters
                .into_iter()
                .collect::<serde_json::Map<String, Value>>(),
        ),
    })))
}
