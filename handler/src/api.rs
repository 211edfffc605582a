//! Authenticated HTTP surface (§6 "Handler HTTP surface"): account
//! provisioning, deposit/withdraw info, withdrawal creation, and read-only
//! handler/block introspection for the Dispatcher to call.
//!
//! Grounded on the teacher's `canceler::server` axum layout (owned `Router`,
//! `AppState` clone-per-request, a health/metrics surface split onto its own
//! bind address) generalized to the custodial handler's authenticated
//! routes, with an `Api-Key` header check in front of everything but
//! `/readiness` and the ungated health/metrics server.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bigdecimal::BigDecimal;
use eyre::Result;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::Config;
use crate::crypto::{self, DbSecretKey};
use crate::db::models::{CoinInfo, Role, NATIVE_COIN};
use crate::db::Store;
use chain_client::ChainClient;

#[derive(Clone)]
pub struct ApiState {
    pub config: Arc<Config>,
    pub store: Store,
    pub chain: Arc<dyn ChainClient>,
    pub db_secret_key: DbSecretKey,
    pub admin_seed_bytes: Arc<Vec<u8>>,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

async fn require_api_key(
    State(state): State<ApiState>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    let provided = headers.get("Api-Key").and_then(|v| v.to_str().ok());
    if provided != Some(state.config.api.api_key.0.as_str()) {
        return error_response(StatusCode::UNAUTHORIZED, "invalid or missing Api-Key header");
    }
    next.run(request).await
}

pub fn authenticated_router(state: ApiState) -> Router {
    Router::new()
        .route("/get_handler_info", get(get_handler_info))
        .route("/get_handled_blocks", get(get_handled_blocks))
        .route("/add_account", post(add_account))
        .route("/get_deposit_info", get(get_deposit_info))
        .route("/get_withdraw_info", get(get_withdraw_info))
        .route("/create_withdrawal", post(create_withdrawal))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key))
        .route("/readiness", get(readiness))
        .with_state(state)
}

/// Ungated liveness/metrics surface, bound to a separate address from the
/// authenticated API per §6.
pub fn operational_router(metrics: Arc<crate::metrics::Metrics>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(move || metrics_handler(metrics.clone())))
}

async fn health() -> &'static str {
    "OK"
}

async fn metrics_handler(metrics: Arc<crate::metrics::Metrics>) -> Response {
    use prometheus::{Encoder, TextEncoder};
    let encoder = TextEncoder::new();
    let families = metrics.registry.gather();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics");
    }
    Response::builder()
        .header(axum::http::header::CONTENT_TYPE, encoder.format_type())
        .body(axum::body::Body::from(buffer))
        .unwrap_or_else(|_| error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to build response").into_response())
}

async fn readiness() -> Json<serde_json::Value> {
    Json(json!({}))
}

fn coin_map(coins: &[crate::db::models::Coin]) -> HashMap<String, CoinInfo> {
    coins
        .iter()
        .map(|c| {
            (
                c.contract_address.clone(),
                CoinInfo {
                    name: c.name.clone(),
                    decimal: c.decimals,
                    min_amount: c.min_amount.to_string(),
                    is_active: c.is_active,
                },
            )
        })
        .collect()
}

async fn get_handler_info(State(state): State<ApiState>) -> Response {
    match state.store.get_active_coins().await {
        Ok(coins) => Json(json!({
            "name": state.config.handler_name,
            "display_name": state.config.handler_display,
            "coins": coin_map(&coins),
        }))
        .into_response(),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}

#[derive(Deserialize)]
struct PageQuery {
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

fn default_limit() -> i64 {
    100
}

async fn get_handled_blocks(State(state): State<ApiState>, Query(q): Query<PageQuery>) -> Response {
    match state.store.get_handled_blocks(q.limit, q.offset).await {
        Ok(blocks) => Json(blocks).into_response(),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}

#[derive(Deserialize)]
struct AddAccountBody {
    user_id: String,
}

async fn add_account(State(state): State<ApiState>, Json(body): Json<AddAccountBody>) -> Response {
    if body.user_id.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "user_id must not be empty");
    }
    match provision_account(&state, &body.user_id).await {
        Ok(address) => Json(json!({ "address": address })).into_response(),
        Err(e) => {
            tracing::error!(user_id = %body.user_id, error = %e, "add_account failed");
            error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
    }
}

async fn provision_account(state: &ApiState, user_id: &str) -> Result<String> {
    if let Some(existing) = state.store.get_user_address_by_user(user_id).await? {
        return Ok(existing.public);
    }
    state.store.create_user(user_id, Role::User).await?;

    let (admin_id, approve_id) = state
        .store
        .pick_admin_and_approve()
        .await?
        .ok_or_else(|| eyre::eyre!("no SADMIN/APPROVE address available to assign"))?;

    let index = state.store.count_user_addresses().await?;
    let private_key_bytes = crypto::derive_private_key_bytes(&state.admin_seed_bytes, Role::User, index);
    let private_key_hex = format!("0x{}", hex::encode(private_key_bytes));
    let public_raw = state.chain.address_from_private_key(&private_key_hex)?;
    let public = state.chain.canonicalize_address(&public_raw);
    let private_enc = crypto::encrypt_str(&state.db_secret_key, &private_key_hex);

    state
        .store
        .insert_user_address(user_id, &public, &private_enc, Some(admin_id), Some(approve_id))
        .await?;
    Ok(public)
}

#[derive(Deserialize)]
struct UserIdQuery {
    user_id: String,
}

async fn get_deposit_info(State(state): State<ApiState>, Query(q): Query<UserIdQuery>) -> Response {
    let address = match state.store.get_user_address_by_user(&q.user_id).await {
        Ok(Some(a)) => a,
        Ok(None) => return error_response(StatusCode::BAD_REQUEST, "no deposit address provisioned for user_id"),
        Err(e) => return error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    };
    let coins = match state.store.get_active_coins().await {
        Ok(c) => c,
        Err(e) => return error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    };
    Json(json!({
        "address": address.public,
        "display_name": state.config.handler_display,
        "coins": coin_map(&coins),
    }))
    .into_response()
}

#[derive(Deserialize)]
struct WithdrawInfoQuery {
    user_id: String,
    quote_amount: String,
}

async fn get_withdraw_info(State(state): State<ApiState>, Query(q): Query<WithdrawInfoQuery>) -> Response {
    if state.store.get_user_address_by_user(&q.user_id).await.ok().flatten().is_none() {
        return error_response(StatusCode::BAD_REQUEST, "no deposit address provisioned for user_id");
    }
    let quote_amount: BigDecimal = match q.quote_amount.parse() {
        Ok(v) => v,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "quote_amount is not a valid decimal"),
    };
    let coins = match state.store.get_active_coins().await {
        Ok(c) => c,
        Err(e) => return error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    };

    let mut out = serde_json::Map::new();
    for coin in coins {
        let rate = coin.current_rate.clone().unwrap_or_else(|| BigDecimal::from(0));
        if rate <= BigDecimal::from(0) {
            continue;
        }
        let scale = BigDecimal::from(10u64.pow(coin.decimals.max(0) as u32));
        let estimated_amount = &quote_amount * &scale / &rate;
        let min_quote = &coin.min_amount * &rate / &scale;
        let fee_quote = &coin.fee_amount * &rate / &scale;
        out.insert(
            coin.contract_address.clone(),
            json!({
                "current_rate": rate.to_string(),
                "estimated_amount": estimated_amount.to_string(),
                "min_quote_amount": min_quote.to_string(),
                "fee_quote_amount": fee_quote.to_string(),
            }),
        );
    }
    Json(serde_json::Value::Object(out)).into_response()
}

#[derive(Deserialize)]
struct CreateWithdrawalBody {
    user_id: String,
    contract_address: String,
    address: String,
    quote_amount: String,
    user_currency: String,
}

#[derive(Serialize)]
struct CreateWithdrawalResponse {
    withdrawal_id: uuid::Uuid,
}

async fn create_withdrawal(State(state): State<ApiState>, Json(body): Json<CreateWithdrawalBody>) -> Response {
    if state.store.get_user_address_by_user(&body.user_id).await.ok().flatten().is_none() {
        return error_response(StatusCode::BAD_REQUEST, "no deposit address provisioned for user_id");
    }
    let quote_amount: BigDecimal = match body.quote_amount.parse() {
        Ok(v) => v,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "quote_amount is not a valid decimal"),
    };
    let coin = match state.store.get_coin(&body.contract_address).await {
        Ok(Some(c)) if c.is_active => c,
        Ok(Some(_)) => return error_response(StatusCode::BAD_REQUEST, "coin is not active"),
        Ok(None) => return error_response(StatusCode::BAD_REQUEST, "unknown contract_address"),
        Err(e) => return error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    };
    let rate = coin.current_rate.clone().unwrap_or_else(|| BigDecimal::from(0));
    if rate <= BigDecimal::from(0) {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "coin has no current rate yet");
    }
    let scale = BigDecimal::from(10u64.pow(coin.decimals.max(0) as u32));
    let amount = &quote_amount * &scale / &rate;
    if coin.contract_address != NATIVE_COIN && body.address.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "address must not be empty");
    }

    match state
        .store
        .create_withdrawal(&body.user_id, &body.contract_address, &body.address, &amount, &quote_amount, &body.user_currency)
        .await
    {
        Ok(withdrawal_id) => Json(CreateWithdrawalResponse { withdrawal_id }).into_response(),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}

pub async fn serve_authenticated(state: ApiState, bind_addr: &str) -> Result<()> {
    let app = authenticated_router(state);
    let addr: SocketAddr = bind_addr.parse()?;
    tracing::info!(%addr, "authenticated API listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

pub async fn serve_operational(metrics: Arc<crate::metrics::Metrics>, bind_addr: &str) -> Result<()> {
    let app = operational_router(metrics);
    let addr: SocketAddr = bind_addr.parse()?;
    tracing::info!(%addr, "operational (health/metrics) server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
