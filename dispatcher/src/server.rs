//! Dispatcher's own HTTP surface (§6 "Dispatcher's own HTTP surface"),
//! grounded on the Handler's own `api::authenticated_router` layout: an
//! owned `Router`, an `AppState` clone-per-request, and a health/metrics
//! surface split onto its own bind address.
//!
//! All routes are authenticated by the customer's `api_key` header except
//! `/readiness` and `/v1/api/customer` (which mints that key) and
//! `/v1/api/private/callback` (authenticated by a Handler-specific
//! credential instead, since it's called by Handlers, not customers).

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use eyre::Result;
use serde::Deserialize;
use serde_json::json;

use crate::crypto::{self, DbSecretKey};
use crate::db::models::Role;
use crate::db::Store;
use crate::handler_client::HandlerClient;

#[derive(Clone)]
pub struct ApiState {
    pub store: Store,
    pub handler: HandlerClient,
    pub db_secret_key: DbSecretKey,
    /// Decrypted Handler API keys, accepted on `/v1/api/private/callback`.
    /// Cached at startup from `network_handlers` — refreshed by restarting
    /// the process after `PROC_API_NETWORK_HANDLERS` changes, matching the
    /// Handler's own bootstrap-is-a-one-shot model.
    pub handler_api_keys: Arc<HashSet<String>>,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

#[derive(Clone)]
struct AuthedCustomer {
    id: uuid::Uuid,
}

async fn require_customer_api_key(
    State(state): State<ApiState>,
    headers: HeaderMap,
    mut request: axum::extract::Request,
    next: Next,
) -> Response {
    let Some(provided) = headers.get("Api-Key").and_then(|v| v.to_str().ok()) else {
        return error_response(StatusCode::UNAUTHORIZED, "missing Api-Key header");
    };
    let hash = crypto::hash_api_key(provided);
    match state.store.get_customer_by_api_key_hash(&hash).await {
        Ok(Some(customer)) => {
            request.extensions_mut().insert(AuthedCustomer { id: customer.id });
            next.run(request).await
        }
        Ok(None) => error_response(StatusCode::UNAUTHORIZED, "invalid Api-Key"),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}

pub fn authenticated_router(state: ApiState) -> Router {
    Router::new()
        .route("/v1/api/user", post(register_user))
        .route("/v1/api/deposit_info", get(deposit_info))
        .route("/v1/api/withdraw_info", get(withdraw_info))
        .route("/v1/api/withdrawal", post(create_withdrawal))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_customer_api_key))
        .route("/v1/api/customer", post(create_customer))
        .route("/v1/api/private/callback", post(private_callback))
        .route("/readiness", get(readiness))
        .with_state(state)
}

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

#[derive(Deserialize)]
struct CreateCustomerBody {
    callback_url: String,
    callback_api_key: String,
}

async fn create_customer(State(state): State<ApiState>, Json(body): Json<CreateCustomerBody>) -> Response {
    if body.callback_url.trim().is_empty() || url::Url::parse(&body.callback_url).is_err() {
        return error_response(StatusCode::BAD_REQUEST, "callback_url must be a valid URL");
    }
    let raw_api_key = crypto::generate_api_key();
    let api_key_hash = crypto::hash_api_key(&raw_api_key);
    let callback_api_key_enc = crypto::encrypt_str(&state.db_secret_key, &body.callback_api_key);

    match state
        .store
        .create_customer(&body.callback_url, &callback_api_key_enc, &api_key_hash)
        .await
    {
        Ok(Some(customer_id)) => {
            Json(json!({ "customer_id": customer_id, "api_key": raw_api_key })).into_response()
        }
        Ok(None) => error_response(StatusCode::CONFLICT, "callback_url already registered"),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}

#[derive(Deserialize)]
struct RegisterUserBody {
    user_id: String,
}

async fn register_user(
    State(state): State<ApiState>,
    axum::Extension(customer): axum::Extension<AuthedCustomer>,
    Json(body): Json<RegisterUserBody>,
) -> Response {
    if body.user_id.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "user_id must not be empty");
    }
    match state.store.register_user(&body.user_id, customer.id, Role::User).await {
        Ok(()) => Json(json!({})).into_response(),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}

/// Confirms `user_id` belongs to the authenticated customer before any
/// cross-network proxy call, so one customer can never read or act on
/// another customer's user.
async fn authorize_user(state: &ApiState, customer: &AuthedCustomer, user_id: &str) -> Result<(), Response> {
    match state.store.get_user(user_id).await {
        Ok(Some(u)) if u.customer_id == Some(customer.id) => Ok(()),
        Ok(_) => Err(error_response(StatusCode::FORBIDDEN, "user_id does not belong to this customer")),
        Err(e) => Err(error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string())),
    }
}

async fn resolve_handler(state: &ApiState, network: &str) -> Result<crate::db::models::NetworkHandler, Response> {
    match state.store.get_network_handler(network).await {
        Ok(Some(h)) => Ok(h),
        Ok(None) => Err(error_response(StatusCode::BAD_REQUEST, "unknown or inactive network")),
        Err(e) => Err(error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string())),
    }
}

#[derive(Deserialize)]
struct DepositInfoQuery {
    user_id: String,
    network: String,
}

async fn deposit_info(
    State(state): State<ApiState>,
    axum::Extension(customer): axum::Extension<AuthedCustomer>,
    Query(q): Query<DepositInfoQuery>,
) -> Response {
    if let Err(resp) = authorize_user(&state, &customer, &q.user_id).await {
        return resp;
    }
    let handler = match resolve_handler(&state, &q.network).await {
        Ok(h) => h,
        Err(resp) => return resp,
    };
    let api_key = match crypto::decrypt_to_string(&state.db_secret_key, &handler.api_key) {
        Ok(k) => k,
        Err(e) => return error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    };
    match state.handler.get_deposit_info(&handler.server_url, &api_key, &q.user_id).await {
        Ok(v) => Json(v).into_response(),
        Err(e) if e.is_missing_account() => {
            // No deposit address provisioned yet for this user on this
            // network (§6 "/add_account"): provision it, then retry once.
            match state.handler.add_account(&handler.server_url, &api_key, &q.user_id).await {
                Ok(_) => match state.handler.get_deposit_info(&handler.server_url, &api_key, &q.user_id).await {
                    Ok(v) => Json(v).into_response(),
                    Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
                },
                Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
            }
        }
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}

#[derive(Deserialize)]
struct WithdrawInfoQuery {
    user_id: String,
    network: String,
    quote_amount: String,
}

async fn withdraw_info(
    State(state): State<ApiState>,
    axum::Extension(customer): axum::Extension<AuthedCustomer>,
    Query(q): Query<WithdrawInfoQuery>,
) -> Response {
    if let Err(resp) = authorize_user(&state, &customer, &q.user_id).await {
        return resp;
    }
    let handler = match resolve_handler(&state, &q.network).await {
        Ok(h) => h,
        Err(resp) => return resp,
    };
    let api_key = match crypto::decrypt_to_string(&state.db_secret_key, &handler.api_key) {
        Ok(k) => k,
        Err(e) => return error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    };
    match state
        .handler
        .get_withdraw_info(&handler.server_url, &api_key, &q.user_id, &q.quote_amount)
        .await
    {
        Ok(v) => Json(v).into_response(),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}

#[derive(Deserialize)]
struct CreateWithdrawalBody {
    user_id: String,
    network: String,
    contract_address: String,
    address: String,
    quote_amount: String,
    user_currency: String,
}

async fn create_withdrawal(
    State(state): State<ApiState>,
    axum::Extension(customer): axum::Extension<AuthedCustomer>,
    Json(body): Json<CreateWithdrawalBody>,
) -> Response {
    if let Err(resp) = authorize_user(&state, &customer, &body.user_id).await {
        return resp;
    }
    let handler = match resolve_handler(&state, &body.network).await {
        Ok(h) => h,
        Err(resp) => return resp,
    };
    let api_key = match crypto::decrypt_to_string(&state.db_secret_key, &handler.api_key) {
        Ok(k) => k,
        Err(e) => return error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    };
    match state
        .handler
        .create_withdrawal(
            &handler.server_url,
            &api_key,
            &body.user_id,
            &body.contract_address,
            &body.address,
            &body.quote_amount,
            &body.user_currency,
        )
        .await
    {
        Ok(v) => Json(v).into_response(),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}

#[derive(Deserialize)]
struct CallbackBody {
    callback_id: String,
    user_id: String,
    path: String,
    json_data: serde_json::Value,
}

/// Called by Handlers (not customers), authenticated by a Handler-specific
/// credential (§6 "Handler → Dispatcher").
async fn private_callback(State(state): State<ApiState>, headers: HeaderMap, Json(body): Json<CallbackBody>) -> Response {
    let Some(provided) = headers.get("Api-Key").and_then(|v| v.to_str().ok()) else {
        return error_response(StatusCode::UNAUTHORIZED, "missing Api-Key header");
    };
    if !state.handler_api_keys.contains(provided) {
        return error_response(StatusCode::UNAUTHORIZED, "invalid Api-Key");
    }
    match state
        .store
        .enqueue_callback(&body.callback_id, &body.user_id, &body.path, &body.json_data)
        .await
    {
        Ok(true) => Json(json!({})).into_response(),
        Ok(false) => error_response(StatusCode::CONFLICT, "callback_id already registered"),
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
