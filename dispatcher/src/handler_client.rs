//! Per-handler RPC client (§2 "Dispatcher components"): fans customer
//! requests out to the named network's Handler HTTP surface (§6), using
//! the per-handler API key from that Handler's `network_handlers` row.

use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HandlerClientError {
    #[error("request to handler {path} failed: {source}")]
    Request {
        path: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("handler {path} returned {status}")]
    Status { path: String, status: StatusCode },
    #[error("failed to parse handler {path} response as JSON: {source}")]
    Decode {
        path: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("handler {path} response was missing an expected field: {field}")]
    Malformed { path: String, field: String },
}

impl HandlerClientError {
    /// The handler reported that the user has no deposit address yet
    /// (§6 "/get_deposit_info"): the caller should provision one via
    /// `/add_account` and retry.
    pub fn is_missing_account(&self) -> bool {
        matches!(self, HandlerClientError::Status { status, .. } if *status == StatusCode::BAD_REQUEST)
    }
}

pub type Result<T> = std::result::Result<T, HandlerClientError>;

#[derive(Clone)]
pub struct HandlerClient {
    http: reqwest::Client,
}

impl HandlerClient {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    fn url(server_url: &str, path: &str) -> String {
        format!("{}{path}", server_url.trim_end_matches('/'))
    }

    async fn get(&self, server_url: &str, api_key: &str, path: &str, query: &[(&str, &str)]) -> Result<Value> {
        let resp = self
            .http
            .get(Self::url(server_url, path))
            .header("Api-Key", api_key)
            .query(query)
            .send()
            .await
            .map_err(|source| HandlerClientError::Request { path: path.to_string(), source })?;
        if !resp.status().is_success() {
            return Err(HandlerClientError::Status { path: path.to_string(), status: resp.status() });
        }
        resp.json().await.map_err(|source| HandlerClientError::Decode { path: path.to_string(), source })
    }

    async fn post(&self, server_url: &str, api_key: &str, path: &str, body: &Value) -> Result<Value> {
        let resp = self
            .http
            .post(Self::url(server_url, path))
            .header("Api-Key", api_key)
            .json(body)
            .send()
            .await
            .map_err(|source| HandlerClientError::Request { path: path.to_string(), source })?;
        if !resp.status().is_success() {
            return Err(HandlerClientError::Status { path: path.to_string(), status: resp.status() });
        }
        resp.json().await.map_err(|source| HandlerClientError::Decode { path: path.to_string(), source })
    }

    pub async fn add_account(&self, server_url: &str, api_key: &str, user_id: &str) -> Result<String> {
        let body = serde_json::json!({ "user_id": user_id });
        let resp = self.post(server_url, api_key, "/add_account", &body).await?;
        resp.get("address").and_then(Value::as_str).map(str::to_string).ok_or_else(|| HandlerClientError::Malformed {
            path: "/add_account".to_string(),
            field: "address".to_string(),
        })
    }

    pub async fn get_deposit_info(&self, server_url: &str, api_key: &str, user_id: &str) -> Result<Value> {
        self.get(server_url, api_key, "/get_deposit_info", &[("user_id", user_id)]).await
    }

    pub async fn get_withdraw_info(
        &self,
        server_url: &str,
        api_key: &str,
        user_id: &str,
        quote_amount: &str,
    ) -> Result<Value> {
        self.get(
            server_url,
            api_key,
            "/get_withdraw_info",
            &[("user_id", user_id), ("quote_amount", quote_amount)],
        )
        .await
    }

    pub async fn create_withdrawal(
        &self,
        server_url: &str,
        api_key: &str,
        user_id: &str,
        contract_address: &str,
        address: &str,
        quote_amount: &str,
        user_currency: &str,
    ) -> Result<Value> {
        let body = serde_json::json!({
            "user_id": user_id,
            "contract_address": contract_address,
            "address": address,
            "quote_amount": quote_amount,
            "user_currency": user_currency,
        });
        self.post(server_url, api_key, "/create_withdrawal", &body).await
    }
}
