//! Dispatcher persistence schema (§3 "Dispatcher schema", supplemented from
//! `original_source/proc_api`): customers, dispatcher-side users, enqueued
//! callbacks, and the per-network Handler registry.
//!
//! Grounded on the Handler's own `db::models` shape (plain `FromRow`
//! structs, no hand-rolled mapping).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum Role {
    User = 10,
    Approve = 11,
    Sadmin = 12,
}

#[derive(Debug, Clone, FromRow)]
pub struct Customer {
    pub id: Uuid,
    pub callback_url: String,
    /// AES-EAX ciphertext with trailing 16-byte nonce.
    pub callback_api_key: Vec<u8>,
    /// SHA-256 hex digest of the raw API key the customer was issued.
    pub api_key_hash: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct DispatcherUser {
    pub id: String,
    pub role: i32,
    pub customer_id: Option<Uuid>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Callback {
    pub id: String,
    pub user_id: String,
    pub path: String,
    pub json_data: serde_json::Value,
    pub is_notified: bool,
    pub locked_by_callback: bool,
    pub time_to_callback: DateTime<Utc>,
    pub callback_period: i32,
}

/// A callback row joined with the owning customer's delivery target, just
/// enough for the callback worker to act on it without a second round trip.
#[derive(Debug, Clone, FromRow)]
pub struct CallbackForDelivery {
    pub id: String,
    pub user_id: String,
    pub path: String,
    pub json_data: serde_json::Value,
    pub callback_period: i32,
    pub callback_url: String,
    pub callback_api_key: Vec<u8>,
}

#[derive(Debug, Clone, FromRow)]
pub struct NetworkHandler {
    pub name: String,
    pub display_name: String,
    pub server_url: String,
    /// AES-EAX ciphertext with trailing 16-byte nonce.
    pub api_key: Vec<u8>,
    pub is_active: bool,
}
