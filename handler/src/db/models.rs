//! Store data model (§3): coins, users, user addresses, deposits,
//! withdrawals, balances, blocks.
//!
//! Grounded on the teacher's own `models.rs` shape (plain `FromRow` structs,
//! a `New*` struct per insert path) but replacing the bridge-monorepo's
//! EVM/Terra message schema with the custodial handler's deposit/withdrawal
//! schema from the specification.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// `"native"` is the reserved contract address denoting the chain's base asset.
pub const NATIVE_COIN: &str = "native";

/// A user's role within the handler. Partitioned as an integer per Design
/// Notes rather than folded into one shared enum-as-values bag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum Role {
    User = 10,
    Approve = 11,
    Sadmin = 12,
}

impl Role {
    pub fn from_i32(v: i32) -> Option<Role> {
        match v {
            10 => Some(Role::User),
            11 => Some(Role::Approve),
            12 => Some(Role::Sadmin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Coin {
    pub contract_address: String,
    pub name: String,
    pub decimals: i32,
    pub min_amount: bigdecimal::BigDecimal,
    pub fee_amount: bigdecimal::BigDecimal,
    pub current_rate: Option<bigdecimal::BigDecimal>,
    pub is_active: bool,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub role: i32,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct UserAddress {
    pub id: i32,
    pub user_id: String,
    pub public: String,
    /// AES-EAX ciphertext with trailing 16-byte nonce.
    pub private: Vec<u8>,
    pub admin_id: Option<i32>,
    pub approve_id: Option<i32>,
    pub locked_by_tx: bool,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Deposit {
    pub id: Uuid,
    pub address_id: i32,
    pub contract_address: String,
    pub tx_hash_in: String,
    pub amount: bigdecimal::BigDecimal,
    pub quote_amount: bigdecimal::BigDecimal,
    pub tx_hash_out: Option<String>,
    /// Set to `"ProviderConnectionErrorOnTx"` when `tx_hash_out` holds a
    /// hash of unknown confirmation status rather than a confirmed sweep;
    /// cleared on a confirmed success so the row is never re-claimed.
    pub last_tx_error: Option<String>,
    pub locked_by_tx_handler: bool,
    pub locked_by_callback: bool,
    pub is_notified: bool,
    pub time_to_tx_handler: DateTime<Utc>,
    pub tx_handler_period: i32,
    pub time_to_callback: DateTime<Utc>,
    pub callback_period: i32,
    pub created_at: DateTime<Utc>,
}

/// A deposit row joined with enough of its `UserAddress`/`User` context for a
/// conductor to act on it without a second round trip.
#[derive(Debug, Clone, FromRow)]
pub struct DepositForTx {
    pub id: Uuid,
    pub address_id: i32,
    pub contract_address: String,
    pub amount: bigdecimal::BigDecimal,
    pub tx_hash_out: Option<String>,
    pub tx_handler_period: i32,
    pub user_public: String,
    pub user_private: Vec<u8>,
    pub admin_public: String,
    pub approve_id: Option<i32>,
    pub approve_public: Option<String>,
    pub approve_private: Option<Vec<u8>>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Withdrawal {
    pub id: Uuid,
    pub user_id: String,
    pub contract_address: String,
    pub withdrawal_address: String,
    pub amount: bigdecimal::BigDecimal,
    pub quote_amount: bigdecimal::BigDecimal,
    pub user_currency: String,
    pub admin_addr_id: Option<i32>,
    pub tx_hash_out: Option<String>,
    pub locked_by_callback: bool,
    pub is_notified: bool,
    pub time_to_callback: DateTime<Utc>,
    pub callback_period: i32,
    pub time_to_tx_handler: DateTime<Utc>,
    pub tx_handler_period: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct WithdrawalForTx {
    pub id: Uuid,
    pub contract_address: String,
    pub withdrawal_address: String,
    pub amount: bigdecimal::BigDecimal,
    pub tx_handler_period: i32,
    pub admin_id: i32,
    pub admin_public: String,
    pub admin_private: Vec<u8>,
}

#[derive(Debug, Clone, FromRow)]
pub struct Balance {
    pub address_id: i32,
    pub contract_address: String,
    pub balance: bigdecimal::BigDecimal,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Block {
    pub id: i64,
    pub deposit_count: i32,
    pub withdrawal_count: i32,
}

/// A new deposit prepared by the scanner, not yet persisted.
#[derive(Debug, Clone)]
pub struct NewDeposit {
    pub address_id: i32,
    pub contract_address: String,
    pub tx_hash_in: String,
    pub amount: bigdecimal::BigDecimal,
    pub quote_amount: bigdecimal::BigDecimal,
}

/// One (address, coin, amount) projection used by the callback payload and
/// by `/get_handler_info`-style responses.
#[derive(Debug, Clone, Serialize)]
pub struct CoinInfo {
    pub name: String,
    pub decimal: i32,
    pub min_amount: String,
    pub is_active: bool,
}

/// A deposit row joined with the owning user's id and the coin's decimals,
/// just enough for the notifier to build a display-rounded callback payload
/// without a second round trip per row.
#[derive(Debug, Clone, FromRow)]
pub struct DepositForCallback {
    pub id: Uuid,
    pub user_id: String,
    pub contract_address: String,
    pub tx_hash_in: String,
    pub tx_hash_out: Option<String>,
    pub amount: bigdecimal::BigDecimal,
    pub quote_amount: bigdecimal::BigDecimal,
    pub decimals: i32,
    /// Coin's exchange rate at callback time, used to pick the display
    /// rounding (`get_round_for_rate`) rather than a fixed two decimals.
    pub current_rate: Option<bigdecimal::BigDecimal>,
}

/// Same projection for withdrawals.
#[derive(Debug, Clone, FromRow)]
pub struct WithdrawalForCallback {
    pub id: Uuid,
    pub user_id: String,
    pub contract_address: String,
    pub withdrawal_address: String,
    pub tx_hash_out: Option<String>,
    pub amount: bigdecimal::BigDecimal,
    pub quote_amount: bigdecimal::BigDecimal,
    pub user_currency: String,
    pub decimals: i32,
    pub current_rate: Option<bigdecimal::BigDecimal>,
}
