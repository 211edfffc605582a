//! Chain-agnostic value types shared by the EVM and TVM clients.

use serde::{Deserialize, Serialize};

/// The ERC20/TRC20 `Transfer(address,address,uint256)` event topic, computed
/// once and reused for every log filter.
pub const TRANSFER_EVENT_TOPIC: &str =
    "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

/// A single ERC20/TRC20 `Transfer` log, already decoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferLog {
    pub contract_address: String,
    pub from: String,
    pub to: String,
    pub amount: u128,
    pub tx_hash: String,
    pub removed: bool,
}

/// A plain native-currency transfer found in a full block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NativeTransfer {
    pub from: String,
    pub to: String,
    pub amount: u128,
    pub tx_hash: String,
    /// `true` when the transaction's receipt reports success.
    pub status_success: bool,
}

/// The subset of a full block's contents the scanner needs.
#[derive(Debug, Clone)]
pub struct ScannedBlock {
    pub number: u64,
    pub native_transfers: Vec<NativeTransfer>,
}

/// Outcome of `broadcast_and_wait`: the transaction hash of a transaction
/// that reached a terminal, successful state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxHash(pub String);

impl std::fmt::Display for TxHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Receipt status as reported by the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptStatus {
    Success,
    Failed,
}
