//! Chain client (C2): a typed façade over one provider pool, uniform across
//! the EVM and TVM-analog backends so the Handler's scanner and conductors
//! are chain-agnostic.

use async_trait::async_trait;

use crate::error::ChainError;
use crate::types::{NativeTransfer, TransferLog};

/// A signed, broadcast-ready transaction plus enough context to poll it to a
/// terminal state.
#[derive(Debug, Clone)]
pub struct SignedTx {
    pub raw_hex: String,
    pub nonce: u64,
}

/// Typed façade over one chain. Implemented once for EVM (alloy) and once
/// for the TVM-analog backend (cosmrs/tendermint-rpc); the Handler only ever
/// holds a `dyn ChainClient`.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// `latest_block_number() -> u64`
    async fn latest_block_number(&self) -> Result<u64, ChainError>;

    /// Native-currency transfers found in a full block, pre-filtered to
    /// plain transfers (no calldata on EVM, bare `TransferContract` on TVM).
    async fn native_transfers_in_block(&self, number: u64) -> Result<Vec<NativeTransfer>, ChainError>;

    /// `Transfer(address,address,uint256)` logs for exactly `[from, to]`.
    async fn transfer_logs(&self, from_block: u64, to_block: u64) -> Result<Vec<TransferLog>, ChainError>;

    /// `get_account_balance(addr) -> u128`
    async fn get_account_balance(&self, address: &str) -> Result<u128, ChainError>;

    /// `get_transaction_count(addr) -> u64` (EVM nonce; no-op returning 0 on TVM)
    async fn get_transaction_count(&self, address: &str) -> Result<u64, ChainError>;

    /// `gas_price() -> u128`
    async fn gas_price(&self) -> Result<u128, ChainError>;

    /// Build, sign, and broadcast a native transfer, then drive it through
    /// the full `broadcast_and_wait` lifecycle to a terminal hash.
    async fn send_native(
        &self,
        to: &str,
        amount: u128,
        signer_key: &str,
        gas_price: u128,
        gas_limit: u64,
    ) -> Result<String, ChainError>;

    /// Poll an already-submitted hash (the `ProviderConnectionErrorOnTx`
    /// recovery path) to a terminal state without rebuilding the transaction.
    async fn result(&self, tx_hash: &str) -> Result<String, ChainError>;

    async fn allowance(&self, token: &str, owner: &str, spender: &str) -> Result<u128, ChainError>;

    async fn balance_of(&self, token: &str, owner: &str) -> Result<u128, ChainError>;

    async fn approve(
        &self,
        token: &str,
        spender: &str,
        amount: u128,
        signer_key: &str,
        gas_price: u128,
    ) -> Result<String, ChainError>;

    async fn transfer_from(
        &self,
        token: &str,
        from: &str,
        to: &str,
        amount: u128,
        signer_key: &str,
        gas_price: u128,
    ) -> Result<String, ChainError>;

    async fn token_transfer(
        &self,
        token: &str,
        to: &str,
        amount: u128,
        signer_key: &str,
        gas_price: u128,
    ) -> Result<String, ChainError>;

    /// Canonical lowercased/hex form for an address, used as the cache key
    /// for `user_accounts`/`handler_accounts` snapshots.
    fn canonicalize_address(&self, address: &str) -> String {
        address.to_lowercase()
    }

    /// Derives the public address for a private key without any network
    /// call — used once at bootstrap to seed each freshly derived
    /// SADMIN/APPROVE/USER keypair's address column.
    fn address_from_private_key(&self, private_key: &str) -> Result<String, ChainError>;
}
