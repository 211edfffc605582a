//! Provider/chain error taxonomy.
//!
//! Mirrors the exception hierarchy the original Python `web3_client` raised
//! (`AlreadyKnown`, `UnderpricedTransaction`, `StuckTransaction`, …) as a flat
//! `thiserror` enum so conductors can `match` exhaustively on recoverable vs.
//! critical variants instead of catching a generic exception type.

use thiserror::Error;

/// Everything a chain client operation can fail with.
#[derive(Debug, Error)]
pub enum ChainError {
    /// The node already has a transaction with this nonce in its mempool.
    #[error("transaction with nonce {nonce} is already known")]
    AlreadyKnown { nonce: u64 },

    /// A replacement transaction was submitted with too low a fee bump.
    #[error("replacement transaction for nonce {nonce} is underpriced")]
    UnderpricedTransaction { nonce: u64 },

    /// Signer does not have enough native balance to pay for this transaction.
    #[error("address {address} has insufficient funds for transaction")]
    InsufficientFundsForTx { address: String },

    /// Transaction was mined but its receipt reports failure.
    #[error("transaction {hash} failed on-chain")]
    TransactionFailed { hash: String },

    /// Transaction has been visible for longer than the mined-wait budget
    /// with no block index. Requires operator intervention — never retried
    /// automatically.
    #[error("transaction {hash} (nonce {nonce}) is stuck")]
    StuckTransaction { hash: String, nonce: u64 },

    /// The hash is not known to the node (used up after the broadcast
    /// lifecycle's bounded polling windows expire).
    #[error("transaction {hash} not found")]
    TransactionNotFound { hash: String },

    /// Submit observed a network error. The transaction may or may not have
    /// landed — the hash is known, the outcome isn't.
    #[error("connection error submitting transaction {hash}")]
    ProviderConnectionErrorOnTx { hash: String },

    /// No enabled provider exists in the pool.
    #[error("no provider available")]
    NoProviderAvailable,

    /// Any other non-2xx/JSON-RPC-error response from a provider.
    #[error("provider HTTP error: {0}")]
    ProviderHTTPError(String),

    /// Transport-level failure not tied to a specific transaction (reads,
    /// not submits) — always recoverable with a retry.
    #[error("provider connection error: {0}")]
    ProviderConnectionError(String),

    #[error(transparent)]
    Other(#[from] eyre::Error),
}

impl ChainError {
    /// Errors for which a conductor should rebuild and retry with a fresh
    /// transaction (bump the retry window, clear `tx_hash_out`).
    pub fn is_recoverable_rebuild(&self) -> bool {
        matches!(
            self,
            ChainError::AlreadyKnown { .. }
                | ChainError::UnderpricedTransaction { .. }
                | ChainError::InsufficientFundsForTx { .. }
                | ChainError::TransactionFailed { .. }
        )
    }

    /// Errors where the transaction may have landed; poll the known hash
    /// again next tick instead of rebuilding.
    pub fn is_connection_error_on_tx(&self) -> bool {
        matches!(self, ChainError::ProviderConnectionErrorOnTx { .. })
    }

    /// Errors that require operator attention and must never be retried
    /// automatically.
    pub fn is_critical(&self) -> bool {
        matches!(self, ChainError::StuckTransaction { .. })
    }
}
