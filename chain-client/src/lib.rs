//! chain-client: the custodial bridge handler's chain-agnostic façade (C1/C2).
//!
//! - **`chain`** — the [`chain::ChainClient`] trait every Handler job programs
//!   against: block/log/receipt reads, balance reads, signed native/contract
//!   transactions, and the `broadcast_and_wait` lifecycle.
//! - **`error`** — the provider/chain error taxonomy ([`error::ChainError`])
//!   conductors match on to decide retry vs. critical-log.
//! - **`provider`** — the provider pool (C1): N upstream RPC endpoints,
//!   uniform-random selection, per-endpoint telemetry.
//! - **`types`** — chain-agnostic value types (`TransferLog`, `NativeTransfer`).
//! - **`evm`** — the alloy-based `ChainClient` for any Ethereum-JSON-RPC chain.
//! - **`terra`** — the cosmrs/tendermint-rpc-based `ChainClient` for the
//!   TVM-analog (CosmWasm) chain, with CW20 standing in for ERC20/TRC20.

pub mod chain;
pub mod error;
pub mod provider;
pub mod redact;
pub mod types;

#[cfg(feature = "evm")]
pub mod evm;

#[cfg(feature = "tvm")]
pub mod terra;

pub use chain::{ChainClient, SignedTx};
pub use error::ChainError;
pub use provider::{parse_api_keys, parse_rpc_urls, Endpoint, ProviderPool};
pub use redact::Redacted;
pub use types::{NativeTransfer, ReceiptStatus, ScannedBlock, TransferLog, TxHash, TRANSFER_EVENT_TOPIC};
