//! EVM chain support.
//!
//! - `contracts` — the ERC20 contract binding (`alloy::sol!`) used for token
//!   sweeps and withdrawals.
//! - `client` — the concrete `ChainClient` implementation over an alloy
//!   `RootProvider`.

pub mod client;
pub mod contracts;

pub use client::EvmChainClient;
pub use contracts::ERC20;
