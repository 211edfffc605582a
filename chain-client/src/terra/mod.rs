//! TVM-analog (CosmWasm) chain support.
//!
//! - `tokens` — CW20 message builders and LCD query helpers, standing in
//!   for ERC20/TRC20.
//! - `client` — the concrete `ChainClient` implementation over cosmrs +
//!   the LCD REST API.

pub mod client;
pub mod tokens;

pub use client::TerraChainClient;
