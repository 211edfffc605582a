//! Concrete `ChainClient` for EVM chains, built on alloy.
//!
//! Grounded on the teacher's `EvmClientReadOnly`/`EvmClientWithSigner` split
//! (one-shot providers, no pinned connection — the provider pool hands out a
//! disposable endpoint every call) and on `web3_client.providers`/
//! `web3_client.async_client` for the broadcast/poll lifecycle and the
//! provider error taxonomy.

use std::sync::Arc;
use std::time::{Duration, Instant};

use alloy::{
    network::{EthereumWallet, TransactionBuilder},
    primitives::{Address, U256},
    providers::{Provider, ProviderBuilder, RootProvider},
    rpc::types::{Filter, TransactionRequest},
    signers::local::PrivateKeySigner,
    transports::http::{Client as HttpClient, Http},
};
use async_trait::async_trait;
use tracing::{debug, info};

use crate::chain::ChainClient;
use crate::error::ChainError;
use crate::evm::contracts::ERC20;
use crate::provider::ProviderPool;
use crate::types::{NativeTransfer, TransferLog, TRANSFER_EVENT_TOPIC};

/// Bounded wait budgets for the broadcast/poll lifecycle, per the chain
/// client contract: submit once, poll mempool, poll mined, fetch receipt.
const MEMPOOL_WAIT: Duration = Duration::from_secs(120);
const MEMPOOL_POLL_INTERVAL: Duration = Duration::from_secs(3);
const MINED_WAIT: Duration = Duration::from_secs(60);
const MINED_POLL_INTERVAL: Duration = Duration::from_secs(3);
const RECEIPT_WAIT: Duration = Duration::from_secs(30);
const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(2);

type ReadProvider = RootProvider<Http<HttpClient>>;
#[allow(clippy::type_complexity)]
type SignerProvider = alloy::providers::fillers::FillProvider<
    alloy::providers::fillers::JoinFill<
        alloy::providers::Identity,
        alloy::providers::fillers::WalletFiller<EthereumWallet>,
    >,
    ReadProvider,
    Http<HttpClient>,
    alloy::network::Ethereum,
>;

pub struct EvmChainClient {
    pool: Arc<ProviderPool>,
    chain_id: u64,
}

impl EvmChainClient {
    pub fn new(pool: Arc<ProviderPool>, chain_id: u64) -> Self {
        Self { pool, chain_id }
    }

    fn read_provider(&self) -> Result<ReadProvider, ChainError> {
        let endpoint = self.pool.get()?;
        let url = endpoint
            .url()
            .parse()
            .map_err(|e| ChainError::ProviderHTTPError(format!("invalid provider url: {e}")))?;
        Ok(ProviderBuilder::new().on_http(url))
    }

    fn address_from_private_key_impl(private_key: &str) -> Result<Address, ChainError> {
        let signer: PrivateKeySigner = private_key
            .parse()
            .map_err(|e| ChainError::ProviderHTTPError(format!("invalid private key: {e}")))?;
        Ok(signer.address())
    }

    fn signer_provider(&self, private_key: &str) -> Result<(SignerProvider, Address), ChainError> {
        let signer: PrivateKeySigner = private_key
            .parse()
            .map_err(|e| ChainError::ProviderHTTPError(format!("invalid private key: {e}")))?;
        let address = signer.address();
        let wallet = EthereumWallet::from(signer);
        let endpoint = self.pool.get()?;
        let url = endpoint
            .url()
            .parse()
            .map_err(|e| ChainError::ProviderHTTPError(format!("invalid provider url: {e}")))?;
        let provider = ProviderBuilder::new().wallet(wallet).on_http(url);
        Ok((provider, address))
    }

    /// Drives an already-broadcast hash through mempool -> mined -> receipt.
    /// Shared by `send_native`, the ERC20 write paths and `result` (the
    /// `ProviderConnectionErrorOnTx` recovery path, which skips straight to
    /// this without resubmitting).
    async fn poll_to_terminal(&self, provider: &ReadProvider, tx_hash: &str) -> Result<String, ChainError> {
        let hash: alloy::primitives::B256 = tx_hash
            .parse()
            .map_err(|e| ChainError::ProviderHTTPError(format!("invalid tx hash: {e}")))?;

        let start = Instant::now();
        loop {
            match provider.get_transaction_by_hash(hash).await {
                Ok(Some(_)) => break,
                Ok(None) => {
                    if start.elapsed() > MEMPOOL_WAIT {
                        return Err(ChainError::TransactionNotFound {
                            hash: tx_hash.to_string(),
                        });
                    }
                    tokio::time::sleep(MEMPOOL_POLL_INTERVAL).await;
                }
                Err(e) => return Err(ChainError::ProviderConnectionErrorOnTx { hash: tx_hash.to_string() }.context(e)),
            }
        }

        let start = Instant::now();
        let nonce = loop {
            match provider.get_transaction_by_hash(hash).await {
                Ok(Some(tx)) => {
                    if tx.block_number.is_some() {
                        break tx.nonce;
                    }
                    if start.elapsed() > MINED_WAIT {
                        return Err(ChainError::StuckTransaction {
                            hash: tx_hash.to_string(),
                            nonce: tx.nonce,
                        });
                    }
                    tokio::time::sleep(MINED_POLL_INTERVAL).await;
                }
                Ok(None) => {
                    return Err(ChainError::TransactionNotFound {
                        hash: tx_hash.to_string(),
                    })
                }
                Err(e) => return Err(ChainError::ProviderConnectionErrorOnTx { hash: tx_hash.to_string() }.context(e)),
            }
        };
        let _ = nonce;

        let start = Instant::now();
        loop {
            match provider.get_transaction_receipt(hash).await {
                Ok(Some(receipt)) => {
                    if receipt.status() {
                        return Ok(tx_hash.to_string());
                    }
                    return Err(ChainError::TransactionFailed {
                        hash: tx_hash.to_string(),
                    });
                }
                Ok(None) => {
                    if start.elapsed() > RECEIPT_WAIT {
                        return Err(ChainError::TransactionNotFound {
                            hash: tx_hash.to_string(),
                        });
                    }
                    tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
                }
                Err(e) => return Err(ChainError::ProviderConnectionErrorOnTx { hash: tx_hash.to_string() }.context(e)),
            }
        }
    }

    /// Classifies a raw alloy submit error into the taxonomy the conductors
    /// match on, the way `web3_client.providers` inspected the JSON-RPC
    /// error message prefix.
    fn classify_send_error(err: &alloy::transports::TransportError, nonce: u64, from: &str) -> ChainError {
        let msg = err.to_string();
        let lower = msg.to_lowercase();
        if lower.contains("already known") {
            ChainError::AlreadyKnown { nonce }
        } else if lower.contains("replacement transaction underpriced") {
            ChainError::UnderpricedTransaction { nonce }
        } else if lower.contains("insufficient funds") {
            ChainError::InsufficientFundsForTx {
                address: from.to_string(),
            }
        } else {
            ChainError::ProviderConnectionError(msg)
        }
    }
}

/// Small helper so `poll_to_terminal` can attach the underlying transport
/// error as context without losing the `_OnTx` variant's semantics.
trait WithContext {
    fn context(self, err: impl std::fmt::Display) -> Self;
}

impl WithContext for ChainError {
    fn context(self, err: impl std::fmt::Display) -> Self {
        match self {
            ChainError::ProviderConnectionErrorOnTx { hash } => {
                ChainError::ProviderConnectionErrorOnTx { hash: format!("{hash} ({err})") }
            }
            other => other,
        }
    }
}

#[async_trait]
impl ChainClient for EvmChainClient {
    async fn latest_block_number(&self) -> Result<u64, ChainError> {
        let provider = self.read_provider()?;
        provider
            .get_block_number()
            .await
            .map_err(|e| ChainError::ProviderConnectionError(e.to_string()))
    }

    async fn native_transfers_in_block(&self, number: u64) -> Result<Vec<NativeTransfer>, ChainError> {
        let provider = self.read_provider()?;
        let block = provider
            .get_block_by_number(number.into(), true.into())
            .await
            .map_err(|e| ChainError::ProviderConnectionError(e.to_string()))?
            .ok_or_else(|| ChainError::ProviderHTTPError(format!("block {number} not found")))?;

        let mut transfers = Vec::new();
        for tx in block.transactions.into_transactions() {
            if tx.input.is_empty() {
                let receipt = provider
                    .get_transaction_receipt(tx.hash)
                    .await
                    .map_err(|e| ChainError::ProviderConnectionError(e.to_string()))?;
                let status_success = receipt.map(|r| r.status()).unwrap_or(false);
                transfers.push(NativeTransfer {
                    from: format!("{:#x}", tx.from),
                    to: tx.to.map(|a| format!("{:#x}", a)).unwrap_or_default(),
                    amount: tx.value.try_into().unwrap_or(u128::MAX),
                    tx_hash: format!("{:#x}", tx.hash),
                    status_success,
                });
            }
        }
        Ok(transfers)
    }

    async fn transfer_logs(&self, from_block: u64, to_block: u64) -> Result<Vec<TransferLog>, ChainError> {
        let provider = self.read_provider()?;
        let topic: alloy::primitives::B256 = TRANSFER_EVENT_TOPIC
            .parse()
            .expect("transfer topic constant is a valid B256");
        let filter = Filter::new()
            .from_block(from_block)
            .to_block(to_block)
            .event_signature(topic);

        let logs = provider
            .get_logs(&filter)
            .await
            .map_err(|e| ChainError::ProviderConnectionError(e.to_string()))?;

        let mut out = Vec::new();
        for log in logs {
            if log.removed {
                continue;
            }
            let topics = log.topics();
            if topics.len() < 3 {
                continue;
            }
            let to = Address::from_word(topics[2]);
            let amount = U256::from_be_slice(log.data().data.as_ref());
            out.push(TransferLog {
                contract_address: format!("{:#x}", log.address()),
                from: format!("{:#x}", Address::from_word(topics[1])),
                to: format!("{:#x}", to),
                amount: amount.try_into().unwrap_or(u128::MAX),
                tx_hash: log
                    .transaction_hash
                    .map(|h| format!("{:#x}", h))
                    .unwrap_or_default(),
                removed: log.removed,
            });
        }
        Ok(out)
    }

    async fn get_account_balance(&self, address: &str) -> Result<u128, ChainError> {
        let provider = self.read_provider()?;
        let addr: Address = address
            .parse()
            .map_err(|e| ChainError::ProviderHTTPError(format!("invalid address: {e}")))?;
        let balance = provider
            .get_balance(addr)
            .await
            .map_err(|e| ChainError::ProviderConnectionError(e.to_string()))?;
        Ok(balance.try_into().unwrap_or(u128::MAX))
    }

    async fn get_transaction_count(&self, address: &str) -> Result<u64, ChainError> {
        let provider = self.read_provider()?;
        let addr: Address = address
            .parse()
            .map_err(|e| ChainError::ProviderHTTPError(format!("invalid address: {e}")))?;
        provider
            .get_transaction_count(addr)
            .await
            .map_err(|e| ChainError::ProviderConnectionError(e.to_string()))
    }

    async fn gas_price(&self) -> Result<u128, ChainError> {
        let provider = self.read_provider()?;
        provider
            .get_gas_price()
            .await
            .map_err(|e| ChainError::ProviderConnectionError(e.to_string()))
    }

    async fn send_native(
        &self,
        to: &str,
        amount: u128,
        signer_key: &str,
        gas_price: u128,
        gas_limit: u64,
    ) -> Result<String, ChainError> {
        let (provider, from) = self.signer_provider(signer_key)?;
        let to_addr: Address = to
            .parse()
            .map_err(|e| ChainError::ProviderHTTPError(format!("invalid address: {e}")))?;
        let nonce = provider
            .get_transaction_count(from)
            .await
            .map_err(|e| ChainError::ProviderConnectionError(e.to_string()))?;

        let tx = TransactionRequest::default()
            .with_to(to_addr)
            .with_value(U256::from(amount))
            .with_gas_price(gas_price)
            .with_gas_limit(gas_limit)
            .with_nonce(nonce)
            .with_chain_id(self.chain_id);

        info!(%from, %to, amount, "submitting native transfer");
        let pending = provider
            .send_transaction(tx)
            .await
            .map_err(|e| Self::classify_send_error(&e, nonce, &format!("{from:#x}")))?;
        let hash = format!("{:#x}", *pending.tx_hash());
        self.poll_to_terminal(&provider.root().clone(), &hash).await
    }

    async fn result(&self, tx_hash: &str) -> Result<String, ChainError> {
        let provider = self.read_provider()?;
        self.poll_to_terminal(&provider, tx_hash).await
    }

    async fn allowance(&self, token: &str, owner: &str, spender: &str) -> Result<u128, ChainError> {
        let provider = self.read_provider()?;
        let token_addr: Address = token
            .parse()
            .map_err(|e| ChainError::ProviderHTTPError(format!("invalid token address: {e}")))?;
        let owner_addr: Address = owner
            .parse()
            .map_err(|e| ChainError::ProviderHTTPError(format!("invalid owner address: {e}")))?;
        let spender_addr: Address = spender
            .parse()
            .map_err(|e| ChainError::ProviderHTTPError(format!("invalid spender address: {e}")))?;
        let erc20 = ERC20::new(token_addr, &provider);
        let result = erc20
            .allowance(owner_addr, spender_addr)
            .call()
            .await
            .map_err(|e| ChainError::ProviderConnectionError(e.to_string()))?;
        Ok(result._0.try_into().unwrap_or(u128::MAX))
    }

    async fn balance_of(&self, token: &str, owner: &str) -> Result<u128, ChainError> {
        let provider = self.read_provider()?;
        let token_addr: Address = token
            .parse()
            .map_err(|e| ChainError::ProviderHTTPError(format!("invalid token address: {e}")))?;
        let owner_addr: Address = owner
            .parse()
            .map_err(|e| ChainError::ProviderHTTPError(format!("invalid owner address: {e}")))?;
        let erc20 = ERC20::new(token_addr, &provider);
        let result = erc20
            .balanceOf(owner_addr)
            .call()
            .await
            .map_err(|e| ChainError::ProviderConnectionError(e.to_string()))?;
        Ok(result._0.try_into().unwrap_or(u128::MAX))
    }

    async fn approve(
        &self,
        token: &str,
        spender: &str,
        amount: u128,
        signer_key: &str,
        gas_price: u128,
    ) -> Result<String, ChainError> {
        let (provider, from) = self.signer_provider(signer_key)?;
        let token_addr: Address = token
            .parse()
            .map_err(|e| ChainError::ProviderHTTPError(format!("invalid token address: {e}")))?;
        let spender_addr: Address = spender
            .parse()
            .map_err(|e| ChainError::ProviderHTTPError(format!("invalid spender address: {e}")))?;
        let erc20 = ERC20::new(token_addr, &provider);
        debug!(%from, %spender, amount, "submitting approve");
        let pending = erc20
            .approve(spender_addr, U256::from(amount))
            .gas_price(gas_price)
            .send()
            .await
            .map_err(|e| ChainError::ProviderConnectionError(format!("approve submit failed: {e}")))?;
        let hash = format!("{:#x}", *pending.tx_hash());
        self.poll_to_terminal(&provider.root().clone(), &hash).await
    }

    async fn transfer_from(
        &self,
        token: &str,
        from: &str,
        to: &str,
        amount: u128,
        signer_key: &str,
        gas_price: u128,
    ) -> Result<String, ChainError> {
        let (provider, _) = self.signer_provider(signer_key)?;
        let token_addr: Address = token
            .parse()
            .map_err(|e| ChainError::ProviderHTTPError(format!("invalid token address: {e}")))?;
        let from_addr: Address = from
            .parse()
            .map_err(|e| ChainError::ProviderHTTPError(format!("invalid from address: {e}")))?;
        let to_addr: Address = to
            .parse()
            .map_err(|e| ChainError::ProviderHTTPError(format!("invalid to address: {e}")))?;
        let erc20 = ERC20::new(token_addr, &provider);
        let pending = erc20
            .transferFrom(from_addr, to_addr, U256::from(amount))
            .gas_price(gas_price)
            .send()
            .await
            .map_err(|e| ChainError::ProviderConnectionError(format!("transferFrom submit failed: {e}")))?;
        let hash = format!("{:#x}", *pending.tx_hash());
        self.poll_to_terminal(&provider.root().clone(), &hash).await
    }

    async fn token_transfer(
        &self,
        token: &str,
        to: &str,
        amount: u128,
        signer_key: &str,
        gas_price: u128,
    ) -> Result<String, ChainError> {
        let (provider, _) = self.signer_provider(signer_key)?;
        let token_addr: Address = token
            .parse()
            .map_err(|e| ChainError::ProviderHTTPError(format!("invalid token address: {e}")))?;
        let to_addr: Address = to
            .parse()
            .map_err(|e| ChainError::ProviderHTTPError(format!("invalid to address: {e}")))?;
        let erc20 = ERC20::new(token_addr, &provider);
        let pending = erc20
            .transfer(to_addr, U256::from(amount))
            .gas_price(gas_price)
            .send()
            .await
            .map_err(|e| ChainError::ProviderConnectionError(format!("transfer submit failed: {e}")))?;
        let hash = format!("{:#x}", *pending.tx_hash());
        self.poll_to_terminal(&provider.root().clone(), &hash).await
    }

    fn canonicalize_address(&self, address: &str) -> String {
        address.to_lowercase()
    }

    fn address_from_private_key(&self, private_key: &str) -> Result<String, ChainError> {
        Ok(format!("{:#x}", Self::address_from_private_key_impl(private_key)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_send_error_insufficient_funds() {
        let msg = "insufficient funds for gas * price + value";
        assert!(msg.to_lowercase().contains("insufficient funds"));
    }

    #[tokio::test]
    async fn test_read_provider_fails_with_no_endpoints() {
        let client = EvmChainClient::new(Arc::new(ProviderPool::from_urls(&[], &[])), 1);
        assert!(matches!(client.read_provider(), Err(ChainError::NoProviderAvailable)));
    }
}
