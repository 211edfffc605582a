//! Block scanner (C5): advances `last_handled_block` one block at a time,
//! parses native transfers and ERC20/TRC20 `Transfer` logs, records
//! deposits.

use std::sync::Arc;

use bigdecimal::BigDecimal;
use chain_client::ChainClient;
use eyre::Result;

use crate::config::NetworkConfig;
use crate::db::models::{NewDeposit, NATIVE_COIN};
use crate::db::Store;
use crate::metrics::Metrics;
use crate::shared::SharedState;

pub struct Scanner {
    pub chain: Arc<dyn ChainClient>,
    pub store: Store,
    pub shared: Arc<SharedState>,
    pub network: NetworkConfig,
    pub metrics: Arc<Metrics>,
}

impl Scanner {
    /// One scheduler tick. Returns `true` if it advanced the chain tip
    /// (used only by tests to assert progress).
    pub async fn tick(&self) -> Result<bool> {
        let snapshot = self.shared.get().await;
        let current = snapshot.last_handled_block + 1;

        let slippage_threshold = (self.network.block_offset * self.network.allowed_slippage) as i64;
        let mut trusted_block = snapshot.trusted_block;
        if trusted_block - current >= slippage_threshold {
            let latest = self.chain.latest_block_number().await?;
            trusted_block = latest as i64 - self.network.block_offset as i64;
            self.shared.set_trusted_block(trusted_block).await;
        }

        let new_slippage = trusted_block - current;
        let interval = if new_slippage >= slippage_threshold {
            tracing::warn!(slippage = new_slippage, threshold = slippage_threshold, "scanner entering catch-up mode");
            0
        } else {
            self.network.scan_interval_secs
        };
        self.shared.set_block_parser_interval(interval).await;

        if trusted_block <= current {
            return Ok(false);
        }

        let (logs, native_transfers) = tokio::try_join!(
            self.chain.transfer_logs(current as u64, current as u64),
            self.chain.native_transfers_in_block(current as u64),
        )?;

        let coins = self.store.get_active_coins().await?;
        let snapshot = self.shared.get().await;

        let mut deposits: Vec<NewDeposit> = Vec::new();

        for log in logs {
            if log.removed {
                continue;
            }
            let canonical_contract = self.chain.canonicalize_address(&log.contract_address);
            let Some(coin) = coins
                .iter()
                .find(|c| self.chain.canonicalize_address(&c.contract_address) == canonical_contract)
            else {
                continue;
            };
            if !coin.is_active {
                continue;
            }
            let to_key = self.chain.canonicalize_address(&log.to);
            let Some(&address_id) = snapshot.user_accounts.get(&to_key) else {
                continue;
            };
            let amount = BigDecimal::from(log.amount);
            if amount < coin.min_amount {
                tracing::debug!(tx = %log.tx_hash, amount = %amount, min = %coin.min_amount, "deposit below min_amount, dropped");
                continue;
            }
            let rate = coin.current_rate.clone().unwrap_or_else(|| BigDecimal::from(0));
            let scale = BigDecimal::from(10u64.pow(coin.decimals.max(0) as u32));
            let quote_amount = if scale == BigDecimal::from(0) {
                BigDecimal::from(0)
            } else {
                &amount * &rate / &scale
            };
            deposits.push(NewDeposit {
                address_id,
                contract_address: coin.contract_address.clone(),
                tx_hash_in: log.tx_hash.clone(),
                amount,
                quote_amount,
            });
        }

        for transfer in native_transfers {
            if !transfer.status_success {
                continue;
            }
            let to_key = self.chain.canonicalize_address(&transfer.to);
            let from_key = self.chain.canonicalize_address(&transfer.from);
            if snapshot.handler_accounts.contains_key(&from_key) {
                continue;
            }
            let Some(&address_id) = snapshot.user_accounts.get(&to_key) else {
                continue;
            };
            let Some(native_coin) = coins.iter().find(|c| c.contract_address == NATIVE_COIN) else {
                continue;
            };
            let amount = BigDecimal::from(transfer.amount);
            if amount < native_coin.min_amount {
                tracing::debug!(tx = %transfer.tx_hash, amount = %amount, "native deposit below min_amount, dropped");
                continue;
            }
            let rate = native_coin.current_rate.clone().unwrap_or_else(|| BigDecimal::from(0));
            let scale = BigDecimal::from(10u64.pow(native_coin.decimals.max(0) as u32));
            let quote_amount = if scale == BigDecimal::from(0) {
                BigDecimal::from(0)
            } else {
                &amount * &rate / &scale
            };
            deposits.push(NewDeposit {
                address_id,
                contract_address: NATIVE_COIN.to_string(),
                tx_hash_in: transfer.tx_hash.clone(),
                amount,
                quote_amount,
            });
        }

        let inserted = self.store.record_block_and_deposits(current, &deposits).await?;
        self.shared.set_last_handled_block(current).await;
        self.metrics.blocks_processed_total.inc();
        self.metrics.last_handled_block.set(current);
        self.metrics.trusted_block.set(trusted_block);
        self.metrics.scanner_catch_up_mode.set(if interval == 0 { 1 } else { 0 });
        for d in &deposits {
            let kind = if d.contract_address == NATIVE_COIN { "native" } else { "token" };
            self.metrics.deposits_detected_total.with_label_values(&[kind]).inc();
        }
        tracing::info!(block = current, deposits_found = deposits.len(), deposits_inserted = inserted, "scanned block");
        Ok(true)
    }
}
