//! Withdrawal conductor (C8): claims pending withdrawals against a free
//! admin (SADMIN) address and sends the payout, native or token.

use std::sync::Arc;

use chain_client::{ChainClient, ChainError};
use eyre::Result;

use crate::crypto::{self, DbSecretKey};
use crate::db::models::{WithdrawalForTx, NATIVE_COIN};
use crate::db::Store;
use crate::metrics::Metrics;
use crate::shared::SharedState;

const NATIVE_GAS_LIMIT: u128 = 21_000;
const RETRY_START_SECS: i64 = 60;
const RETRY_STEP_SECS: i64 = 15;

pub struct WithdrawalConductor {
    pub chain: Arc<dyn ChainClient>,
    pub store: Store,
    pub shared: Arc<SharedState>,
    pub db_secret_key: DbSecretKey,
    pub batch_size: i64,
    pub metrics: Arc<Metrics>,
}

impl WithdrawalConductor {
    pub async fn tick(&self) -> Result<()> {
        self.shared.wait_for_gas_price().await;

        // Only claim as many withdrawals as there are free admins to serve
        // them — claiming more just means immediately giving them back.
        let free = self.store.count_free_sadmin().await?;
        let claim = free.min(self.batch_size);
        if claim <= 0 {
            return Ok(());
        }

        let rows = self.store.get_and_lock_pending_withdrawals(claim).await?;
        for row in rows {
            if let Err(e) = self.process_one(&row).await {
                tracing::error!(withdrawal_id = %row.id, error = %e, "unexpected error processing withdrawal");
                self.store.finish_withdrawal_retry(row.id, row.admin_id, RETRY_START_SECS).await?;
            }
        }
        Ok(())
    }

    async fn process_one(&self, row: &WithdrawalForTx) -> Result<()> {
        let gas_price = self.shared.get().await.gas_price.unwrap_or(0);
        let amount: u128 = row.amount.to_string().parse().unwrap_or(0);
        let admin_key = crypto::decrypt_to_string(&self.db_secret_key, &row.admin_private)?;

        let outcome = if row.contract_address == NATIVE_COIN {
            self.chain
                .send_native(&row.withdrawal_address, amount, &admin_key, gas_price, NATIVE_GAS_LIMIT as u64)
                .await
        } else {
            self.chain
                .token_transfer(&row.contract_address, &row.withdrawal_address, amount, &admin_key, gas_price)
                .await
        };

        self.handle_outcome(row, outcome).await
    }

    async fn handle_outcome(
        &self,
        row: &WithdrawalForTx,
        outcome: std::result::Result<String, ChainError>,
    ) -> Result<()> {
        match outcome {
            Ok(tx_hash) => {
                tracing::info!(withdrawal_id = %row.id, tx_hash = %tx_hash, "withdrawal landed");
                self.store.finish_withdrawal_success(row.id, &tx_hash, row.admin_id).await?;
                self.metrics.withdrawals_total.with_label_values(&["success"]).inc();
            }
            Err(ChainError::ProviderConnectionErrorOnTx { hash }) => {
                tracing::warn!(withdrawal_id = %row.id, tx_hash = %hash, "connection error mid-submit, will retry");
                self.store.finish_withdrawal_retry(row.id, row.admin_id, RETRY_STEP_SECS).await?;
                self.metrics.withdrawals_total.with_label_values(&["conn_error"]).inc();
            }
            Err(ChainError::StuckTransaction { hash, nonce }) => {
                tracing::error!(withdrawal_id = %row.id, tx_hash = %hash, nonce, "withdrawal stuck");
                self.store.mark_withdrawal_stuck(row.id).await?;
                self.metrics.withdrawals_total.with_label_values(&["stuck"]).inc();
            }
            Err(err) => {
                tracing::warn!(withdrawal_id = %row.id, error = %err, "withdrawal send failed, will retry");
                self.store.finish_withdrawal_retry(row.id, row.admin_id, RETRY_START_SECS).await?;
                self.metrics.withdrawals_total.with_label_values(&["retry"]).inc();
            }
        }
        Ok(())
    }
}
