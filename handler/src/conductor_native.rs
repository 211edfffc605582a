//! Deposit conductor — native (C6): sweeps native-asset deposits from user
//! addresses to their admin address, net of fee.

use std::sync::Arc;

use bigdecimal::BigDecimal;
use chain_client::{ChainClient, ChainError};
use eyre::Result;

use crate::crypto::{self, DbSecretKey};
use crate::db::{DepositKind, Store};
use crate::metrics::Metrics;
use crate::shared::SharedState;

const NATIVE_GAS_LIMIT: u128 = 21_000;
const RETRY_START_SECS: i64 = 60;
const RETRY_STEP_SECS: i64 = 30;

pub struct NativeDepositConductor {
    pub chain: Arc<dyn ChainClient>,
    pub store: Store,
    pub shared: Arc<SharedState>,
    pub db_secret_key: DbSecretKey,
    pub batch_size: i64,
    pub metrics: Arc<Metrics>,
}

impl NativeDepositConductor {
    pub async fn tick(&self) -> Result<()> {
        self.shared.wait_for_gas_price().await;
        let rows = self
            .store
            .get_and_lock_pending_deposits(DepositKind::Native, self.batch_size)
            .await?;
        for row in rows {
            let gas_price = self.shared.get().await.gas_price.unwrap_or(0);
            let amount: u128 = row.amount.to_string().parse().unwrap_or(0);
            let fee = gas_price.saturating_mul(NATIVE_GAS_LIMIT);
            let send_amount = amount.saturating_sub(fee);

            if send_amount == 0 {
                tracing::warn!(deposit_id = %row.id, %amount, fee, "sweep amount non-positive after fee, postponing");
                self.store
                    .finish_deposit_retry(row.id, row.address_id, None, RETRY_START_SECS)
                    .await?;
                continue;
            }

            let outcome = if let Some(existing_hash) = &row.tx_hash_out {
                self.chain.result(existing_hash).await.map(|_| existing_hash.clone())
            } else {
                let user_key = crypto::decrypt_to_string(&self.db_secret_key, &row.user_private);
                match user_key {
                    Ok(key) => {
                        self.chain
                            .send_native(&row.admin_public, send_amount, &key, gas_price, NATIVE_GAS_LIMIT as u64)
                            .await
                    }
                    Err(e) => Err(ChainError::Other(e)),
                }
            };

            self.handle_outcome(row, outcome).await?;
        }
        Ok(())
    }

    async fn handle_outcome(
        &self,
        row: crate::db::models::DepositForTx,
        outcome: std::result::Result<String, ChainError>,
    ) -> Result<()> {
        match outcome {
            Ok(tx_hash) => {
                tracing::info!(deposit_id = %row.id, tx_hash = %tx_hash, "native sweep landed");
                self.store
                    .finish_deposit_success(row.id, &tx_hash, row.address_id, None)
                    .await?;
                self.metrics.deposit_sweeps_total.with_label_values(&["native", "success"]).inc();
            }
            Err(ChainError::ProviderConnectionErrorOnTx { hash }) => {
                tracing::warn!(deposit_id = %row.id, tx_hash = %hash, "connection error mid-submit, will poll next tick");
                self.store
                    .set_deposit_conn_error_hash(row.id, &hash, RETRY_STEP_SECS)
                    .await?;
                self.metrics.deposit_sweeps_total.with_label_values(&["native", "conn_error"]).inc();
            }
            Err(ChainError::StuckTransaction { hash, nonce }) => {
                tracing::error!(deposit_id = %row.id, tx_hash = %hash, nonce, "native sweep stuck");
                self.store.mark_deposit_stuck(row.id).await?;
                self.metrics.deposit_sweeps_total.with_label_values(&["native", "stuck"]).inc();
            }
            Err(err) if err.is_recoverable_rebuild() => {
                tracing::warn!(deposit_id = %row.id, error = %err, "recoverable sweep failure, will rebuild");
                self.store
                    .finish_deposit_retry(row.id, row.address_id, None, RETRY_START_SECS)
                    .await?;
                self.metrics.deposit_sweeps_total.with_label_values(&["native", "retry"]).inc();
            }
            Err(err) => {
                tracing::error!(deposit_id = %row.id, error = %err, "unexpected sweep failure");
                self.store
                    .finish_deposit_retry(row.id, row.address_id, None, RETRY_START_SECS)
                    .await?;
                self.metrics.deposit_sweeps_total.with_label_values(&["native", "retry"]).inc();
            }
        }
        Ok(())
    }
}

/// `amount - gas_price * gas_limit`, saturating at zero — used by tests and
/// by `tick` above.
pub fn net_of_fee(amount: &BigDecimal, gas_price: u128) -> BigDecimal {
    let fee = BigDecimal::from(gas_price) * BigDecimal::from(NATIVE_GAS_LIMIT);
    let net = amount - &fee;
    if net < BigDecimal::from(0) {
        BigDecimal::from(0)
    } else {
        net
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn net_of_fee_subtracts_gas_cost() {
        let amount = BigDecimal::from(5_000_000_000_000_000_000u64);
        let gas_price = 5_000_000_000u128;
        let net = net_of_fee(&amount, gas_price);
        assert_eq!(net, amount - BigDecimal::from(gas_price * NATIVE_GAS_LIMIT));
    }

    #[test]
    fn net_of_fee_floors_at_zero() {
        let amount = BigDecimal::from(100u64);
        let net = net_of_fee(&amount, 1_000_000_000_000u128);
        assert_eq!(net, BigDecimal::from(0));
    }
}
