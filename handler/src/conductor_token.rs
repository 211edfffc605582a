//! Deposit conductor — token (C7): sweeps token deposits via an
//! approve+transferFrom pattern using a dedicated approver account.

use std::sync::Arc;

use chain_client::{ChainClient, ChainError};
use eyre::Result;

use crate::crypto::{self, DbSecretKey};
use crate::db::models::DepositForTx;
use crate::db::{DepositKind, Store};
use crate::metrics::Metrics;
use crate::shared::SharedState;

/// Carried forward unchanged from the original source (DESIGN.md Open
/// Question (a)): a deliberately bounded allowance rather than a
/// chain-native maximum, so a compromised approve key's blast radius is
/// capped at this many base units of the token.
const APPROVAL_VALUE: u128 = 9_999_999_999_999_999;
const APPROVE_FUNDING_GAS_LIMIT: u128 = 21_000;
const APPROVE_FUNDING_MULTIPLIER_NUM: u128 = 13;
const APPROVE_FUNDING_MULTIPLIER_DEN: u128 = 10;
const APPROVE_FUNDING_UNITS: u128 = 100_000;
const RETRY_START_SECS: i64 = 60;
const RETRY_STEP_SECS: i64 = 30;

pub struct TokenDepositConductor {
    pub chain: Arc<dyn ChainClient>,
    pub store: Store,
    pub shared: Arc<SharedState>,
    pub db_secret_key: DbSecretKey,
    pub batch_size: i64,
    pub metrics: Arc<Metrics>,
}

impl TokenDepositConductor {
    pub async fn tick(&self) -> Result<()> {
        self.shared.wait_for_gas_price().await;
        let rows = self
            .store
            .get_and_lock_pending_deposits(DepositKind::Token, self.batch_size)
            .await?;
        for row in rows {
            if let Err(e) = self.process_one(&row).await {
                tracing::error!(deposit_id = %row.id, error = %e, "unexpected error processing token deposit");
                self.store
                    .finish_deposit_retry(row.id, row.address_id, row.approve_id, RETRY_START_SECS)
                    .await?;
            }
        }
        Ok(())
    }

    async fn process_one(&self, row: &DepositForTx) -> Result<()> {
        let gas_price = self.shared.get().await.gas_price.unwrap_or(0);
        let amount: u128 = row.amount.to_string().parse().unwrap_or(0);

        let (Some(approve_public), Some(approve_private_enc)) =
            (row.approve_public.clone(), row.approve_private.clone())
        else {
            tracing::error!(deposit_id = %row.id, "token deposit missing approve account");
            return Ok(());
        };
        let approve_key = crypto::decrypt_to_string(&self.db_secret_key, &approve_private_enc)?;

        let outcome = if let Some(existing_hash) = &row.tx_hash_out {
            self.chain.result(existing_hash).await.map(|_| existing_hash.clone())
        } else {
            match self.prepare_and_sweep(row, &approve_public, &approve_key, amount, gas_price).await {
                Ok(hash) => Ok(hash),
                Err(e) => Err(e),
            }
        };
        self.handle_outcome(row, outcome).await
    }

    /// Step 1-3: ensure allowance, funding the approve tx from the approve
    /// account's native balance if the user can't pay for it themselves,
    /// then the `transferFrom` sweep itself (step 4).
    async fn prepare_and_sweep(
        &self,
        row: &DepositForTx,
        approve_public: &str,
        approve_key: &str,
        amount: u128,
        gas_price: u128,
    ) -> std::result::Result<String, ChainError> {
        let user_key = crypto::decrypt_to_string(&self.store_secret(), &row.user_private)
            .map_err(ChainError::Other)?;

        let allowance = self
            .chain
            .allowance(&row.contract_address, &row.user_public, approve_public)
            .await?;

        if allowance < amount {
            let user_native = self.chain.get_account_balance(&row.user_public).await?;
            let approve_fee = gas_price
                * APPROVE_FUNDING_GAS_LIMIT
                * APPROVE_FUNDING_MULTIPLIER_NUM
                / APPROVE_FUNDING_MULTIPLIER_DEN;
            let funding_needed = APPROVE_FUNDING_UNITS * gas_price * APPROVE_FUNDING_MULTIPLIER_NUM
                / APPROVE_FUNDING_MULTIPLIER_DEN;
            if user_native < approve_fee {
                self.chain
                    .send_native(
                        &row.user_public,
                        funding_needed,
                        approve_key,
                        gas_price,
                        APPROVE_FUNDING_GAS_LIMIT as u64,
                    )
                    .await
                    .map_err(|e| ChainError::Other(eyre::eyre!("PreparingTransactionError: funding user for approve failed: {e}")))?;
            }

            self.chain
                .approve(&row.contract_address, approve_public, APPROVAL_VALUE, &user_key, gas_price)
                .await
                .map_err(|e| ChainError::Other(eyre::eyre!("PreparingTransactionError: approve failed: {e}")))?;
        }

        self.chain
            .transfer_from(&row.contract_address, &row.user_public, &row.admin_public, amount, approve_key, gas_price)
            .await
    }

    /// The deposit row only holds AES-EAX ciphertext, the key lives in
    /// config; conductors are constructed with it directly so this is just
    /// a convenience accessor kept local to avoid threading it through every
    /// call site above.
    fn store_secret(&self) -> DbSecretKey {
        self.db_secret_key
    }

    async fn handle_outcome(
        &self,
        row: &DepositForTx,
        outcome: std::result::Result<String, ChainError>,
    ) -> Result<()> {
        match outcome {
            Ok(tx_hash) => {
                tracing::info!(deposit_id = %row.id, tx_hash = %tx_hash, "token sweep landed");
                self.store
                    .finish_deposit_success(row.id, &tx_hash, row.address_id, row.approve_id)
                    .await?;
                self.metrics.deposit_sweeps_total.with_label_values(&["token", "success"]).inc();
            }
            Err(ChainError::ProviderConnectionErrorOnTx { hash }) => {
                tracing::warn!(deposit_id = %row.id, tx_hash = %hash, "connection error mid-submit, will poll next tick");
                // The approve account always releases on any outcome; the
                // user stays locked via the retry window (§4.7 step 5).
                self.store
                    .set_deposit_conn_error_hash(row.id, &hash, RETRY_STEP_SECS)
                    .await?;
                if let Some(approve_id) = row.approve_id {
                    self.store.finish_deposit_retry_approve_only(approve_id).await?;
                }
                self.metrics.deposit_sweeps_total.with_label_values(&["token", "conn_error"]).inc();
            }
            Err(ChainError::StuckTransaction { hash, nonce }) => {
                tracing::error!(deposit_id = %row.id, tx_hash = %hash, nonce, "token sweep stuck");
                self.store.mark_deposit_stuck(row.id).await?;
                if let Some(approve_id) = row.approve_id {
                    self.store.finish_deposit_retry_approve_only(approve_id).await?;
                }
                self.metrics.deposit_sweeps_total.with_label_values(&["token", "stuck"]).inc();
            }
            Err(err) => {
                tracing::warn!(deposit_id = %row.id, error = %err, "token sweep failed, will retry");
                self.store
                    .finish_deposit_retry(row.id, row.address_id, row.approve_id, RETRY_START_SECS)
                    .await?;
                self.metrics.deposit_sweeps_total.with_label_values(&["token", "retry"]).inc();
            }
        }
        Ok(())
    }
}
