//! Balance/rate refreshers (C10): five independent timers feeding Shared
//! state and the Store. Each is registered as its own scheduled job so a
//! slow ticker API never stalls the gas-price or balance refreshes.

use std::collections::HashMap;
use std::sync::Arc;

use bigdecimal::BigDecimal;
use chain_client::{ChainClient, ProviderPool};
use eyre::Result;
use serde::Deserialize;

use crate::config::RatesConfig;
use crate::db::models::{Role, NATIVE_COIN};
use crate::db::Store;
use crate::metrics::Metrics;
use crate::shared::{build_account_indexes, SharedState, Snapshot};

const GAS_PRICE_MULTIPLIER_NUM: u128 = 3;
const GAS_PRICE_MULTIPLIER_DEN: u128 = 2;

/// `update_coin_rates`: fetches two independent public tickers per
/// non-quote coin and averages them; the quote coin itself is forced to 1.
pub struct RateRefresher {
    pub store: Store,
    pub http: reqwest::Client,
    pub rates: RatesConfig,
}

#[derive(Deserialize)]
struct TickerResponse {
    price: String,
}

impl RateRefresher {
    pub async fn tick(&self) -> Result<()> {
        let coins = self.store.get_active_coins().await?;
        for coin in coins {
            if coin.name.eq_ignore_ascii_case(&self.rates.quote_symbol) {
                self.store.set_coin_rate(&coin.contract_address, &BigDecimal::from(1)).await?;
                continue;
            }
            match self.fetch_aggregate_rate(&coin.name).await {
                Ok(rate) => {
                    self.store.set_coin_rate(&coin.contract_address, &rate).await?;
                }
                Err(e) => {
                    tracing::warn!(coin = %coin.name, error = %e, "rate refresh failed, keeping last known rate");
                }
            }
        }
        Ok(())
    }

    async fn fetch_aggregate_rate(&self, symbol: &str) -> Result<BigDecimal> {
        let primary = self.fetch_one(&self.rates.primary_url_template, symbol).await;
        let secondary = self.fetch_one(&self.rates.secondary_url_template, symbol).await;
        match (primary, secondary) {
            (Ok(a), Ok(b)) => Ok((a + b) / BigDecimal::from(2)),
            (Ok(a), Err(_)) => Ok(a),
            (Err(_), Ok(b)) => Ok(b),
            (Err(e), Err(_)) => Err(e),
        }
    }

    async fn fetch_one(&self, template: &str, symbol: &str) -> Result<BigDecimal> {
        let url = template
            .replace("{symbol}", symbol)
            .replace("{quote}", &self.rates.quote_symbol);
        let resp = self.http.get(&url).send().await?.error_for_status()?;
        let body: TickerResponse = resp.json().await?;
        Ok(body.price.parse()?)
    }
}

/// `update_gas_price`: `shared.gas_price = provider_gas_price * 1.5`.
pub struct GasPriceRefresher {
    pub chain: Arc<dyn ChainClient>,
    pub shared: Arc<SharedState>,
}

impl GasPriceRefresher {
    pub async fn tick(&self) -> Result<()> {
        let provider_price = self.chain.gas_price().await?;
        let price = provider_price * GAS_PRICE_MULTIPLIER_NUM / GAS_PRICE_MULTIPLIER_DEN;
        self.shared.set_gas_price(price).await;
        Ok(())
    }
}

/// `admin_coins_bal` / `admin_approve_native_bal`: refreshes SADMIN balances
/// for every coin, and SADMIN+APPROVE native balances, warning when an
/// address is running low on gas money.
pub struct AdminBalanceRefresher {
    pub chain: Arc<dyn ChainClient>,
    pub store: Store,
    pub shared: Arc<SharedState>,
    pub threshold: BigDecimal,
}

impl AdminBalanceRefresher {
    pub fn new(chain: Arc<dyn ChainClient>, store: Store, shared: Arc<SharedState>, threshold: BigDecimal) -> Self {
        Self { chain, store, shared, threshold }
    }

    pub async fn tick(&self) -> Result<()> {
        let gas_price = self.shared.get().await.gas_price.unwrap_or(0);
        let threshold = &self.threshold;

        let sadmins = self.store.users_addresses(&[Role::Sadmin], 10_000).await?;
        let coins = self.store.get_active_coins().await?;
        for admin in &sadmins {
            for coin in &coins {
                let balance = if coin.contract_address == NATIVE_COIN {
                    self.chain.get_account_balance(&admin.public).await
                } else {
                    self.chain.balance_of(&coin.contract_address, &admin.public).await
                };
                match balance {
                    Ok(b) => {
                        self.store
                            .upsert_balance(admin.id, &coin.contract_address, &BigDecimal::from(b))
                            .await?;
                    }
                    Err(e) => {
                        tracing::warn!(admin = %admin.public, coin = %coin.name, error = %e, "balance refresh failed");
                    }
                }
            }
        }

        let approvers = self.store.users_addresses(&[Role::Approve], 10_000).await?;
        for addr in sadmins.iter().chain(approvers.iter()) {
            match self.chain.get_account_balance(&addr.public).await {
                Ok(native) => {
                    self.store.upsert_balance(addr.id, NATIVE_COIN, &BigDecimal::from(native)).await?;
                    let warn_floor = BigDecimal::from(gas_price) * BigDecimal::from(100_000u64) * threshold;
                    if BigDecimal::from(native) <= warn_floor {
                        tracing::warn!(address = %addr.public, native_balance = native, "native balance low, may be unable to pay for sweeps/withdrawals");
                    }
                }
                Err(e) => {
                    tracing::warn!(address = %addr.public, error = %e, "native balance refresh failed");
                }
            }
        }
        Ok(())
    }
}

/// `update_in_memory_accounts`: reloads the USER/SADMIN+APPROVE address
/// index maps and swaps them into Shared state.
pub struct AccountsRefresher {
    pub chain: Arc<dyn ChainClient>,
    pub store: Store,
    pub shared: Arc<SharedState>,
}

impl AccountsRefresher {
    pub async fn tick(&self) -> Result<()> {
        let addresses = self.store.all_accounts().await?;
        let users: Vec<_> = {
            let mut seen = std::collections::HashSet::new();
            addresses
                .iter()
                .filter(|a| seen.insert(a.user_id.clone()))
                .map(|a| a.user_id.clone())
                .collect()
        };
        let mut roles = HashMap::new();
        for user_id in users {
            if let Some(user) = self.store.get_user(&user_id).await? {
                if let Some(role) = Role::from_i32(user.role) {
                    roles.insert(user.id, role);
                }
            }
        }
        let (user_accounts, handler_accounts) =
            build_account_indexes(&addresses, &roles, |s| self.chain.canonicalize_address(s));

        let current = self.shared.get().await;
        let next = Snapshot {
            user_accounts,
            handler_accounts,
            ..(*current).clone()
        };
        self.shared.swap(next).await;
        Ok(())
    }
}

/// `explorer`: publishes per-provider telemetry every tick. Catch-up mode is
/// driven by the scanner itself from the live snapshot (§4.5); this job only
/// surfaces operator-visible provider health.
pub struct ExplorerRefresher {
    pub pool: Arc<ProviderPool>,
    pub metrics: Arc<Metrics>,
}

impl ExplorerRefresher {
    pub async fn tick(&self) -> Result<()> {
        for endpoint in self.pool.endpoints() {
            let (rps, statuses) = endpoint.telemetry();
            tracing::info!(url = %endpoint.base_url, rps, ?statuses, enabled = endpoint.is_enabled(), "provider telemetry");
            self.metrics
                .provider_rps
                .with_label_values(&[&endpoint.base_url])
                .set(rps as i64);
            self.metrics
                .provider_enabled
                .with_label_values(&[&endpoint.base_url])
                .set(if endpoint.is_enabled() { 1 } else { 0 });
        }
        Ok(())
    }
}
