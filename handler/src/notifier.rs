//! Notifier (C9): two symmetric callback loops POSTing deposit/withdrawal
//! outcomes to the upstream Dispatcher's private callback endpoint.
//!
//! HTTP 409 Conflict is treated as success — the Dispatcher has already
//! recorded this callback (its own idempotency key rejected a duplicate),
//! so retrying it would just loop forever (§4.9).

use std::sync::Arc;

use bigdecimal::BigDecimal;
use eyre::Result;
use num_traits::ToPrimitive;
use serde::Serialize;
use serde_json::json;

use crate::config::DispatcherConfig;
use crate::db::models::{DepositForCallback, WithdrawalForCallback};
use crate::db::Store;
use crate::metrics::Metrics;

const RETRY_STEP_SECS: i64 = 60;

/// The wire envelope expected by the Dispatcher's `/v1/api/private/callback`
/// receiver: `callback_id` doubles as the idempotency key, `path` tells the
/// Dispatcher which customer-facing route this event corresponds to, and
/// `json_data` carries the event-specific payload.
#[derive(Serialize)]
struct CallbackEnvelope<'a> {
    callback_id: String,
    user_id: &'a str,
    path: &'a str,
    json_data: serde_json::Value,
}

/// Number of decimal places to display so that roughly one cent of quote
/// value is distinguishable, given the coin's `current_rate` (quote value
/// per whole unit): `10 ** round(log10(0.01 / rate))`, ported from
/// `get_round_for_rate`. Falls back to two decimals when the rate is
/// missing or non-positive.
fn round_for_rate(rate: Option<&BigDecimal>) -> i64 {
    const QUOTE_ASSET_PRECISION: f64 = 0.01;
    let rate = match rate.and_then(|r| r.to_f64()) {
        Some(r) if r > 0.0 => r,
        _ => return 2,
    };
    let exponent = (QUOTE_ASSET_PRECISION / rate).log10().round();
    -(exponent as i64)
}

/// Renders `amount / 10^decimals` to a display string, quantized to
/// [`round_for_rate`]'s rate-dependent precision rather than a fixed two
/// decimal places, e.g. `5 * 10^18` base units at 18 decimals and a rate of
/// `1` displays as `"5.00"`.
fn to_display_string(amount: &BigDecimal, decimals: i32, rate: Option<&BigDecimal>) -> String {
    let scale = BigDecimal::from(10u64.pow(decimals.max(0) as u32));
    let value = (amount / scale).with_scale(round_for_rate(rate));
    value.to_string()
}

pub struct Notifier {
    pub store: Store,
    pub http: reqwest::Client,
    pub dispatcher: DispatcherConfig,
    pub batch_size: i64,
    pub metrics: Arc<Metrics>,
}

impl Notifier {
    async fn post(&self, envelope: &CallbackEnvelope<'_>) -> Result<bool> {
        let url = format!("{}/v1/api/private/callback", self.dispatcher.url.trim_end_matches('/'));
        let resp = self
            .http
            .post(&url)
            .header("Api-Key", self.dispatcher.api_key.0.as_str())
            .json(envelope)
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::CONFLICT {
            tracing::debug!("callback already recorded by dispatcher (409), treating as delivered");
            return Ok(true);
        }
        Ok(resp.status().is_success())
    }

    pub async fn deposit_callback_tick(&self) -> Result<()> {
        let rows = self.store.get_and_lock_unnotified_deposits(self.batch_size).await?;
        for row in rows {
            if let Err(e) = self.process_deposit(&row).await {
                tracing::error!(deposit_id = %row.id, error = %e, "deposit callback failed");
                self.store.retry_deposit_notification(row.id, RETRY_STEP_SECS).await?;
            }
        }
        Ok(())
    }

    async fn process_deposit(&self, row: &DepositForCallback) -> Result<()> {
        let envelope = CallbackEnvelope {
            callback_id: format!("deposit_{}", row.id),
            user_id: &row.user_id,
            path: "deposit",
            json_data: json!({
                "id": row.id,
                "contract_address": row.contract_address,
                "tx_hash_in": row.tx_hash_in,
                "tx_hash_out": row.tx_hash_out,
                "amount": row.amount.to_string(),
                "quote_amount": row.quote_amount.to_string(),
                "display_amount": to_display_string(&row.amount, row.decimals, row.current_rate.as_ref()),
            }),
        };
        match self.post(&envelope).await {
            Ok(true) => {
                self.store.mark_deposit_notified(row.id).await?;
                self.metrics.callback_attempts_total.with_label_values(&["deposit", "success"]).inc();
            }
            Ok(false) => {
                tracing::warn!(deposit_id = %row.id, "dispatcher rejected callback, will retry");
                self.store.retry_deposit_notification(row.id, RETRY_STEP_SECS).await?;
                self.metrics.callback_attempts_total.with_label_values(&["deposit", "rejected"]).inc();
            }
            Err(e) => {
                tracing::warn!(deposit_id = %row.id, error = %e, "callback request failed, will retry");
                self.store.retry_deposit_notification(row.id, RETRY_STEP_SECS).await?;
                self.metrics.callback_attempts_total.with_label_values(&["deposit", "error"]).inc();
            }
        }
        Ok(())
    }

    pub async fn withdrawal_callback_tick(&self) -> Result<()> {
        let rows = self.store.get_and_lock_unnotified_withdrawals(self.batch_size).await?;
        for row in rows {
            if let Err(e) = self.process_withdrawal(&row).await {
                tracing::error!(withdrawal_id = %row.id, error = %e, "withdrawal callback failed");
                self.store.retry_withdrawal_notification(row.id, RETRY_STEP_SECS).await?;
            }
        }
        Ok(())
    }

    async fn process_withdrawal(&self, row: &WithdrawalForCallback) -> Result<()> {
        let envelope = CallbackEnvelope {
            callback_id: format!("withdrawal_{}", row.id),
            user_id: &row.user_id,
            path: "withdrawal",
            json_data: json!({
                "id": row.id,
                "contract_address": row.contract_address,
                "withdrawal_address": row.withdrawal_address,
                "tx_hash_out": row.tx_hash_out,
                "amount": row.amount.to_string(),
                "quote_amount": row.quote_amount.to_string(),
                "user_currency": row.user_currency,
                "display_amount": to_display_string(&row.amount, row.decimals, row.current_rate.as_ref()),
            }),
        };
        match self.post(&envelope).await {
            Ok(true) => {
                self.store.mark_withdrawal_notified(row.id).await?;
                self.metrics.callback_attempts_total.with_label_values(&["withdrawal", "success"]).inc();
            }
            Ok(false) => {
                tracing::warn!(withdrawal_id = %row.id, "dispatcher rejected callback, will retry");
                self.store.retry_withdrawal_notification(row.id, RETRY_STEP_SECS).await?;
                self.metrics.callback_attempts_total.with_label_values(&["withdrawal", "rejected"]).inc();
            }
            Err(e) => {
                tracing::warn!(withdrawal_id = %row.id, error = %e, "callback request failed, will retry");
                self.store.retry_withdrawal_notification(row.id, RETRY_STEP_SECS).await?;
                self.metrics.callback_attempts_total.with_label_values(&["withdrawal", "error"]).inc();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_string_rounds_to_two_decimals_at_unit_rate() {
        let amount = BigDecimal::from(5_000_000_000_000_000_000u64);
        let rate = BigDecimal::from(1);
        assert_eq!(to_display_string(&amount, 18, Some(&rate)), "5.00");
    }

    #[test]
    fn display_string_handles_fractional_base_units() {
        let amount = BigDecimal::from(3_000_000u64);
        let rate = BigDecimal::from(1);
        assert_eq!(to_display_string(&amount, 6, Some(&rate)), "3.00");
    }

    #[test]
    fn display_string_falls_back_to_two_decimals_without_a_rate() {
        let amount = BigDecimal::from(3_000_000u64);
        assert_eq!(to_display_string(&amount, 6, None), "3.00");
    }

    #[test]
    fn round_for_rate_widens_precision_for_high_value_coins() {
        // A coin worth 100 quote units per whole token needs four decimal
        // places for $0.01 of value to register.
        let rate = BigDecimal::from(100);
        assert_eq!(round_for_rate(Some(&rate)), 4);
    }

    #[test]
    fn round_for_rate_narrows_precision_for_low_value_coins() {
        // A coin worth 0.0001 quote units per whole token rounds to the
        // nearest hundred whole tokens.
        let rate = BigDecimal::try_from(0.0001).unwrap();
        assert_eq!(round_for_rate(Some(&rate)), -2);
    }
}
