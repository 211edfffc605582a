//! Callback worker (§4.9 "The Dispatcher's callback worker is symmetric"):
//! drains the `callbacks` table toward customer-supplied URLs with the
//! same linear-backoff policy and 409 short-circuit as the Handler's own
//! `Notifier`, running as a `max_instances = 1` job at a 1 s tick, batch
//! size 20.

use std::sync::Arc;

use eyre::Result;

use crate::crypto::{self, DbSecretKey};
use crate::db::models::CallbackForDelivery;
use crate::db::Store;
use crate::metrics::Metrics;

const RETRY_STEP_SECS: i64 = 60;
pub const BATCH_SIZE: i64 = 20;

pub struct CallbackWorker {
    pub store: Store,
    pub http: reqwest::Client,
    pub db_secret_key: DbSecretKey,
    pub metrics: Arc<Metrics>,
}

impl CallbackWorker {
    pub async fn tick(&self) -> Result<()> {
        let rows = self.store.get_and_lock_unnotified_callbacks(BATCH_SIZE).await?;
        for row in rows {
            if let Err(e) = self.deliver(&row).await {
                tracing::error!(callback_id = %row.id, error = %e, "callback delivery failed");
                self.store.retry_callback(&row.id, RETRY_STEP_SECS).await?;
            }
        }
        Ok(())
    }

    async fn deliver(&self, row: &CallbackForDelivery) -> Result<()> {
        let api_key = crypto::decrypt_to_string(&self.db_secret_key, &row.callback_api_key)?;
        let envelope = serde_json::json!({
            "callback_id": row.id,
            "user_id": row.user_id,
            "path": row.path,
            "json_data": row.json_data,
        });
        let result = self
            .http
            .post(&row.callback_url)
            .header("Api-Key", api_key)
            .json(&envelope)
            .send()
            .await;

        match result {
            Ok(resp) if resp.status() == reqwest::StatusCode::CONFLICT => {
                tracing::debug!(callback_id = %row.id, "customer already recorded callback (409), treating as delivered");
                self.store.mark_callback_notified(&row.id).await?;
                self.metrics.callback_attempts_total.with_label_values(&["success"]).inc();
            }
            Ok(resp) if resp.status().is_success() => {
                self.store.mark_callback_notified(&row.id).await?;
                self.metrics.callback_attempts_total.with_label_values(&["success"]).inc();
            }
            Ok(resp) => {
                tracing::warn!(callback_id = %row.id, status = %resp.status(), "customer rejected callback, will retry");
                self.store.retry_callback(&row.id, RETRY_STEP_SECS).await?;
                self.metrics.callback_attempts_total.with_label_values(&["rejected"]).inc();
            }
            Err(e) => {
                tracing::warn!(callback_id = %row.id, error = %e, "callback request failed, will retry");
                self.store.retry_callback(&row.id, RETRY_STEP_SECS).await?;
                self.metrics.callback_attempts_total.with_label_values(&["error"]).inc();
            }
        }
        Ok(())
    }
}
