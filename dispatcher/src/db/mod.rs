//! Dispatcher persistence layer, grounded on the Handler's own `db::Store`
//! (owned write/read `PgPool`s, `sqlx::migrate!` at startup, `FOR UPDATE
//! SKIP LOCKED` for the callback queue so N dispatcher replicas never hand
//! the same callback to two delivery workers).

pub mod models;

pub use models::*;

use eyre::{Result, WrapErr};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use uuid::Uuid;

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(|e| e.code().as_deref() == Some("23505"))
}

#[derive(Clone)]
pub struct Store {
    write_pool: PgPool,
    read_pool: PgPool,
}

impl Store {
    pub async fn connect(write_dsn: &str, read_dsn: &str) -> Result<Self> {
        let write_pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(write_dsn)
            .await
            .wrap_err("failed to connect to write DSN")?;
        let read_pool = if read_dsn == write_dsn {
            write_pool.clone()
        } else {
            PgPoolOptions::new()
                .max_connections(10)
                .connect(read_dsn)
                .await
                .wrap_err("failed to connect to read DSN")?
        };
        Ok(Self { write_pool, read_pool })
    }

    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.write_pool)
            .await
            .wrap_err("failed to run database migrations")?;
        Ok(())
    }

    // ---- Network handler registry -----------------------------------------

    /// Idempotent upsert of the bootstrap `PROC_API_NETWORK_HANDLERS` list.
    pub async fn bootstrap_network_handlers(
        &self,
        handlers: &[(String, String, String, Vec<u8>)],
    ) -> Result<()> {
        for (name, display_name, server_url, api_key_enc) in handlers {
            sqlx::query(
                r#"INSERT INTO network_handlers (name, display_name, server_url, api_key, is_active)
                   VALUES ($1, $2, $3, $4, true)
                   ON CONFLICT (name) DO UPDATE
                   SET display_name = EXCLUDED.display_name,
                       server_url = EXCLUDED.server_url,
                       api_key = EXCLUDED.api_key"#,
            )
            .bind(name)
            .bind(display_name)
            .bind(server_url)
            .bind(api_key_enc)
            .execute(&self.write_pool)
            .await
            .wrap_err("failed to upsert network handler")?;
        }
        Ok(())
    }

    pub async fn get_network_handler(&self, name: &str) -> Result<Option<NetworkHandler>> {
        let row = sqlx::query_as::<_, NetworkHandler>(
            "SELECT * FROM network_handlers WHERE name = $1 AND is_active = true",
        )
        .bind(name)
        .fetch_optional(&self.read_pool)
        .await?;
        Ok(row)
    }

    pub async fn all_network_handlers(&self) -> Result<Vec<NetworkHandler>> {
        let rows = sqlx::query_as::<_, NetworkHandler>("SELECT * FROM network_handlers")
            .fetch_all(&self.read_pool)
            .await?;
        Ok(rows)
    }

    // ---- Customers ----------------------------------------------------------

    pub async fn create_customer(
        &self,
        callback_url: &str,
        callback_api_key_enc: &[u8],
        api_key_hash: &str,
    ) -> Result<Option<Uuid>> {
        let result = sqlx::query(
            r#"INSERT INTO customers (id, callback_url, callback_api_key, api_key_hash)
               VALUES (gen_random_uuid(), $1, $2, $3) RETURNING id"#,
        )
        .bind(callback_url)
        .bind(callback_api_key_enc)
        .bind(api_key_hash)
        .fetch_one(&self.write_pool)
        .await;
        match result {
            Ok(row) => Ok(Some(row.get("id"))),
            Err(sqlx::Error::Database(e)) if e.code().as_deref() == Some("23505") => Ok(None),
            Err(e) => Err(e).wrap_err("failed to insert customer"),
        }
    }

    pub async fn get_customer_by_api_key_hash(&self, hash: &str) -> Result<Option<Customer>> {
        let row = sqlx::query_as::<_, Customer>("SELECT * FROM customers WHERE api_key_hash = $1")
            .bind(hash)
            .fetch_optional(&self.read_pool)
            .await?;
        Ok(row)
    }

    // ---- Dispatcher-side users ------------------------------------------------

    pub async fn register_user(&self, user_id: &str, customer_id: Uuid, role: Role) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO dispatcher_users (id, role, customer_id) VALUES ($1, $2, $3)
               ON CONFLICT (id) DO NOTHING"#,
        )
        .bind(user_id)
        .bind(role as i32)
        .bind(customer_id)
        .execute(&self.write_pool)
        .await
        .wrap_err("failed to insert dispatcher user")?;
        Ok(())
    }

    pub async fn get_user(&self, user_id: &str) -> Result<Option<DispatcherUser>> {
        let row = sqlx::query_as::<_, DispatcherUser>("SELECT * FROM dispatcher_users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.read_pool)
            .await?;
        Ok(row)
    }

    // ---- Callback queue (§4.9 "Dispatcher's callback worker") ---------------

    /// Enqueues a callback row. Returns `Ok(false)` (rather than an error)
    /// when `callback_id` already exists — the caller maps that to HTTP 409
    /// per the idempotent-receiver contract (P6).
    pub async fn enqueue_callback(
        &self,
        callback_id: &str,
        user_id: &str,
        path: &str,
        json_data: &serde_json::Value,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"INSERT INTO callbacks (id, user_id, path, json_data) VALUES ($1, $2, $3, $4)"#,
        )
        .bind(callback_id)
        .bind(user_id)
        .bind(path)
        .bind(json_data)
        .execute(&self.write_pool)
        .await;
        match result {
            Ok(_) => Ok(true),
            Err(e) if e.as_database_error().is_some_and(is_unique_violation) => Ok(false),
            Err(e) => Err(e).wrap_err("failed to enqueue callback"),
        }
    }

    pub async fn get_and_lock_unnotified_callbacks(&self, limit: i64) -> Result<Vec<CallbackForDelivery>> {
        let ids: Vec<String> = sqlx::query_scalar(
            r#"UPDATE callbacks SET locked_by_callback = true WHERE id IN (
                   SELECT id FROM callbacks
                   WHERE is_notified = false AND locked_by_callback = false
                     AND time_to_callback < now()
                   LIMIT $1
                   FOR UPDATE SKIP LOCKED
               ) RETURNING id"#,
        )
        .bind(limit)
        .fetch_all(&self.write_pool)
        .await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query_as::<_, CallbackForDelivery>(
            r#"SELECT cb.id, cb.user_id, cb.path, cb.json_data, cb.callback_period,
                      cu.callback_url, cu.callback_api_key
               FROM callbacks cb
               JOIN dispatcher_users du ON du.id = cb.user_id
               JOIN customers cu ON cu.id = du.customer_id
               WHERE cb.id = ANY($1)"#,
        )
        .bind(&ids)
        .fetch_all(&self.read_pool)
        .await?;
        Ok(rows)
    }

    pub async fn mark_callback_notified(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE callbacks SET is_notified = true, locked_by_callback = false WHERE id = $1")
            .bind(id)
            .execute(&self.write_pool)
            .await?;
        Ok(())
    }

    pub async fn retry_callback(&self, id: &str, bump_secs: i64) -> Result<()> {
        sqlx::query(
            r#"UPDATE callbacks SET locked_by_callback = false,
                  callback_period = callback_period + $2,
                  time_to_callback = now() + (callback_period + $2) * interval '1 second'
               WHERE id = $1"#,
        )
        .bind(id)
        .bind(bump_secs as i32)
        .execute(&self.write_pool)
        .await?;
        Ok(())
    }

    pub fn write_pool(&self) -> &PgPool {
        &self.write_pool
    }

    pub fn read_pool(&self) -> &PgPool {
        &self.read_pool
    }
}
