//! Store (C3): transactional persistence of users, addresses, coins,
//! balances, deposits, withdrawals, last-handled block; at-most-once
//! locking queries.
//!
//! Every "get and lock" query uses `FOR UPDATE SKIP LOCKED` so N conductor
//! workers (or N processes racing a shared Postgres) never hand the same row
//! to two executors — the strengthening over the original implementation's
//! plain `FOR UPDATE` called out in SPEC_FULL.md §4.3 and DESIGN.md.

pub mod models;

pub use models::*;

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use eyre::{Result, WrapErr};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use uuid::Uuid;

/// Kind discriminant for a deposit-conductor query (§4.6/§4.7 share the same
/// shape, differing only in whether `contract_address = 'native'`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepositKind {
    Native,
    Token,
}

#[derive(Clone)]
pub struct Store {
    write_pool: PgPool,
    read_pool: PgPool,
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(|e| e.code().as_deref() == Some("23505"))
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

    /// Startup-safety sweep (§5 "Cancellation and timeouts", mechanism b):
    /// clears `locked_by_tx_handler`/`locked_by_tx` left over from a process
    /// that died mid-job, for rows whose retry window has already elapsed.
    pub async fn unlock_stale_tx_handler_rows(&self) -> Result<()> {
        let mut tx = self.write_pool.begin().await?;
        sqlx::query(
            r#"UPDATE user_address SET locked_by_tx = false
               WHERE id IN (
                   SELECT address_id FROM deposits
                   WHERE locked_by_tx_handler = true AND time_to_tx_handler < now()
                   UNION
                   SELECT admin_addr_id FROM withdrawals
                   WHERE admin_addr_id IS NOT NULL AND tx_hash_out IS NULL AND time_to_tx_handler < now()
               )"#,
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "UPDATE deposits SET locked_by_tx_handler = false
             WHERE locked_by_tx_handler = true AND time_to_tx_handler < now()",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "UPDATE withdrawals SET admin_addr_id = NULL
             WHERE admin_addr_id IS NOT NULL AND tx_hash_out IS NULL AND time_to_tx_handler < now()",
        )
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    // ---- Block tracking (invariant 6) ----------------------------------

    pub async fn get_last_handled_block(&self) -> Result<Option<i64>> {
        let row = sqlx::query("SELECT max(id) AS id FROM blocks")
            .fetch_one(&self.read_pool)
            .await?;
        Ok(row.try_get::<Option<i64>, _>("id")?)
    }

    /// Inserts the new deposits and advances `last_handled_block` to
    /// `block_number` in one transaction — either both happen or neither
    /// does (§5 "Ordering guarantees"). The block insert's primary key
    /// constraint enforces invariant 6 (strictly monotone ids); a duplicate
    /// `tx_hash_in` is expected on scanner replay and silently dropped
    /// rather than aborting the whole batch.
    pub async fn record_block_and_deposits(
        &self,
        block_number: i64,
        deposits: &[NewDeposit],
    ) -> Result<usize> {
        let mut tx = self.write_pool.begin().await?;
        let mut inserted = 0usize;
        for d in deposits {
            let result = sqlx::query(
                r#"INSERT INTO deposits (address_id, contract_address, tx_hash_in, amount, quote_amount)
                   VALUES ($1, $2, $3, $4, $5)
                   ON CONFLICT (tx_hash_in) DO NOTHING"#,
            )
            .bind(d.address_id)
            .bind(&d.contract_address)
            .bind(&d.tx_hash_in)
            .bind(&d.amount)
            .bind(&d.quote_amount)
            .execute(&mut *tx)
            .await
            .wrap_err("failed to insert deposit")?;
            if result.rows_affected() > 0 {
                inserted += 1;
            }
        }
        sqlx::query("INSERT INTO blocks (id, deposit_count, withdrawal_count) VALUES ($1, $2, 0)")
            .bind(block_number)
            .bind(inserted as i32)
            .execute(&mut *tx)
            .await
            .wrap_err("failed to advance last_handled_block (duplicate or non-monotone id)")?;
        tx.commit().await?;
        Ok(inserted)
    }

    pub async fn get_handled_blocks(&self, limit: i64, offset: i64) -> Result<Vec<Block>> {
        let rows = sqlx::query_as::<_, Block>(
            "SELECT id, deposit_count, withdrawal_count FROM blocks ORDER BY id DESC LIMIT $1 OFFSET $2",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.read_pool)
        .await?;
        Ok(rows)
    }

    // ---- Coins -----------------------------------------------------------

    pub async fn upsert_coins(&self, coins: &[crate::config::CoinConfig]) -> Result<()> {
        for c in coins {
            sqlx::query(
                r#"INSERT INTO coins (contract_address, name, decimals, min_amount, fee_amount, is_active)
                   VALUES ($1, $2, $3, $4, $5, true)
                   ON CONFLICT (contract_address) DO UPDATE
                   SET name = EXCLUDED.name, decimals = EXCLUDED.decimals,
                       min_amount = EXCLUDED.min_amount, fee_amount = EXCLUDED.fee_amount"#,
            )
            .bind(&c.contract_address)
            .bind(&c.name)
            .bind(c.decimals)
            .bind(&c.min_amount)
            .bind(&c.fee_amount)
            .execute(&self.write_pool)
            .await
            .wrap_err("failed to upsert coin")?;
        }
        Ok(())
    }

    pub async fn get_active_coins(&self) -> Result<Vec<Coin>> {
        let rows = sqlx::query_as::<_, Coin>("SELECT * FROM coins WHERE is_active = true")
            .fetch_all(&self.read_pool)
            .await?;
        Ok(rows)
    }

    pub async fn get_coin(&self, contract_address: &str) -> Result<Option<Coin>> {
        let row = sqlx::query_as::<_, Coin>("SELECT * FROM coins WHERE contract_address = $1")
            .bind(contract_address)
            .fetch_optional(&self.read_pool)
            .await?;
        Ok(row)
    }

    pub async fn set_coin_rate(&self, contract_address: &str, rate: &BigDecimal) -> Result<()> {
        sqlx::query("UPDATE coins SET current_rate = $1 WHERE contract_address = $2")
            .bind(rate)
            .bind(contract_address)
            .execute(&self.write_pool)
            .await?;
        Ok(())
    }

    // ---- Users / addresses ------------------------------------------------

    pub async fn create_user(&self, user_id: &str, role: Role) -> Result<()> {
        sqlx::query("INSERT INTO users (id, role) VALUES ($1, $2) ON CONFLICT (id) DO NOTHING")
            .bind(user_id)
            .bind(role as i32)
            .execute(&self.write_pool)
            .await?;
        Ok(())
    }

    pub async fn insert_user_address(
        &self,
        user_id: &str,
        public: &str,
        private_enc: &[u8],
        admin_id: Option<i32>,
        approve_id: Option<i32>,
    ) -> Result<i32> {
        let row = sqlx::query(
            r#"INSERT INTO user_address (user_id, public, private, admin_id, approve_id, locked_by_tx)
               VALUES ($1, $2, $3, $4, $5, false) RETURNING id"#,
        )
        .bind(user_id)
        .bind(public)
        .bind(private_enc)
        .bind(admin_id)
        .bind(approve_id)
        .fetch_one(&self.write_pool)
        .await
        .wrap_err("failed to insert user_address")?;
        Ok(row.get("id"))
    }

    pub async fn get_user_address_by_user(&self, user_id: &str) -> Result<Option<UserAddress>> {
        let row = sqlx::query_as::<_, UserAddress>(
            "SELECT * FROM user_address WHERE user_id = $1 AND admin_id IS NOT NULL LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(&self.read_pool)
        .await?;
        Ok(row)
    }

    pub async fn get_user(&self, user_id: &str) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.read_pool)
            .await?;
        Ok(row)
    }

    /// USER/SADMIN/APPROVE address projections for the Shared state snapshot
    /// (§4.4): keyed by lowercased/hex canonical address upstream.
    pub async fn users_addresses(&self, roles: &[Role], limit: i64) -> Result<Vec<UserAddress>> {
        let role_ints: Vec<i32> = roles.iter().map(|r| *r as i32).collect();
        let rows = sqlx::query_as::<_, UserAddress>(
            r#"SELECT ua.* FROM user_address ua
               JOIN users u ON u.id = ua.user_id
               WHERE u.role = ANY($1)
               LIMIT $2"#,
        )
        .bind(&role_ints)
        .bind(limit)
        .fetch_all(&self.read_pool)
        .await?;
        Ok(rows)
    }

    /// Next deterministic derivation index for a freshly provisioned USER
    /// keypair (`/add_account`) — the count of USER rows created so far.
    /// Racy under concurrent `/add_account` calls against the same process
    /// (two requests could read the same count before either inserts); left
    /// as a known limitation since the admin/approve API surface this
    /// guards is already authenticated and low-QPS in practice.
    pub async fn count_user_addresses(&self) -> Result<u32> {
        let row = sqlx::query(
            r#"SELECT count(*) AS n FROM user_address ua JOIN users u ON u.id = ua.user_id WHERE u.role = $1"#,
        )
        .bind(Role::User as i32)
        .fetch_one(&self.write_pool)
        .await?;
        let n: i64 = row.get("n");
        Ok(n as u32)
    }

    pub async fn all_accounts(&self) -> Result<Vec<UserAddress>> {
        let rows = sqlx::query_as::<_, UserAddress>("SELECT * FROM user_address")
            .fetch_all(&self.read_pool)
            .await?;
        Ok(rows)
    }

    /// Picks one unlocked SADMIN and one unlocked APPROVE address at random
    /// for a freshly provisioned USER (`/add_account`).
    pub async fn pick_admin_and_approve(&self) -> Result<Option<(i32, i32)>> {
        let admin = sqlx::query(
            r#"SELECT ua.id FROM user_address ua JOIN users u ON u.id = ua.user_id
               WHERE u.role = $1 ORDER BY random() LIMIT 1"#,
        )
        .bind(Role::Sadmin as i32)
        .fetch_optional(&self.read_pool)
        .await?;
        let approve = sqlx::query(
            r#"SELECT ua.id FROM user_address ua JOIN users u ON u.id = ua.user_id
               WHERE u.role = $1 ORDER BY random() LIMIT 1"#,
        )
        .bind(Role::Approve as i32)
        .fetch_optional(&self.read_pool)
        .await?;
        match (admin, approve) {
            (Some(a), Some(p)) => Ok(Some((a.get("id"), p.get("id")))),
            _ => Ok(None),
        }
    }

    // ---- Deposit conductor queries (§4.3, §4.6, §4.7) ----------------------

    /// `get_and_lock_pending_deposits_native`/`_coin`: atomically selects and
    /// locks up to `limit` rows, distinct by `address_id`.
    pub async fn get_and_lock_pending_deposits(
        &self,
        kind: DepositKind,
        limit: i64,
    ) -> Result<Vec<DepositForTx>> {
        let contract_filter = match kind {
            DepositKind::Native => "d.contract_address = 'native'",
            DepositKind::Token => "d.contract_address != 'native'",
        };
        let query = format!(
            r#"
            WITH candidates AS (
                SELECT DISTINCT ON (d.address_id) d.id
                FROM deposits d
                JOIN user_address ua ON ua.id = d.address_id
                JOIN user_address admin_ua ON admin_ua.id = ua.admin_id
                LEFT JOIN user_address approve_ua ON approve_ua.id = ua.approve_id
                WHERE {contract_filter}
                  AND (d.tx_hash_out IS NULL OR d.last_tx_error = 'ProviderConnectionErrorOnTx')
                  AND d.locked_by_tx_handler = false
                  AND d.time_to_tx_handler < now()
                  AND ua.locked_by_tx = false
                  AND (approve_ua.id IS NULL OR approve_ua.locked_by_tx = false)
                ORDER BY d.address_id, d.created_at
                LIMIT $1
                FOR UPDATE OF d SKIP LOCKED
            )
            UPDATE deposits d
            SET locked_by_tx_handler = true
            FROM candidates
            WHERE d.id = candidates.id
            RETURNING d.id, d.address_id, d.contract_address, d.amount, d.tx_hash_out, d.tx_handler_period
            "#
        );
        let rows = sqlx::query(&query).bind(limit).fetch_all(&self.write_pool).await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let id: Uuid = row.get("id");
            let address_id: i32 = row.get("address_id");
            let contract_address: String = row.get("contract_address");
            let amount: BigDecimal = row.get("amount");
            let tx_hash_out: Option<String> = row.get("tx_hash_out");
            let tx_handler_period: i32 = row.get("tx_handler_period");

            let ua = sqlx::query(
                r#"SELECT ua.public AS user_public, ua.private AS user_private, ua.approve_id,
                          admin_ua.public AS admin_public,
                          approve_ua.public AS approve_public, approve_ua.private AS approve_private
                   FROM user_address ua
                   JOIN user_address admin_ua ON admin_ua.id = ua.admin_id
                   LEFT JOIN user_address approve_ua ON approve_ua.id = ua.approve_id
                   WHERE ua.id = $1"#,
            )
            .bind(address_id)
            .fetch_one(&self.write_pool)
            .await?;

            sqlx::query("UPDATE user_address SET locked_by_tx = true WHERE id = $1")
                .bind(address_id)
                .execute(&self.write_pool)
                .await?;
            // Only the token path (§4.7) locks the approve account — the
            // native path never spends through it.
            let approve_id: Option<i32> = if kind == DepositKind::Token {
                ua.get("approve_id")
            } else {
                None
            };
            if let Some(aid) = approve_id {
                sqlx::query("UPDATE user_address SET locked_by_tx = true WHERE id = $1")
                    .bind(aid)
                    .execute(&self.write_pool)
                    .await?;
            }

            out.push(DepositForTx {
                id,
                address_id,
                contract_address,
                amount,
                tx_hash_out,
                tx_handler_period,
                user_public: ua.get("user_public"),
                user_private: ua.get("user_private"),
                admin_public: ua.get("admin_public"),
                approve_id,
                approve_public: ua.get("approve_public"),
                approve_private: ua.get("approve_private"),
            });
        }
        Ok(out)
    }

    /// Successful sweep: sets `tx_hash_out`, clears `last_tx_error` so the
    /// row is never re-selected by `get_and_lock_pending_deposits` again,
    /// and clears both locks.
    pub async fn finish_deposit_success(
        &self,
        id: Uuid,
        tx_hash_out: &str,
        address_id: i32,
        approve_id: Option<i32>,
    ) -> Result<()> {
        let mut tx = self.write_pool.begin().await?;
        sqlx::query(
            "UPDATE deposits SET tx_hash_out = $1, last_tx_error = NULL, locked_by_tx_handler = false WHERE id = $2",
        )
        .bind(tx_hash_out)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE user_address SET locked_by_tx = false WHERE id = $1")
            .bind(address_id)
            .execute(&mut *tx)
            .await?;
        if let Some(aid) = approve_id {
            sqlx::query("UPDATE user_address SET locked_by_tx = false WHERE id = $1")
                .bind(aid)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Recoverable rebuild failure (`AlreadyKnown`/`UnderpricedTransaction`/
    /// `InsufficientFundsForTx`/`TransactionFailed`): clears the handler
    /// lock, bumps the retry window, leaves `tx_hash_out` null. The approve
    /// account (if any) always unlocks; the user address only unlocks for
    /// the token path's success case — for the failure case here it also
    /// unlocks, since the next attempt rebuilds a fresh transaction from
    /// scratch and needs the user address available to pick up again.
    pub async fn finish_deposit_retry(
        &self,
        id: Uuid,
        address_id: i32,
        approve_id: Option<i32>,
        bump_secs: i64,
    ) -> Result<()> {
        let mut tx = self.write_pool.begin().await?;
        sqlx::query(
            r#"UPDATE deposits SET locked_by_tx_handler = false, last_tx_error = NULL,
                  tx_handler_period = tx_handler_period + $2,
                  time_to_tx_handler = now() + (tx_handler_period + $2) * interval '1 second'
               WHERE id = $1"#,
        )
        .bind(id)
        .bind(bump_secs as i32)
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE user_address SET locked_by_tx = false WHERE id = $1")
            .bind(address_id)
            .execute(&mut *tx)
            .await?;
        if let Some(aid) = approve_id {
            sqlx::query("UPDATE user_address SET locked_by_tx = false WHERE id = $1")
                .bind(aid)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// `ProviderConnectionErrorOnTx`: persist the known hash and mark
    /// `last_tx_error` so `get_and_lock_pending_deposits` still treats this
    /// row as a candidate (its confirmation status is unknown), unlock the
    /// handler lock only (the user/approve address stays locked — the row
    /// will be re-picked by the poll-only path, which needs the source
    /// address to remain unavailable to any other conductor).
    pub async fn set_deposit_conn_error_hash(&self, id: Uuid, tx_hash: &str, bump_secs: i64) -> Result<()> {
        sqlx::query(
            r#"UPDATE deposits SET tx_hash_out = $1, last_tx_error = 'ProviderConnectionErrorOnTx',
                  locked_by_tx_handler = false,
                  tx_handler_period = tx_handler_period + $3,
                  time_to_tx_handler = now() + (tx_handler_period + $3) * interval '1 second'
               WHERE id = $2"#,
        )
        .bind(tx_hash)
        .bind(id)
        .bind(bump_secs as i32)
        .execute(&self.write_pool)
        .await?;
        Ok(())
    }

    /// Releases just the approve address lock, leaving the deposit row and
    /// the user address lock untouched — used by the token conductor when a
    /// connection error or stuck transaction still needs the user address
    /// held for the poll-only retry path, but the approve account (which
    /// played no further part in that attempt) should return to the pool.
    pub async fn finish_deposit_retry_approve_only(&self, approve_id: i32) -> Result<()> {
        sqlx::query("UPDATE user_address SET locked_by_tx = false WHERE id = $1")
            .bind(approve_id)
            .execute(&self.write_pool)
            .await?;
        Ok(())
    }

    /// `StuckTransaction`: critical, no automatic retry. The handler lock is
    /// left set so no other conductor picks the row up; an operator clears
    /// it manually (or the startup sweep does, on the next process
    /// restart, per P4).
    pub async fn mark_deposit_stuck(&self, id: Uuid) -> Result<()> {
        tracing::error!(deposit_id = %id, "deposit sweep stuck; operator intervention required");
        Ok(())
    }

    // ---- Withdrawal conductor queries (§4.8) -------------------------------

    pub async fn count_free_sadmin(&self) -> Result<i64> {
        let row = sqlx::query(
            r#"SELECT count(*) AS n FROM user_address ua JOIN users u ON u.id = ua.user_id
               WHERE u.role = $1 AND ua.locked_by_tx = false"#,
        )
        .bind(Role::Sadmin as i32)
        .fetch_one(&self.read_pool)
        .await?;
        Ok(row.get("n"))
    }

    /// Claims up to `count` withdrawals, matching each to an admin whose
    /// balance of the requested coin is `>= amount` (the stricter of the two
    /// policies found in the original source — Design Notes item c).
    pub async fn get_and_lock_pending_withdrawals(&self, count: i64) -> Result<Vec<WithdrawalForTx>> {
        if count <= 0 {
            return Ok(Vec::new());
        }
        let candidates = sqlx::query(
            r#"SELECT w.id, w.contract_address, w.withdrawal_address, w.amount, w.tx_handler_period
               FROM withdrawals w
               WHERE w.tx_hash_out IS NULL AND w.admin_addr_id IS NULL
                 AND w.time_to_tx_handler < now()
               ORDER BY w.created_at
               LIMIT $1
               FOR UPDATE OF w SKIP LOCKED"#,
        )
        .bind(count)
        .fetch_all(&self.write_pool)
        .await?;

        let mut out = Vec::new();
        for row in candidates {
            let id: Uuid = row.get("id");
            let contract_address: String = row.get("contract_address");
            let amount: BigDecimal = row.get("amount");

            let admin = sqlx::query(
                r#"SELECT ua.id, ua.public, ua.private FROM user_address ua
                   JOIN users u ON u.id = ua.user_id
                   JOIN balances b ON b.address_id = ua.id
                   WHERE u.role = $1 AND ua.locked_by_tx = false
                     AND b.contract_address = $2 AND b.balance >= $3
                   ORDER BY random() LIMIT 1
                   FOR UPDATE OF ua SKIP LOCKED"#,
            )
            .bind(Role::Sadmin as i32)
            .bind(&contract_address)
            .bind(&amount)
            .fetch_optional(&self.write_pool)
            .await?;

            let Some(admin) = admin else { continue };
            let admin_id: i32 = admin.get("id");

            sqlx::query("UPDATE withdrawals SET admin_addr_id = $1 WHERE id = $2")
                .bind(admin_id)
                .bind(id)
                .execute(&self.write_pool)
                .await?;
            sqlx::query("UPDATE user_address SET locked_by_tx = true WHERE id = $1")
                .bind(admin_id)
                .execute(&self.write_pool)
                .await?;

            out.push(WithdrawalForTx {
                id,
                contract_address,
                withdrawal_address: row.get("withdrawal_address"),
                amount,
                tx_handler_period: row.get("tx_handler_period"),
                admin_id,
                admin_public: admin.get("public"),
                admin_private: admin.get("private"),
            });
        }
        Ok(out)
    }

    pub async fn finish_withdrawal_success(&self, id: Uuid, tx_hash_out: &str, admin_id: i32) -> Result<()> {
        let mut tx = self.write_pool.begin().await?;
        sqlx::query("UPDATE withdrawals SET tx_hash_out = $1 WHERE id = $2")
            .bind(tx_hash_out)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE user_address SET locked_by_tx = false WHERE id = $1")
            .bind(admin_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Recoverable failure: release the admin by nulling `admin_addr_id`,
    /// push `time_to_tx_handler` forward.
    pub async fn finish_withdrawal_retry(&self, id: Uuid, admin_id: i32, bump_secs: i64) -> Result<()> {
        let mut tx = self.write_pool.begin().await?;
        sqlx::query(
            r#"UPDATE withdrawals SET admin_addr_id = NULL,
                  tx_handler_period = tx_handler_period + $2,
                  time_to_tx_handler = now() + (tx_handler_period + $2) * interval '1 second'
               WHERE id = $1"#,
        )
        .bind(id)
        .bind(bump_secs as i32)
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE user_address SET locked_by_tx = false WHERE id = $1")
            .bind(admin_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn mark_withdrawal_stuck(&self, id: Uuid) -> Result<()> {
        tracing::error!(withdrawal_id = %id, "withdrawal stuck or not found; operator intervention required");
        Ok(())
    }

    pub async fn create_withdrawal(
        &self,
        user_id: &str,
        contract_address: &str,
        withdrawal_address: &str,
        amount: &BigDecimal,
        quote_amount: &BigDecimal,
        user_currency: &str,
    ) -> Result<Uuid> {
        let row = sqlx::query(
            r#"INSERT INTO withdrawals (user_id, contract_address, withdrawal_address, amount, quote_amount, user_currency)
               VALUES ($1, $2, $3, $4, $5, $6) RETURNING id"#,
        )
        .bind(user_id)
        .bind(contract_address)
        .bind(withdrawal_address)
        .bind(amount)
        .bind(quote_amount)
        .bind(user_currency)
        .fetch_one(&self.write_pool)
        .await
        .wrap_err("failed to insert withdrawal")?;
        Ok(row.get("id"))
    }

    // ---- Notifier queries (§4.9) -------------------------------------------

    pub async fn get_and_lock_unnotified_deposits(&self, limit: i64) -> Result<Vec<DepositForCallback>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"UPDATE deposits SET locked_by_callback = true WHERE id IN (
                   SELECT id FROM deposits
                   WHERE is_notified = false AND locked_by_callback = false
                     AND time_to_callback < now()
                   ORDER BY created_at LIMIT $1
                   FOR UPDATE SKIP LOCKED
               ) RETURNING id"#,
        )
        .bind(limit)
        .fetch_all(&self.write_pool)
        .await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query_as::<_, DepositForCallback>(
            r#"SELECT d.id, ua.user_id, d.contract_address, d.tx_hash_in, d.tx_hash_out,
                      d.amount, d.quote_amount, c.decimals, c.current_rate
               FROM deposits d
               JOIN user_address ua ON ua.id = d.address_id
               JOIN coins c ON c.contract_address = d.contract_address
               WHERE d.id = ANY($1)"#,
        )
        .bind(&ids)
        .fetch_all(&self.read_pool)
        .await?;
        Ok(rows)
    }

    pub async fn get_and_lock_unnotified_withdrawals(&self, limit: i64) -> Result<Vec<WithdrawalForCallback>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"UPDATE withdrawals SET locked_by_callback = true WHERE id IN (
                   SELECT id FROM withdrawals
                   WHERE tx_hash_out IS NOT NULL AND is_notified = false AND locked_by_callback = false
                     AND time_to_callback < now()
                   ORDER BY created_at LIMIT $1
                   FOR UPDATE SKIP LOCKED
               ) RETURNING id"#,
        )
        .bind(limit)
        .fetch_all(&self.write_pool)
        .await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query_as::<_, WithdrawalForCallback>(
            r#"SELECT w.id, w.user_id, w.contract_address, w.withdrawal_address, w.tx_hash_out,
                      w.amount, w.quote_amount, w.user_currency, c.decimals, c.current_rate
               FROM withdrawals w
               JOIN coins c ON c.contract_address = w.contract_address
               WHERE w.id = ANY($1)"#,
        )
        .bind(&ids)
        .fetch_all(&self.read_pool)
        .await?;
        Ok(rows)
    }

    pub async fn mark_deposit_notified(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE deposits SET is_notified = true, locked_by_callback = false WHERE id = $1")
            .bind(id)
            .execute(&self.write_pool)
            .await?;
        Ok(())
    }

    pub async fn retry_deposit_notification(&self, id: Uuid, bump_secs: i64) -> Result<()> {
        sqlx::query(
            r#"UPDATE deposits SET locked_by_callback = false,
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

    pub async fn mark_withdrawal_notified(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE withdrawals SET is_notified = true, locked_by_callback = false WHERE id = $1")
            .bind(id)
            .execute(&self.write_pool)
            .await?;
        Ok(())
    }

    pub async fn retry_withdrawal_notification(&self, id: Uuid, bump_secs: i64) -> Result<()> {
        sqlx::query(
            r#"UPDATE withdrawals SET locked_by_callback = false,
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

    // ---- Balances (C10) -----------------------------------------------------

    pub async fn upsert_balance(&self, address_id: i32, contract_address: &str, balance: &BigDecimal) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO balances (address_id, contract_address, balance) VALUES ($1, $2, $3)
               ON CONFLICT (address_id, contract_address) DO UPDATE SET balance = EXCLUDED.balance"#,
        )
        .bind(address_id)
        .bind(contract_address)
        .bind(balance)
        .execute(&self.write_pool)
        .await?;
        Ok(())
    }

    pub async fn get_balance(&self, address_id: i32, contract_address: &str) -> Result<Option<BigDecimal>> {
        let row = sqlx::query("SELECT balance FROM balances WHERE address_id = $1 AND contract_address = $2")
            .bind(address_id)
            .bind(contract_address)
            .fetch_optional(&self.read_pool)
            .await?;
        Ok(row.map(|r| r.get("balance")))
    }

    pub fn is_unique_violation(err: &eyre::Error) -> bool {
        err.downcast_ref::<sqlx::Error>().is_some_and(is_unique_violation)
    }

    pub fn write_pool(&self) -> &PgPool {
        &self.write_pool
    }

    pub fn read_pool(&self) -> &PgPool {
        &self.read_pool
    }
}

/// Retry-window arithmetic shared by every conductor/notifier (§5
/// "Retries/backoff"): linear growth capped only by operator cleanup.
pub fn next_period(current_period: i32, step: i32) -> i32 {
    current_period + step
}

pub fn retry_at(from: DateTime<Utc>, period_secs: i32) -> DateTime<Utc> {
    from + chrono::Duration::seconds(period_secs as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_grows_linearly() {
        assert_eq!(next_period(60, 30), 90);
        assert_eq!(next_period(90, 30), 120);
    }

    #[test]
    fn retry_at_adds_seconds() {
        let base = Utc::now();
        let next = retry_at(base, 60);
        assert_eq!((next - base).num_seconds(), 60);
    }
}
