//! Shared state (C4): in-memory caches refreshed on a timer.
//!
//! Implemented as an immutable snapshot swapped under a lock (Design Notes,
//! "In-memory projections"): each refresh job builds a brand-new `Snapshot`
//! off the Store and swaps a single `Arc<RwLock<Snapshot>>` pointer. Readers
//! clone the `Arc` under a short-held read lock and then work from their own
//! immutable copy, so a slow reader never blocks the writer and the writer
//! never blocks a reader mid-read. The "readiness event" from the
//! specification collapses to "the gas price field is `Some` only once the
//! first refresh has completed".

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{watch, RwLock};

use crate::db::models::UserAddress;

#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub last_handled_block: i64,
    pub trusted_block: i64,
    /// canonical (lowercased/hex) address -> `user_address.id`, USER role only.
    pub user_accounts: HashMap<String, i32>,
    /// canonical address -> `user_address.id`, SADMIN+APPROVE roles.
    pub handler_accounts: HashMap<String, i32>,
    pub gas_price: Option<u128>,
    pub block_parser_interval_secs: u64,
}

pub struct SharedState {
    snapshot: RwLock<Arc<Snapshot>>,
    gas_price_ready: watch::Sender<bool>,
    gas_price_ready_rx: watch::Receiver<bool>,
}

impl SharedState {
    pub fn new(default_interval_secs: u64) -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            snapshot: RwLock::new(Arc::new(Snapshot {
                block_parser_interval_secs: default_interval_secs,
                ..Default::default()
            })),
            gas_price_ready: tx,
            gas_price_ready_rx: rx,
        }
    }

    pub async fn get(&self) -> Arc<Snapshot> {
        self.snapshot.read().await.clone()
    }

    /// Non-blocking read of the scanner's current pacing interval, for the
    /// scheduler's dynamic-interval closure (which cannot `.await`). Falls
    /// back to the last-known value's default if the snapshot is momentarily
    /// write-locked rather than blocking the scheduler thread.
    pub fn current_interval_secs(&self) -> u64 {
        match self.snapshot.try_read() {
            Ok(guard) => guard.block_parser_interval_secs,
            Err(_) => 1,
        }
    }

    /// Replaces the whole snapshot. Used by `update_in_memory_accounts` and
    /// the scanner/block-parser pacing job.
    pub async fn swap(&self, new: Snapshot) {
        let ready = new.gas_price.is_some();
        *self.snapshot.write().await = Arc::new(new);
        if ready {
            let _ = self.gas_price_ready.send(true);
        }
    }

    /// Sets just `gas_price`, preserving the rest of the snapshot.
    pub async fn set_gas_price(&self, gas_price: u128) {
        let mut guard = self.snapshot.write().await;
        let mut next = (**guard).clone();
        next.gas_price = Some(gas_price);
        *guard = Arc::new(next);
        let _ = self.gas_price_ready.send(true);
    }

    pub async fn set_block_parser_interval(&self, secs: u64) {
        let mut guard = self.snapshot.write().await;
        let mut next = (**guard).clone();
        next.block_parser_interval_secs = secs;
        *guard = Arc::new(next);
    }

    pub async fn set_last_handled_block(&self, n: i64) {
        let mut guard = self.snapshot.write().await;
        let mut next = (**guard).clone();
        next.last_handled_block = n;
        *guard = Arc::new(next);
    }

    pub async fn set_trusted_block(&self, n: i64) {
        let mut guard = self.snapshot.write().await;
        let mut next = (**guard).clone();
        next.trusted_block = n;
        *guard = Arc::new(next);
    }

    /// Conductors that need a gas price await this before their very first
    /// build, so it can never race an unset value (§4.10).
    pub async fn wait_for_gas_price(&self) {
        let mut rx = self.gas_price_ready_rx.clone();
        if *rx.borrow() {
            return;
        }
        let _ = rx.changed().await;
    }
}

/// Builds the `user_accounts`/`handler_accounts` index maps from a flat list
/// of addresses, keyed by each chain client's canonical address form.
pub fn build_account_indexes(
    addresses: &[UserAddress],
    users_by_id: &HashMap<String, crate::db::models::Role>,
    canonicalize: impl Fn(&str) -> String,
) -> (HashMap<String, i32>, HashMap<String, i32>) {
    let mut user_accounts = HashMap::new();
    let mut handler_accounts = HashMap::new();
    for addr in addresses {
        let Some(role) = users_by_id.get(&addr.user_id) else { continue };
        let key = canonicalize(&addr.public);
        match role {
            crate::db::models::Role::User => {
                user_accounts.insert(key, addr.id);
            }
            crate::db::models::Role::Sadmin | crate::db::models::Role::Approve => {
                handler_accounts.insert(key, addr.id);
            }
        }
    }
    (user_accounts, handler_accounts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::Role;

    #[tokio::test]
    async fn gas_price_wait_unblocks_after_set() {
        let shared = Arc::new(SharedState::new(2));
        let waiter = {
            let shared = shared.clone();
            tokio::spawn(async move {
                shared.wait_for_gas_price().await;
            })
        };
        shared.set_gas_price(42).await;
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("wait_for_gas_price should unblock")
            .unwrap();
        assert_eq!(shared.get().await.gas_price, Some(42));
    }

    #[test]
    fn builds_disjoint_indexes_by_role() {
        let addrs = vec![
            UserAddress {
                id: 1,
                user_id: "u1".into(),
                public: "0xAAA".into(),
                private: vec![],
                admin_id: Some(2),
                approve_id: None,
                locked_by_tx: false,
            },
            UserAddress {
                id: 2,
                user_id: "a1".into(),
                public: "0xBBB".into(),
                private: vec![],
                admin_id: None,
                approve_id: None,
                locked_by_tx: false,
            },
        ];
        let mut roles = HashMap::new();
        roles.insert("u1".to_string(), Role::User);
        roles.insert("a1".to_string(), Role::Sadmin);
        let (user_accounts, handler_accounts) =
            build_account_indexes(&addrs, &roles, |s| s.to_lowercase());
        assert_eq!(user_accounts.get("0xaaa"), Some(&1));
        assert_eq!(handler_accounts.get("0xbbb"), Some(&2));
    }
}
