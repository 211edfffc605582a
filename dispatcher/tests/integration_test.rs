//! Integration tests for the bridge dispatcher
//!
//! Run with: cargo test --test integration_test -- --ignored --nocapture
//!
//! Prerequisites for the ignored tests:
//! - A reachable Postgres instance, configured via DATABASE_URL
//! - Migrations are run automatically by `Store::run_migrations`

use std::env;

use dispatcher::crypto;
use dispatcher::db::models::Role;
use dispatcher::db::Store;

fn database_url() -> Option<String> {
    env::var("DATABASE_URL").ok()
}

async fn connected_store() -> Store {
    let url = database_url().expect("DATABASE_URL required");
    let store = Store::connect(&url, &url).await.expect("failed to connect to database");
    store.run_migrations().await.expect("failed to run migrations");
    store
}

#[tokio::test]
#[ignore = "requires Postgres, set DATABASE_URL"]
async fn test_customer_registration_and_auth() {
    let store = connected_store().await;

    let raw_key = crypto::generate_api_key();
    let hash = crypto::hash_api_key(&raw_key);
    let key = [7u8; 32];
    let callback_api_key_enc = crypto::encrypt_str(&key, "customer-secret");

    let customer_id = store
        .create_customer("https://example.test/callbacks", &callback_api_key_enc, &hash)
        .await
        .expect("db error")
        .expect("customer should be created");

    let fetched = store
        .get_customer_by_api_key_hash(&hash)
        .await
        .expect("db error")
        .expect("customer should be found by api key hash");
    assert_eq!(fetched.id, customer_id);
    assert_eq!(fetched.callback_url, "https://example.test/callbacks");

    // Re-registering the same callback_url is rejected, not silently ignored.
    let dup = store
        .create_customer("https://example.test/callbacks", &callback_api_key_enc, &crypto::hash_api_key("other"))
        .await
        .expect("db error");
    assert!(dup.is_none(), "duplicate callback_url must not create a second customer");
}

#[tokio::test]
#[ignore = "requires Postgres, set DATABASE_URL"]
async fn test_user_registration_is_idempotent() {
    let store = connected_store().await;
    let hash = crypto::hash_api_key(&crypto::generate_api_key());
    let customer_id = store
        .create_customer("https://example.test/u1", &crypto::encrypt_str(&[1u8; 32], "k"), &hash)
        .await
        .unwrap()
        .unwrap();

    store.register_user("user-42", customer_id, Role::User).await.unwrap();
    // Registering the same user_id again must not error (ON CONFLICT DO NOTHING).
    store.register_user("user-42", customer_id, Role::User).await.unwrap();

    let user = store.get_user("user-42").await.unwrap().expect("user should exist");
    assert_eq!(user.customer_id, Some(customer_id));
    assert_eq!(user.role, Role::User as i32);
}

#[tokio::test]
#[ignore = "requires Postgres, set DATABASE_URL"]
async fn test_callback_enqueue_is_idempotent_and_delivers_in_order() {
    let store = connected_store().await;
    let hash = crypto::hash_api_key(&crypto::generate_api_key());
    let customer_id = store
        .create_customer("https://example.test/u2", &crypto::encrypt_str(&[2u8; 32], "k"), &hash)
        .await
        .unwrap()
        .unwrap();
    store.register_user("user-cb", customer_id, Role::User).await.unwrap();

    let data = serde_json::json!({ "amount": "100" });
    let first = store.enqueue_callback("cb-1", "user-cb", "/deposit", &data).await.unwrap();
    assert!(first, "first enqueue of a fresh callback_id must succeed");

    let second = store.enqueue_callback("cb-1", "user-cb", "/deposit", &data).await.unwrap();
    assert!(!second, "re-enqueuing the same callback_id must be rejected, not duplicated");

    let pending = store.get_and_lock_unnotified_callbacks(10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, "cb-1");
    assert_eq!(pending[0].path, "/deposit");

    // Locked rows are skipped by a second concurrent dequeue.
    let pending_again = store.get_and_lock_unnotified_callbacks(10).await.unwrap();
    assert!(pending_again.is_empty(), "a locked-but-unnotified row must not be handed out twice");

    store.mark_callback_notified("cb-1").await.unwrap();
    let after_notify = store.get_and_lock_unnotified_callbacks(10).await.unwrap();
    assert!(after_notify.is_empty());
}

#[tokio::test]
#[ignore = "requires Postgres, set DATABASE_URL"]
async fn test_callback_retry_bumps_period_and_unlocks() {
    let store = connected_store().await;
    let hash = crypto::hash_api_key(&crypto::generate_api_key());
    let customer_id = store
        .create_customer("https://example.test/u3", &crypto::encrypt_str(&[3u8; 32], "k"), &hash)
        .await
        .unwrap()
        .unwrap();
    store.register_user("user-retry", customer_id, Role::User).await.unwrap();
    store
        .enqueue_callback("cb-retry", "user-retry", "/withdrawal", &serde_json::json!({}))
        .await
        .unwrap();

    let locked = store.get_and_lock_unnotified_callbacks(10).await.unwrap();
    assert_eq!(locked.len(), 1);
    assert_eq!(locked[0].callback_period, 60, "default callback_period from the schema");

    store.retry_callback("cb-retry", 60).await.unwrap();

    // retry_callback unlocks the row but pushes time_to_callback into the future,
    // so it should not be immediately re-dequeued.
    let immediately = store.get_and_lock_unnotified_callbacks(10).await.unwrap();
    assert!(immediately.is_empty(), "a just-retried callback must wait out its backoff window");
}

#[tokio::test]
#[ignore = "requires Postgres, set DATABASE_URL"]
async fn test_network_handler_bootstrap_upserts() {
    let store = connected_store().await;
    let key = [9u8; 32];
    let api_key_enc = crypto::encrypt_str(&key, "handler-secret");

    store
        .bootstrap_network_handlers(&[(
            "eth".to_string(),
            "Ethereum".to_string(),
            "http://handler-eth:8000".to_string(),
            api_key_enc.clone(),
        )])
        .await
        .unwrap();

    let handler = store.get_network_handler("eth").await.unwrap().expect("handler should exist");
    assert_eq!(handler.display_name, "Ethereum");
    assert!(handler.is_active);
    assert_eq!(crypto::decrypt_to_string(&key, &handler.api_key).unwrap(), "handler-secret");

    // Re-bootstrapping with a new server_url updates the existing row in place.
    store
        .bootstrap_network_handlers(&[(
            "eth".to_string(),
            "Ethereum Mainnet".to_string(),
            "http://handler-eth-2:8000".to_string(),
            api_key_enc,
        )])
        .await
        .unwrap();
    let updated = store.get_network_handler("eth").await.unwrap().unwrap();
    assert_eq!(updated.display_name, "Ethereum Mainnet");
    assert_eq!(updated.server_url, "http://handler-eth-2:8000");

    let all = store.all_network_handlers().await.unwrap();
    assert!(all.iter().any(|h| h.name == "eth"));
}

// ============================================================================
// Pure logic tests (no infrastructure required)
// ============================================================================

#[test]
fn test_role_values_partition_by_meaning() {
    assert_eq!(Role::User as i32, 10);
    assert_eq!(Role::Approve as i32, 11);
    assert_eq!(Role::Sadmin as i32, 12);
}

#[test]
fn test_callback_envelope_round_trips_through_json() {
    let envelope = serde_json::json!({
        "callback_id": "cb-1",
        "user_id": "user-1",
        "path": "/deposit",
        "json_data": { "amount": "100" },
    });
    let text = envelope.to_string();
    let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(parsed["callback_id"], "cb-1");
    assert_eq!(parsed["json_data"]["amount"], "100");
}
