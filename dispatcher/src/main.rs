mod callback_worker;
mod config;
mod crypto;
mod db;
mod handler_client;
mod metrics;
mod redact;
mod server;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use callback_worker::CallbackWorker;
use config::Config;
use crypto::DbSecretKey;
use db::Store;
use handler_client::HandlerClient;
use metrics::Metrics;
use server::ApiState;

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    init_logging();
    tracing::info!("starting bridge dispatcher");

    let config = Arc::new(Config::load()?);
    tracing::info!(handlers = config.network_handlers.len(), "configuration loaded");

    let store = Store::connect(&config.database.write_dsn.0, &config.database.read_dsn.0).await?;
    store.run_migrations().await?;
    tracing::info!("database migrations complete");

    let db_secret_key: DbSecretKey = config.db_secret_key.0;

    let bootstrap_entries: Vec<(String, String, String, Vec<u8>)> = config
        .network_handlers
        .iter()
        .map(|h| {
            (
                h.name.clone(),
                h.display_name.clone(),
                h.server_url.clone(),
                crypto::encrypt_str(&db_secret_key, &h.api_key.0),
            )
        })
        .collect();
    store.bootstrap_network_handlers(&bootstrap_entries).await?;

    // Handler credentials are accepted verbatim on /v1/api/private/callback,
    // so the set is built straight from config rather than round-tripping
    // through the database's encrypted copy.
    let handler_api_keys: Arc<HashSet<String>> =
        Arc::new(config.network_handlers.iter().map(|h| h.api_key.0.clone()).collect());

    let http = reqwest::Client::builder().timeout(Duration::from_secs(10)).build()?;
    let metrics = Arc::new(Metrics::new());

    let api_state = ApiState {
        store: store.clone(),
        handler: HandlerClient::new(http.clone()),
        db_secret_key,
        handler_api_keys,
    };

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);

    let authenticated_server = tokio::spawn({
        let bind_addr = config.api.bind_addr.clone();
        async move {
            if let Err(e) = server::serve_authenticated(api_state, &bind_addr).await {
                tracing::error!(error = %e, "authenticated API server failed");
            }
        }
    });
    let operational_server = tokio::spawn({
        let bind_addr = config.api.metrics_addr.clone();
        let metrics = metrics.clone();
        async move {
            if let Err(e) = server::serve_operational(metrics, &bind_addr).await {
                tracing::error!(error = %e, "operational server failed");
            }
        }
    });

    let worker = Arc::new(CallbackWorker { store, http, db_secret_key, metrics });
    let running = Arc::new(AtomicBool::new(false));
    let worker_loop = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    // max_instances = 1: skip this tick if the previous one is still running.
                    if running.swap(true, Ordering::SeqCst) {
                        continue;
                    }
                    let worker = worker.clone();
                    let running = running.clone();
                    tokio::spawn(async move {
                        if let Err(e) = worker.tick().await {
                            tracing::error!(error = %e, "callback worker tick failed");
                        }
                        running.store(false, Ordering::SeqCst);
                    });
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    });

    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let _ = worker_loop.await;
    authenticated_server.abort();
    operational_server.abort();

    tracing::info!("bridge dispatcher stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry().with(fmt::layer().with_target(true)).with(filter).init();
}

async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install ctrl_c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received ctrl_c, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}
