mod api;
mod bootstrap;
mod conductor_native;
mod conductor_token;
mod conductor_withdrawal;
mod config;
mod crypto;
mod db;
mod metrics;
mod notifier;
mod refreshers;
mod scanner;
mod scheduler;
mod shared;

use std::sync::Arc;
use std::time::Duration;

use bip39::Mnemonic;
use chain_client::{evm::EvmChainClient, terra::TerraChainClient, ChainClient, ProviderPool};
use config::Config;
use db::{models::NATIVE_COIN, Store};
use metrics::Metrics;
use notifier::Notifier;
use refreshers::{AccountsRefresher, AdminBalanceRefresher, ExplorerRefresher, GasPriceRefresher, RateRefresher};
use scheduler::Scheduler;
use shared::SharedState;

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    init_logging();
    tracing::info!("starting bridge handler");

    let config = Arc::new(Config::load()?);
    tracing::info!(network = %config.network.name, handler = %config.handler_name, "configuration loaded");

    let store = Store::connect(&config.database.write_dsn.0, &config.database.read_dsn.0).await?;
    store.run_migrations().await?;
    tracing::info!("database migrations complete");
    store.unlock_stale_tx_handler_rows().await?;

    let pool = Arc::new(ProviderPool::from_urls(
        &config.providers.urls,
        &config.providers.api_keys.iter().map(|k| k.0.clone()).collect::<Vec<_>>(),
    ));
    let chain: Arc<dyn ChainClient> = if config.network.is_evm {
        let chain_id: u64 = config
            .network
            .id
            .parse()
            .map_err(|_| eyre::eyre!("PROC_HANDLER_NETWORK_ID must be numeric for an EVM network"))?;
        Arc::new(EvmChainClient::new(pool.clone(), chain_id))
    } else {
        let native_denom = config
            .coins
            .iter()
            .find(|c| c.contract_address == NATIVE_COIN)
            .map(|c| c.name.clone())
            .ok_or_else(|| eyre::eyre!("PROC_HANDLER_COINS must include a native-asset entry"))?;
        Arc::new(TerraChainClient::new(pool.clone(), config.network.id.clone(), native_denom))
    };

    let db_secret_key = config.db_secret_key.0;
    bootstrap::run(&config, &store, chain.as_ref(), &db_secret_key).await?;

    let mnemonic = Mnemonic::parse(&config.admin_seed.0)
        .map_err(|e| eyre::eyre!("invalid admin seed mnemonic: {e}"))?;
    let admin_seed_bytes = Arc::new(mnemonic.to_seed("").to_vec());

    let shared = Arc::new(SharedState::new(config.network.scan_interval_secs));
    let metrics = Arc::new(Metrics::new());

    let mut scheduler = Scheduler::new();

    {
        let scanner = Arc::new(scanner::Scanner {
            chain: chain.clone(),
            store: store.clone(),
            shared: shared.clone(),
            network: config.network.clone(),
            metrics: metrics.clone(),
        });
        let shared_for_interval = shared.clone();
        scheduler.add_dynamic(
            "scanner",
            move || Duration::from_secs(shared_for_interval.current_interval_secs()),
            move || {
                let scanner = scanner.clone();
                async move {
                    if let Err(e) = scanner.tick().await {
                        tracing::error!(error = %e, "scanner tick failed");
                    }
                }
            },
        );
    }

    {
        let conductor = Arc::new(conductor_native::NativeDepositConductor {
            chain: chain.clone(),
            store: store.clone(),
            shared: shared.clone(),
            db_secret_key,
            batch_size: 20,
            metrics: metrics.clone(),
        });
        scheduler.add("native_deposit_conductor", Duration::from_secs(2), move || {
            let conductor = conductor.clone();
            async move {
                if let Err(e) = conductor.tick().await {
                    tracing::error!(error = %e, "native deposit conductor tick failed");
                }
            }
        });
    }

    {
        let conductor = Arc::new(conductor_token::TokenDepositConductor {
            chain: chain.clone(),
            store: store.clone(),
            shared: shared.clone(),
            db_secret_key,
            batch_size: 20,
            metrics: metrics.clone(),
        });
        scheduler.add("token_deposit_conductor", Duration::from_secs(2), move || {
            let conductor = conductor.clone();
            async move {
                if let Err(e) = conductor.tick().await {
                    tracing::error!(error = %e, "token deposit conductor tick failed");
                }
            }
        });
    }

    {
        let conductor = Arc::new(conductor_withdrawal::WithdrawalConductor {
            chain: chain.clone(),
            store: store.clone(),
            shared: shared.clone(),
            db_secret_key,
            batch_size: 20,
            metrics: metrics.clone(),
        });
        scheduler.add("withdrawal_conductor", Duration::from_secs(2), move || {
            let conductor = conductor.clone();
            async move {
                if let Err(e) = conductor.tick().await {
                    tracing::error!(error = %e, "withdrawal conductor tick failed");
                }
            }
        });
    }

    {
        let notifier = Arc::new(Notifier {
            store: store.clone(),
            http: reqwest::Client::builder().timeout(Duration::from_secs(10)).build()?,
            dispatcher: config.dispatcher.clone(),
            batch_size: 20,
            metrics: metrics.clone(),
        });
        let deposit_notifier = notifier.clone();
        scheduler.add("deposit_callback", Duration::from_secs(1), move || {
            let notifier = deposit_notifier.clone();
            async move {
                if let Err(e) = notifier.deposit_callback_tick().await {
                    tracing::error!(error = %e, "deposit callback tick failed");
                }
            }
        });
        let withdrawal_notifier = notifier.clone();
        scheduler.add("withdrawal_callback", Duration::from_secs(1), move || {
            let notifier = withdrawal_notifier.clone();
            async move {
                if let Err(e) = notifier.withdrawal_callback_tick().await {
                    tracing::error!(error = %e, "withdrawal callback tick failed");
                }
            }
        });
    }

    {
        let rate_refresher = Arc::new(RateRefresher {
            store: store.clone(),
            http: reqwest::Client::builder().timeout(Duration::from_secs(10)).build()?,
            rates: config.rates.clone(),
        });
        scheduler.add("update_coin_rates", Duration::from_secs(10), move || {
            let r = rate_refresher.clone();
            async move {
                if let Err(e) = r.tick().await {
                    tracing::warn!(error = %e, "coin rate refresh failed");
                }
            }
        });
    }

    {
        let gas_refresher = Arc::new(GasPriceRefresher { chain: chain.clone(), shared: shared.clone() });
        scheduler.add("update_gas_price", Duration::from_secs(60), move || {
            let r = gas_refresher.clone();
            async move {
                if let Err(e) = r.tick().await {
                    tracing::warn!(error = %e, "gas price refresh failed");
                }
            }
        });
    }

    {
        let admin_bal_refresher = Arc::new(AdminBalanceRefresher::new(
            chain.clone(),
            store.clone(),
            shared.clone(),
            config.rates.native_warning_threshold.clone(),
        ));
        scheduler.add("admin_balances", Duration::from_secs(30), move || {
            let r = admin_bal_refresher.clone();
            async move {
                if let Err(e) = r.tick().await {
                    tracing::warn!(error = %e, "admin balance refresh failed");
                }
            }
        });
    }

    {
        let accounts_refresher =
            Arc::new(AccountsRefresher { chain: chain.clone(), store: store.clone(), shared: shared.clone() });
        scheduler.add("update_in_memory_accounts", Duration::from_secs(10), move || {
            let r = accounts_refresher.clone();
            async move {
                if let Err(e) = r.tick().await {
                    tracing::warn!(error = %e, "account index refresh failed");
                }
            }
        });
    }

    {
        let explorer_refresher = Arc::new(ExplorerRefresher { pool: pool.clone(), metrics: metrics.clone() });
        scheduler.add("explorer", Duration::from_secs(120), move || {
            let r = explorer_refresher.clone();
            async move {
                if let Err(e) = r.tick().await {
                    tracing::warn!(error = %e, "explorer telemetry tick failed");
                }
            }
        });
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let api_state = api::ApiState {
        config: config.clone(),
        store: store.clone(),
        chain: chain.clone(),
        db_secret_key,
        admin_seed_bytes,
    };
    let authenticated_server = tokio::spawn({
        let bind_addr = config.api.bind_addr.clone();
        async move {
            if let Err(e) = api::serve_authenticated(api_state, &bind_addr).await {
                tracing::error!(error = %e, "authenticated API server failed");
            }
        }
    });
    let operational_server = tokio::spawn({
        let bind_addr = config.api.metrics_addr.clone();
        let metrics = metrics.clone();
        async move {
            if let Err(e) = api::serve_operational(metrics, &bind_addr).await {
                tracing::error!(error = %e, "operational server failed");
            }
        }
    });

    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    scheduler.run(shutdown_rx).await;
    authenticated_server.abort();
    operational_server.abort();

    tracing::info!("bridge handler stopped");
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
