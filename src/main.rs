use std::sync::Arc;

use tokio::sync::mpsc;

use withdrawer::api::{self, AppState};
use withdrawer::config::Config;
use withdrawer::db::{self, PgStore, WithdrawalStore};
use withdrawer::rpc::{BitcoindRpc, RpcRegistry};
use withdrawer::types::TransferDetail;
use withdrawer::withdraw::WithdrawCoordinator;

fn main() -> eyre::Result<()> {
    // Install color-eyre for better error reporting
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    init_logging();

    tracing::info!("Starting custody withdrawer");

    let config = Config::load()?;
    tracing::info!(
        asset = %config.coin.name,
        stable = config.coin.stable,
        rpc_urls = config.coin.all_rpc_urls().len(),
        "Configuration loaded"
    );

    let pool = db::create_pool(&config.database.url).await?;
    tracing::info!("Database connected");

    db::run_migrations(&pool).await?;
    tracing::info!("Database migrations complete");

    let store: Arc<dyn WithdrawalStore> = Arc::new(PgStore::new(pool));

    let mut registry = RpcRegistry::new();
    registry.register(&config.coin.name, Arc::new(BitcoindRpc::new(&config.coin)?));

    let (notify_tx, notify_rx) = mpsc::channel(config.withdraw.notify_queue_size);
    tokio::spawn(log_included_transfers(notify_rx));

    let mut coordinator = WithdrawCoordinator::new(
        &config.coin.name,
        config.coin.stable,
        config.withdraw.clone(),
        Arc::clone(&store),
        &registry,
        notify_tx,
    )?;

    // Fails startup if unfinished withdrawals cannot be reloaded
    coordinator.recover().await?;

    let state = AppState {
        submitter: coordinator.submitter(),
        handle: coordinator.handle(),
        store,
    };

    let running = coordinator.spawn()?;
    let handle = running.handle();

    let bind_address = config.api.bind_address.clone();
    let port = config.api.port;
    let api_handle = handle.clone();
    tokio::spawn(async move {
        if let Err(e) = api::start_server(&bind_address, port, state).await {
            tracing::error!(error = %e, "API server error");
            api_handle.shutdown();
        }
    });

    let signal_handle = handle.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        signal_handle.shutdown();
    });

    running.wait().await?;

    tracing::info!("Custody withdrawer stopped");
    Ok(())
}

/// Downstream consumer of included transfers. The finality watcher lives in
/// another service; here they are only logged.
async fn log_included_transfers(mut rx: mpsc::Receiver<TransferDetail>) {
    while let Some(detail) = rx.recv().await {
        tracing::info!(
            asset = %detail.asset,
            tx_hash = %detail.tx_hash,
            address = %detail.address,
            amount = %detail.amount,
            height = detail.height,
            tx_index = detail.tx_index,
            "Transfer included"
        );
    }
}

/// Initialize tracing/logging with structured output
fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,withdrawer=debug,custody_withdrawer=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(filter)
        .init();
}

/// Wait for shutdown signals (SIGINT/SIGTERM)
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
