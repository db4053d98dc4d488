use anyhow::{Context, Result};
use axum::Router;
use bagkeeper::{
    config::AppConfig,
    daemons::{
        auditor::Auditor,
        cleaner::Cleaner,
        pinger::{DEFAULT_MIN_CONTRACT_AGE, Pinger},
        pool::WorkerPool,
        reconcile::run_loop,
        replicator::Replicator,
    },
    db::StateStore,
    network::{StorageNetwork, loopback::LoopbackNetwork},
    providers::ProviderDirectory,
    routes,
    services::{restore::RestoreTracker, storage_service::StorageService},
};
use std::{fs, io::ErrorKind, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;
    tracing::info!("Starting bagkeeper with config: {:?}", cfg);

    // --- Ensure data directories exist ---
    for dir in [&cfg.storage_dir, &cfg.downloads_dir, &cfg.network_dir] {
        if !Path::new(dir).exists() {
            fs::create_dir_all(dir).with_context(|| format!("creating {dir}"))?;
            tracing::info!("Created directory at {}", dir);
        }
    }

    // --- Initialize SQLite ---
    let db_path = cfg
        .database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    let store = StateStore::connect(&cfg.database_url, 5)
        .await
        .with_context(|| format!("opening {}", cfg.database_url))?;
    let statements = store.apply_schema().await?;
    tracing::info!(statements, "schema applied");

    // --- Handle migration mode ---
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(());
    }

    let interrupted = store.reset_stuck_downloads().await?;
    if interrupted > 0 {
        tracing::warn!(jobs = interrupted, "marked interrupted restore jobs failed");
    }

    // --- Core services ---
    let network: Arc<dyn StorageNetwork> =
        Arc::new(LoopbackNetwork::new(&cfg.network_dir, &cfg.downloads_dir));
    let providers = Arc::new(ProviderDirectory::new(
        cfg.providers.clone(),
        cfg.provider_reuse,
    ));
    let restore = RestoreTracker::new(store.clone(), network.clone(), cfg.restore_timeout);
    let storage = StorageService::new(
        store.clone(),
        network.clone(),
        providers.clone(),
        restore,
        &cfg.storage_dir,
        cfg.default_replicas,
    );

    // --- Control loops ---
    let root = CancellationToken::new();
    let pools = vec![
        WorkerPool::start("replicator", &root, cfg.replicator_workers, {
            let (store, network, providers) = (store.clone(), network.clone(), providers.clone());
            move |cancel, shard| {
                let replicator = Replicator::new(store.clone(), network.clone(), providers.clone());
                run_loop(replicator, shard, cancel)
            }
        }),
        WorkerPool::start("auditor", &root, cfg.auditor_workers, {
            let (store, network, staleness) = (store.clone(), network.clone(), cfg.audit_staleness);
            move |cancel, shard| {
                let auditor = Auditor::new(store.clone(), network.clone(), staleness);
                run_loop(auditor, shard, cancel)
            }
        }),
        WorkerPool::start("pinger", &root, cfg.pinger_workers, {
            let (store, network) = (store.clone(), network.clone());
            move |cancel, shard| {
                let pinger = Pinger::new(store.clone(), network.clone(), DEFAULT_MIN_CONTRACT_AGE);
                run_loop(pinger, shard, cancel)
            }
        }),
        WorkerPool::start("cleaner", &root, cfg.cleaner_workers, {
            let (store, network, min_age) = (store.clone(), network.clone(), cfg.cleaner_min_age);
            move |cancel, shard| {
                let cleaner = Cleaner::new(store.clone(), network.clone(), min_age);
                run_loop(cleaner, shard, cancel)
            }
        }),
    ];

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(storage);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => tracing::info!("Received shutdown signal"),
                Err(err) => {
                    tracing::error!(error = %err, "failed to listen for Ctrl-C");
                    std::future::pending::<()>().await;
                }
            }
        })
        .await;

    // --- Drain the loops ---
    root.cancel();
    for pool in pools {
        pool.stop().await;
    }
    tracing::info!("Shutdown complete");

    served?;
    Ok(())
}
