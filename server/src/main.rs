use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use server::api::{self, AppState};
use server::config::Config;
use server::database::Database;
use server::hub::HubRegistry;
use server::lifecycle::CancellationSet;
use server::tasks::TaskStore;
use server::vm_manager::VmManager;
use server::vmm::FirecrackerBackend;

#[derive(Debug)]
enum Error {
    Config(String),
    Database(String),
    Vm(String),
    Network(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::Database(msg) => write!(f, "Database error: {}", msg),
            Error::Vm(msg) => write!(f, "VM manager error: {}", msg),
            Error::Network(msg) => write!(f, "Network error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

type Result<T> = std::result::Result<T, Error>;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Arc::new(Config::load().map_err(|e| Error::Config(e.to_string()))?);

    info!(
        listen = config.listen_addr().as_str(),
        database = config.database.url.as_str(),
        bridge = config.network.bridge_name.as_str(),
        "Starting VM-API server"
    );

    let database = Database::new(&config.database.url, config.database.max_connections)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
    let store = TaskStore::new(database);

    // A restart leaves no VM handles behind, so any row still marked live
    // belongs to a dead hypervisor and gets settled now.
    let swept = store
        .reconcile_startup()
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
    if swept > 0 {
        warn!(count = swept, "Terminated orphaned tasks from a previous run");
    }
    let orphans = server::vmm::firecracker::sweep_orphans(&config.hypervisor).await;
    if orphans > 0 {
        warn!(count = orphans, "Swept orphaned VM processes and files");
    }

    let backend = FirecrackerBackend::new(config.hypervisor.clone(), config.network.clone());
    let manager = Arc::new(
        VmManager::new(backend, Arc::clone(&config)).map_err(|e| Error::Vm(e.to_string()))?,
    );

    let state = AppState {
        config: Arc::clone(&config),
        store,
        manager,
        hubs: HubRegistry::new(),
        cancels: CancellationSet::new(),
    };
    let cancels = Arc::clone(&state.cancels);

    let app = Router::new()
        .route("/health", get(|| async { "OK" }))
        .nest("/api/v1", api::routes::<FirecrackerBackend>())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(config.listen_addr())
        .await
        .map_err(|e| Error::Network(e.to_string()))?;

    info!(listen = config.listen_addr().as_str(), "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| Error::Network(e.to_string()))?;

    // Stop every in-flight pipeline before the process exits; each one
    // tears its VM down on the way out.
    cancels.cancel_all();

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received");
}
