use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

use livescrape::adapter::{AdapterRegistry, GenericPageAdapter};
use livescrape::browser::{ChromiumLauncher, ChromiumSettings};
use livescrape::cache::{CacheBackend, MemoryBackend, SqliteBackend};
use livescrape::config::{CacheBackendKind, Config};
use livescrape::service::runtime::shutdown_signalled;
use livescrape::service::OrchestrationService;
use livescrape::status::{self, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing / logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    config.validate()?;

    let cache_backend: Arc<dyn CacheBackend> = match config.cache_backend {
        CacheBackendKind::Sqlite => {
            let backend = SqliteBackend::open(&config.cache_path)?;
            info!("Cache database opened: {}", config.cache_path);
            Arc::new(backend)
        }
        CacheBackendKind::Memory => {
            warn!("In-memory cache selected; snapshots will not survive a restart");
            Arc::new(MemoryBackend::new())
        }
    };

    let launcher = Arc::new(ChromiumLauncher::new(ChromiumSettings::from_config(&config)));

    let mut adapters = AdapterRegistry::new();
    adapters.register(Arc::new(GenericPageAdapter));
    info!("Registered adapter(s): {}", adapters.names().join(", "));

    let service = Arc::new(OrchestrationService::new(
        &config,
        launcher,
        cache_backend,
        adapters,
    ));
    service.start().await?;
    info!(
        "Orchestrator running: {} worker(s), {} browser(s) x {} context(s)",
        config.concurrency_cap, config.browser_instances, config.contexts_per_browser
    );

    let app = status::router(AppState {
        service: Arc::clone(&service),
    });
    let addr: SocketAddr = config.status_addr.parse()?;
    info!("Status endpoint listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let shutdown_rx = service.runtime().subscribe_shutdown();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                res = tokio::signal::ctrl_c() => {
                    if let Err(e) = res {
                        warn!("Failed to listen for ctrl-c: {}", e);
                    }
                    info!("Interrupt received, shutting down");
                }
                _ = shutdown_signalled(shutdown_rx) => {}
            }
        })
        .await;

    service.stop().await;
    info!("Shutdown complete");
    served?;
    Ok(())
}
