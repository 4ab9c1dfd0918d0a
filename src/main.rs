use axum::routing::get;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use ocr_dispatch::app_state::AppState;
use ocr_dispatch::config::AppConfig;
use ocr_dispatch::routes::{self, metrics};
use ocr_dispatch::services::{
    dispatcher::{Dispatcher, DispatcherConfig},
    engine::{CommandEngine, OcrEngine},
    routing::ResultRouter,
    watcher::{DirectoryWatcher, WatchConfig},
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = AppConfig::from_env().inspect_err(|e| {
        tracing::error!(error = %e, "Failed to load configuration from environment");
    })?;

    tracing::info!("Initializing ocr-dispatch server");

    let prometheus_handle = Arc::new(metrics::install_recorder()?);

    // The engine must be runnable before any job is accepted
    let engine = CommandEngine::new(&config.engine_program);
    match engine.version().await {
        Ok(version) => tracing::info!(engine = engine.name(), %version, "OCR engine available"),
        Err(e) => {
            tracing::error!(engine = engine.name(), error = %e, "OCR engine is not usable");
            return Err(e.into());
        }
    }
    let engine: Arc<dyn OcrEngine> = Arc::new(engine);

    config.ensure_directories()?;
    let ocr_defaults = config.ocr_defaults()?;

    let router = Arc::new(ResultRouter::new(
        config.quarantine_dir.clone(),
        config.archive_dir.clone(),
        config.disposition()?,
    ));
    let dispatcher = Arc::new(Dispatcher::start(
        engine.clone(),
        router,
        DispatcherConfig::from_app_config(&config),
    ));

    let state = AppState::new(
        dispatcher.clone(),
        engine,
        ocr_defaults.clone(),
        config.work_dir.clone(),
        config.http_queue_wait(),
    );

    let app = routes::router(state, config.max_upload_bytes).route(
        "/metrics",
        get(metrics::prometheus_metrics).with_state(prometheus_handle),
    );

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .inspect_err(|e| tracing::error!(addr = %config.bind_addr, error = %e, "Failed to bind"))?;

    tracing::info!(
        addr = %config.bind_addr,
        concurrency = config.concurrency,
        watcher = config.enable_watcher,
        "Server listening"
    );

    let server = async {
        axum::serve(listener, app)
            .with_graceful_shutdown(ocr_dispatch::shutdown_signal())
            .await
    };

    if config.enable_watcher {
        // Shares the dispatcher so both entry points draw from one concurrency limit
        let watcher = DirectoryWatcher::new(
            WatchConfig::from_app_config(&config),
            dispatcher,
            ocr_defaults,
        );
        tokio::select! {
            result = server => result?,
            result = watcher.run() => {
                if let Err(e) = &result {
                    tracing::error!(error = %e, "Watch-folder stopped");
                }
                result?;
            }
        }
    } else {
        server.await?;
    }

    tracing::info!("Server stopped");
    Ok(())
}
