use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use ocr_dispatch::config::AppConfig;
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

    tracing::info!("Starting watch-folder daemon");

    let config = AppConfig::from_env().inspect_err(|e| {
        tracing::error!(error = %e, "Failed to load configuration");
    })?;

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
        engine,
        router,
        DispatcherConfig::from_app_config(&config),
    ));

    let watcher = DirectoryWatcher::new(WatchConfig::from_app_config(&config), dispatcher, ocr_defaults);

    tracing::info!(
        input = %config.input_dir.display(),
        output = %config.output_dir.display(),
        concurrency = config.concurrency,
        polling = config.use_polling,
        "Watching for documents"
    );

    tokio::select! {
        result = watcher.run() => {
            if let Err(e) = &result {
                tracing::error!(error = %e, "Watch-folder stopped");
            }
            result?;
        }
        _ = ocr_dispatch::shutdown_signal() => {}
    }

    tracing::info!("Watcher stopped");
    Ok(())
}
