use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::models::options::OcrOptions;
use crate::services::{dispatcher::Dispatcher, engine::OcrEngine};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub engine: Arc<dyn OcrEngine>,
    pub ocr_defaults: Arc<OcrOptions>,
    /// Scratch space for uploads and results.
    pub work_dir: Arc<PathBuf>,
    /// How long a request may wait in the queue before giving up.
    pub queue_wait: Duration,
}

impl AppState {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        engine: Arc<dyn OcrEngine>,
        ocr_defaults: OcrOptions,
        work_dir: PathBuf,
        queue_wait: Duration,
    ) -> Self {
        Self {
            dispatcher,
            engine,
            ocr_defaults: Arc::new(ocr_defaults),
            work_dir: Arc::new(work_dir),
            queue_wait,
        }
    }
}
