use garde::Validate;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use strum::{Display, EnumString};

use crate::models::options::OcrOptions;

/// What happens to a claimed watch-folder file once its job succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display)]
#[strum(serialize_all = "lowercase")]
pub enum SourceDisposition {
    Archive,
    Delete,
}

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Webservice bind address (e.g., "0.0.0.0:5000"). Unused by the standalone watcher.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Directory watched for new documents
    #[serde(default = "default_input_dir")]
    pub input_dir: PathBuf,

    /// Directory receiving processed documents
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Directory receiving failed inputs and their error descriptors
    #[serde(default = "default_quarantine_dir")]
    pub quarantine_dir: PathBuf,

    /// Directory receiving sources after success when `on_success` is "archive"
    #[serde(default = "default_archive_dir")]
    pub archive_dir: PathBuf,

    /// Scratch space for webservice uploads and results
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Run the directory watcher inside the webservice process
    #[serde(default)]
    pub enable_watcher: bool,

    /// Maximum concurrent engine invocations
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Pending-queue bound; unbounded when unset
    #[serde(default)]
    pub queue_capacity: Option<usize>,

    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Scan the input directory instead of subscribing to native notifications
    #[serde(default)]
    pub use_polling: bool,

    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// "archive" or "delete"
    #[serde(default = "default_on_success")]
    pub on_success: String,

    /// Place outputs under YYYY/MM subdirectories
    #[serde(default)]
    pub output_year_month: bool,

    /// Comma-separated list of extensions picked up by the watcher
    #[serde(default = "default_file_extensions")]
    pub file_extensions: String,

    /// OCR engine executable
    #[serde(default = "default_engine_program")]
    pub engine_program: String,

    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,

    /// How long a webservice request may wait for a free engine slot
    #[serde(default = "default_http_queue_wait_secs")]
    pub http_queue_wait_secs: u64,

    // Engine defaults applied to every job unless overridden
    #[serde(default = "default_ocr_language")]
    pub ocr_language: String,

    #[serde(default = "default_ocr_mode")]
    pub ocr_mode: String,

    #[serde(default)]
    pub ocr_deskew: bool,

    #[serde(default)]
    pub ocr_clean: bool,

    #[serde(default)]
    pub ocr_clean_final: bool,

    #[serde(default)]
    pub ocr_rotate_pages: bool,

    #[serde(default = "default_ocr_output_type")]
    pub ocr_output_type: String,

    #[serde(default = "default_ocr_optimize")]
    pub ocr_optimize: u8,

    #[serde(default = "default_ocr_pdfa_image_compression")]
    pub ocr_pdfa_image_compression: String,

    #[serde(default = "default_ocr_color_conversion_strategy")]
    pub ocr_color_conversion_strategy: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0:5000".to_string()
}

fn default_input_dir() -> PathBuf {
    PathBuf::from("./input")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./output")
}

fn default_quarantine_dir() -> PathBuf {
    PathBuf::from("./quarantine")
}

fn default_archive_dir() -> PathBuf {
    PathBuf::from("./archive")
}

fn default_work_dir() -> PathBuf {
    std::env::temp_dir().join("ocr-dispatch")
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_debounce_ms() -> u64 {
    2000
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_job_timeout_secs() -> u64 {
    600
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    1000
}

fn default_on_success() -> String {
    "archive".to_string()
}

fn default_file_extensions() -> String {
    "pdf,png,jpg,jpeg,tif,tiff".to_string()
}

fn default_engine_program() -> String {
    "ocrmypdf".to_string()
}

fn default_max_upload_bytes() -> usize {
    100 * 1024 * 1024
}

fn default_http_queue_wait_secs() -> u64 {
    300
}

fn default_ocr_language() -> String {
    "eng".to_string()
}

fn default_ocr_mode() -> String {
    "normal".to_string()
}

fn default_ocr_output_type() -> String {
    "pdfa".to_string()
}

fn default_ocr_optimize() -> u8 {
    1
}

fn default_ocr_pdfa_image_compression() -> String {
    "auto".to_string()
}

fn default_ocr_color_conversion_strategy() -> String {
    "LeaveColorUnchanged".to_string()
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config: Self = envy::from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Build from an explicit list of variables, bypassing the process environment.
    pub fn from_pairs<I>(pairs: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let config: Self = envy::from_iter(pairs)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid("CONCURRENCY must be at least 1".into()));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("MAX_ATTEMPTS must be at least 1".into()));
        }
        if self.queue_capacity == Some(0) {
            return Err(ConfigError::Invalid("QUEUE_CAPACITY must be at least 1 when set".into()));
        }
        if self.extensions().is_empty() {
            return Err(ConfigError::Invalid("FILE_EXTENSIONS must name at least one extension".into()));
        }
        self.disposition()?;
        self.ocr_defaults()?;
        Ok(())
    }

    pub fn disposition(&self) -> Result<SourceDisposition, ConfigError> {
        self.on_success
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("unknown ON_SUCCESS `{}`", self.on_success)))
    }

    /// Lower-cased extensions without the leading dot.
    pub fn extensions(&self) -> Vec<String> {
        self.file_extensions
            .split(',')
            .map(|e| e.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|e| !e.is_empty())
            .collect()
    }

    /// Engine options applied to every job unless a submission overrides them.
    pub fn ocr_defaults(&self) -> Result<OcrOptions, ConfigError> {
        let options = OcrOptions {
            languages: OcrOptions::parse_languages(&self.ocr_language),
            mode: parse_setting("OCR_MODE", &self.ocr_mode)?,
            deskew: self.ocr_deskew,
            clean: self.ocr_clean,
            clean_final: self.ocr_clean_final,
            rotate_pages: self.ocr_rotate_pages,
            output_type: parse_setting("OCR_OUTPUT_TYPE", &self.ocr_output_type)?,
            optimize: self.ocr_optimize,
            pdfa_image_compression: parse_setting(
                "OCR_PDFA_IMAGE_COMPRESSION",
                &self.ocr_pdfa_image_compression,
            )?,
            color_conversion_strategy: parse_setting(
                "OCR_COLOR_CONVERSION_STRATEGY",
                &self.ocr_color_conversion_strategy,
            )?,
        };
        options
            .validate()
            .map_err(|report| ConfigError::Invalid(format!("OCR defaults: {report}")))?;
        Ok(options)
    }

    /// Create every directory the binaries write into, failing loudly if one is unusable.
    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        for dir in [
            &self.output_dir,
            &self.quarantine_dir,
            &self.archive_dir,
            &self.work_dir,
        ] {
            std::fs::create_dir_all(dir).map_err(|e| ConfigError::Directory {
                path: dir.clone(),
                source: e,
            })?;
        }
        Ok(())
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn http_queue_wait(&self) -> Duration {
        Duration::from_secs(self.http_queue_wait_secs)
    }
}

fn parse_setting<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("unknown {name} `{value}`")))
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration from environment: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Cannot create directory {path}: {source}")]
    Directory { path: PathBuf, source: std::io::Error },
}
