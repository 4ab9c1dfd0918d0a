//! Test helper utilities: a scriptable engine and throwaway directory trees

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use ocr_dispatch::config::SourceDisposition;
use ocr_dispatch::models::job::{Job, JobOrigin};
use ocr_dispatch::models::options::OcrOptions;
use ocr_dispatch::services::dispatcher::DispatcherConfig;
use ocr_dispatch::services::engine::{EngineError, OcrEngine};
use ocr_dispatch::services::routing::ResultRouter;
use ocr_dispatch::services::watcher::WatchConfig;

use crate::fixtures::OCR_MARKER;

/// What the fake engine does on one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Write `OCR_MARKER` followed by the input bytes.
    Succeed,
    /// Exit with the given code.
    Exit(i32),
    /// Die as if killed by the OS.
    Signal,
    /// Never finish.
    Hang,
    /// Report success without writing anything.
    NoOutput,
}

/// In-process stand-in for the OCR command.
pub struct FakeEngine {
    script: Mutex<VecDeque<Step>>,
    fallback: Step,
    delay: Duration,
    calls: AtomicUsize,
    running: Arc<AtomicUsize>,
    peak: AtomicUsize,
    started: Mutex<Vec<PathBuf>>,
    options: Mutex<Vec<OcrOptions>>,
}

struct Running(Arc<AtomicUsize>);

impl Drop for Running {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeEngine {
    pub fn always(step: Step) -> Self {
        Self::scripted(Vec::new(), step)
    }

    pub fn succeeding() -> Self {
        Self::always(Step::Succeed)
    }

    /// Play `steps` in order, then repeat `fallback` forever.
    pub fn scripted(steps: Vec<Step>, fallback: Step) -> Self {
        Self {
            script: Mutex::new(steps.into()),
            fallback,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            running: Arc::new(AtomicUsize::new(0)),
            peak: AtomicUsize::new(0),
            started: Mutex::new(Vec::new()),
            options: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous invocations seen.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Input paths in the order invocations began.
    pub fn started(&self) -> Vec<PathBuf> {
        self.started.lock().unwrap().clone()
    }

    /// Options passed to each invocation, in order.
    pub fn options_seen(&self) -> Vec<OcrOptions> {
        self.options.lock().unwrap().clone()
    }
}

#[async_trait]
impl OcrEngine for FakeEngine {
    fn name(&self) -> &str {
        "fake"
    }

    async fn version(&self) -> Result<String, EngineError> {
        Ok("fake 1.0".to_string())
    }

    async fn process(&self, input: &Path, output: &Path, options: &OcrOptions) -> Result<(), EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        let _running = Running(self.running.clone());
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.started.lock().unwrap().push(input.to_path_buf());
        self.options.lock().unwrap().push(options.clone());

        let step = self.script.lock().unwrap().pop_front().unwrap_or(self.fallback);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match step {
            Step::Succeed => {
                let mut content = OCR_MARKER.to_vec();
                content.extend(tokio::fs::read(input).await?);
                tokio::fs::write(output, content).await?;
                Ok(())
            }
            Step::Exit(code) => Err(EngineError::Exit {
                code,
                message: format!("scripted exit {code}"),
            }),
            Step::Signal => Err(EngineError::Signaled {
                message: "Killed".to_string(),
            }),
            Step::Hang => std::future::pending().await,
            Step::NoOutput => Ok(()),
        }
    }
}

/// Input, output, quarantine, archive and work directories under one temp root.
pub struct TestDirs {
    _root: TempDir,
    pub input: PathBuf,
    pub output: PathBuf,
    pub quarantine: PathBuf,
    pub archive: PathBuf,
    pub work: PathBuf,
}

impl TestDirs {
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let dir = |name: &str| {
            let path = root.path().join(name);
            std::fs::create_dir_all(&path).unwrap();
            path
        };
        Self {
            input: dir("input"),
            output: dir("output"),
            quarantine: dir("quarantine"),
            archive: dir("archive"),
            work: dir("work"),
            _root: root,
        }
    }

    pub fn router(&self, disposition: SourceDisposition) -> Arc<ResultRouter> {
        Arc::new(ResultRouter::new(
            self.quarantine.clone(),
            self.archive.clone(),
            disposition,
        ))
    }

    pub fn watch_config(&self, debounce: Duration) -> WatchConfig {
        WatchConfig {
            input_dir: self.input.clone(),
            output_dir: self.output.clone(),
            extensions: vec!["pdf".to_string(), "png".to_string()],
            debounce,
            poll_interval: Duration::from_millis(25),
            use_polling: true,
            output_year_month: false,
        }
    }

    /// A watcher-origin job for `name`, with the source written into the input directory.
    pub fn watched_job(&self, name: &str, content: &[u8]) -> Job {
        let source = self.input.join(name);
        std::fs::write(&source, content).unwrap();
        let stem = Path::new(name).file_stem().unwrap().to_string_lossy().into_owned();
        Job::new(
            JobOrigin::Watcher,
            source,
            self.output.join(format!("{stem}.pdf")),
            OcrOptions::default(),
        )
    }

    /// An upload-origin job, with the source written into the work directory.
    pub fn upload_job(&self, name: &str, content: &[u8]) -> Job {
        let source = self.work.join(name);
        std::fs::write(&source, content).unwrap();
        Job::new(
            JobOrigin::Upload,
            source,
            self.work.join(format!("{name}-result.pdf")),
            OcrOptions::default(),
        )
    }
}

pub fn dispatcher_config(capacity: usize) -> DispatcherConfig {
    DispatcherConfig {
        capacity,
        queue_capacity: None,
        job_timeout: Duration::from_secs(5),
        max_attempts: 3,
        retry_backoff: Duration::from_millis(10),
    }
}

/// Poll `condition` until it holds or `limit` passes.
pub async fn wait_until<F>(limit: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Names of the entries in `dir`, sorted.
pub fn list_dir(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

pub const BOUNDARY: &str = "ocr-dispatch-test-boundary";

/// One part of a multipart/form-data body.
pub enum Part<'a> {
    Text(&'a str, &'a str),
    File(&'a str, &'a str, &'a [u8]),
}

/// Encode `parts` using `BOUNDARY`.
pub fn multipart_body(parts: &[Part<'_>]) -> Vec<u8> {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        match part {
            Part::Text(name, value) => {
                body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n").as_bytes(),
                );
            }
            Part::File(name, file_name, data) => {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{name}\"; filename=\"{file_name}\"\r\n\
                         Content-Type: application/octet-stream\r\n\r\n"
                    )
                    .as_bytes(),
                );
                body.extend_from_slice(data);
                body.extend_from_slice(b"\r\n");
            }
        }
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}
