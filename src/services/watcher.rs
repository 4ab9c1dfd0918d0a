//! Watch-folder front end: turns filesystem activity into jobs.
//!
//! Events (native notifications, a polling scan, or a synthetic channel) only mark
//! a path as a candidate. A candidate becomes a job once its size and mtime have
//! stayed the same for the debounce window, so every mode behaves the same.

use chrono::Utc;
use notify::event::{AccessKind, AccessMode, ModifyKind};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::mpsc;

use crate::config::AppConfig;
use crate::models::job::{Job, JobOrigin};
use crate::models::options::OcrOptions;
use crate::models::result::Outcome;
use crate::services::dispatcher::{Dispatcher, SubmitError};

const CLAIM_DIR: &str = ".processing";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Created,
    Modified,
    Moved,
}

impl WatchEventKind {
    fn from_notify(kind: &EventKind) -> Option<Self> {
        match kind {
            EventKind::Create(_) => Some(WatchEventKind::Created),
            EventKind::Modify(ModifyKind::Name(_)) => Some(WatchEventKind::Moved),
            EventKind::Modify(_) => Some(WatchEventKind::Modified),
            EventKind::Access(AccessKind::Close(AccessMode::Write)) => Some(WatchEventKind::Modified),
            _ => None,
        }
    }
}

/// Raw filesystem notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: PathBuf,
    pub kind: WatchEventKind,
}

impl WatchEvent {
    pub fn new(path: impl Into<PathBuf>, kind: WatchEventKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

/// Size and modification time of a readable regular file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint {
    pub len: u64,
    pub modified: Option<SystemTime>,
}

impl Fingerprint {
    pub fn of(path: &Path) -> io::Result<Self> {
        // Opening proves the file is readable, not merely listed.
        let file = std::fs::File::open(path)?;
        let metadata = file.metadata()?;
        if !metadata.is_file() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "not a regular file"));
        }
        Ok(Self {
            len: metadata.len(),
            modified: metadata.modified().ok(),
        })
    }
}

#[derive(Debug)]
struct Candidate {
    fingerprint: Option<Fingerprint>,
    changed_at: Instant,
}

/// Debounces candidates until they stop changing.
#[derive(Debug)]
pub struct StabilityTracker {
    quiet: Duration,
    candidates: HashMap<PathBuf, Candidate>,
}

impl StabilityTracker {
    pub fn new(quiet: Duration) -> Self {
        Self {
            quiet,
            candidates: HashMap::new(),
        }
    }

    /// Note activity on `path`, restarting its quiet period.
    pub fn observe(&mut self, path: PathBuf, now: Instant) {
        self.candidates
            .entry(path)
            .and_modify(|c| c.changed_at = now)
            .or_insert(Candidate {
                fingerprint: None,
                changed_at: now,
            });
    }

    pub fn is_tracked(&self, path: &Path) -> bool {
        self.candidates.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Probe every candidate and return (and stop tracking) the ones that are stable.
    ///
    /// A candidate is stable once a probe matches the previous one and the quiet
    /// period has elapsed since the last observed change. Vanished or unreadable
    /// candidates are dropped.
    pub fn settle<F>(&mut self, now: Instant, mut probe: F) -> Vec<PathBuf>
    where
        F: FnMut(&Path) -> io::Result<Fingerprint>,
    {
        let mut stable = Vec::new();
        let quiet = self.quiet;

        self.candidates.retain(|path, candidate| match probe(path) {
            Ok(fingerprint) => {
                if candidate.fingerprint != Some(fingerprint) {
                    candidate.fingerprint = Some(fingerprint);
                    candidate.changed_at = now;
                    true
                } else if now.duration_since(candidate.changed_at) >= quiet {
                    stable.push((candidate.changed_at, path.clone()));
                    false
                } else {
                    true
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Candidate vanished before it settled");
                false
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable file");
                false
            }
        });

        stable.sort();
        stable.into_iter().map(|(_, path)| path).collect()
    }
}

#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Lower-cased, without the dot.
    pub extensions: Vec<String>,
    pub debounce: Duration,
    pub poll_interval: Duration,
    pub use_polling: bool,
    pub output_year_month: bool,
}

impl WatchConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            input_dir: config.input_dir.clone(),
            output_dir: config.output_dir.clone(),
            extensions: config.extensions(),
            debounce: config.debounce(),
            poll_interval: config.poll_interval(),
            use_polling: config.use_polling,
            output_year_month: config.output_year_month,
        }
    }

    pub fn claim_dir(&self) -> PathBuf {
        self.input_dir.join(CLAIM_DIR)
    }
}

pub struct DirectoryWatcher {
    config: WatchConfig,
    dispatcher: Arc<Dispatcher>,
    options: OcrOptions,
    tracker: StabilityTracker,
    /// Input paths whose job is pending or running.
    in_flight: HashSet<PathBuf>,
}

impl DirectoryWatcher {
    pub fn new(config: WatchConfig, dispatcher: Arc<Dispatcher>, options: OcrOptions) -> Self {
        let tracker = StabilityTracker::new(config.debounce);
        Self {
            config,
            dispatcher,
            options,
            tracker,
            in_flight: HashSet::new(),
        }
    }

    /// Watch with native notifications, or by scanning when polling is configured.
    pub async fn run(mut self) -> Result<(), WatchError> {
        self.prepare()?;
        if self.config.use_polling {
            return self.run_loop(None).await;
        }
        let (tx, rx) = mpsc::channel(1024);
        let _native = watch_native(&self.config.input_dir, tx)?;
        self.run_loop(Some(rx)).await
    }

    /// Watch using events from a caller-supplied producer. Stops when the producer closes.
    pub async fn run_with_events(mut self, events: mpsc::Receiver<WatchEvent>) -> Result<(), WatchError> {
        self.prepare()?;
        self.run_loop(Some(events)).await
    }

    fn prepare(&mut self) -> Result<(), WatchError> {
        for dir in [&self.config.input_dir, &self.config.output_dir] {
            std::fs::create_dir_all(dir).map_err(|e| WatchError::Directory {
                path: dir.clone(),
                source: e,
            })?;
        }
        self.config.input_dir = self
            .config
            .input_dir
            .canonicalize()
            .map_err(|e| WatchError::Directory {
                path: self.config.input_dir.clone(),
                source: e,
            })?;
        let claim_dir = self.config.claim_dir();
        std::fs::create_dir_all(&claim_dir).map_err(|e| WatchError::Directory {
            path: claim_dir,
            source: e,
        })?;

        tracing::info!(
            input = %self.config.input_dir.display(),
            output = %self.config.output_dir.display(),
            debounce_ms = self.config.debounce.as_millis() as u64,
            polling = self.config.use_polling,
            "Watching directory"
        );
        Ok(())
    }

    async fn run_loop(mut self, mut events: Option<mpsc::Receiver<WatchEvent>>) -> Result<(), WatchError> {
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        self.recover_claimed(&done_tx)?;
        self.scan()?;

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                event = next_event(&mut events) => match event {
                    Some(event) => self.observe(event),
                    None => {
                        tracing::info!("Event source closed, stopping watcher");
                        return Ok(());
                    }
                },
                Some(path) = done_rx.recv() => self.release(path),
                _ = ticker.tick() => {
                    if self.config.use_polling {
                        self.scan()?;
                    }
                    self.settle(&done_tx)?;
                }
            }
        }
    }

    /// Map an event path onto the input directory, if it belongs there and is wanted.
    fn candidate_path(&self, path: &Path) -> Option<PathBuf> {
        let name = path.file_name()?.to_str()?;
        if name.starts_with('.') {
            return None;
        }
        let extension = Path::new(name).extension()?.to_str()?.to_ascii_lowercase();
        if !self.config.extensions.contains(&extension) {
            return None;
        }
        let parent = path.parent()?;
        let same_dir = parent == self.config.input_dir
            || parent
                .canonicalize()
                .map(|p| p == self.config.input_dir)
                .unwrap_or(false);
        same_dir.then(|| self.config.input_dir.join(name))
    }

    fn observe(&mut self, event: WatchEvent) {
        let Some(path) = self.candidate_path(&event.path) else {
            return;
        };
        if self.in_flight.contains(&path) {
            tracing::debug!(path = %path.display(), kind = ?event.kind, "Coalesced event for in-flight file");
            return;
        }
        tracing::trace!(path = %path.display(), kind = ?event.kind, "File activity");
        self.tracker.observe(path, Instant::now());
    }

    fn scan(&mut self) -> Result<(), WatchError> {
        let entries = std::fs::read_dir(&self.config.input_dir).map_err(|e| WatchError::Directory {
            path: self.config.input_dir.clone(),
            source: e,
        })?;
        let now = Instant::now();
        for entry in entries.flatten() {
            let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
            if !is_file {
                continue;
            }
            let Some(path) = self.candidate_path(&entry.path()) else {
                continue;
            };
            if !self.in_flight.contains(&path) && !self.tracker.is_tracked(&path) {
                self.tracker.observe(path, now);
            }
        }
        Ok(())
    }

    fn settle(&mut self, done: &mpsc::UnboundedSender<PathBuf>) -> Result<(), WatchError> {
        for path in self.tracker.settle(Instant::now(), Fingerprint::of) {
            if self.in_flight.contains(&path) {
                continue;
            }
            match claim(&path, &self.config.claim_dir()) {
                Ok(claimed) => self.enqueue(path, claimed, done)?,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    tracing::debug!(path = %path.display(), "File vanished before it could be claimed");
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to claim file, skipping");
                }
            }
        }
        Ok(())
    }

    /// Resubmit files a previous run claimed but never finished.
    fn recover_claimed(&mut self, done: &mpsc::UnboundedSender<PathBuf>) -> Result<(), WatchError> {
        let claim_dir = self.config.claim_dir();
        let entries = std::fs::read_dir(&claim_dir).map_err(|e| WatchError::Directory {
            path: claim_dir.clone(),
            source: e,
        })?;
        for entry in entries.flatten() {
            let claimed = entry.path();
            let Some(name) = claimed.file_name() else {
                continue;
            };
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            let origin = self.config.input_dir.join(name);
            if self.in_flight.contains(&origin) {
                continue;
            }
            tracing::info!(path = %claimed.display(), "Recovering previously claimed file");
            self.enqueue(origin, claimed, done)?;
        }
        Ok(())
    }

    fn enqueue(
        &mut self,
        origin: PathBuf,
        claimed: PathBuf,
        done: &mpsc::UnboundedSender<PathBuf>,
    ) -> Result<(), WatchError> {
        let job = Job::new(
            JobOrigin::Watcher,
            claimed.clone(),
            self.destination_for(&claimed),
            self.options.clone(),
        );
        let job_id = job.id;

        match self.dispatcher.submit(job) {
            Ok(handle) => {
                tracing::info!(job_id = %job_id, path = %origin.display(), "Job created");
                self.in_flight.insert(origin.clone());
                let done = done.clone();
                tokio::spawn(async move {
                    let result = handle.await;
                    if let Outcome::Failed(failure) = &result.outcome {
                        tracing::debug!(job_id = %result.job_id, error = %failure, "Watched file failed");
                    }
                    let _ = done.send(origin);
                });
                Ok(())
            }
            Err(SubmitError::QueueFull) => {
                tracing::warn!(path = %origin.display(), "Queue full, releasing claim for a later retry");
                if let Err(e) = std::fs::rename(&claimed, &origin) {
                    tracing::error!(path = %claimed.display(), error = %e, "Failed to release claim");
                    return Ok(());
                }
                self.tracker.observe(origin, Instant::now());
                Ok(())
            }
            Err(SubmitError::Closed) => Err(WatchError::DispatcherClosed),
        }
    }

    fn release(&mut self, origin: PathBuf) {
        self.in_flight.remove(&origin);
        // A new file may have landed under the same name while the job ran.
        if origin.exists() {
            self.tracker.observe(origin, Instant::now());
        }
    }

    fn destination_for(&self, source: &Path) -> PathBuf {
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document".to_string());
        let mut dir = self.config.output_dir.clone();
        if self.config.output_year_month {
            dir = dir.join(Utc::now().format("%Y/%m").to_string());
        }
        dir.join(format!("{stem}.pdf"))
    }
}

async fn next_event(events: &mut Option<mpsc::Receiver<WatchEvent>>) -> Option<WatchEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Atomically move `path` into `claim_dir`. Claiming an already-claimed file succeeds.
pub fn claim(path: &Path, claim_dir: &Path) -> io::Result<PathBuf> {
    let name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let target = claim_dir.join(name);
    match std::fs::rename(path, &target) {
        Ok(()) => Ok(target),
        Err(e) if e.kind() == io::ErrorKind::NotFound && target.exists() => Ok(target),
        Err(e) => Err(e),
    }
}

/// Forward native filesystem notifications for `dir` into `tx`.
///
/// The returned watcher must be kept alive for events to keep flowing.
pub fn watch_native(dir: &Path, tx: mpsc::Sender<WatchEvent>) -> Result<RecommendedWatcher, WatchError> {
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
        Ok(event) => {
            let Some(kind) = WatchEventKind::from_notify(&event.kind) else {
                return;
            };
            for path in event.paths {
                if tx.blocking_send(WatchEvent { path, kind }).is_err() {
                    return;
                }
            }
        }
        Err(e) => tracing::warn!(error = %e, "Filesystem notification error"),
    })?;
    watcher.watch(dir, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("Directory {path} is not accessible: {source}")]
    Directory { path: PathBuf, source: io::Error },

    #[error("Filesystem notifications unavailable: {0}")]
    Notify(#[from] notify::Error),

    #[error("Dispatcher is shut down")]
    DispatcherClosed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fp(len: u64) -> io::Result<Fingerprint> {
        Ok(Fingerprint { len, modified: None })
    }

    #[test]
    fn test_stable_after_quiet_period() {
        let quiet = Duration::from_millis(100);
        let mut tracker = StabilityTracker::new(quiet);
        let t0 = Instant::now();
        let path = PathBuf::from("/in/a.pdf");
        tracker.observe(path.clone(), t0);

        assert!(tracker.settle(t0, |_| fp(10)).is_empty(), "first probe only records");
        assert!(tracker.settle(t0 + quiet / 2, |_| fp(10)).is_empty());
        assert_eq!(tracker.settle(t0 + quiet, |_| fp(10)), vec![path]);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_growth_restarts_quiet_period() {
        let quiet = Duration::from_millis(100);
        let mut tracker = StabilityTracker::new(quiet);
        let t0 = Instant::now();
        tracker.observe(PathBuf::from("/in/a.pdf"), t0);

        tracker.settle(t0, |_| fp(10));
        // Still being written.
        assert!(tracker.settle(t0 + quiet, |_| fp(20)).is_empty());
        assert!(tracker.settle(t0 + quiet + quiet / 2, |_| fp(20)).is_empty());
        assert_eq!(tracker.settle(t0 + quiet * 2, |_| fp(20)).len(), 1);
    }

    #[test]
    fn test_events_restart_quiet_period() {
        let quiet = Duration::from_millis(100);
        let mut tracker = StabilityTracker::new(quiet);
        let t0 = Instant::now();
        let path = PathBuf::from("/in/a.pdf");
        tracker.observe(path.clone(), t0);
        tracker.settle(t0, |_| fp(10));

        tracker.observe(path.clone(), t0 + quiet / 2);
        assert!(tracker.settle(t0 + quiet, |_| fp(10)).is_empty());
        assert_eq!(tracker.settle(t0 + quiet + quiet / 2, |_| fp(10)), vec![path]);
    }

    #[test]
    fn test_vanished_and_unreadable_are_dropped() {
        let mut tracker = StabilityTracker::new(Duration::ZERO);
        let t0 = Instant::now();
        tracker.observe(PathBuf::from("/in/gone.pdf"), t0);
        tracker.observe(PathBuf::from("/in/locked.pdf"), t0);

        let stable = tracker.settle(t0, |path| {
            if path.ends_with("gone.pdf") {
                Err(io::Error::from(io::ErrorKind::NotFound))
            } else {
                Err(io::Error::from(io::ErrorKind::PermissionDenied))
            }
        });
        assert!(stable.is_empty());
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_repeated_events_track_once() {
        let mut tracker = StabilityTracker::new(Duration::ZERO);
        let t0 = Instant::now();
        for _ in 0..5 {
            tracker.observe(PathBuf::from("/in/a.pdf"), t0);
        }
        assert_eq!(tracker.len(), 1);
        tracker.settle(t0, |_| fp(1));
        assert_eq!(tracker.settle(t0, |_| fp(1)).len(), 1);
    }

    #[test]
    fn test_claim_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let claim_dir = dir.path().join(CLAIM_DIR);
        std::fs::create_dir_all(&claim_dir).unwrap();
        let source = dir.path().join("scan.pdf");
        std::fs::write(&source, b"%PDF").unwrap();

        let first = claim(&source, &claim_dir).unwrap();
        let second = claim(&source, &claim_dir).unwrap();
        assert_eq!(first, second);
        assert!(!source.exists());
        assert_eq!(std::fs::read(&first).unwrap(), b"%PDF");
    }

    #[test]
    fn test_fingerprint_rejects_directories() {
        let dir = TempDir::new().unwrap();
        assert!(Fingerprint::of(dir.path()).is_err());
        assert_eq!(
            Fingerprint::of(&dir.path().join("missing.pdf")).unwrap_err().kind(),
            io::ErrorKind::NotFound
        );
    }
}
