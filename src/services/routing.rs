//! Places results on disk once a job reaches a terminal state.
//!
//! Every move is a same-filesystem rename, and routing the same result twice is a no-op.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::config::SourceDisposition;
use crate::models::job::{Job, JobOrigin};
use crate::models::result::{ExecutionResult, FailureKind, Outcome};

/// Written next to every quarantined input.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureDescriptor {
    pub job_id: Uuid,
    pub source_path: PathBuf,
    pub classification: FailureKind,
    pub message: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ResultRouter {
    quarantine_dir: PathBuf,
    archive_dir: PathBuf,
    disposition: SourceDisposition,
}

impl ResultRouter {
    pub fn new(quarantine_dir: PathBuf, archive_dir: PathBuf, disposition: SourceDisposition) -> Self {
        Self {
            quarantine_dir,
            archive_dir,
            disposition,
        }
    }

    pub fn quarantine_path(&self, job: &Job) -> PathBuf {
        self.quarantine_dir
            .join(format!("{}-{}", job.id, job.source_name()))
    }

    /// Archived sources carry the job id so same-named inputs never replace each other.
    pub fn archive_path(&self, job: &Job) -> PathBuf {
        self.archive_dir
            .join(format!("{}-{}", job.id, job.source_name()))
    }

    pub fn descriptor_path(&self, job: &Job) -> PathBuf {
        self.quarantine_dir
            .join(format!("{}-{}.error.json", job.id, job.source_name()))
    }

    /// Route a terminal result. Returns the final location of the output, if any.
    pub fn route(&self, job: &Job, result: &ExecutionResult) -> Result<Option<PathBuf>, RoutingError> {
        match &result.outcome {
            Outcome::Succeeded => {
                self.place_output(job, result)?;
                self.dispose_source(job)?;
                Ok(Some(job.destination_path.clone()))
            }
            Outcome::Failed(failure) => {
                if let Some(staged) = &result.staged_path {
                    remove_if_exists(staged)?;
                }
                match job.origin {
                    JobOrigin::Watcher => self.quarantine(job, result, failure.kind, &failure.message)?,
                    JobOrigin::Upload => remove_if_exists(&job.source_path)?,
                }
                Ok(None)
            }
        }
    }

    fn place_output(&self, job: &Job, result: &ExecutionResult) -> Result<(), RoutingError> {
        let destination = &job.destination_path;
        match &result.staged_path {
            Some(staged) if staged.exists() => {
                ensure_parent(destination)?;
                std::fs::rename(staged, destination).map_err(|e| RoutingError::Move {
                    from: staged.clone(),
                    to: destination.clone(),
                    source: e,
                })?;
                tracing::debug!(job_id = %job.id, output = %destination.display(), "Output placed");
                Ok(())
            }
            // Already moved by an earlier delivery of this result.
            _ if destination.exists() => Ok(()),
            _ => Err(RoutingError::MissingOutput(destination.clone())),
        }
    }

    fn dispose_source(&self, job: &Job) -> Result<(), RoutingError> {
        if job.origin == JobOrigin::Upload {
            return remove_if_exists(&job.source_path);
        }
        match self.disposition {
            SourceDisposition::Delete => remove_if_exists(&job.source_path),
            SourceDisposition::Archive => {
                if !job.source_path.exists() {
                    return Ok(());
                }
                move_file(&job.source_path, &self.archive_path(job))
            }
        }
    }

    fn quarantine(
        &self,
        job: &Job,
        result: &ExecutionResult,
        kind: FailureKind,
        message: &str,
    ) -> Result<(), RoutingError> {
        let target = self.quarantine_path(job);
        if job.source_path.exists() {
            move_file(&job.source_path, &target)?;
        } else if !target.exists() {
            // Nothing left to quarantine; still record why the job failed.
            tracing::warn!(
                job_id = %job.id,
                source = %job.source_path.display(),
                "Source vanished before it could be quarantined"
            );
        }

        let descriptor = FailureDescriptor {
            job_id: job.id,
            source_path: job.source_path.clone(),
            classification: kind,
            message: message.to_string(),
            attempts: result.attempts,
            failed_at: Utc::now(),
        };
        write_atomically(&self.descriptor_path(job), &serde_json::to_vec_pretty(&descriptor)?)?;

        tracing::warn!(
            job_id = %job.id,
            quarantined = %target.display(),
            classification = %kind,
            "Input quarantined"
        );
        Ok(())
    }
}

fn ensure_parent(path: &Path) -> Result<(), RoutingError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| RoutingError::Directory {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }
    Ok(())
}

fn move_file(from: &Path, to: &Path) -> Result<(), RoutingError> {
    ensure_parent(to)?;
    std::fs::rename(from, to).map_err(|e| RoutingError::Move {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        source: e,
    })
}

fn remove_if_exists(path: &Path) -> Result<(), RoutingError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(RoutingError::Remove {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Write `bytes` to a temp file in the target directory, then rename it into place.
pub fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), RoutingError> {
    ensure_parent(path)?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut file = tempfile::Builder::new()
        .prefix(".tmp")
        .tempfile_in(dir)
        .map_err(|e| RoutingError::Directory {
            path: dir.to_path_buf(),
            source: e,
        })?;
    file.write_all(bytes).map_err(|e| RoutingError::Directory {
        path: dir.to_path_buf(),
        source: e,
    })?;
    file.persist(path).map_err(|e| RoutingError::Move {
        from: e.file.path().to_path_buf(),
        to: path.to_path_buf(),
        source: e.error,
    })?;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("Failed to move {from} to {to}: {source}")]
    Move {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to remove {path}: {source}")]
    Remove { path: PathBuf, source: std::io::Error },

    #[error("Directory {path} is not writable: {source}")]
    Directory { path: PathBuf, source: std::io::Error },

    #[error("Engine output for {0} is missing")]
    MissingOutput(PathBuf),

    #[error("Failed to serialize failure descriptor: {0}")]
    Serialize(#[from] serde_json::Error),
}
