use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::models::options::OcrOptions;

/// Lifecycle of a job. `Running` covers every attempt, including retries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

/// Which front end created the job. Decides what routing does with the source.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobOrigin {
    /// Claimed file from the watch directory; quarantined on failure.
    Watcher,
    /// Scratch copy of an HTTP upload; discarded either way.
    Upload,
}

/// One document-processing submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub origin: JobOrigin,
    pub source_path: PathBuf,
    pub destination_path: PathBuf,
    pub options: OcrOptions,
    pub created_at: DateTime<Utc>,
    status: JobStatus,
    attempt_count: u32,
}

impl Job {
    pub fn new(
        origin: JobOrigin,
        source_path: PathBuf,
        destination_path: PathBuf,
        options: OcrOptions,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            origin,
            source_path,
            destination_path,
            options,
            created_at: Utc::now(),
            status: JobStatus::Pending,
            attempt_count: 0,
        }
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Start the first attempt or a retry. Returns the new attempt number.
    pub fn begin_attempt(&mut self) -> Result<u32, JobError> {
        match self.status {
            JobStatus::Pending => self.status = JobStatus::Running,
            JobStatus::Running => {}
            terminal => {
                return Err(JobError::InvalidTransition {
                    job_id: self.id,
                    from: terminal,
                    to: JobStatus::Running,
                })
            }
        }
        self.attempt_count += 1;
        Ok(self.attempt_count)
    }

    /// Record the terminal state. Only a running job can finish, and only once.
    pub fn finish(&mut self, succeeded: bool) -> Result<(), JobError> {
        let to = if succeeded {
            JobStatus::Succeeded
        } else {
            JobStatus::Failed
        };
        if self.status != JobStatus::Running {
            return Err(JobError::InvalidTransition {
                job_id: self.id,
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// Hidden sibling of the destination that the engine writes into.
    ///
    /// Lives in the destination directory so the final move is a same-filesystem rename.
    pub fn staging_path(&self, attempt: u32) -> PathBuf {
        let name = self
            .destination_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "output.pdf".to_string());
        let dir = self
            .destination_path
            .parent()
            .unwrap_or_else(|| Path::new("."));
        dir.join(format!(".{name}.{}.{attempt}.part", self.id))
    }

    pub fn source_name(&self) -> String {
        self.source_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.id.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {job_id} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },
}
