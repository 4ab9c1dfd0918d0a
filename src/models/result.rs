use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use strum::{Display, EnumString};
use uuid::Uuid;

/// Classification attached to every failed execution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailureKind {
    /// Unreadable, encrypted or unsupported document.
    MalformedInput,
    /// The engine rejected the arguments it was given.
    InvalidOptions,
    Timeout,
    /// Out of memory, disk, or killed by the OS.
    ResourceExhausted,
    EngineCrash,
    /// Engine executable or one of its dependencies is missing.
    EngineUnavailable,
    Io,
    QueueFull,
    Cancelled,
}

impl FailureKind {
    /// Worth another attempt on the same input.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            FailureKind::Timeout | FailureKind::ResourceExhausted | FailureKind::EngineCrash
        )
    }

    /// The environment is broken rather than the document.
    pub fn is_infrastructure(self) -> bool {
        matches!(self, FailureKind::EngineUnavailable | FailureKind::Io)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(limit: Duration) -> Self {
        Self::new(
            FailureKind::Timeout,
            format!("engine did not finish within {}s", limit.as_secs_f64()),
        )
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Failed(Failure),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Succeeded)
    }

    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Outcome::Succeeded => None,
            Outcome::Failed(failure) => Some(failure),
        }
    }
}

/// Terminal report for one job, produced by the dispatcher.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub job_id: Uuid,
    pub outcome: Outcome,
    /// Where the output was placed, for successful jobs.
    pub output_path: Option<PathBuf>,
    /// Engine output waiting to be moved into place by routing.
    pub staged_path: Option<PathBuf>,
    pub attempts: u32,
    pub duration: Duration,
}

impl ExecutionResult {
    /// A job that ended without ever reaching the engine.
    pub fn not_run(job_id: Uuid, failure: Failure) -> Self {
        Self {
            job_id,
            outcome: Outcome::Failed(failure),
            output_path: None,
            staged_path: None,
            attempts: 0,
            duration: Duration::ZERO,
        }
    }
}
