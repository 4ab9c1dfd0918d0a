use async_trait::async_trait;
use std::path::Path;
use std::process::{Output, Stdio};
use tokio::process::Command;

use crate::models::options::OcrOptions;
use crate::models::result::{Failure, FailureKind};

/// Capability the dispatcher runs jobs against.
///
/// Implementations must leave `output` untouched unless they succeed. A future that
/// is dropped mid-flight (timeout) must stop the underlying work.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Probe the engine; used at startup and by the health check.
    async fn version(&self) -> Result<String, EngineError>;

    async fn process(
        &self,
        input: &Path,
        output: &Path,
        options: &OcrOptions,
    ) -> Result<(), EngineError>;
}

/// Runs an `ocrmypdf`-compatible executable: `<program> [options] <input> <output>`.
pub struct CommandEngine {
    program: String,
}

impl CommandEngine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, command: &mut Command) -> Result<Output, EngineError> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match command.output().await {
            Ok(output) => Ok(output),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(EngineError::NotFound(self.program.clone()))
            }
            Err(e) => Err(EngineError::Io(e)),
        }
    }
}

#[async_trait]
impl OcrEngine for CommandEngine {
    fn name(&self) -> &str {
        &self.program
    }

    async fn version(&self) -> Result<String, EngineError> {
        let output = self.run(Command::new(&self.program).arg("--version")).await?;
        if !output.status.success() {
            return Err(exit_error(&output));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn process(
        &self,
        input: &Path,
        output_path: &Path,
        options: &OcrOptions,
    ) -> Result<(), EngineError> {
        let mut command = Command::new(&self.program);
        command.args(options.to_args()).arg(input).arg(output_path);

        tracing::debug!(
            program = %self.program,
            input = %input.display(),
            output = %output_path.display(),
            "Invoking OCR engine"
        );

        let output = self.run(&mut command).await?;
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            for part in collapse_repeats(stderr_parts(&stderr)) {
                tracing::error!(input = %input.display(), "{}", part);
            }
            return Err(exit_error(&output));
        }

        if mentions_error(&stderr) {
            for part in collapse_repeats(stderr_parts(&stderr)) {
                tracing::warn!(input = %input.display(), "{}", part);
            }
        }

        if !output_path.exists() {
            return Err(EngineError::MissingOutput);
        }
        Ok(())
    }
}

fn exit_error(output: &Output) -> EngineError {
    let message = String::from_utf8_lossy(&output.stderr).trim().to_string();
    match output.status.code() {
        Some(code) => EngineError::Exit { code, message },
        None => EngineError::Signaled { message },
    }
}

/// Stderr split on the `****` marker some converters prefix their errors with.
pub fn stderr_parts(stderr: &str) -> Vec<String> {
    stderr
        .split("****")
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn mentions_error(stderr: &str) -> bool {
    stderr.to_ascii_lowercase().contains("error")
}

/// Drop consecutive duplicates, replacing each run with a repeat count line.
pub fn collapse_repeats<I>(messages: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut collapsed = Vec::new();
    let mut last: Option<String> = None;
    let mut repeats = 0usize;

    for message in messages {
        if last.as_deref() == Some(message.as_str()) {
            repeats += 1;
            continue;
        }
        if repeats >= 1 {
            collapsed.push(format!("(previous message repeated {repeats} times)"));
            repeats = 0;
        }
        collapsed.push(message.clone());
        last = Some(message);
    }
    if repeats >= 1 {
        collapsed.push(format!("(previous message repeated {repeats} times)"));
    }
    collapsed
}

/// Map an engine exit code to a failure classification.
pub fn classify_exit_code(code: i32) -> FailureKind {
    match code {
        1 | 9 => FailureKind::InvalidOptions,
        2 | 6 | 8 => FailureKind::MalformedInput,
        3 => FailureKind::EngineUnavailable,
        5 => FailureKind::Io,
        // 4 invalid output, 7 child process, 10 PDF/A conversion, 15 other, 130 interrupted
        _ => FailureKind::EngineCrash,
    }
}

fn reports_exhaustion(message: &str) -> bool {
    ["MemoryError", "Cannot allocate memory", "No space left on device"]
        .iter()
        .any(|needle| message.contains(needle))
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("OCR engine `{0}` not found")]
    NotFound(String),

    #[error("OCR engine exited with code {code}: {message}")]
    Exit { code: i32, message: String },

    #[error("OCR engine was terminated by a signal: {message}")]
    Signaled { message: String },

    #[error("OCR engine reported success but produced no output")]
    MissingOutput,

    #[error("I/O error running OCR engine: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn kind(&self) -> FailureKind {
        match self {
            EngineError::NotFound(_) => FailureKind::EngineUnavailable,
            EngineError::Exit { message, .. } if reports_exhaustion(message) => {
                FailureKind::ResourceExhausted
            }
            EngineError::Exit { code, .. } => classify_exit_code(*code),
            EngineError::Signaled { .. } => FailureKind::ResourceExhausted,
            EngineError::MissingOutput => FailureKind::EngineCrash,
            EngineError::Io(_) => FailureKind::Io,
        }
    }
}

impl From<EngineError> for Failure {
    fn from(error: EngineError) -> Self {
        Failure::new(error.kind(), error.to_string())
    }
}
