use axum::body::Bytes;
use axum::extract::{Multipart, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::job::{Job, JobOrigin};
use crate::models::options::OcrOptionsPatch;
use crate::models::result::{ExecutionResult, FailureKind, Outcome};
use crate::routes::error::ApiError;
use crate::services::dispatcher::{Dispatcher, JobHandle};

struct Upload {
    file_name: String,
    data: Bytes,
}

/// POST /api/v1/ocr: Run OCR on an uploaded document and return the result.
pub async fn submit_document(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let mut upload: Option<Upload> = None;
    let mut patch = OcrOptionsPatch::default();
    let mut json_patch: Option<OcrOptionsPatch> = None;

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let file_name = field.file_name().unwrap_or("upload").to_string();
                let data = field.bytes().await?;
                upload = Some(Upload { file_name, data });
            }
            "options" => {
                let text = field.text().await?;
                if !text.trim().is_empty() {
                    json_patch = Some(
                        serde_json::from_str(&text)
                            .map_err(crate::models::options::OptionsError::from)?,
                    );
                }
            }
            other => {
                let value = field.text().await?;
                if !patch.set_field(other, &value)? {
                    tracing::debug!(field = other, "Ignoring unknown form field");
                }
            }
        }
    }

    let upload = upload.ok_or_else(|| ApiError::invalid_request("missing `file` field"))?;
    if upload.data.is_empty() {
        return Err(ApiError::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            FailureKind::MalformedInput,
            "uploaded file is empty",
        ));
    }
    if let Some(json) = json_patch {
        patch.merge(json);
    }
    let options = patch.apply(&state.ocr_defaults)?;

    let extension = sniff_document(&upload.data).ok_or_else(|| {
        ApiError::new(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            FailureKind::MalformedInput,
            "expected a PDF, PNG, JPEG or TIFF document",
        )
    })?;

    tokio::fs::create_dir_all(state.work_dir.as_path())
        .await
        .map_err(ApiError::io)?;
    let upload_id = Uuid::new_v4();
    let source = state.work_dir.join(format!("{upload_id}-upload.{extension}"));
    let destination = state.work_dir.join(format!("{upload_id}-result.pdf"));

    let job = Job::new(JobOrigin::Upload, source, destination, options);
    tracing::info!(
        job_id = %job.id,
        file_name = %upload.file_name,
        bytes = upload.data.len(),
        "Document submitted over HTTP"
    );

    // Owns the scratch files from here on, so they are removed even if the client
    // goes away and this handler is dropped.
    let (reply, response) = oneshot::channel();
    tokio::spawn(run_upload(
        state.dispatcher.clone(),
        job,
        upload.data.clone(),
        state.queue_wait,
        reply,
    ));
    let bytes = response.await.map_err(|_| {
        ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            FailureKind::Io,
            "upload task stopped without a result",
        )
    })??;

    let disposition = format!(
        "attachment; filename=\"{}_ocr.pdf\"",
        download_stem(&upload.file_name)
    );
    Ok((
        [
            (header::CONTENT_TYPE, "application/pdf".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response())
}

/// Write the upload, run `job`, collect the output, then remove both scratch files.
///
/// Stops waiting once `reply` is closed; a still-queued job is cancelled, a running
/// one is awaited so its output can be removed.
async fn run_upload(
    dispatcher: Arc<Dispatcher>,
    job: Job,
    data: Bytes,
    queue_wait: Duration,
    mut reply: oneshot::Sender<Result<Vec<u8>, ApiError>>,
) {
    let job_id = job.id;
    let source = job.source_path.clone();
    let destination = job.destination_path.clone();

    if let Err(e) = tokio::fs::write(&source, &data).await {
        discard(&source).await;
        let _ = reply.send(Err(ApiError::io(e)));
        return;
    }

    let outcome = match dispatcher.submit(job) {
        Ok(mut handle) => {
            let waited = tokio::select! {
                result = wait_for_result(&mut handle, queue_wait) => Some(result),
                _ = reply.closed() => None,
            };
            match waited {
                Some(result) => collect_output(result).await,
                None => {
                    if !handle.cancel() {
                        let _ = handle.await;
                    }
                    tracing::info!(job_id = %job_id, "Client disconnected, discarded upload");
                    Err(ApiError::new(
                        StatusCode::SERVICE_UNAVAILABLE,
                        FailureKind::Cancelled,
                        "client disconnected",
                    ))
                }
            }
        }
        Err(e) => Err(e.into()),
    };

    discard(&source).await;
    discard(&destination).await;
    let _ = reply.send(outcome);
}

/// Wait for the job, giving up (and cancelling) if it is still queued after `queue_wait`.
///
/// A job that has already started is always waited for; it is bounded by the job timeout.
async fn wait_for_result(
    handle: &mut JobHandle,
    queue_wait: Duration,
) -> Result<ExecutionResult, ApiError> {
    match tokio::time::timeout(queue_wait, &mut *handle).await {
        Ok(result) => Ok(result),
        Err(_) if handle.cancel() => {
            tracing::warn!(job_id = %handle.job_id(), "Request gave up waiting for a slot");
            Err(ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                FailureKind::QueueFull,
                "timed out waiting for a free OCR slot",
            ))
        }
        Err(_) => Ok(handle.await),
    }
}

async fn collect_output(result: Result<ExecutionResult, ApiError>) -> Result<Vec<u8>, ApiError> {
    let result = result?;
    match result.outcome {
        Outcome::Succeeded => {
            let output = result.output_path.ok_or_else(|| {
                ApiError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    FailureKind::Io,
                    "job succeeded without an output file",
                )
            })?;
            tokio::fs::read(&output).await.map_err(ApiError::io)
        }
        Outcome::Failed(failure) => Err(failure.into()),
    }
}

async fn discard(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove scratch file");
        }
    }
}

/// File extension for a supported upload, judged by content rather than name.
pub fn sniff_document(data: &[u8]) -> Option<&'static str> {
    if data.starts_with(b"%PDF-") {
        return Some("pdf");
    }
    match image::guess_format(data).ok()? {
        image::ImageFormat::Png => Some("png"),
        image::ImageFormat::Jpeg => Some("jpg"),
        image::ImageFormat::Tiff => Some("tiff"),
        _ => None,
    }
}

fn download_stem(file_name: &str) -> String {
    let stem = Path::new(file_name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let cleaned: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "document".to_string()
    } else {
        cleaned
    }
}
