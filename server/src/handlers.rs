//! Route handlers.
//!
//! Queue and filesystem work is blocking, so every call into the pipeline
//! from here goes through `spawn_blocking` or the async retrieval API.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::io::ReaderStream;

use schemaforge::{ArtifactDownload, Job, QueueCounts, QueueError, Retrieval};

use crate::error::{AppError, AppResult};
use crate::state::AppState;

/// Multipart field carrying the schema file.
pub const SCHEMA_FIELD: &str = "schema";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub job_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResponse {
    pub job_id: String,
    pub status: String,
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<Job> for JobResponse {
    fn from(job: Job) -> Self {
        Self {
            job_id: job.id,
            status: job.status.to_string(),
            attempt: job.attempt,
            error: job.error,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue: Option<QueueCounts>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DownloadParams {
    /// Seconds to wait for an unfinished job before answering 202.
    #[serde(default)]
    pub wait: Option<u64>,
}

/// POST /generate-code
///
/// Accepts a multipart upload with the schema in the `schema` field and
/// answers `202 {"jobId": ..}` once the job is durably queued.
pub async fn generate_code(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> AppResult<(StatusCode, Json<SubmitResponse>)> {
    let mut upload: Option<(Option<String>, Vec<u8>)> = None;

    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(SCHEMA_FIELD) {
            continue;
        }
        let filename = field.file_name().map(str::to_string);
        let data = field.bytes().await?;
        if data.len() > state.max_upload_bytes {
            return Err(AppError::PayloadTooLarge);
        }
        upload = Some((filename, data.to_vec()));
        break;
    }

    let (filename, data) = upload.unwrap_or_default();
    let ingress = Arc::clone(&state.ingress);
    let job_id = tokio::task::spawn_blocking(move || ingress.submit(filename.as_deref(), &data))
        .await
        .map_err(|e| AppError::InternalError(e.to_string()))??;

    Ok((StatusCode::ACCEPTED, Json(SubmitResponse { job_id })))
}

/// GET /download/{job_id}?wait=<secs>
pub async fn download(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Query(params): Query<DownloadParams>,
) -> AppResult<Response> {
    let wait = Duration::from_secs(params.wait.unwrap_or(0));

    let response = match state.retrieval.retrieve(&job_id, wait).await? {
        Retrieval::Ready(download) => stream_artifact(download)?,
        Retrieval::Pending => {
            (StatusCode::ACCEPTED, Json(json!({ "status": "pending" }))).into_response()
        }
        Retrieval::NotFound => error_response(
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            format!("Job '{}' not found", job_id),
        ),
        Retrieval::Consumed => error_response(
            StatusCode::GONE,
            "ALREADY_DOWNLOADED",
            "The artifact has already been downloaded".to_string(),
        ),
        Retrieval::Failed(message) => {
            error_response(StatusCode::UNPROCESSABLE_ENTITY, "GENERATION_FAILED", message)
        }
    };

    Ok(response)
}

/// GET /jobs/{job_id}
pub async fn job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> AppResult<Json<JobResponse>> {
    let queue = Arc::clone(&state.queue);
    let lookup_id = job_id.clone();
    let job = tokio::task::spawn_blocking(move || queue.get(&lookup_id))
        .await
        .map_err(|e| AppError::InternalError(e.to_string()))??;

    job.map(|job| Json(JobResponse::from(job)))
        .ok_or(AppError::Queue(QueueError::NotFound(job_id)))
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let queue = Arc::clone(&state.queue);
    let counts = tokio::task::spawn_blocking(move || queue.counts()).await;

    let queue = match counts {
        Ok(Ok(counts)) => Some(counts),
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "Health check could not read the queue");
            None
        }
        Err(e) => {
            tracing::warn!(error = %e, "Health check task failed");
            None
        }
    };

    Json(HealthResponse {
        status: if queue.is_some() { "ok" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        queue,
    })
}

fn error_response(status: StatusCode, code: &str, message: String) -> Response {
    (status, Json(json!({ "error": message, "code": code }))).into_response()
}

fn stream_artifact(mut download: ArtifactDownload) -> AppResult<Response> {
    let file = download
        .take_file()
        .ok_or_else(|| AppError::InternalError("artifact file already taken".to_string()))?;
    let len = download.len();
    let disposition = format!("attachment; filename=\"{}\"", download.filename());

    let body = GuardedFile {
        file: tokio::fs::File::from_std(file),
        _download: download,
    };

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (header::CONTENT_LENGTH, len.to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        Body::from_stream(ReaderStream::new(body)),
    )
        .into_response())
}

/// Streams the archive while holding its [`ArtifactDownload`], so the file
/// is deleted once the body is finished or dropped.
struct GuardedFile {
    file: tokio::fs::File,
    _download: ArtifactDownload,
}

impl AsyncRead for GuardedFile {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().file).poll_read(cx, buf)
    }
}
