//! HTTP surface for uploading batches, following progress and downloading
//! results.

use crate::bundle::{
    BundleError, UniqueNames, group_by_client, safe_file_name, unique_owners, zip_files,
};
use crate::config::Config;
use crate::documents::{DocumentRenderer, RenderError, Template};
use crate::jobs::{Job, JobOutcome, JobStatus, JobTracker, Progress, RowError};
use crate::spreadsheet::{
    DEFAULT_SHEET_NAME, SpreadsheetError, merge_results, parse_workbook, write_workbook,
};
use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Multipart, Path, State, multipart::MultipartError},
    http::{HeaderName, HeaderValue, Method, StatusCode, header},
    response::{
        IntoResponse, Response,
        sse::{Event, Sse},
    },
    routing::{get, post},
};
use futures::stream::{self, Stream};
use registry::RegistryRecord;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{AllowOrigin, CorsLayer};

const UPLOAD_FIELD: &str = "file";
const STATUS_ERROR_LIMIT: usize = 10;
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;
const XLSX_CONTENT_TYPE: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
const ZIP_CONTENT_TYPE: &str = "application/zip";

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("No file uploaded")]
    NoFile,
    #[error("file exceeds the upload limit of {0} bytes")]
    TooLarge(usize),
    #[error("invalid upload: {0}")]
    Multipart(#[from] MultipartError),
    #[error("{0}")]
    Spreadsheet(#[from] SpreadsheetError),
    #[error("Not found")]
    NotFound,
    #[error("Job not finished")]
    NotFinished,
    #[error("document rendering is not configured")]
    DocumentsDisabled,
    #[error("{0}")]
    Render(#[from] RenderError),
    #[error("{0}")]
    Bundle(#[from] BundleError),
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Serialize)]
struct ApiErrorResponse {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NoFile => StatusCode::BAD_REQUEST,
            ApiError::TooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Multipart(e) => e.status(),
            ApiError::Spreadsheet(SpreadsheetError::Write(_) | SpreadsheetError::TooLarge(_)) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ApiError::Spreadsheet(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::NotFinished => StatusCode::CONFLICT,
            ApiError::DocumentsDisabled => StatusCode::NOT_IMPLEMENTED,
            ApiError::Render(_) | ApiError::Bundle(_) | ApiError::Join(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        if status.is_server_error() && status != StatusCode::NOT_IMPLEMENTED {
            tracing::error!("request failed: {self}");
        }

        let body = Json(ApiErrorResponse {
            error: self.to_string(),
        });
        (status, body).into_response()
    }
}

/// Template and renderer used for the power of attorney download.
pub struct DocumentSet {
    pub template: Template,
    pub renderer: Arc<dyn DocumentRenderer>,
}

#[derive(Clone)]
pub struct AppState {
    tracker: Arc<JobTracker>,
    documents: Option<Arc<DocumentSet>>,
    progress_interval: Duration,
    max_upload_bytes: usize,
}

impl AppState {
    pub fn new(tracker: Arc<JobTracker>, documents: Option<DocumentSet>) -> Self {
        AppState {
            tracker,
            documents: documents.map(Arc::new),
            progress_interval: Duration::from_secs(1),
            max_upload_bytes: Config::default().max_upload_bytes,
        }
    }

    /// How often the progress stream emits an update.
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    fn job(&self, id: &str) -> Result<Arc<Job>, ApiError> {
        self.tracker.get_job(id).ok_or(ApiError::NotFound)
    }

    fn finished_job(&self, id: &str) -> Result<(Arc<Job>, JobOutcome), ApiError> {
        let job = self.job(id)?;
        let outcome = job.outcome().ok_or(ApiError::NotFinished)?;
        Ok((job, outcome))
    }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST])
}

pub fn router(state: AppState, config: &Config) -> Router {
    let state = AppState {
        max_upload_bytes: config.max_upload_bytes,
        ..state
    };

    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/jobs", post(create_job))
        .route("/api/jobs/{id}", get(job_status))
        .route("/api/jobs/{id}/stream", get(job_stream))
        .route("/api/jobs/{id}/full", get(job_full))
        .route("/api/jobs/{id}/download", get(download))
        .route("/api/jobs/{id}/download-split", get(download_split))
        .route("/api/jobs/{id}/download-poas", get(download_poas))
        .layer(DefaultBodyLimit::max(
            config.max_upload_bytes + MULTIPART_OVERHEAD_BYTES,
        ))
        .layer(cors_layer(&config.allowed_origins))
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
}

async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse { ok: true })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreatedResponse {
    job_id: String,
    total: usize,
}

async fn create_job(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<CreatedResponse>, ApiError> {
    let mut upload = None;
    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some(UPLOAD_FIELD) {
            upload = Some(field.bytes().await?);
            break;
        }
    }
    let data = upload.ok_or(ApiError::NoFile)?;

    // The body limit allows for multipart framing, the file itself may not.
    if data.len() > state.max_upload_bytes {
        return Err(ApiError::TooLarge(state.max_upload_bytes));
    }

    let batch = tokio::task::spawn_blocking(move || parse_workbook(&data)).await??;
    let job = state.tracker.create_job(batch);

    Ok(Json(CreatedResponse {
        job_id: job.id.clone(),
        total: job.total(),
    }))
}

#[derive(Serialize)]
struct JobSummary {
    id: String,
    total: usize,
    done: usize,
    status: JobStatus,
    errors: Vec<RowError>,
}

async fn job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobSummary>, ApiError> {
    let job = state.job(&id)?;
    let progress = job.progress();

    Ok(Json(JobSummary {
        id: job.id.clone(),
        total: progress.total,
        done: progress.done,
        status: progress.status,
        errors: job.errors(STATUS_ERROR_LIMIT),
    }))
}

#[derive(Serialize)]
struct Completion {
    done: usize,
    total: usize,
}

enum StreamState {
    Polling,
    Completing,
    Done,
}

fn progress_events(
    job: Arc<Job>,
    interval: Duration,
) -> impl Stream<Item = Result<Event, axum::Error>> {
    stream::unfold(
        (job, StreamState::Polling),
        move |(job, state)| async move {
            match state {
                StreamState::Polling => {
                    tokio::time::sleep(interval).await;
                    let progress: Progress = job.progress();
                    let next = match progress.status {
                        JobStatus::Finished => StreamState::Completing,
                        JobStatus::Running => StreamState::Polling,
                    };
                    Some((Event::default().json_data(progress), (job, next)))
                }
                StreamState::Completing => {
                    let progress = job.progress();
                    let event = Event::default().event("complete").json_data(Completion {
                        done: progress.done,
                        total: progress.total,
                    });
                    Some((event, (job, StreamState::Done)))
                }
                StreamState::Done => None,
            }
        },
    )
}

async fn job_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.job(&id)?;
    let sse = Sse::new(progress_events(job, state.progress_interval));
    Ok(([(header::CACHE_CONTROL, "no-cache")], sse))
}

#[derive(Serialize)]
struct JobDetails {
    id: String,
    total: usize,
    done: usize,
    status: JobStatus,
    results: Vec<RegistryRecord>,
    errors: Vec<RowError>,
}

async fn job_full(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobDetails>, ApiError> {
    let (job, outcome) = state.finished_job(&id)?;
    let progress = job.progress();

    Ok(Json(JobDetails {
        id: job.id.clone(),
        total: progress.total,
        done: progress.done,
        status: progress.status,
        results: outcome.results,
        errors: outcome.errors,
    }))
}

fn attachment(content_type: &'static str, file_name: String, bytes: Vec<u8>) -> Response {
    let disposition = format!("attachment; filename=\"{file_name}\"");
    let headers: [(HeaderName, String); 2] = [
        (header::CONTENT_TYPE, content_type.to_string()),
        (header::CONTENT_DISPOSITION, disposition),
    ];
    (headers, bytes).into_response()
}

async fn download(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let (job, outcome) = state.finished_job(&id)?;

    let bytes = {
        let job = job.clone();
        tokio::task::spawn_blocking(move || {
            let rows: Vec<_> = job.batch.rows.iter().collect();
            let results: Vec<_> = outcome.results.iter().collect();
            let sheet = merge_results(&job.batch.sheet_name, &job.batch.headers, &rows, &results);
            write_workbook(&sheet)
        })
        .await??
    };

    Ok(attachment(
        XLSX_CONTENT_TYPE,
        format!("registry-results-{}.xlsx", job.id),
        bytes,
    ))
}

fn split_archive(job: &Job, outcome: &JobOutcome) -> Result<Vec<u8>, ApiError> {
    let mut names = UniqueNames::default();
    let mut files = Vec::new();

    for (client, indices) in group_by_client(&job.batch.rows) {
        let rows: Vec<_> = indices.iter().map(|&i| &job.batch.rows[i]).collect();
        let results: Vec<_> = indices.iter().map(|&i| &outcome.results[i]).collect();
        let sheet = merge_results(DEFAULT_SHEET_NAME, &job.batch.headers, &rows, &results);

        let file_name = names.claim(&safe_file_name(&client), ".xlsx");
        files.push((file_name, write_workbook(&sheet)?));
    }

    Ok(zip_files(files)?)
}

async fn download_split(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let (job, outcome) = state.finished_job(&id)?;

    let bytes = {
        let job = job.clone();
        tokio::task::spawn_blocking(move || split_archive(&job, &outcome)).await??
    };

    Ok(attachment(
        ZIP_CONTENT_TYPE,
        format!("registry-split-{}.zip", job.id),
        bytes,
    ))
}

/// Archive path and filled template for every distinct owner, one folder per
/// client.
fn owner_documents(job: &Job, outcome: &JobOutcome, template: &Template) -> Vec<(String, String)> {
    let mut folders = UniqueNames::default();
    let mut documents = Vec::new();

    for (client, indices) in group_by_client(&job.batch.rows) {
        let owners = unique_owners(indices.iter().map(|&i| &outcome.results[i]));
        if owners.is_empty() {
            continue;
        }

        let folder = folders.claim(&safe_file_name(&client), "");
        let mut files = UniqueNames::default();
        for (name, address) in owners {
            let stem = if name.is_empty() { &address } else { &name };
            let file_name = files.claim(&safe_file_name(stem), ".pdf");
            documents.push((format!("{folder}/{file_name}"), template.fill(&name, &address)));
        }
    }

    documents
}

async fn download_poas(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let documents = state.documents.clone().ok_or(ApiError::DocumentsDisabled)?;
    let (job, outcome) = state.finished_job(&id)?;

    let (paths, html): (Vec<String>, Vec<String>) =
        owner_documents(&job, &outcome, &documents.template)
            .into_iter()
            .unzip();
    tracing::info!(job_id = %job.id, documents = paths.len(), "rendering powers of attorney");

    let pdfs = documents.renderer.render_many(html).await?;
    if pdfs.len() != paths.len() {
        return Err(RenderError::Browser(format!(
            "expected {} documents, renderer returned {}",
            paths.len(),
            pdfs.len()
        ))
        .into());
    }

    let files = paths.into_iter().zip(pdfs).collect();
    let bytes = tokio::task::spawn_blocking(move || zip_files(files)).await??;

    Ok(attachment(
        ZIP_CONTENT_TYPE,
        format!("registry-poas-{}.zip", job.id),
        bytes,
    ))
}
