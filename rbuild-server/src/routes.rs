//! HTTP route handlers for the build server API.

use std::fs;
use std::io::ErrorKind;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::Router;
use axum::extract::multipart::MultipartError;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use serde::Deserialize;
use tracing::{info, warn};

use rbuild::core::path::PathError;
use rbuild::core::types::{
    ActionError, ActionOutcome, ErrorBody, GitAction, GitState, JobView, Progress, StartedJob,
};
use rbuild::io::client::{BINARY_FIELD, DIFF_FIELD};
use rbuild::io::jobs::JobError;
use rbuild::io::live::AttachError;
use rbuild::io::transfer::{
    IncomingFile, RestoreReport, backup_and_restore, collect_changes, resolve_on_disk,
};

use crate::state::AppState;
use crate::stream::stream_job;

/// Build the API router.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/git/state", get(git_state))
        .route("/git/action", post(git_action))
        .route("/worktree/restore", post(restore_worktree))
        .route("/jobs", post(start_job))
        .route("/jobs/{id}", get(job_status))
        .route("/jobs/{id}/progress/{offset}", get(job_progress))
        .route("/jobs/{id}/stream", get(stream_job))
        .route("/changes/diff", get(changes_diff))
        .route("/changes/binaries", get(changes_binaries))
        .route("/files", get(get_file))
}

/// Failure returned as `{"error": ...}` with a matching status code.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            warn!(status = %self.status, error = %self.message, "request failed");
        }
        (
            self.status,
            Json(ErrorBody {
                error: self.message,
            }),
        )
            .into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(action) = err.downcast_ref::<ActionError>() {
            return Self::bad_request(action.to_string());
        }
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
    }
}

impl From<PathError> for ApiError {
    fn from(err: PathError) -> Self {
        Self::bad_request(err.to_string())
    }
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::Busy { .. } => Self::new(StatusCode::CONFLICT, err.to_string()),
            JobError::NotFound(_) => Self::new(StatusCode::NOT_FOUND, err.to_string()),
            JobError::InvalidPath(e) => e.into(),
            JobError::Other(e) => e.into(),
        }
    }
}

impl From<AttachError> for ApiError {
    fn from(err: AttachError) -> Self {
        let status = match err {
            AttachError::UnknownJob(_) => StatusCode::NOT_FOUND,
            AttachError::AlreadyAttached(_) | AttachError::Expired(_) => StatusCode::CONFLICT,
        };
        Self::new(status, err.to_string())
    }
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        Self::new(err.status(), err.body_text())
    }
}

/// Run git and filesystem work off the async workers.
async fn blocking<T, E>(f: impl FnOnce() -> Result<T, E> + Send + 'static) -> Result<T, ApiError>
where
    T: Send + 'static,
    E: Into<ApiError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| {
            ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("worker task failed: {e}"),
            )
        })?
        .map_err(Into::into)
}

async fn health() -> &'static str {
    "ok"
}

/// GET /git/state - snapshot of the mirror repository.
async fn git_state(State(state): State<AppState>) -> Result<Json<GitState>, ApiError> {
    let git = state.git.clone();
    blocking(move || git.snapshot()).await.map(Json)
}

/// POST /git/action - run one whitelisted git action.
///
/// Actions that move refs or files are refused while a build is active.
async fn git_action(
    State(state): State<AppState>,
    Json(action): Json<GitAction>,
) -> Result<Json<ActionOutcome>, ApiError> {
    info!(action = action.name(), "git action requested");
    if !action.is_mutating() {
        let git = state.git.clone();
        return blocking(move || git.execute(&action)).await.map(Json);
    }
    let jobs = state.jobs.clone();
    let outcome = blocking(move || jobs.with_idle_mirror(|git| git.execute(&action))).await?;
    Ok(Json(outcome?))
}

/// POST /worktree/restore - back up and discard uncommitted changes.
async fn restore_worktree(State(state): State<AppState>) -> Result<Json<RestoreReport>, ApiError> {
    let jobs = state.jobs.clone();
    let runtime = state.runtime().clone();
    let stamp = backup_stamp();
    let report = blocking(move || {
        jobs.with_idle_mirror(|git| backup_and_restore(git, &runtime, &stamp))
    })
    .await??;
    if let Some(backup) = &report.backup {
        info!(backup = %backup.display(), "worktree restored");
    }
    Ok(Json(report))
}

/// POST /jobs - apply an uploaded change set and start a build.
async fn start_job(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<StartedJob>), ApiError> {
    let mut diff: Option<Vec<u8>> = None;
    let mut files = Vec::new();
    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            DIFF_FIELD => diff = Some(field.bytes().await?.to_vec()),
            BINARY_FIELD => {
                let path = field
                    .file_name()
                    .map(str::to_string)
                    .ok_or_else(|| ApiError::bad_request("binary part has no file name"))?;
                let bytes = field.bytes().await?.to_vec();
                files.push(IncomingFile { path, bytes });
            }
            other => warn!(field = other, "ignoring unknown multipart field"),
        }
    }
    let diff = diff.ok_or_else(|| ApiError::bad_request(format!("missing {DIFF_FIELD} part")))?;

    let jobs = state.jobs.clone();
    let started = blocking(move || jobs.start(diff, files)).await?;
    Ok((StatusCode::ACCEPTED, Json(started)))
}

/// GET /jobs/{id}
async fn job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobView>, ApiError> {
    Ok(Json(state.jobs.status(&job_id)?))
}

/// GET /jobs/{id}/progress/{offset}
async fn job_progress(
    State(state): State<AppState>,
    Path((job_id, offset)): Path<(String, u64)>,
) -> Result<Json<Progress>, ApiError> {
    let jobs = state.jobs.clone();
    blocking(move || jobs.progress(&job_id, offset))
        .await
        .map(Json)
}

/// GET /changes/diff - the mirror's plaintext delta against HEAD.
async fn changes_diff(State(state): State<AppState>) -> Result<Response, ApiError> {
    let git = state.git.clone();
    let runtime = state.runtime().clone();
    let outgoing = blocking(move || collect_changes(&git, &runtime)).await?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        outgoing.diff,
    )
        .into_response())
}

/// GET /changes/binaries - changed binary paths on the mirror.
async fn changes_binaries(State(state): State<AppState>) -> Result<Json<Vec<String>>, ApiError> {
    let git = state.git.clone();
    let runtime = state.runtime().clone();
    let outgoing = blocking(move || collect_changes(&git, &runtime)).await?;
    Ok(Json(outgoing.manifest.binary_paths))
}

#[derive(Debug, Deserialize)]
struct FileQuery {
    path: Option<String>,
}

/// GET /files?path=<rel> - raw bytes of one project file.
async fn get_file(
    State(state): State<AppState>,
    Query(query): Query<FileQuery>,
) -> Result<Response, ApiError> {
    let rel = query.path.ok_or(PathError::Missing)?;
    let root = state.project_dir().to_path_buf();
    let (mime, bytes) = blocking(move || {
        let resolved = resolve_on_disk(&root, &rel)?;
        let mime = mime_guess::from_path(&resolved).first_or_octet_stream();
        let bytes = fs::read(&resolved).map_err(|e| match e.kind() {
            ErrorKind::NotFound => ApiError::new(
                StatusCode::NOT_FOUND,
                format!("no such file: {}", resolved.display()),
            ),
            _ => ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("read {}: {e}", resolved.display()),
            ),
        })?;
        Ok::<_, ApiError>((mime, bytes))
    })
    .await?;
    Ok(([(header::CONTENT_TYPE, mime.essence_str().to_string())], bytes).into_response())
}

/// Backup directory suffix: seconds since the epoch plus a short random tag.
fn backup_stamp() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    let tag = uuid::Uuid::new_v4().simple().to_string();
    format!("{secs}-{}", &tag[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn job_errors_map_to_status_codes() {
        let busy: ApiError = JobError::Busy {
            active: "a".to_string(),
        }
        .into();
        assert_eq!(busy.status, StatusCode::CONFLICT);

        let missing: ApiError = JobError::NotFound("x".to_string()).into();
        assert_eq!(missing.status, StatusCode::NOT_FOUND);

        let bad_path: ApiError = JobError::InvalidPath(PathError::Traversal("../x".into())).into();
        assert_eq!(bad_path.status, StatusCode::BAD_REQUEST);

        let other: ApiError = JobError::Other(anyhow!("disk full")).into();
        assert_eq!(other.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(other.message, "disk full");
    }

    #[test]
    fn rejected_action_arguments_are_bad_requests() {
        let err = anyhow::Error::from(ActionError::InvalidBranch("-x".to_string()));
        let api: ApiError = err.into();
        assert_eq!(api.status, StatusCode::BAD_REQUEST);
        assert!(api.message.contains("-x"));
    }

    #[test]
    fn attach_errors_map_to_status_codes() {
        let unknown: ApiError = AttachError::UnknownJob("j".to_string()).into();
        assert_eq!(unknown.status, StatusCode::NOT_FOUND);
        let taken: ApiError = AttachError::AlreadyAttached("j".to_string()).into();
        assert_eq!(taken.status, StatusCode::CONFLICT);
    }

    #[test]
    fn backup_stamps_are_unique() {
        assert_ne!(backup_stamp(), backup_stamp());
    }
}
