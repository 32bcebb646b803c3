use axum::{
    http::StatusCode,
    response::Json,
    routing::{get, patch, post, put},
    Router,
};
use markban_core::storage::{ErrorKind, StorageError};
use serde::Serialize;

mod cards;
mod events;
mod projects;

use crate::state::AppState;

/// Axum REST API routes.
///
///   GET    /status                                       -> health check
///   GET    /projects?includeArchived=true                -> list projects
///   POST   /projects                                     -> create project
///   GET    /projects/{project}                           -> read project
///   PATCH  /projects/{project}                           -> update project
///   DELETE /projects/{project}[?permanent=true]          -> archive (or delete) project
///   GET    /projects/{project}/cards?lane=&since=&staleDays= -> list card summaries
///   POST   /projects/{project}/cards                     -> create card
///   GET    /projects/{project}/cards/{card}              -> read card
///   PATCH  /projects/{project}/cards/{card}              -> update card
///   DELETE /projects/{project}/cards/{card}              -> delete card
///   POST   /projects/{project}/cards/{card}/move         -> move card
///   POST   /projects/{project}/cards/{card}/archive      -> archive card
///   POST   /projects/{project}/cards/{card}/tasks        -> add task
///   PATCH  /projects/{project}/cards/{card}/tasks/{index} -> toggle task
///   PUT    /projects/{project}/lanes/{lane}/order        -> reorder lane
///   GET    /projects/{project}/history?limit=            -> recent activity
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/status", get(events::status))
        .route(
            "/projects",
            get(projects::list_projects).post(projects::create_project),
        )
        .route(
            "/projects/{project}",
            get(projects::get_project)
                .patch(projects::update_project)
                .delete(projects::delete_project),
        )
        .route(
            "/projects/{project}/cards",
            get(cards::list_cards).post(cards::create_card),
        )
        .route(
            "/projects/{project}/cards/{card}",
            get(cards::get_card)
                .patch(cards::update_card)
                .delete(cards::delete_card),
        )
        .route("/projects/{project}/cards/{card}/move", post(cards::move_card))
        .route(
            "/projects/{project}/cards/{card}/archive",
            post(cards::archive_card),
        )
        .route("/projects/{project}/cards/{card}/tasks", post(cards::add_task))
        .route(
            "/projects/{project}/cards/{card}/tasks/{index}",
            patch(cards::toggle_task),
        )
        .route(
            "/projects/{project}/lanes/{lane}/order",
            put(cards::reorder_lane),
        )
        .route("/projects/{project}/history", get(events::history))
}

// ── Shared types and helpers used across sub-modules ────────────────────

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);

/// Check if a user-supplied path segment contains path traversal sequences.
/// Percent-decodes the input first, then checks the decoded string for:
/// "..", "/", "\", "./" prefix, and "/./" in path.
fn has_path_traversal(input: &str) -> bool {
    use percent_encoding::percent_decode_str;
    let decoded = percent_decode_str(input).decode_utf8_lossy();
    decoded.contains("..")
        || decoded.contains('/')
        || decoded.contains('\\')
        || decoded.starts_with("./")
        || decoded.contains("/./")
}

/// Reject path parameters that would escape the workspace.
fn check_segments(target: &'static str, segments: &[&str]) -> Result<(), ApiError> {
    match segments.iter().find(|s| has_path_traversal(s)) {
        Some(bad) => Err(api_error(
            StatusCode::BAD_REQUEST,
            target,
            format!("Invalid path segment: {}", bad),
        )),
        None => Ok(()),
    }
}

fn api_error(status: StatusCode, target: &'static str, error: String) -> ApiError {
    log_api_issue(status, target, &error);
    (status, Json(ErrorResponse { error }))
}

fn storage_error(target: &'static str, err: StorageError) -> ApiError {
    let status = match err.kind() {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    api_error(status, target, err.to_string())
}

fn log_api_issue(status: StatusCode, target: &'static str, message: impl AsRef<str>) {
    let message = message.as_ref();
    if status.is_server_error() {
        log::error!(target: target, "{}", message);
    } else {
        log::warn!(target: target, "{}", message);
    }
}
