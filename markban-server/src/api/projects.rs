use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use markban_core::events::BoardEvent;
use markban_core::types::{NewProject, Project, ProjectPatch};
use serde::Deserialize;

use super::{check_segments, storage_error, ApiError};
use crate::state::AppState;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListProjectsQuery {
    #[serde(default)]
    include_archived: bool,
}

#[derive(Deserialize)]
pub struct DeleteProjectQuery {
    #[serde(default)]
    permanent: bool,
}

pub async fn list_projects(
    State(state): State<AppState>,
    Query(query): Query<ListProjectsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let projects = state
        .store
        .list_projects(query.include_archived)
        .await
        .map_err(|e| storage_error("markban.api.list_projects", e))?;
    Ok(Json(serde_json::json!({ "projects": projects })))
}

pub async fn create_project(
    State(state): State<AppState>,
    Json(body): Json<NewProject>,
) -> Result<(StatusCode, Json<Project>), ApiError> {
    let project = state
        .store
        .create_project(body)
        .await
        .map_err(|e| storage_error("markban.api.create_project", e))?;
    Ok((StatusCode::CREATED, Json(project)))
}

pub async fn get_project(
    State(state): State<AppState>,
    Path(project): Path<String>,
) -> Result<Json<Project>, ApiError> {
    check_segments("markban.api.get_project", &[&project])?;
    let project = state
        .store
        .get_project(&project)
        .await
        .map_err(|e| storage_error("markban.api.get_project", e))?;
    Ok(Json(project))
}

pub async fn update_project(
    State(state): State<AppState>,
    Path(project): Path<String>,
    Json(patch): Json<ProjectPatch>,
) -> Result<Json<Project>, ApiError> {
    check_segments("markban.api.update_project", &[&project])?;
    let updated = state
        .store
        .update_project(&project, patch)
        .await
        .map_err(|e| storage_error("markban.api.update_project", e))?;
    state
        .publish(
            &project,
            BoardEvent::ProjectUpdated {
                project: updated.clone(),
            },
        )
        .await;
    Ok(Json(updated))
}

/// DELETE /projects/{project} archives; `?permanent=true` removes it from disk.
pub async fn delete_project(
    State(state): State<AppState>,
    Path(project): Path<String>,
    Query(query): Query<DeleteProjectQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    check_segments("markban.api.delete_project", &[&project])?;
    if query.permanent {
        state
            .store
            .delete_project_permanently(&project)
            .await
            .map_err(|e| storage_error("markban.api.delete_project", e))?;
        return Ok(Json(serde_json::json!({ "success": true, "deleted": project })));
    }

    let archived = state
        .store
        .archive_project(&project)
        .await
        .map_err(|e| storage_error("markban.api.delete_project", e))?;
    state
        .publish(
            &project,
            BoardEvent::ProjectUpdated {
                project: archived.clone(),
            },
        )
        .await;
    Ok(Json(serde_json::json!({ "success": true, "project": archived })))
}
