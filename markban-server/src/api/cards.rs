use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use markban_core::events::BoardEvent;
use markban_core::types::{parse_timestamp, Card, CardPatch, ListFilter, NewCard};
use serde::Deserialize;

use super::{api_error, check_segments, storage_error, ApiError};
use crate::state::AppState;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListCardsQuery {
    lane: Option<String>,
    since: Option<String>,
    stale_days: Option<u32>,
}

#[derive(Deserialize)]
pub struct MoveCardBody {
    lane: String,
    #[serde(default)]
    position: Option<usize>,
}

#[derive(Deserialize)]
pub struct AddTaskBody {
    text: String,
}

#[derive(Deserialize)]
pub struct ToggleTaskBody {
    #[serde(default)]
    checked: Option<bool>,
}

#[derive(Deserialize)]
pub struct ReorderBody {
    order: Vec<String>,
}

pub async fn list_cards(
    State(state): State<AppState>,
    Path(project): Path<String>,
    Query(query): Query<ListCardsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    const TARGET: &str = "markban.api.list_cards";
    check_segments(TARGET, &[&project])?;
    let since = match query.since.as_deref() {
        Some(raw) => Some(parse_timestamp(raw).ok_or_else(|| {
            api_error(
                StatusCode::BAD_REQUEST,
                TARGET,
                format!("Invalid since timestamp: {}", raw),
            )
        })?),
        None => None,
    };
    let filter = ListFilter {
        lane: query.lane,
        since,
        stale_days: query.stale_days,
    };
    let cards = state
        .store
        .list_cards(&project, &filter)
        .await
        .map_err(|e| storage_error(TARGET, e))?;
    Ok(Json(serde_json::json!({ "cards": cards })))
}

pub async fn create_card(
    State(state): State<AppState>,
    Path(project): Path<String>,
    Json(body): Json<NewCard>,
) -> Result<(StatusCode, Json<Card>), ApiError> {
    check_segments("markban.api.create_card", &[&project])?;
    let card = state
        .store
        .create_card(&project, body)
        .await
        .map_err(|e| storage_error("markban.api.create_card", e))?;
    state
        .publish(&project, BoardEvent::CardCreated { card: card.summary() })
        .await;
    Ok((StatusCode::CREATED, Json(card)))
}

pub async fn get_card(
    State(state): State<AppState>,
    Path((project, slug)): Path<(String, String)>,
) -> Result<Json<Card>, ApiError> {
    check_segments("markban.api.get_card", &[&project, &slug])?;
    let card = state
        .store
        .get_card(&project, &slug)
        .await
        .map_err(|e| storage_error("markban.api.get_card", e))?;
    Ok(Json(card))
}

pub async fn update_card(
    State(state): State<AppState>,
    Path((project, slug)): Path<(String, String)>,
    Json(patch): Json<CardPatch>,
) -> Result<Json<Card>, ApiError> {
    check_segments("markban.api.update_card", &[&project, &slug])?;
    let card = state
        .store
        .update_card(&project, &slug, patch)
        .await
        .map_err(|e| storage_error("markban.api.update_card", e))?;
    state
        .publish(&project, BoardEvent::CardUpdated { card: card.summary() })
        .await;
    Ok(Json(card))
}

pub async fn delete_card(
    State(state): State<AppState>,
    Path((project, slug)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    check_segments("markban.api.delete_card", &[&project, &slug])?;
    let lane = state
        .store
        .delete_card(&project, &slug)
        .await
        .map_err(|e| storage_error("markban.api.delete_card", e))?;
    state
        .publish(
            &project,
            BoardEvent::CardDeleted {
                slug: slug.clone(),
                lane,
            },
        )
        .await;
    Ok(Json(serde_json::json!({ "success": true })))
}

pub async fn move_card(
    State(state): State<AppState>,
    Path((project, slug)): Path<(String, String)>,
    Json(body): Json<MoveCardBody>,
) -> Result<Json<Card>, ApiError> {
    check_segments("markban.api.move_card", &[&project, &slug, &body.lane])?;
    let (card, from_lane) = state
        .store
        .move_card(&project, &slug, &body.lane, body.position)
        .await
        .map_err(|e| storage_error("markban.api.move_card", e))?;
    publish_move(&state, &project, &card, from_lane, body.position).await;
    Ok(Json(card))
}

pub async fn archive_card(
    State(state): State<AppState>,
    Path((project, slug)): Path<(String, String)>,
) -> Result<Json<Card>, ApiError> {
    check_segments("markban.api.archive_card", &[&project, &slug])?;
    let (card, from_lane) = state
        .store
        .archive_card(&project, &slug)
        .await
        .map_err(|e| storage_error("markban.api.archive_card", e))?;
    publish_move(&state, &project, &card, from_lane, None).await;
    Ok(Json(card))
}

async fn publish_move(
    state: &AppState,
    project: &str,
    card: &Card,
    from_lane: String,
    position: Option<usize>,
) {
    state
        .publish(
            project,
            BoardEvent::CardMoved {
                slug: card.slug.clone(),
                from_lane,
                to_lane: card.lane.clone(),
                position,
                card: Some(card.summary()),
            },
        )
        .await;
}

pub async fn add_task(
    State(state): State<AppState>,
    Path((project, slug)): Path<(String, String)>,
    Json(body): Json<AddTaskBody>,
) -> Result<(StatusCode, Json<Card>), ApiError> {
    check_segments("markban.api.add_task", &[&project, &slug])?;
    let (card, index) = state
        .store
        .add_task(&project, &slug, &body.text)
        .await
        .map_err(|e| storage_error("markban.api.add_task", e))?;
    state
        .publish(
            &project,
            BoardEvent::TaskAdded {
                slug: slug.clone(),
                index,
                text: body.text.trim().to_string(),
                card: card.summary(),
            },
        )
        .await;
    Ok((StatusCode::CREATED, Json(card)))
}

/// PATCH .../tasks/{index} -- `{"checked": bool}` sets, `{}` flips.
pub async fn toggle_task(
    State(state): State<AppState>,
    Path((project, slug, index)): Path<(String, String, usize)>,
    Json(body): Json<ToggleTaskBody>,
) -> Result<Json<Card>, ApiError> {
    check_segments("markban.api.toggle_task", &[&project, &slug])?;
    let card = state
        .store
        .toggle_task(&project, &slug, index, body.checked)
        .await
        .map_err(|e| storage_error("markban.api.toggle_task", e))?;
    let checked = card.tasks.get(index).is_some_and(|t| t.checked);
    state
        .publish(
            &project,
            BoardEvent::TaskToggled {
                slug: slug.clone(),
                index,
                checked,
                card: card.summary(),
            },
        )
        .await;
    Ok(Json(card))
}

pub async fn reorder_lane(
    State(state): State<AppState>,
    Path((project, lane)): Path<(String, String)>,
    Json(body): Json<ReorderBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    check_segments("markban.api.reorder_lane", &[&project, &lane])?;
    let order = state
        .store
        .reorder_cards(&project, &lane, &body.order)
        .await
        .map_err(|e| storage_error("markban.api.reorder_lane", e))?;
    state
        .publish(
            &project,
            BoardEvent::LaneReordered {
                lane: lane.clone(),
                order: order.clone(),
            },
        )
        .await;
    Ok(Json(serde_json::json!({ "lane": lane, "order": order })))
}
