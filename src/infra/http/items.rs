use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use crate::application::{
    error::HttpError,
    items::{CreateItemCommand, ItemFilter, UpdateItemCommand},
};

use super::HttpState;

pub(super) async fn list(
    State(state): State<HttpState>,
    Query(filter): Query<ItemFilter>,
) -> impl IntoResponse {
    Json(state.items.list(&filter))
}

/// `POST` to the query endpoint: same filter, carried in the body.
pub(super) async fn query(
    State(state): State<HttpState>,
    Json(filter): Json<ItemFilter>,
) -> impl IntoResponse {
    Json(state.items.list(&filter))
}

pub(super) async fn show(
    State(state): State<HttpState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpError> {
    let item = state.items.get(id)?;
    Ok(Json(item))
}

pub(super) async fn create(
    State(state): State<HttpState>,
    Json(command): Json<CreateItemCommand>,
) -> Result<impl IntoResponse, HttpError> {
    let item = state.items.create(command).await?;
    Ok((StatusCode::CREATED, Json(item)))
}

pub(super) async fn update(
    State(state): State<HttpState>,
    Path(id): Path<Uuid>,
    Json(command): Json<UpdateItemCommand>,
) -> Result<impl IntoResponse, HttpError> {
    let item = state.items.update(id, command).await?;
    Ok(Json(item))
}

pub(super) async fn remove(
    State(state): State<HttpState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpError> {
    state.items.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
