use axum::{Json, extract::State, response::IntoResponse};
use serde_json::Value;

use crate::application::error::HttpError;

use super::HttpState;

pub(super) async fn show(State(state): State<HttpState>) -> impl IntoResponse {
    Json(state.settings.get().await)
}

pub(super) async fn update(
    State(state): State<HttpState>,
    Json(patch): Json<Value>,
) -> Result<impl IntoResponse, HttpError> {
    let document = state.settings.patch(patch).await?;
    Ok(Json(document))
}
