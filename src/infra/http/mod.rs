//! Router assembly for the demo content API.

mod items;
mod middleware;
mod settings;

pub use middleware::{RequestContext, log_responses, set_request_context};

use axum::{
    Json, Router,
    extract::State,
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
};
use serde_json::{Value, json};

use crate::{
    application::{items::ItemService, settings::SettingsService},
    cache::{CacheState, CacheTrigger, invalidate_on_write, response_cache_layer},
};

#[derive(Clone)]
pub struct HttpState {
    pub items: ItemService,
    pub settings: SettingsService,
    pub cache: CacheState,
    pub trigger: CacheTrigger,
}

/// Build the public router.
///
/// `/health` sits outside the cache gate. Item handlers call the mutation
/// hook themselves; `/settings` relies on `invalidate_on_write`.
pub fn build_router(state: HttpState) -> Router {
    let settings_routes = Router::new()
        .route("/settings", get(settings::show).patch(settings::update))
        .route_layer(from_fn_with_state(
            state.trigger.clone(),
            invalidate_on_write,
        ));

    let mut cached = Router::new()
        .route("/items", get(items::list).post(items::create))
        .route(
            "/items/{id}",
            get(items::show).put(items::update).delete(items::remove),
        )
        .merge(settings_routes);

    let query_endpoint = state.cache.config.query_endpoint.clone();
    if !query_endpoint.is_empty() {
        cached = cached.route(&query_endpoint, post(items::query));
    }

    let cached = cached.layer(from_fn_with_state(
        state.cache.clone(),
        response_cache_layer,
    ));

    Router::new()
        .route("/health", get(health))
        .merge(cached)
        .layer(from_fn(log_responses))
        .layer(from_fn(set_request_context))
        .with_state(state)
}

async fn health(State(state): State<HttpState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "cache": {
            "enabled": state.cache.config.enabled,
            "store_available": state.cache.cache.is_available(),
        },
    }))
}
