//! Response cache middleware.
//!
//! Serves fresh entries for read requests and writes successful responses
//! back after a miss. Every failure inside the cache degrades to running the
//! handler; the request itself never fails because of the cache.

use std::time::Duration;

use axum::{
    body::{Body, Bytes, HttpBody},
    extract::State,
    http::{
        HeaderMap, HeaderName, HeaderValue, Request, StatusCode,
        header::{CACHE_CONTROL, CONTENT_TYPE, SET_COOKIE, VARY},
    },
    middleware::Next,
    response::{IntoResponse, Response},
};
use http_body_util::BodyExt;
use metrics::counter;
use tracing::{debug, instrument, warn};

use super::{
    config::CacheConfig,
    keys::{CallerIdentity, RequestFingerprint, derive_key},
    policy::skip_reason,
    store::{CachedResponse, Lookup, ResponseCache},
};

const METRIC_HIT: &str = "quire_cache_hit_total";
const METRIC_MISS: &str = "quire_cache_miss_total";
const METRIC_SKIP: &str = "quire_cache_skip_total";
const METRIC_FILL: &str = "quire_cache_fill_total";

const VARY_VALUE: &str = "Origin, Cache-Control";

/// Shared cache state for middleware.
#[derive(Clone)]
pub struct CacheState {
    pub config: CacheConfig,
    pub cache: ResponseCache,
}

impl CacheState {
    pub fn new(config: CacheConfig, cache: ResponseCache) -> Self {
        Self { config, cache }
    }

    fn mark(&self, response: &mut Response, status: &'static str) {
        let Some(name) = self.config.status_header.as_deref() else {
            return;
        };
        if let Ok(name) = HeaderName::from_bytes(name.as_bytes()) {
            response
                .headers_mut()
                .insert(name, HeaderValue::from_static(status));
        }
    }
}

/// Middleware for response caching.
///
/// Reads (`GET`, `HEAD`, and `POST` to the query endpoint) are looked up by
/// derived key. Only `200 OK` responses without cookies are written back.
#[instrument(skip_all, fields(method = %request.method(), path = %request.uri().path()))]
pub async fn response_cache_layer(
    State(state): State<CacheState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if let Some(reason) = skip_reason(&request, &state.config, state.cache.is_available()) {
        counter!(METRIC_SKIP, "reason" => reason.as_str()).increment(1);
        debug!(
            cache = "response",
            outcome = "skip",
            reason = reason.as_str(),
            "bypassing cache"
        );
        let mut response = next.run(request).await;
        state.mark(&mut response, "MISS");
        return response;
    }

    let (request, fingerprint) = match fingerprint(request, &state.config).await {
        Ok(Fingerprint::Keyed(request, fingerprint)) => (request, fingerprint),
        Ok(Fingerprint::Unkeyed(request)) => {
            counter!(METRIC_SKIP, "reason" => "unbounded_body").increment(1);
            let mut response = next.run(request).await;
            state.mark(&mut response, "MISS");
            return response;
        }
        Err(response) => return response,
    };

    let key = derive_key(state.cache.namespace(), &fingerprint);
    let personalized = fingerprint.is_personalized();

    match state.cache.lookup(&key).await {
        Lookup::Hit {
            response: cached,
            remaining,
        } => {
            counter!(METRIC_HIT).increment(1);
            debug!(
                cache = "response",
                outcome = "hit",
                cache_key = %key,
                remaining_secs = remaining.as_secs(),
                "serving cached response"
            );
            let mut response = build_response(cached, personalized, remaining);
            state.mark(&mut response, "HIT");
            return response;
        }
        Lookup::Miss(reason) => {
            counter!(METRIC_MISS).increment(1);
            debug!(
                cache = "response",
                outcome = "miss",
                reason = reason.as_str(),
                cache_key = %key,
                "cache miss, executing handler"
            );
        }
    }

    let response = next.run(request).await;
    let mut response = write_back(&state, &key, personalized, response).await;
    state.mark(&mut response, "MISS");
    response
}

enum Fingerprint {
    Keyed(Request<Body>, RequestFingerprint),
    /// Query endpoint body too large or of unknown length to buffer.
    Unkeyed(Request<Body>),
}

async fn fingerprint(
    request: Request<Body>,
    config: &CacheConfig,
) -> Result<Fingerprint, Response> {
    let base = RequestFingerprint::from_parts(
        request.method(),
        request.uri().path(),
        request.uri().query(),
        request.headers(),
        request.extensions().get::<CallerIdentity>(),
    );

    if !config.is_query_endpoint(request.uri().path()) {
        return Ok(Fingerprint::Keyed(request, base));
    }

    let limit = config.value_max_bytes;
    let bounded = request
        .body()
        .size_hint()
        .upper()
        .is_some_and(|upper| upper <= limit as u64);
    if !bounded {
        debug!(limit, "query body has no bounded length; bypassing cache");
        return Ok(Fingerprint::Unkeyed(request));
    }

    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, limit).await.map_err(|err| {
        warn!(error = %err, "failed to read query body");
        StatusCode::BAD_REQUEST.into_response()
    })?;

    let fingerprint = base.with_body(&bytes);
    Ok(Fingerprint::Keyed(
        Request::from_parts(parts, Body::from(bytes)),
        fingerprint,
    ))
}

async fn write_back(
    state: &CacheState,
    key: &str,
    personalized: bool,
    response: Response,
) -> Response {
    let limit = state.config.value_max_bytes;
    if state.config.ttl.is_zero()
        || !should_store_response(&response)
        || response.body().size_hint().lower() > limit as u64
    {
        return response;
    }

    let (mut parts, body) = response.into_parts();
    let bytes = match BodyExt::collect(body).await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            warn!(cache_key = %key, error = %err, "response body failed; not caching");
            // Keep the handler's status and surface the failure on the body.
            let failed = futures::stream::once(async move { Err::<Bytes, _>(err) });
            return Response::from_parts(parts, Body::from_stream(failed));
        }
    };

    if bytes.len() > limit {
        debug!(cache_key = %key, size = bytes.len(), limit, "response too large to cache");
        return Response::from_parts(parts, Body::from(bytes));
    }

    let cached = CachedResponse {
        status: parts.status.as_u16(),
        content_type: parts
            .headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string),
        body: bytes.clone(),
    };

    if state
        .cache
        .fill(key, &cached, state.config.ttl)
        .await
        .is_ok()
    {
        counter!(METRIC_FILL).increment(1);
        debug!(cache = "response", cache_key = %key, "caching response");
        if !parts.headers.contains_key(CACHE_CONTROL) {
            apply_cache_headers(&mut parts.headers, personalized, state.config.ttl);
        }
    }

    Response::from_parts(parts, Body::from(bytes))
}

/// Whether a handler response may be written back.
pub fn should_store_response(response: &Response) -> bool {
    if response.status() != StatusCode::OK {
        return false;
    }

    let headers = response.headers();
    if headers.contains_key(SET_COOKIE) {
        return false;
    }

    if headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("text/event-stream"))
    {
        return false;
    }

    !headers
        .get_all(CACHE_CONTROL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|directive| directive.trim().to_ascii_lowercase())
        .any(|directive| matches!(directive.as_str(), "no-store" | "no-cache" | "private"))
}

/// `Cache-Control` value advertising `remaining` freshness.
pub fn cache_control_value(personalized: bool, remaining: Duration) -> String {
    let secs = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
    if personalized {
        format!("private, max-age={secs}")
    } else {
        format!("public, max-age={secs}, s-maxage={secs}")
    }
}

fn apply_cache_headers(headers: &mut HeaderMap, personalized: bool, remaining: Duration) {
    if let Ok(value) = HeaderValue::from_str(&cache_control_value(personalized, remaining)) {
        headers.insert(CACHE_CONTROL, value);
    }
    headers.insert(VARY, HeaderValue::from_static(VARY_VALUE));
}

/// Build a response from cached data.
fn build_response(cached: CachedResponse, personalized: bool, remaining: Duration) -> Response {
    let status = StatusCode::from_u16(cached.status).unwrap_or(StatusCode::OK);
    let mut response = Response::new(Body::from(cached.body));
    *response.status_mut() = status;

    let headers = response.headers_mut();
    if let Some(value) = cached
        .content_type
        .as_deref()
        .and_then(|value| HeaderValue::from_str(value).ok())
    {
        headers.insert(CONTENT_TYPE, value);
    }
    apply_cache_headers(headers, personalized, remaining);

    response
}
