//! Decides, before any store I/O, whether a request bypasses the cache.

use axum::http::{
    HeaderMap, Method, Request,
    header::{CACHE_CONTROL, PRAGMA},
};

use super::config::CacheConfig;

/// Request extension set by upstream middleware to force a bypass.
#[derive(Debug, Clone, Copy, Default)]
pub struct BypassCache;

/// Why a request bypassed the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Caching is administratively disabled.
    Disabled,
    /// The store reported itself unavailable.
    StoreUnavailable,
    /// The request mutates state.
    Mutating,
    /// The client asked for a fresh response.
    ClientBypass,
    /// Upstream middleware attached `BypassCache`.
    Internal,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::StoreUnavailable => "store_unavailable",
            Self::Mutating => "mutating",
            Self::ClientBypass => "client_bypass",
            Self::Internal => "internal",
        }
    }
}

/// First reason `request` must bypass the cache, if any.
pub fn skip_reason<B>(
    request: &Request<B>,
    config: &CacheConfig,
    store_available: bool,
) -> Option<SkipReason> {
    if !config.enabled {
        return Some(SkipReason::Disabled);
    }
    if !store_available {
        return Some(SkipReason::StoreUnavailable);
    }
    if !is_read(request.method(), request.uri().path(), config) {
        return Some(SkipReason::Mutating);
    }
    if config.skip_allowed && client_requests_bypass(request.headers()) {
        return Some(SkipReason::ClientBypass);
    }
    if request.extensions().get::<BypassCache>().is_some() {
        return Some(SkipReason::Internal);
    }
    None
}

/// Whether `request` must bypass the cache.
pub fn should_skip<B>(request: &Request<B>, config: &CacheConfig, store_available: bool) -> bool {
    skip_reason(request, config, store_available).is_some()
}

/// Read-only verbs, plus `POST` to the designated query endpoint.
pub fn is_read(method: &Method, path: &str, config: &CacheConfig) -> bool {
    *method == Method::GET
        || *method == Method::HEAD
        || (*method == Method::POST && config.is_query_endpoint(path))
}

/// `Cache-Control: no-cache|no-store` or `Pragma: no-cache`.
pub fn client_requests_bypass(headers: &HeaderMap) -> bool {
    let cache_control = headers
        .get_all(CACHE_CONTROL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|directive| directive.trim().to_ascii_lowercase())
        .any(|directive| directive == "no-cache" || directive == "no-store");

    let pragma = headers
        .get(PRAGMA)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.trim().eq_ignore_ascii_case("no-cache"));

    cache_control || pragma
}

#[cfg(test)]
mod tests {
    use axum::body::Body;

    use super::*;

    fn request(method: Method, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .expect("request should build")
    }

    #[test]
    fn plain_get_is_cacheable() {
        let config = CacheConfig::default();
        assert_eq!(skip_reason(&request(Method::GET, "/items"), &config, true), None);
        assert!(!should_skip(&request(Method::HEAD, "/items"), &config, true));
    }

    #[test]
    fn disabled_cache_skips_everything() {
        let config = CacheConfig {
            enabled: false,
            ..Default::default()
        };
        assert_eq!(
            skip_reason(&request(Method::GET, "/items"), &config, true),
            Some(SkipReason::Disabled)
        );
    }

    #[test]
    fn unavailable_store_skips() {
        let config = CacheConfig::default();
        assert_eq!(
            skip_reason(&request(Method::GET, "/items"), &config, false),
            Some(SkipReason::StoreUnavailable)
        );
    }

    #[test]
    fn mutating_verbs_skip() {
        let config = CacheConfig::default();
        for method in [Method::POST, Method::PUT, Method::PATCH, Method::DELETE] {
            assert_eq!(
                skip_reason(&request(method, "/items"), &config, true),
                Some(SkipReason::Mutating)
            );
        }
    }

    #[test]
    fn query_endpoint_post_is_a_read() {
        let config = CacheConfig::default();
        assert_eq!(skip_reason(&request(Method::POST, "/query"), &config, true), None);
        assert_eq!(
            skip_reason(&request(Method::PUT, "/query"), &config, true),
            Some(SkipReason::Mutating)
        );
    }

    #[test]
    fn client_cache_control_forces_bypass() {
        let config = CacheConfig::default();
        for value in ["no-cache", "max-age=0, No-Store", "no-cache, private"] {
            let mut req = request(Method::GET, "/items");
            req.headers_mut()
                .insert(CACHE_CONTROL, value.parse().expect("header value"));
            assert_eq!(
                skip_reason(&req, &config, true),
                Some(SkipReason::ClientBypass),
                "{value}"
            );
        }

        let mut pragma = request(Method::GET, "/items");
        pragma
            .headers_mut()
            .insert(PRAGMA, "no-cache".parse().expect("header value"));
        assert!(should_skip(&pragma, &config, true));
    }

    #[test]
    fn client_bypass_ignored_when_not_allowed() {
        let config = CacheConfig {
            skip_allowed: false,
            ..Default::default()
        };
        let mut req = request(Method::GET, "/items");
        req.headers_mut()
            .insert(CACHE_CONTROL, "no-store".parse().expect("header value"));
        assert_eq!(skip_reason(&req, &config, true), None);
    }

    #[test]
    fn unrelated_cache_control_does_not_bypass() {
        let config = CacheConfig::default();
        let mut req = request(Method::GET, "/items");
        req.headers_mut()
            .insert(CACHE_CONTROL, "max-age=60".parse().expect("header value"));
        assert_eq!(skip_reason(&req, &config, true), None);
    }

    #[test]
    fn internal_flag_forces_bypass() {
        let config = CacheConfig::default();
        let mut req = request(Method::GET, "/items");
        req.extensions_mut().insert(BypassCache);
        assert_eq!(skip_reason(&req, &config, true), Some(SkipReason::Internal));
    }
}
