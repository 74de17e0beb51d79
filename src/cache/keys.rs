//! Cache key derivation.
//!
//! A key is a pure function of the request's method, exact path, sorted
//! query string, caller identity and (for the query endpoint only) body digest.
//! Keys are namespaced by topic so that a whole resource family can be
//! evicted with a single prefix delete.

use axum::http::{HeaderMap, Method, header::AUTHORIZATION};
use sha2::{Digest, Sha256};

/// Reserved suffix for expiry records. No derived payload key ends with it.
pub const EXPIRY_SUFFIX: &str = "__expires_at";

/// Topic used for requests to `/`.
pub const ROOT_TOPIC: &str = "_root";

const PUBLIC_IDENTITY: &str = "public";

/// Caller identity attached to the request by upstream authentication.
///
/// Responses for requests carrying an identity are keyed per caller and
/// served with `Cache-Control: private`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallerIdentity(pub String);

impl CallerIdentity {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }
}

/// Everything the key depends on, extracted from a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFingerprint {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub identity: Option<String>,
    pub body_digest: Option<String>,
}

impl RequestFingerprint {
    /// Build a fingerprint from request parts.
    ///
    /// The identity comes from the `CallerIdentity` extension when present,
    /// otherwise from a digest of the `Authorization` header.
    pub fn from_parts(
        method: &Method,
        path: &str,
        query: Option<&str>,
        headers: &HeaderMap,
        identity: Option<&CallerIdentity>,
    ) -> Self {
        let identity = identity.map(|id| id.0.clone()).or_else(|| {
            headers
                .get(AUTHORIZATION)
                .map(|value| format!("auth:{}", digest_hex(value.as_bytes())))
        });

        Self {
            method: method.clone(),
            path: path.to_string(),
            query: query.map(str::to_string),
            identity,
            body_digest: None,
        }
    }

    /// Include a request body in the fingerprint (query endpoint only).
    pub fn with_body(mut self, body: &[u8]) -> Self {
        self.body_digest = Some(digest_hex(body));
        self
    }

    /// True when the response may differ per caller.
    pub fn is_personalized(&self) -> bool {
        self.identity.is_some()
    }

    fn canonical(&self) -> String {
        let method = if self.method == Method::HEAD {
            Method::GET.as_str()
        } else {
            self.method.as_str()
        };

        format!(
            "{}\n{}\n{}\n{}\n{}",
            method.to_ascii_uppercase(),
            self.path,
            canonical_query(self.query.as_deref().unwrap_or("")),
            self.identity.as_deref().unwrap_or(PUBLIC_IDENTITY),
            self.body_digest.as_deref().unwrap_or(""),
        )
    }
}

/// Derive the namespaced cache key for a fingerprint.
pub fn derive_key(namespace: &str, fingerprint: &RequestFingerprint) -> String {
    let topic = topic_for_path(&fingerprint.path);
    let digest = digest_hex(fingerprint.canonical().as_bytes());
    format!("{namespace}{topic}:{digest}")
}

/// Key prefix shared by every entry of a topic.
pub fn topic_prefix(namespace: &str, topic: &str) -> String {
    format!("{namespace}{topic}:")
}

/// Key of the expiry record paired with `key`.
pub fn expiry_key(key: &str) -> String {
    format!("{key}{EXPIRY_SUFFIX}")
}

/// Whether `key` lives in the reserved expiry-record space.
pub fn is_expiry_key(key: &str) -> bool {
    key.ends_with(EXPIRY_SUFFIX)
}

/// Resource family of a path: its first non-empty segment.
pub fn topic_for_path(path: &str) -> &str {
    path.split('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or(ROOT_TOPIC)
}

/// Sort query pairs by name, then value. Empty pairs are dropped.
pub fn canonical_query(query: &str) -> String {
    let mut pairs: Vec<(&str, &str)> = query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| pair.split_once('=').unwrap_or((pair, "")))
        .collect();
    pairs.sort_unstable();

    pairs
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join("&")
}

fn digest_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    const NS: &str = "quire:response:";

    fn fingerprint(path: &str, query: Option<&str>) -> RequestFingerprint {
        RequestFingerprint::from_parts(&Method::GET, path, query, &HeaderMap::new(), None)
    }

    #[test]
    fn query_order_does_not_matter() {
        let a = derive_key(NS, &fingerprint("/items", Some("a=1&b=2")));
        let b = derive_key(NS, &fingerprint("/items", Some("b=2&a=1")));
        assert_eq!(a, b);
    }

    #[test]
    fn different_query_values_differ() {
        let a = derive_key(NS, &fingerprint("/items", Some("sort=name")));
        let b = derive_key(NS, &fingerprint("/items", Some("sort=date")));
        assert_ne!(a, b);
    }

    #[test]
    fn repeated_parameters_are_sorted_by_value() {
        assert_eq!(canonical_query("tag=b&tag=a"), canonical_query("tag=a&tag=b"));
        assert_eq!(canonical_query("&a=1&&"), "a=1");
    }

    #[test]
    fn identity_participates_in_key() {
        let alice = CallerIdentity::new("alice");
        let bob = CallerIdentity::new("bob");
        let headers = HeaderMap::new();

        let a = RequestFingerprint::from_parts(&Method::GET, "/items", None, &headers, Some(&alice));
        let b = RequestFingerprint::from_parts(&Method::GET, "/items", None, &headers, Some(&bob));
        let again =
            RequestFingerprint::from_parts(&Method::GET, "/items", None, &headers, Some(&alice));

        assert_ne!(derive_key(NS, &a), derive_key(NS, &b));
        assert_eq!(derive_key(NS, &a), derive_key(NS, &again));
        assert_ne!(derive_key(NS, &a), derive_key(NS, &fingerprint("/items", None)));
    }

    #[test]
    fn authorization_header_is_digested_not_copied() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer secret-token"));

        let fp = RequestFingerprint::from_parts(&Method::GET, "/items", None, &headers, None);
        let identity = fp.identity.clone().expect("identity from header");

        assert!(fp.is_personalized());
        assert!(!identity.contains("secret-token"));
        assert!(!derive_key(NS, &fp).contains("secret-token"));
    }

    #[test]
    fn head_and_get_share_a_key() {
        let get = fingerprint("/items", None);
        let head =
            RequestFingerprint::from_parts(&Method::HEAD, "/items", None, &HeaderMap::new(), None);
        assert_eq!(derive_key(NS, &get), derive_key(NS, &head));
    }

    #[test]
    fn body_digest_changes_key() {
        let base = RequestFingerprint::from_parts(
            &Method::POST,
            "/query",
            None,
            &HeaderMap::new(),
            None,
        );
        let a = derive_key(NS, &base.clone().with_body(br#"{"search":"a"}"#));
        let b = derive_key(NS, &base.with_body(br#"{"search":"b"}"#));
        assert_ne!(a, b);
    }

    #[test]
    fn paths_are_keyed_as_routed() {
        let items = derive_key(NS, &fingerprint("/items", None));
        assert_ne!(items, derive_key(NS, &fingerprint("/items/", None)));
        assert_ne!(items, derive_key(NS, &fingerprint("//items", None)));
        assert_eq!(items, derive_key(NS, &fingerprint("/items", None)));
    }

    #[test]
    fn keys_are_namespaced_by_topic() {
        let key = derive_key(NS, &fingerprint("/items/5", Some("fields=name")));
        assert!(key.starts_with(&topic_prefix(NS, "items")));
        assert!(!is_expiry_key(&key));

        let root = derive_key(NS, &fingerprint("/", None));
        assert!(root.starts_with(&topic_prefix(NS, ROOT_TOPIC)));
    }

    #[test]
    fn expiry_keys_use_reserved_suffix() {
        let key = derive_key(NS, &fingerprint("/items", None));
        let expiry = expiry_key(&key);
        assert!(is_expiry_key(&expiry));
        assert!(expiry.starts_with(&key));
    }
}
