use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use bytes::Bytes;
use metrics_util::debugging::{DebuggingRecorder, Snapshotter};
use quire::{
    application::{items::ItemService, settings::SettingsService},
    cache::{
        CacheConfig, CacheConsumer, CacheState, CacheStore, CacheTrigger, ManualClock,
        MemoryStore, ResponseCache, StoreError,
    },
    infra::{
        http::{HttpState, build_router},
        telemetry,
    },
    messenger::{
        BusError, InvalidationBus, InvalidationMessage, LocalBus, MessageHandler, Subscription,
    },
};
use tower::ServiceExt;

struct DownStore;

#[async_trait]
impl CacheStore for DownStore {
    fn name(&self) -> &'static str {
        "down"
    }

    async fn get(&self, _: &str) -> Result<Option<Bytes>, StoreError> {
        Err(StoreError::unavailable("down"))
    }

    async fn set(&self, _: &str, _: Bytes, _: i64, _: Duration) -> Result<(), StoreError> {
        Err(StoreError::unavailable("down"))
    }

    async fn delete(&self, _: &str) -> Result<(), StoreError> {
        Err(StoreError::unavailable("down"))
    }

    async fn delete_prefix(&self, _: &str) -> Result<u64, StoreError> {
        Err(StoreError::unavailable("down"))
    }

    async fn clear(&self) -> Result<(), StoreError> {
        Err(StoreError::unavailable("down"))
    }
}

struct DownBus;

#[async_trait]
impl InvalidationBus for DownBus {
    fn name(&self) -> &'static str {
        "down"
    }

    async fn publish(&self, _: &str, _: &InvalidationMessage) -> Result<(), BusError> {
        Err(BusError::Unavailable("down".to_string()))
    }

    async fn subscribe(
        &self,
        pattern: &str,
        _: Arc<dyn MessageHandler>,
    ) -> Result<Subscription, BusError> {
        Err(BusError::Subscribe {
            pattern: pattern.to_string(),
            reason: "down".to_string(),
        })
    }
}

fn app(store: Arc<dyn CacheStore>, bus: Arc<dyn InvalidationBus>) -> (Router, ResponseCache) {
    let config = CacheConfig::default();
    let cache = ResponseCache::new(
        store,
        Arc::new(ManualClock::default()),
        config.namespace.clone(),
    );
    let trigger = CacheTrigger::new(config.clone(), cache.clone(), bus, "quire");
    let state = HttpState {
        items: ItemService::new().with_cache_trigger(trigger.clone()),
        settings: SettingsService::default(),
        cache: CacheState::new(config, cache.clone()),
        trigger,
    };
    (build_router(state), cache)
}

async fn send(app: &Router, request: Request<Body>) -> StatusCode {
    app.clone()
        .oneshot(request)
        .await
        .expect("router should respond")
        .status()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .body(Body::empty())
        .expect("request should build")
}

fn create(name: &str) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri("/items")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(format!(r#"{{"name":"{name}"}}"#)))
        .expect("request should build")
}

fn recorded(snapshotter: &Snapshotter) -> HashSet<String> {
    snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect()
}

#[tokio::test]
async fn cache_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");
    telemetry::describe_metrics();

    // Hit, miss, fill, skip and invalidation through a healthy stack.
    let bus = Arc::new(LocalBus::new());
    let (healthy, cache) = app(
        Arc::new(MemoryStore::new(&CacheConfig::default())),
        bus.clone(),
    );
    let consumer = Arc::new(CacheConsumer::new(cache, bus, "quire"));
    let subscription = consumer.start().await.expect("consumer should subscribe");

    assert_eq!(send(&healthy, get("/items")).await, StatusCode::OK);
    assert_eq!(send(&healthy, get("/items")).await, StatusCode::OK);
    assert_eq!(send(&healthy, create("pear")).await, StatusCode::CREATED);

    // Store errors and publish errors through a broken one.
    let (broken, _) = app(Arc::new(DownStore), Arc::new(DownBus));
    assert_eq!(send(&broken, get("/items")).await, StatusCode::OK);
    assert_eq!(send(&broken, create("pear")).await, StatusCode::CREATED);

    let expected = [
        "quire_cache_hit_total",
        "quire_cache_miss_total",
        "quire_cache_skip_total",
        "quire_cache_fill_total",
        "quire_cache_lookup_ms",
        "quire_cache_store_error_total",
        "quire_cache_invalidation_total",
        "quire_bus_publish_error_total",
    ];

    // The consumer applies the published invalidation on its own task.
    let mut names = recorded(&snapshotter);
    for _ in 0..100 {
        if expected.iter().all(|metric| names.contains(*metric)) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        names = recorded(&snapshotter);
    }
    subscription.abort();

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}
