//! Two "processes" with private memory stores kept coherent over one bus.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use quire::{
    application::{items::ItemService, settings::SettingsService},
    cache::{
        CacheConfig, CacheConsumer, CacheState, CacheTrigger, ManualClock, MemoryStore,
        ResponseCache,
    },
    infra::http::{HttpState, build_router},
    messenger::{InvalidationBus, InvalidationMessage, LocalBus, Subscription, channel_for},
};
use tower::ServiceExt;

struct Process {
    app: Router,
    subscription: Subscription,
}

impl Drop for Process {
    fn drop(&mut self) {
        self.subscription.abort();
    }
}

async fn spawn_process(bus: Arc<LocalBus>, items: ItemService) -> Process {
    let config = CacheConfig::default();
    let store = Arc::new(MemoryStore::new(&config));
    let cache = ResponseCache::new(
        store,
        Arc::new(ManualClock::default()),
        config.namespace.clone(),
    );
    let bus: Arc<dyn InvalidationBus> = bus;
    let trigger = CacheTrigger::new(config.clone(), cache.clone(), Arc::clone(&bus), "quire");
    let consumer = Arc::new(CacheConsumer::new(cache.clone(), bus, "quire"));
    let subscription = consumer.start().await.expect("consumer should subscribe");

    let state = HttpState {
        items: items.with_cache_trigger(trigger.clone()),
        settings: SettingsService::default(),
        cache: CacheState::new(config, cache),
        trigger,
    };
    Process {
        app: build_router(state),
        subscription,
    }
}

async fn cache_status(app: &Router, request: Request<Body>) -> String {
    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("router should respond");
    assert!(response.status().is_success(), "{}", response.status());
    response
        .headers()
        .get("x-cache")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .body(Body::empty())
        .expect("request should build")
}

/// Poll `uri` until its cache status is `expected`, for up to a second.
async fn eventually(app: &Router, uri: &str, expected: &str) -> bool {
    for _ in 0..100 {
        if cache_status(app, get(uri)).await == expected {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

async fn warm(app: &Router, uri: &str) {
    cache_status(app, get(uri)).await;
    assert_eq!(cache_status(app, get(uri)).await, "HIT");
}

#[tokio::test]
async fn a_write_on_one_process_invalidates_the_other() {
    let bus = Arc::new(LocalBus::new());
    // Shared backing data, private caches.
    let items = ItemService::new();
    let a = spawn_process(Arc::clone(&bus), items.clone()).await;
    let b = spawn_process(Arc::clone(&bus), items).await;

    warm(&a.app, "/items").await;
    warm(&b.app, "/items").await;

    let create = Request::builder()
        .method(Method::POST)
        .uri("/items")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"name":"pear"}"#))
        .expect("request should build");
    let response = a.app.clone().oneshot(create).await.expect("create");
    assert_eq!(response.status(), StatusCode::CREATED);

    // The writer evicts its own store before publishing.
    assert_eq!(cache_status(&a.app, get("/items")).await, "MISS");
    // A peer observes the eviction once the message arrives. Each poll that
    // misses refills the entry, so look for the first MISS only.
    assert!(eventually(&b.app, "/items", "MISS").await);
}

#[tokio::test]
async fn flush_from_outside_clears_every_process() {
    let bus = Arc::new(LocalBus::new());
    let a = spawn_process(Arc::clone(&bus), ItemService::new()).await;
    let b = spawn_process(Arc::clone(&bus), ItemService::new()).await;

    warm(&a.app, "/items").await;
    warm(&b.app, "/settings").await;

    bus.publish(
        &channel_for("quire", "_all"),
        &InvalidationMessage::flush().with_origin("quire-cli"),
    )
    .await
    .expect("publish");

    assert!(eventually(&a.app, "/items", "MISS").await);
    assert!(eventually(&b.app, "/settings", "MISS").await);
}

#[tokio::test]
async fn topic_invalidation_spares_other_topics() {
    let bus = Arc::new(LocalBus::new());
    let a = spawn_process(Arc::clone(&bus), ItemService::new()).await;

    warm(&a.app, "/items").await;
    warm(&a.app, "/settings").await;

    bus.publish(
        &channel_for("quire", "settings"),
        &InvalidationMessage::invalidate("settings"),
    )
    .await
    .expect("publish");

    assert!(eventually(&a.app, "/settings", "MISS").await);
    assert_eq!(cache_status(&a.app, get("/items")).await, "HIT");
}
