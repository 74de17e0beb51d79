use std::{future::IntoFuture, process, sync::Arc};

use axum::http::StatusCode;
use deadpool_redis::Pool;
use quire::{
    application::{
        error::{AppError, ErrorReport},
        items::ItemService,
        settings::SettingsService,
    },
    cache::{
        CacheConfig, CacheConsumer, CacheState, CacheStore, CacheTrigger, FLUSH_TOPIC, MemoryStore,
        RedisStore, ResponseCache, StoreKind, SystemClock, topic_for_path,
    },
    config::{self, MessengerKind},
    infra::{
        error::InfraError,
        http::{self, HttpState},
        redis, telemetry,
    },
    messenger::{InvalidationBus, InvalidationMessage, LocalBus, RedisBus, channel_for},
};
use tokio::sync::Notify;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    let chain = ErrorReport::new("main", StatusCode::INTERNAL_SERVER_ERROR)
        .with_chain(error)
        .messages;

    if dispatcher::has_been_set() {
        error!(error = %error, chain = ?chain, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, chain = ?chain, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Purge(args) => run_purge(settings, args).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let pool = redis_pool(&settings)?;
    let cache_config = CacheConfig::from(&settings.cache);

    let store: Arc<dyn CacheStore> = match (settings.cache.store, pool.as_ref()) {
        (StoreKind::Redis, Some(pool)) => Arc::new(RedisStore::new(
            pool.clone(),
            cache_config.namespace.clone(),
        )),
        (StoreKind::Redis, None) => {
            return Err(InfraError::configuration("redis store requires redis.url").into());
        }
        (StoreKind::Memory, _) => Arc::new(MemoryStore::new(&cache_config)),
    };
    let bus = build_bus(&settings, pool.as_ref())?;

    let cache = ResponseCache::new(store, Arc::new(SystemClock), cache_config.namespace.clone());
    let trigger = CacheTrigger::new(
        cache_config.clone(),
        cache.clone(),
        Arc::clone(&bus),
        settings.messenger.namespace.clone(),
    );

    let consumer = Arc::new(CacheConsumer::new(
        cache.clone(),
        Arc::clone(&bus),
        settings.messenger.namespace.clone(),
    ));
    let subscription = consumer.start().await.map_err(InfraError::from)?;

    let mut items = ItemService::new().with_cache_trigger(trigger.clone());
    if !cache_config.query_endpoint.is_empty() {
        items = items.with_dependent_topic(topic_for_path(&cache_config.query_endpoint));
    }

    info!(
        store = ?settings.cache.store,
        messenger = ?settings.messenger.kind,
        enabled = cache_config.enabled,
        instance_id = trigger.instance_id(),
        "Response cache configured"
    );

    let state = HttpState {
        items,
        settings: SettingsService::default(),
        cache: CacheState::new(cache_config, cache),
        trigger,
    };

    let result = serve_http(&settings, state).await;
    subscription.abort();
    result
}

async fn run_purge(settings: config::Settings, args: config::PurgeArgs) -> Result<(), AppError> {
    if settings.messenger.kind == MessengerKind::Local {
        return Err(AppError::validation(
            "purge needs a shared messenger; pass --messenger redis",
        ));
    }

    let pool = redis_pool(&settings)?;
    let bus = build_bus(&settings, pool.as_ref())?;
    let namespace = &settings.messenger.namespace;

    let (channel, message) = match args.topic.as_deref() {
        Some(topic) => (
            channel_for(namespace, topic),
            InvalidationMessage::invalidate(topic),
        ),
        None => (
            channel_for(namespace, FLUSH_TOPIC),
            InvalidationMessage::flush(),
        ),
    };
    let message = message.with_origin("quire-cli");

    bus.publish(&channel, &message)
        .await
        .map_err(InfraError::from)?;
    info!(channel = %channel, message_id = %message.id, "Published invalidation");
    Ok(())
}

fn redis_pool(settings: &config::Settings) -> Result<Option<Pool>, AppError> {
    match settings.redis_url() {
        Some(url) if settings.needs_redis() => Ok(Some(redis::build_pool(url)?)),
        _ => Ok(None),
    }
}

fn build_bus(
    settings: &config::Settings,
    pool: Option<&Pool>,
) -> Result<Arc<dyn InvalidationBus>, AppError> {
    match (settings.messenger.kind, pool, settings.redis_url()) {
        (MessengerKind::Local, _, _) => Ok(Arc::new(LocalBus::new())),
        (MessengerKind::Redis, Some(pool), Some(url)) => {
            Ok(Arc::new(RedisBus::new(pool.clone(), url)))
        }
        (MessengerKind::Redis, _, _) => {
            Err(InfraError::configuration("redis messenger requires redis.url").into())
        }
    }
}

async fn serve_http(settings: &config::Settings, state: HttpState) -> Result<(), AppError> {
    let router = http::build_router(state);
    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(InfraError::from)?;
    info!(addr = %settings.server.addr, "Listening");

    let stop = Arc::new(Notify::new());
    let server = axum::serve(listener, router.into_make_service()).with_graceful_shutdown({
        let stop = Arc::clone(&stop);
        async move { stop.notified().await }
    });
    let mut server = tokio::spawn(server.into_future());

    let joined = tokio::select! {
        joined = &mut server => joined,
        () = shutdown_signal() => {
            info!("Shutdown signal received; draining connections");
            stop.notify_one();
            match tokio::time::timeout(settings.server.graceful_shutdown, &mut server).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(
                        timeout = ?settings.server.graceful_shutdown,
                        "Graceful shutdown timed out; aborting open connections"
                    );
                    server.abort();
                    return Ok(());
                }
            }
        }
    };

    joined
        .map_err(|err| AppError::unexpected(format!("server task failed: {err}")))?
        .map_err(|err| AppError::unexpected(format!("server error: {err}")))?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
