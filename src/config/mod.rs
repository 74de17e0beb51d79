//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{net::SocketAddr, num::NonZeroUsize, str::FromStr, time::Duration};

use axum::http::HeaderName;
use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::StoreKind;

pub use cli::{CliArgs, Command, MessengerOverrides, PurgeArgs, ServeArgs, ServeOverrides};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "quire";
const ENV_PREFIX: &str = "QUIRE";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_CACHE_TTL_SECS: u64 = 300;
const DEFAULT_STATUS_HEADER: &str = "x-cache";
const DEFAULT_CACHE_NAMESPACE: &str = "quire:response:";
const DEFAULT_MEMORY_LIMIT: usize = 1000;
const DEFAULT_VALUE_MAX_BYTES: usize = 1024 * 1024;
const DEFAULT_QUERY_ENDPOINT: &str = "/query";
const DEFAULT_MESSENGER_NAMESPACE: &str = "quire";

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
    pub messenger: MessengerSettings,
    pub redis: RedisSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub ttl: Duration,
    pub status_header: Option<String>,
    pub skip_allowed: bool,
    pub auto_purge: bool,
    pub namespace: String,
    pub store: StoreKind,
    pub memory_limit: NonZeroUsize,
    pub value_max_bytes: NonZeroUsize,
    pub query_endpoint: String,
}

/// Transport carrying invalidation messages between processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessengerKind {
    /// In-process only; suitable for a single instance.
    Local,
    /// Redis pub/sub.
    Redis,
}

#[derive(Debug, Clone)]
pub struct MessengerSettings {
    pub kind: MessengerKind,
    pub namespace: String,
}

#[derive(Debug, Clone)]
pub struct RedisSettings {
    pub url: Option<String>,
}

impl Settings {
    /// Redis URL, required when either the store or the messenger uses Redis.
    pub fn redis_url(&self) -> Option<&str> {
        self.redis.url.as_deref()
    }

    pub fn needs_redis(&self) -> bool {
        self.cache.store == StoreKind::Redis || self.messenger.kind == MessengerKind::Redis
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Purge(args)) => raw.apply_messenger_overrides(&args.messenger),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
    messenger: RawMessengerSettings,
    redis: RawRedisSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(enabled) = overrides.cache_enabled {
            self.cache.enabled = Some(enabled);
        }
        if let Some(ttl) = overrides.cache_ttl_seconds {
            self.cache.ttl_seconds = Some(ttl);
        }
        if let Some(header) = overrides.cache_status_header.as_ref() {
            self.cache.status_header = Some(header.clone());
        }
        if let Some(store) = overrides.cache_store {
            self.cache.store = Some(store);
        }

        self.apply_messenger_overrides(&overrides.messenger);
    }

    fn apply_messenger_overrides(&mut self, overrides: &MessengerOverrides) {
        if let Some(kind) = overrides.messenger {
            self.messenger.kind = Some(kind);
        }
        if let Some(url) = overrides.redis_url.as_ref() {
            self.redis.url = Some(url.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            cache,
            messenger,
            redis,
        } = raw;

        let settings = Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            cache: build_cache_settings(cache)?,
            messenger: build_messenger_settings(messenger)?,
            redis: build_redis_settings(redis),
        };

        if settings.needs_redis() && settings.redis.url.is_none() {
            return Err(LoadError::invalid(
                "redis.url",
                "required when cache.store or messenger.kind is `redis`",
            ));
        }

        Ok(settings)
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let status_header = match cache.status_header {
        None => Some(DEFAULT_STATUS_HEADER.to_string()),
        Some(value) if value.trim().is_empty() => None,
        Some(value) => {
            let name = value.trim().to_ascii_lowercase();
            HeaderName::from_bytes(name.as_bytes()).map_err(|err| {
                LoadError::invalid("cache.status_header", format!("invalid header name: {err}"))
            })?;
            Some(name)
        }
    };

    let namespace = cache
        .namespace
        .unwrap_or_else(|| DEFAULT_CACHE_NAMESPACE.to_string());
    if namespace.is_empty() {
        return Err(LoadError::invalid("cache.namespace", "must not be empty"));
    }

    let query_endpoint = cache
        .query_endpoint
        .unwrap_or_else(|| DEFAULT_QUERY_ENDPOINT.to_string());
    if !query_endpoint.is_empty() && !query_endpoint.starts_with('/') {
        return Err(LoadError::invalid(
            "cache.query_endpoint",
            "must be empty or start with `/`",
        ));
    }

    Ok(CacheSettings {
        enabled: cache.enabled.unwrap_or(true),
        ttl: Duration::from_secs(cache.ttl_seconds.unwrap_or(DEFAULT_CACHE_TTL_SECS)),
        status_header,
        skip_allowed: cache.skip_allowed.unwrap_or(true),
        auto_purge: cache.auto_purge.unwrap_or(true),
        namespace,
        store: cache.store.unwrap_or(StoreKind::Memory),
        memory_limit: non_zero_usize(
            cache.memory_limit.unwrap_or(DEFAULT_MEMORY_LIMIT),
            "cache.memory_limit",
        )?,
        value_max_bytes: non_zero_usize(
            cache.value_max_bytes.unwrap_or(DEFAULT_VALUE_MAX_BYTES),
            "cache.value_max_bytes",
        )?,
        query_endpoint,
    })
}

fn build_messenger_settings(
    messenger: RawMessengerSettings,
) -> Result<MessengerSettings, LoadError> {
    let namespace = messenger
        .namespace
        .unwrap_or_else(|| DEFAULT_MESSENGER_NAMESPACE.to_string());
    if namespace.is_empty() || namespace.contains('*') {
        return Err(LoadError::invalid(
            "messenger.namespace",
            "must be non-empty and must not contain `*`",
        ));
    }

    Ok(MessengerSettings {
        kind: messenger.kind.unwrap_or(MessengerKind::Local),
        namespace,
    })
}

fn build_redis_settings(redis: RawRedisSettings) -> RedisSettings {
    let url = redis.url.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });

    RedisSettings { url }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    enabled: Option<bool>,
    ttl_seconds: Option<u64>,
    status_header: Option<String>,
    skip_allowed: Option<bool>,
    auto_purge: Option<bool>,
    namespace: Option<String>,
    store: Option<StoreKind>,
    memory_limit: Option<usize>,
    value_max_bytes: Option<usize>,
    query_endpoint: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawMessengerSettings {
    kind: Option<MessengerKind>,
    namespace: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRedisSettings {
    url: Option<String>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_zero_usize(value: usize, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}
