use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

use crate::cache::StoreKind;

use super::MessengerKind;

/// Command-line arguments for the Quire binary.
#[derive(Debug, Parser)]
#[command(name = "quire", version, about = "Quire content server")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "QUIRE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the Quire HTTP service.
    Serve(Box<ServeArgs>),
    /// Publish an invalidation to every running instance and exit.
    Purge(PurgeArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct PurgeArgs {
    /// Invalidate a single topic instead of flushing everything.
    #[arg(long, value_name = "TOPIC")]
    pub topic: Option<String>,

    #[command(flatten)]
    pub messenger: MessengerOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct MessengerOverrides {
    /// Override the invalidation transport (local|redis).
    #[arg(long = "messenger", value_name = "KIND", value_parser = parse_messenger_kind)]
    pub messenger: Option<MessengerKind>,

    /// Override the Redis connection URL.
    #[arg(long = "redis-url", value_name = "URL")]
    pub redis_url: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Toggle the response cache.
    #[arg(
        long = "cache-enabled",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub cache_enabled: Option<bool>,

    /// Override the lifetime of cached responses.
    #[arg(long = "cache-ttl-seconds", value_name = "SECONDS")]
    pub cache_ttl_seconds: Option<u64>,

    /// Override the diagnostic header name; an empty value disables it.
    #[arg(long = "cache-status-header", value_name = "NAME")]
    pub cache_status_header: Option<String>,

    /// Override the cache store backend (memory|redis).
    #[arg(long = "cache-store", value_name = "KIND", value_parser = parse_store_kind)]
    pub cache_store: Option<StoreKind>,

    #[command(flatten)]
    pub messenger: MessengerOverrides,
}

fn parse_store_kind(value: &str) -> Result<StoreKind, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "memory" => Ok(StoreKind::Memory),
        "redis" => Ok(StoreKind::Redis),
        other => Err(format!("unknown cache store `{other}` (expected memory|redis)")),
    }
}

fn parse_messenger_kind(value: &str) -> Result<MessengerKind, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "local" => Ok(MessengerKind::Local),
        "redis" => Ok(MessengerKind::Redis),
        other => Err(format!("unknown messenger `{other}` (expected local|redis)")),
    }
}
