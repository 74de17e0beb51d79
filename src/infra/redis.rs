use deadpool_redis::{Config, Pool, Runtime};
use tracing::info;

use super::error::InfraError;

/// Build a lazily connecting pool; the first checkout dials the server.
pub fn build_pool(url: &str) -> Result<Pool, InfraError> {
    let pool = Config::from_url(url)
        .create_pool(Some(Runtime::Tokio1))
        .map_err(|err| InfraError::redis(format!("failed to create pool: {err}")))?;
    info!(target: "quire::redis", "Redis pool created");
    Ok(pool)
}
