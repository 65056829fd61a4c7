use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Upper bound on network workers, whatever the environment asks for.
pub const MAX_WORKERS: usize = 8;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub cache_dir: PathBuf,
    pub memory_cache_size: usize,
    pub disk_max_age: Duration,
    pub upstream_timeout: Duration,
    pub user_agent: String,
    pub max_workers: usize,
    pub queue_capacity: usize,
    pub worker_idle_timeout: Duration,
    pub serve_stale_on_error: bool,
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            cache_dir: env::var("CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| env::temp_dir().join("maptile-cache")),
            memory_cache_size: env_or("MEMORY_CACHE_SIZE", 200),
            // Tiles older than a day are refetched
            disk_max_age: Duration::from_secs(env_or("DISK_MAX_AGE_SECS", 24 * 60 * 60)),
            upstream_timeout: Duration::from_secs(env_or("UPSTREAM_TIMEOUT_SECS", 30)),
            user_agent: env::var("USER_AGENT")
                .unwrap_or_else(|_| "maptile_loader/0.1 (track map viewer)".to_string()),
            max_workers: env_or("MAX_WORKERS", MAX_WORKERS).clamp(1, MAX_WORKERS),
            queue_capacity: env_or("QUEUE_CAPACITY", 100).max(1),
            worker_idle_timeout: Duration::from_secs(30),
            serve_stale_on_error: env_or("SERVE_STALE_ON_ERROR", true),
        }
    }
}
