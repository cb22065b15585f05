//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use tracing::info;

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "config.toml",
    "application.toml",
    "waybill.toml",
    "./config/config.toml",
    "./config/application.toml",
    "/etc/waybill/config.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable overrides
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        // Start with defaults
        let mut config = AppConfig::default();

        // Try to load from file
        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        // Apply environment variable overrides
        self.apply_env_overrides(&mut config);

        Ok(config)
    }

    /// Find the configuration file to use
    fn find_config_file(&self) -> Option<PathBuf> {
        // Check explicit path first
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        // Check WAYBILL_CONFIG env var
        if let Ok(path) = env::var("WAYBILL_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        // Search standard paths
        for path in CONFIG_PATHS {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&self, config: &mut AppConfig) {
        // HTTP
        if let Ok(val) = env::var("WAYBILL_HTTP_PORT") {
            if let Ok(port) = val.parse() {
                config.http.port = port;
            }
        }
        if let Ok(val) = env::var("WAYBILL_HTTP_HOST") {
            config.http.host = val;
        }
        if let Ok(val) = env::var("WAYBILL_CORS_ORIGINS") {
            config.http.cors_origins = val.split(',').map(|s| s.trim().to_string()).collect();
        }

        // Redis
        if let Ok(val) = env::var("WAYBILL_REDIS_URL") {
            config.redis.url = val;
        }
        if let Ok(val) = env::var("WAYBILL_REDIS_POOL_SIZE") {
            if let Ok(size) = val.parse() {
                config.redis.pool_size = size;
            }
        }

        // Queue
        if let Ok(val) = env::var("WAYBILL_QUEUE_TYPE") {
            config.queue.queue_type = val;
        }
        if let Ok(val) = env::var("WAYBILL_AMQP_URI") {
            config.queue.amqp.uri = val;
        }
        if let Ok(val) = env::var("WAYBILL_SQS_QUEUE_URL") {
            config.queue.sqs.queue_url = val;
        }
        if let Ok(val) = env::var("WAYBILL_SQS_REGION") {
            config.queue.sqs.region = val;
        }

        // Router
        if let Ok(val) = env::var("WAYBILL_ROUTER_TIMEOUT_MS") {
            if let Ok(timeout) = val.parse() {
                config.router.timeout_ms = timeout;
            }
        }
        if let Ok(val) = env::var("WAYBILL_ROUTER_MAX_WORKERS") {
            if let Ok(workers) = val.parse() {
                config.router.max_workers_per_pool = workers;
            }
        }
        if let Ok(val) = env::var("WAYBILL_ROUTER_MAX_POOLS") {
            if let Ok(pools) = val.parse() {
                config.router.max_pools = pools;
            }
        }

        // Router Config Sync
        if let Ok(val) = env::var("WAYBILL_CONFIG_SYNC_ENABLED") {
            config.router.config_sync.enabled = val.parse().unwrap_or(false);
        }
        if let Ok(val) = env::var("WAYBILL_CONFIG_SYNC_URL") {
            config.router.config_sync.config_url = val;
        }
        if let Ok(val) = env::var("WAYBILL_CONFIG_SYNC_INTERVAL") {
            if let Ok(interval) = val.parse() {
                config.router.config_sync.interval_seconds = interval;
            }
        }
        if let Ok(val) = env::var("WAYBILL_CONFIG_SYNC_FAIL_ON_ERROR") {
            config.router.config_sync.fail_on_initial_error = val.parse().unwrap_or(true);
        }

        // Router Standby/HA
        if let Ok(val) = env::var("WAYBILL_STANDBY_ENABLED") {
            config.router.standby.enabled = val.parse().unwrap_or(false);
        }
        if let Ok(val) = env::var("WAYBILL_STANDBY_REDIS_URL") {
            config.router.standby.redis_url = val;
        }
        if let Ok(val) = env::var("WAYBILL_STANDBY_LOCK_KEY") {
            config.router.standby.lock_key = val;
        }
        if let Ok(val) = env::var("WAYBILL_STANDBY_LOCK_TTL") {
            if let Ok(ttl) = val.parse() {
                config.router.standby.lock_ttl_seconds = ttl;
            }
        }
        if let Ok(val) = env::var("WAYBILL_STANDBY_HEARTBEAT_INTERVAL") {
            if let Ok(interval) = val.parse() {
                config.router.standby.heartbeat_interval_seconds = interval;
            }
        }

        // General
        if let Ok(val) = env::var("WAYBILL_DATA_DIR") {
            config.data_dir = val;
        }
        if let Ok(val) = env::var("WAYBILL_DEV_MODE") {
            config.dev_mode = val.parse().unwrap_or(false);
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
