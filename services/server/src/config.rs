//! Server configuration loading.
//!
//! TOML is the primary source, with environment variables overriding the
//! handful of settings that commonly differ between deployments (bind
//! address, log level, Redis URL) the same way `main.rs` reads `BIND_ADDR`
//! and `LOG_LEVEL` directly.
//!
//! Default config path: `/etc/realtime-server/config.toml`. Missing file is
//! not an error — every field has a usable default.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub log_level: String,
    pub rate_limit_max: u32,
    pub rate_limit_interval: Duration,
    pub keep_alive_interval: Duration,
    pub allowed_context_keys: Vec<String>,
    pub redis_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_addr: "0.0.0.0:8080".to_owned(),
            log_level: "info".to_owned(),
            rate_limit_max: 60,
            rate_limit_interval: Duration::from_secs(60),
            keep_alive_interval: Duration::from_secs(10),
            allowed_context_keys: Vec::new(),
            redis_url: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    bind_addr: Option<String>,
    log_level: Option<String>,
    rate_limit: Option<RawRateLimit>,
    keep_alive_interval_ms: Option<u64>,
    allowed_context_keys: Option<Vec<String>>,
    redis_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawRateLimit {
    max_requests: Option<u32>,
    interval_ms: Option<u64>,
}

impl ServerConfig {
    pub fn load(path: &Path) -> ServerConfig {
        let raw = match std::fs::read_to_string(path) {
            Ok(text) => toml::from_str(&text).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "ignoring malformed config file");
                RawConfig::default()
            }),
            Err(_) => RawConfig::default(),
        };

        let mut config = ServerConfig::default();
        if let Some(bind_addr) = raw.bind_addr {
            config.bind_addr = bind_addr;
        }
        if let Some(log_level) = raw.log_level {
            config.log_level = log_level;
        }
        if let Some(rate_limit) = raw.rate_limit {
            if let Some(max) = rate_limit.max_requests {
                config.rate_limit_max = max;
            }
            if let Some(ms) = rate_limit.interval_ms {
                config.rate_limit_interval = Duration::from_millis(ms);
            }
        }
        if let Some(ms) = raw.keep_alive_interval_ms {
            config.keep_alive_interval = Duration::from_millis(ms);
        }
        if let Some(keys) = raw.allowed_context_keys {
            config.allowed_context_keys = keys;
        }
        if let Some(redis_url) = raw.redis_url {
            config.redis_url = Some(redis_url);
        }

        if let Ok(bind_addr) = std::env::var("BIND_ADDR") {
            config.bind_addr = bind_addr;
        }
        if let Ok(log_level) = std::env::var("LOG_LEVEL") {
            config.log_level = log_level;
        }
        if let Ok(redis_url) = std::env::var("REDIS_URL") {
            config.redis_url = Some(redis_url);
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = ServerConfig::load(Path::new("/nonexistent/realtime-server.toml"));
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.rate_limit_max, 60);
    }

    #[test]
    fn toml_overrides_defaults() {
        let dir = std::env::temp_dir().join(format!("realtime-server-test-{:?}", std::thread::current().id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(
            &path,
            r#"
            bind_addr = "127.0.0.1:9090"
            [rate_limit]
            max_requests = 10
            "#,
        )
        .unwrap();
        let config = ServerConfig::load(&path);
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.rate_limit_max, 10);
        std::fs::remove_dir_all(&dir).ok();
    }
}
