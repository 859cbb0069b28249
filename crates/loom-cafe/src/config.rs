//! Cafe configuration loaded from environment variables.
//!
//! A cafe starts with zero configuration for local development; a public
//! deployment sets at least `CAFE_PUBLIC_URL`.

use std::net::SocketAddr;
use std::path::PathBuf;

use chrono::Duration;

use loom_node::cafe::CafeHostConfig;
use loom_shared::constants::{ACCESS_TOKEN_TTL_SECS, DEFAULT_QUIC_PORT, REFRESH_TOKEN_TTL_SECS};

#[derive(Debug, Clone)]
pub struct CafeConfig {
    /// Socket address for the HTTP (axum) API server.
    /// Env: `CAFE_HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// QUIC port for the peer swarm.
    /// Env: `CAFE_LISTEN_PORT`
    /// Default: `4001`
    pub listen_port: u16,

    /// Directory holding keys, the database and pinned objects.
    /// Env: `CAFE_DATA_DIR`
    /// Default: `./cafe-data`
    pub data_dir: PathBuf,

    /// Base URL clients reach this cafe at, advertised in sessions.
    /// Env: `CAFE_PUBLIC_URL`
    /// Default: empty (swarm only).
    pub public_url: String,

    /// Accept registrations without a dev token.
    /// Env: `CAFE_OPEN` (true/false)
    /// Default: `false`
    pub open: bool,

    /// Env: `CAFE_ACCESS_TTL_SECS`
    pub access_ttl_secs: i64,

    /// Env: `CAFE_REFRESH_TTL_SECS`
    pub refresh_ttl_secs: i64,

    /// Admin API bearer token. Required for /admin/* endpoints.
    /// Env: `ADMIN_TOKEN`
    /// Default: empty (admin API disabled).
    pub admin_token: Option<String>,

    /// Largest object accepted on upload routes.
    /// Env: `CAFE_MAX_BLOB_SIZE`
    /// Default: 64 MiB
    pub max_blob_size: usize,
}

impl Default for CafeConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], 8080).into(),
            listen_port: DEFAULT_QUIC_PORT,
            data_dir: PathBuf::from("./cafe-data"),
            public_url: String::new(),
            open: false,
            access_ttl_secs: ACCESS_TOKEN_TTL_SECS,
            refresh_ttl_secs: REFRESH_TOKEN_TTL_SECS,
            admin_token: None,
            max_blob_size: 64 * 1024 * 1024,
        }
    }
}

impl CafeConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = get("CAFE_HTTP_ADDR") {
            match addr.parse::<SocketAddr>() {
                Ok(parsed) => config.http_addr = parsed,
                Err(_) => tracing::warn!(value = %addr, "Invalid CAFE_HTTP_ADDR, using default"),
            }
        }

        if let Some(val) = get("CAFE_LISTEN_PORT") {
            match val.parse::<u16>() {
                Ok(port) => config.listen_port = port,
                Err(_) => tracing::warn!(value = %val, "Invalid CAFE_LISTEN_PORT, using default"),
            }
        }

        if let Some(dir) = get("CAFE_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }

        if let Some(url) = get("CAFE_PUBLIC_URL") {
            config.public_url = url.trim_end_matches('/').to_string();
        }

        if let Some(val) = get("CAFE_OPEN") {
            config.open = val != "false" && val != "0";
        }

        if let Some(val) = get("CAFE_ACCESS_TTL_SECS") {
            match val.parse::<i64>() {
                Ok(secs) if secs > 0 => config.access_ttl_secs = secs,
                _ => tracing::warn!(value = %val, "Invalid CAFE_ACCESS_TTL_SECS, using default"),
            }
        }

        if let Some(val) = get("CAFE_REFRESH_TTL_SECS") {
            match val.parse::<i64>() {
                Ok(secs) if secs > 0 => config.refresh_ttl_secs = secs,
                _ => tracing::warn!(value = %val, "Invalid CAFE_REFRESH_TTL_SECS, using default"),
            }
        }

        if let Some(token) = get("ADMIN_TOKEN") {
            if !token.is_empty() {
                config.admin_token = Some(token);
            }
        }

        if let Some(val) = get("CAFE_MAX_BLOB_SIZE") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.max_blob_size = n,
                _ => tracing::warn!(value = %val, "Invalid CAFE_MAX_BLOB_SIZE, using default"),
            }
        }

        config
    }

    pub fn host_config(&self) -> CafeHostConfig {
        CafeHostConfig {
            open: self.open,
            url: self.public_url.clone(),
            access_ttl: Duration::seconds(self.access_ttl_secs),
            refresh_ttl: Duration::seconds(self.refresh_ttl_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> CafeConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        CafeConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = CafeConfig::default();
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 8080).into());
        assert!(!config.open);
        assert!(config.admin_token.is_none());
        assert_eq!(config.host_config().access_ttl, Duration::seconds(ACCESS_TOKEN_TTL_SECS));
    }

    #[test]
    fn test_overrides() {
        let c = config(&[
            ("CAFE_PUBLIC_URL", "https://cafe.example/"),
            ("CAFE_OPEN", "true"),
            ("CAFE_ACCESS_TTL_SECS", "60"),
            ("ADMIN_TOKEN", ""),
        ]);
        let host = c.host_config();
        assert_eq!(host.url, "https://cafe.example");
        assert!(host.open);
        assert_eq!(host.access_ttl, Duration::seconds(60));
        assert!(c.admin_token.is_none());
    }

    #[test]
    fn test_bad_values_keep_defaults() {
        let c = config(&[
            ("CAFE_HTTP_ADDR", "localhost"),
            ("CAFE_REFRESH_TTL_SECS", "-5"),
            ("CAFE_MAX_BLOB_SIZE", "lots"),
        ]);
        let d = CafeConfig::default();
        assert_eq!(c.http_addr, d.http_addr);
        assert_eq!(c.refresh_ttl_secs, d.refresh_ttl_secs);
        assert_eq!(c.max_blob_size, d.max_blob_size);
    }
}
