//! Node configuration loaded from environment variables.
//!
//! Every setting has a default so a node starts with zero configuration.

use std::path::PathBuf;
use std::time::Duration;

use loom_shared::constants::DEFAULT_QUIC_PORT;
use loom_shared::types::PeerId;

/// How often queues are flushed and cafe inboxes polled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    /// Battery friendly: every 60 seconds
    Mobile,
    /// Every 10 seconds
    Server,
}

impl Profile {
    pub fn flush_interval(self) -> Duration {
        match self {
            Profile::Mobile => Duration::from_secs(60),
            Profile::Server => Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Directory holding keys, the database and content.
    /// Env: `LOOM_DATA_DIR`
    /// Default: `./loom-data`
    pub data_dir: PathBuf,

    /// Display name in the contact card.
    /// Env: `LOOM_NAME`
    pub name: String,

    /// Env: `LOOM_PROFILE` (`mobile` | `server`)
    /// Default: `server`
    pub profile: Profile,

    /// Overrides the profile's interval.
    /// Env: `LOOM_FLUSH_INTERVAL_SECS`
    pub flush_interval: Option<Duration>,

    /// QUIC port for the peer swarm, 0 picks one.
    /// Env: `LOOM_LISTEN_PORT`
    pub listen_port: u16,

    /// Comma-separated multiaddrs to dial at startup.
    /// Env: `LOOM_BOOTSTRAP`
    pub bootstrap: Vec<String>,

    /// Cafes reached over HTTP, as `<peer-hex>@<url>` comma-separated.
    /// Env: `LOOM_CAFES`
    pub cafes: Vec<(PeerId, String)>,

    /// Serve cafe requests from other peers.
    /// Env: `LOOM_CAFE_HOST` (true/false)
    pub cafe_host: bool,

    /// Accept cafe registrations without a dev token.
    /// Env: `LOOM_CAFE_OPEN` (true/false)
    pub cafe_open: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./loom-data"),
            name: String::new(),
            profile: Profile::Server,
            flush_interval: None,
            listen_port: DEFAULT_QUIC_PORT,
            bootstrap: Vec::new(),
            cafes: Vec::new(),
            cafe_host: false,
            cafe_open: false,
        }
    }
}

impl NodeConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(dir) = get("LOOM_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }

        if let Some(name) = get("LOOM_NAME") {
            config.name = name;
        }

        if let Some(profile) = get("LOOM_PROFILE") {
            match profile.to_ascii_lowercase().as_str() {
                "mobile" => config.profile = Profile::Mobile,
                "server" => config.profile = Profile::Server,
                other => tracing::warn!(value = %other, "Invalid LOOM_PROFILE, using default"),
            }
        }

        if let Some(val) = get("LOOM_FLUSH_INTERVAL_SECS") {
            match val.parse::<u64>() {
                Ok(secs) if secs > 0 => config.flush_interval = Some(Duration::from_secs(secs)),
                _ => tracing::warn!(value = %val, "Invalid LOOM_FLUSH_INTERVAL_SECS, using profile"),
            }
        }

        if let Some(val) = get("LOOM_LISTEN_PORT") {
            match val.parse::<u16>() {
                Ok(port) => config.listen_port = port,
                Err(_) => tracing::warn!(value = %val, "Invalid LOOM_LISTEN_PORT, using default"),
            }
        }

        if let Some(val) = get("LOOM_BOOTSTRAP") {
            config.bootstrap = split_list(&val).map(str::to_string).collect();
        }

        if let Some(val) = get("LOOM_CAFES") {
            for entry in split_list(&val) {
                match parse_cafe_route(entry) {
                    Some(route) => config.cafes.push(route),
                    None => tracing::warn!(value = %entry, "Invalid LOOM_CAFES entry, skipping"),
                }
            }
        }

        if let Some(val) = get("LOOM_CAFE_HOST") {
            config.cafe_host = parse_flag(&val);
        }

        if let Some(val) = get("LOOM_CAFE_OPEN") {
            config.cafe_open = parse_flag(&val);
        }

        config
    }

    pub fn flush_interval(&self) -> Duration {
        self.flush_interval
            .unwrap_or_else(|| self.profile.flush_interval())
    }
}

fn split_list(val: &str) -> impl Iterator<Item = &str> {
    val.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn parse_flag(val: &str) -> bool {
    val != "false" && val != "0"
}

/// `<peer-hex>@<url>`
fn parse_cafe_route(entry: &str) -> Option<(PeerId, String)> {
    let (peer, url) = entry.split_once('@')?;
    let peer = PeerId::from_hex(peer).ok()?;
    if url.is_empty() {
        return None;
    }
    Some((peer, url.trim_end_matches('/').to_string()))
}
