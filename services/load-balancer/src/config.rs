//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Backends come from an explicit URL list, an inclusive port range, or both.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Overrides `balancer.listen_addr`.
const LISTEN_ADDR_ENV: &str = "LISTEN_ADDR";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub balancer: BalancerConfig,
    pub backends: BackendsConfig,
    #[serde(default)]
    pub health: HealthConfig,
}

/// Listener and forwarding settings
#[derive(Debug, Deserialize)]
pub struct BalancerConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_admin_addr")]
    pub admin_addr: SocketAddr,
    /// Per-attempt timeout for a forwarded request
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Backend pool membership
#[derive(Debug, Default, Deserialize)]
pub struct BackendsConfig {
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default)]
    pub port_range: Option<PortRange>,
}

/// `scheme://host:start` ..= `scheme://host:end`
#[derive(Debug, Deserialize)]
pub struct PortRange {
    #[serde(default = "default_host")]
    pub host: String,
    pub start: u16,
    pub end: u16,
    #[serde(default = "default_scheme")]
    pub scheme: String,
}

/// Active health probing
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
    #[serde(default = "default_probe_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_health_path")]
    pub path: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            cooldown_secs: default_cooldown(),
            timeout_secs: default_probe_timeout(),
            path: default_health_path(),
        }
    }
}

fn default_admin_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9090))
}

fn default_request_timeout() -> u64 {
    10
}

fn default_max_connections() -> usize {
    1000
}

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_scheme() -> String {
    "http".into()
}

fn default_interval() -> u64 {
    10
}

fn default_cooldown() -> u64 {
    30
}

fn default_probe_timeout() -> u64 {
    5
}

fn default_health_path() -> String {
    "/healthcheck".into()
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if let Ok(addr) = std::env::var(LISTEN_ADDR_ENV) {
            config.balancer.listen_addr = addr.parse().map_err(|e| {
                common::Error::Config(format!("{LISTEN_ADDR_ENV} is not a socket address: {e}"))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if let Some(range) = &self.backends.port_range {
            if range.start > range.end {
                return Err(common::Error::Config(format!(
                    "port_range start ({}) must not exceed end ({})",
                    range.start, range.end
                )));
            }
            if range.scheme != "http" && range.scheme != "https" {
                return Err(common::Error::Config(format!(
                    "port_range scheme must be http or https, got: {}",
                    range.scheme
                )));
            }
        }

        for url in &self.backends.urls {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(common::Error::Config(format!(
                    "backend url must start with http:// or https://, got: {url}"
                )));
            }
        }

        if self.backend_urls().is_empty() {
            return Err(common::Error::Config(
                "at least one backend must be configured".into(),
            ));
        }

        let durations = [
            ("request_timeout_secs", self.balancer.request_timeout_secs),
            ("interval_secs", self.health.interval_secs),
            ("cooldown_secs", self.health.cooldown_secs),
            ("timeout_secs", self.health.timeout_secs),
        ];
        for (name, value) in durations {
            if value == 0 {
                return Err(common::Error::Config(format!(
                    "{name} must be greater than 0"
                )));
            }
        }

        if self.balancer.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        if !self.health.path.starts_with('/') {
            return Err(common::Error::Config(format!(
                "health path must start with '/', got: {}",
                self.health.path
            )));
        }

        Ok(())
    }

    /// Explicit URLs followed by the port range, trailing slashes removed, duplicates dropped.
    pub fn backend_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = Vec::new();
        let ranged = self.backends.port_range.iter().flat_map(|range| {
            (range.start..=range.end)
                .map(move |port| format!("{}://{}:{port}", range.scheme, range.host))
        });
        for url in self.backends.urls.iter().cloned().chain(ranged) {
            let url = url.trim_end_matches('/').to_string();
            if !urls.contains(&url) {
                urls.push(url);
            }
        }
        urls
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.balancer.request_timeout_secs)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("load-balancer.toml")
    }
}
