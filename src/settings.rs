use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, bail, ensure};
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;

use crate::cache::CacheConfig;
use crate::cli::Cli;

fn default_local_addr() -> SocketAddr {
    "0.0.0.0:3456".parse().expect("static listen address")
}

fn default_log_level() -> LogLevel {
    LogLevel::Warning
}

fn default_cache_size() -> usize {
    1 << 30 // 1 GiB
}

fn default_non_get_mode() -> NonGetMode {
    NonGetMode::Pass
}

fn default_lfu_time() -> u64 {
    1800
}

fn default_protection_expire() -> u64 {
    1800
}

fn default_max_body_size() -> usize {
    64 * 1024 * 1024
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Disposition of non-GET requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NonGetMode {
    Pass,
    Block,
    Cache,
    Queue,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_local_addr")]
    pub local_addr: SocketAddr,
    /// Upstream base URL, e.g. `http://origin:8080`. Empty means every
    /// origin fetch fails until configured.
    #[serde(default)]
    pub target_addr: String,
    #[serde(default)]
    pub control_addr: Option<SocketAddr>,
    /// Log destination; stderr when empty.
    #[serde(default)]
    pub log_file: String,
    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,
    /// Share one stored copy between URLs that return byte-equal bodies.
    #[serde(default)]
    pub cache_unique: bool,
    /// Detect mobile user agents and cache their responses separately.
    #[serde(default)]
    pub cache_mobile: bool,
    /// High-water mark for the pool in bytes.
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
    #[serde(default = "default_non_get_mode")]
    pub non_get_mode: NonGetMode,
    /// Queue at most this many non-GET requests; 0 means unlimited.
    #[serde(default)]
    pub queue_capacity: usize,
    /// Forward this many queued requests per second.
    #[serde(default)]
    pub dequeue_rate: f64,
    /// Access-count window in seconds.
    #[serde(default = "default_lfu_time")]
    pub lfu_time: u64,
    /// Seconds before a protected entry goes stale and becomes evictable.
    #[serde(default = "default_protection_expire")]
    pub protection_expire: u64,
    /// Connection timeouts in seconds; 0 disables.
    #[serde(default)]
    pub idle_timeout: u64,
    #[serde(default)]
    pub read_timeout: u64,
    #[serde(default)]
    pub write_timeout: u64,
    /// Cap on buffered request and origin-response bodies.
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
    /// Header name and password arming the force-refresh gate; both must be
    /// set for the gate to be active.
    #[serde(default)]
    pub refresh_header: String,
    #[serde(default)]
    pub refresh_pw: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            local_addr: default_local_addr(),
            target_addr: String::new(),
            control_addr: None,
            log_file: String::new(),
            log_level: default_log_level(),
            cache_unique: false,
            cache_mobile: false,
            cache_size: default_cache_size(),
            non_get_mode: default_non_get_mode(),
            queue_capacity: 0,
            dequeue_rate: 0.0,
            lfu_time: default_lfu_time(),
            protection_expire: default_protection_expire(),
            idle_timeout: 0,
            read_timeout: 0,
            write_timeout: 0,
            max_body_size: default_max_body_size(),
            refresh_header: String::new(),
            refresh_pw: String::new(),
        }
    }
}

impl Settings {
    /// Loads settings from the configured JSON file plus `MEMGATE__*`
    /// environment overrides. A load or validation failure is not fatal: the
    /// defaults are returned together with the error so the caller can log it
    /// once the logger is up.
    pub fn load(cli: &Cli) -> (Self, Option<anyhow::Error>) {
        match Self::try_load(cli) {
            Ok(settings) => (settings, None),
            Err(err) => (Self::default(), Some(err)),
        }
    }

    fn try_load(cli: &Cli) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = resolve_config_path(cli) {
            builder = builder.add_source(
                File::from(path)
                    .format(FileFormat::Json)
                    .required(true),
            );
        }
        builder = builder.add_source(
            Environment::with_prefix("MEMGATE")
                .separator("__")
                .try_parsing(true),
        );
        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.cache_size > 0,
            "cache_size must be greater than 0 (got {})",
            self.cache_size
        );
        ensure!(
            self.max_body_size > 0,
            "max_body_size must be greater than 0 (got {})",
            self.max_body_size
        );
        if self.non_get_mode == NonGetMode::Queue {
            ensure!(
                self.dequeue_rate > 0.0,
                "dequeue_rate must be greater than 0 when non_get_mode is queue (got {})",
                self.dequeue_rate
            );
        }
        if self.refresh_header.is_empty() != self.refresh_pw.is_empty() {
            bail!("refresh_header and refresh_pw must both be set or both be empty");
        }
        Ok(())
    }

    pub fn lfu_time(&self) -> Duration {
        Duration::from_secs(self.lfu_time)
    }

    pub fn protection_expire(&self) -> Duration {
        Duration::from_secs(self.protection_expire)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        nonzero_secs(self.idle_timeout)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        nonzero_secs(self.read_timeout)
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        nonzero_secs(self.write_timeout)
    }

    /// The armed refresh gate, if any: header name plus required value.
    pub fn refresh_gate(&self) -> Option<(&str, &str)> {
        if self.refresh_header.is_empty() || self.refresh_pw.is_empty() {
            return None;
        }
        Some((&self.refresh_header, &self.refresh_pw))
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            cache_size: self.cache_size,
            cache_unique: self.cache_unique,
            cache_mobile: self.cache_mobile,
            method_keyed: self.non_get_mode == NonGetMode::Cache,
            lfu_time: self.lfu_time(),
            protection_expire: self.protection_expire(),
            ..CacheConfig::default()
        }
    }
}

fn nonzero_secs(secs: u64) -> Option<Duration> {
    if secs == 0 {
        None
    } else {
        Some(Duration::from_secs(secs))
    }
}

fn resolve_config_path(cli: &Cli) -> Option<PathBuf> {
    if let Some(path) = &cli.config {
        return Some(path.clone());
    }
    let fallback = PathBuf::from("memgate.json");
    if fallback.exists() {
        return Some(fallback);
    }
    None
}
