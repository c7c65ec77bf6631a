//! Configuration model for the runtime, the listener and the proxy engine.
//!
//! Files are parsed by extension (`.toml` or `.json`); every section has
//! serde defaults so a minimal config only names a listener and its routes.
mod parsers;

use std::{net::SocketAddr, num::NonZeroUsize, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{route::RouteDef, AnyResult};

// Default iouring/epoll entries: 32k
const DEFAULT_ENTRIES: u32 = 32768;

pub const FALLBACK_PARALLELISM: NonZeroUsize = unsafe { NonZeroUsize::new_unchecked(1) };

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    pub server: ServerConfig,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> AnyResult<Self> {
        let raw = crate::util::file_read_sync(path.as_ref())?;
        let extension = path
            .as_ref()
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("toml");
        parsers::parse(extension, &raw)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_name")]
    pub name: String,
    pub listener: ListenerConfig,
    #[serde(default)]
    pub proxy: ProxyOptions,
    #[serde(default)]
    pub routing: RoutingOptions,
    #[serde(default)]
    pub timeouts: ServerTimeoutConfig,
    #[serde(default)]
    pub tokeninfo: Option<TokeninfoConfig>,
    #[serde(default)]
    pub routes: Vec<RouteDef>,
}

/// Downstream-side timeouts. Absent fields keep the serving stack defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerTimeoutConfig {
    #[serde(default)]
    pub keepalive_ms: Option<u64>,
    #[serde(default)]
    pub read_header_ms: Option<u64>,
    #[serde(default)]
    pub write_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ListenerConfig {
    Socket { socket_addr: SocketAddr },
    #[cfg(unix)]
    Unix { uds_path: std::path::PathBuf },
}

/// Behavior knobs of the request pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyOptions {
    /// Keep the client's Host header when forwarding instead of rewriting it
    /// to the upstream authority.
    #[serde(default)]
    pub preserve_host: bool,

    /// Append the peer address to the X-Forwarded-For chain.
    #[serde(default = "default_true")]
    pub x_forwarded_for: bool,

    /// Maximum number of loopback iterations per request.
    #[serde(default = "default_max_loop_depth")]
    pub max_loop_depth: usize,

    /// Tunnel connections carrying `Connection: Upgrade` as raw byte copies.
    #[serde(default)]
    pub experimental_upgrade: bool,

    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,
    #[serde(default)]
    pub upstream_read_timeout_ms: Option<u64>,

    /// Ramp-up window for endpoints newly added to an LB backend.
    #[serde(default)]
    pub fade_in_ms: Option<u64>,

    /// Server header advertised on failure responses; absent by default.
    #[serde(default)]
    pub server_header: Option<String>,

    /// Protocol the upstream connector negotiates.
    #[serde(default)]
    pub upstream_http_version: UpstreamHttpVersion,
}

#[derive(Debug, Copy, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamHttpVersion {
    Http2,
    Http11,
    #[default]
    Auto,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            preserve_host: false,
            x_forwarded_for: true,
            max_loop_depth: default_max_loop_depth(),
            experimental_upgrade: false,
            connect_timeout_ms: None,
            upstream_read_timeout_ms: None,
            fade_in_ms: None,
            server_header: None,
            upstream_http_version: UpstreamHttpVersion::default(),
        }
    }
}

impl ProxyOptions {
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }

    pub fn upstream_read_timeout(&self) -> Option<Duration> {
        self.upstream_read_timeout_ms.map(Duration::from_millis)
    }

    pub fn fade_in(&self) -> Option<Duration> {
        self.fade_in_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingOptions {
    /// Backoff between data client polls and after failed loads.
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
}

impl Default for RoutingOptions {
    fn default() -> Self {
        Self {
            poll_timeout_ms: default_poll_timeout_ms(),
        }
    }
}

impl RoutingOptions {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokeninfoConfig {
    pub url: String,
    #[serde(default = "default_tokeninfo_cache_size")]
    pub cache_size: usize,
    #[serde(default = "default_tokeninfo_ttl_ms")]
    pub cache_ttl_ms: u64,
    #[serde(default = "default_tokeninfo_timeout_ms")]
    pub timeout_ms: u64,
}

impl TokeninfoConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Runtime environment options: worker threads, io_uring tuning, affinity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_workers")]
    pub worker_threads: usize,

    #[serde(default = "default_entries")]
    pub entries: u32,

    #[serde(default)]
    pub sqpoll_idle: Option<u32>,

    #[serde(default)]
    pub runtime_type: RuntimeType,

    #[serde(default)]
    pub cpu_affinity: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            worker_threads: default_workers(),
            entries: default_entries(),
            sqpoll_idle: None,
            runtime_type: Default::default(),
            cpu_affinity: false,
        }
    }
}

#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeType {
    #[cfg(target_os = "linux")]
    IoUring,
    Legacy,
}

impl Default for RuntimeType {
    #[cfg(target_os = "linux")]
    fn default() -> Self {
        Self::IoUring
    }

    #[cfg(not(target_os = "linux"))]
    fn default() -> Self {
        Self::Legacy
    }
}

fn default_name() -> String {
    "veer".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_loop_depth() -> usize {
    9
}

fn default_poll_timeout_ms() -> u64 {
    3000
}

fn default_tokeninfo_cache_size() -> usize {
    1024
}

fn default_tokeninfo_ttl_ms() -> u64 {
    30_000
}

fn default_tokeninfo_timeout_ms() -> u64 {
    2000
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .unwrap_or(FALLBACK_PARALLELISM)
        .into()
}

const fn default_entries() -> u32 {
    DEFAULT_ENTRIES
}

impl service_async::Param<ProxyOptions> for ServerConfig {
    fn param(&self) -> ProxyOptions {
        self.proxy.clone()
    }
}

impl service_async::Param<Option<TokeninfoConfig>> for ServerConfig {
    fn param(&self) -> Option<TokeninfoConfig> {
        self.tokeninfo.clone()
    }
}
