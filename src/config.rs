use serde::Deserialize;
use std::convert::TryFrom;
use std::fmt;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::allow::AllowList;
use crate::controller::BodyWait;
use crate::error::{Error, Result};
use crate::tls::Certificate;

/// Polled by the supervision loop; returning `true` shuts the server down.
pub type TerminatePredicate = Arc<dyn Fn() -> bool + Send + Sync>;

/// Configuration for the server, as loaded from the environment.
///
/// Every field can be set through a `VIGIL_` prefixed environment variable
/// (`VIGIL_PORT`, `VIGIL_ALLOWED_SOURCES=10.0.0.1,10.0.0.2`, ...) or from an
/// optional `config` file. Use [`options`](Self::options) and
/// [`engine`](Self::engine) to turn it into the runtime settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listening port. Defaults to 8080.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bind to 127.0.0.1 only.
    #[serde(default)]
    pub bind_loopback: bool,
    /// Literal IP address to bind to. Ignored when `bind_loopback` is set.
    pub bind_address: Option<String>,
    /// Network interface to bind the socket to (Linux only).
    pub bind_interface: Option<String>,
    /// PEM private key. TLS is enabled when both files are set.
    pub tls_key_file: Option<PathBuf>,
    /// PEM certificate chain.
    pub tls_cert_file: Option<PathBuf>,
    /// Admitted source addresses. Defaults to `["*"]`.
    #[serde(default = "default_allowed_sources")]
    pub allowed_sources: Vec<String>,
    /// Attempts made by one daemon start. Defaults to 12.
    #[serde(default = "default_start_attempts")]
    pub start_attempts: u32,
    /// Pause between two failed start attempts. Defaults to 5 seconds.
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
    /// Supervision period in milliseconds. Defaults to 1000.
    #[serde(default = "default_supervise_interval_ms")]
    pub supervise_interval_ms: u64,
    #[serde(default = "default_listen_backlog")]
    pub listen_backlog: i32,
    /// Restarts after liveness loss before giving up. Unset retries forever.
    pub max_restarts: Option<u32>,
    /// Sleep between two body-wait invocations, in milliseconds.
    #[serde(default = "default_body_wait_interval_ms")]
    pub body_wait_interval_ms: u64,
    /// Empty invocations tolerated while waiting for a request body.
    #[serde(default = "default_body_wait_ceiling")]
    pub body_wait_ceiling: u32,
    /// Whether the body wait sleeps at all.
    #[serde(default = "default_true")]
    pub body_wait_sleep: bool,
    /// Maximum number of worker threads. Defaults to CPU count * 15.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Keep-alive duration in seconds for idle worker threads.
    #[serde(default = "default_keep_alive_secs")]
    pub worker_keep_alive_secs: u64,
    #[serde(default = "default_true")]
    pub http1_keep_alive: bool,
    #[serde(default)]
    pub http1_half_close: bool,
    /// Maximum buffer size for HTTP/1.x requests. Defaults to 512kb.
    #[serde(default = "default_max_buf_size")]
    pub http1_max_buf_size: usize,
    #[serde(default)]
    pub http1_only: bool,
    #[cfg(feature = "http2")]
    #[serde(default)]
    pub http2_only: bool,
    /// Invocations without a reply before an exchange times out.
    #[serde(default = "default_idle_invocations")]
    pub idle_invocations: u32,
    /// Largest request body accepted, in bytes. Defaults to 8mb.
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
}

impl TryFrom<config::Config> for ServerConfig {
    type Error = config::ConfigError;

    fn try_from(config: config::Config) -> std::result::Result<Self, Self::Error> {
        config.try_deserialize()
    }
}

impl ServerConfig {
    /// Loads the configuration.
    ///
    /// 1. Load environment variables from a .env file if present
    /// 2. Load a "config" file if it exists
    /// 3. Override with environment variables prefixed with "VIGIL_"
    pub fn new() -> std::result::Result<Self, config::ConfigError> {
        dotenv::dotenv().ok();

        let builder = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("VIGIL")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("allowed_sources"),
            );

        builder.build()?.try_into()
    }

    pub fn worker_keep_alive(&self) -> Duration {
        Duration::from_secs(self.worker_keep_alive_secs)
    }

    /// Builds the daemon options, reading the TLS files if configured.
    pub fn options(&self) -> Result<ServerOptions> {
        let certificate = match (&self.tls_key_file, &self.tls_cert_file) {
            (Some(key), Some(cert)) => Some(Certificate::new(fs::read(key)?, fs::read(cert)?)),
            (None, None) => None,
            _ => {
                return Err(Error::Tls(
                    "tls_key_file and tls_cert_file must be set together".into(),
                ))
            }
        };

        Ok(ServerOptions {
            bind_loopback: self.bind_loopback,
            bind_address: self.bind_address.clone(),
            bind_interface: self.bind_interface.clone(),
            certificate,
            allowed_sources: self.allowed_sources.clone(),
            should_terminate: None,
            start_attempts: self.start_attempts,
            retry_backoff: Duration::from_secs(self.retry_backoff_secs),
            supervise_interval: Duration::from_millis(self.supervise_interval_ms),
            listen_backlog: self.listen_backlog,
            max_restarts: self.max_restarts,
            body_wait: BodyWait {
                ceiling: self.body_wait_ceiling,
                interval: self
                    .body_wait_sleep
                    .then(|| Duration::from_millis(self.body_wait_interval_ms)),
            },
        })
    }

    /// Settings for the transport engine.
    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            max_workers: self.max_workers,
            worker_keep_alive: self.worker_keep_alive(),
            http1_keep_alive: self.http1_keep_alive,
            http1_half_close: self.http1_half_close,
            http1_max_buf_size: self.http1_max_buf_size,
            http1_only: self.http1_only,
            #[cfg(feature = "http2")]
            http2_only: self.http2_only,
            idle_invocations: self.idle_invocations,
            max_body_size: self.max_body_size,
        }
    }
}

fn default_port() -> u16 {
    8080
}

fn default_allowed_sources() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_start_attempts() -> u32 {
    12
}

fn default_retry_backoff_secs() -> u64 {
    5
}

fn default_supervise_interval_ms() -> u64 {
    1000
}

fn default_listen_backlog() -> i32 {
    1024
}

fn default_body_wait_interval_ms() -> u64 {
    10
}

fn default_body_wait_ceiling() -> u32 {
    300
}

fn default_true() -> bool {
    true
}

/// Default value for max_workers. Returns CPU count * 15.
fn default_max_workers() -> usize {
    num_cpus::get() * 15
}

fn default_keep_alive_secs() -> u64 {
    6
}

/// Default maximum buffer size (512kb).
fn default_max_buf_size() -> usize {
    524_288
}

fn default_idle_invocations() -> u32 {
    4096
}

fn default_max_body_size() -> usize {
    8 * 1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_loopback: false,
            bind_address: None,
            bind_interface: None,
            tls_key_file: None,
            tls_cert_file: None,
            allowed_sources: default_allowed_sources(),
            start_attempts: default_start_attempts(),
            retry_backoff_secs: default_retry_backoff_secs(),
            supervise_interval_ms: default_supervise_interval_ms(),
            listen_backlog: default_listen_backlog(),
            max_restarts: None,
            body_wait_interval_ms: default_body_wait_interval_ms(),
            body_wait_ceiling: default_body_wait_ceiling(),
            body_wait_sleep: true,
            max_workers: default_max_workers(),
            worker_keep_alive_secs: default_keep_alive_secs(),
            http1_keep_alive: true,
            http1_half_close: false,
            http1_max_buf_size: default_max_buf_size(),
            http1_only: false,
            #[cfg(feature = "http2")]
            http2_only: false,
            idle_invocations: default_idle_invocations(),
            max_body_size: default_max_body_size(),
        }
    }
}

/// Runtime settings of the daemon.
///
/// Changes made through [`OptionsHandle::update`](crate::OptionsHandle::update)
/// take effect at the next supervision tick, which restarts the daemon.
#[derive(Clone)]
pub struct ServerOptions {
    pub bind_loopback: bool,
    pub bind_address: Option<String>,
    pub bind_interface: Option<String>,
    /// Serve TLS with this key and certificate.
    pub certificate: Option<Certificate>,
    pub allowed_sources: Vec<String>,
    pub should_terminate: Option<TerminatePredicate>,
    pub start_attempts: u32,
    pub retry_backoff: Duration,
    pub supervise_interval: Duration,
    pub listen_backlog: i32,
    pub max_restarts: Option<u32>,
    pub body_wait: BodyWait,
}

impl ServerOptions {
    /// Sets the predicate polled by the supervision loop.
    pub fn terminate_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.should_terminate = Some(Arc::new(predicate));
        self
    }

    /// Resolves the address the daemon listens on.
    pub fn bind_addr(&self, port: u16) -> Result<SocketAddr> {
        let ip = if self.bind_loopback {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            match self.bind_address.as_deref().map(str::trim) {
                Some(literal) if !literal.is_empty() => literal
                    .parse::<IpAddr>()
                    .map_err(|_| Error::InvalidBindAddress(literal.to_string()))?,
                _ => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            }
        };
        Ok(SocketAddr::new(ip, port))
    }

    pub fn allow_list(&self) -> AllowList {
        AllowList::new(self.allowed_sources.iter().cloned())
    }

    pub fn terminate_requested(&self) -> bool {
        self.should_terminate
            .as_ref()
            .map(|predicate| predicate())
            .unwrap_or(false)
    }
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            bind_loopback: false,
            bind_address: None,
            bind_interface: None,
            certificate: None,
            allowed_sources: default_allowed_sources(),
            should_terminate: None,
            start_attempts: default_start_attempts(),
            retry_backoff: Duration::from_secs(default_retry_backoff_secs()),
            supervise_interval: Duration::from_millis(default_supervise_interval_ms()),
            listen_backlog: default_listen_backlog(),
            max_restarts: None,
            body_wait: BodyWait::default(),
        }
    }
}

impl fmt::Debug for ServerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerOptions")
            .field("bind_loopback", &self.bind_loopback)
            .field("bind_address", &self.bind_address)
            .field("bind_interface", &self.bind_interface)
            .field("certificate", &self.certificate)
            .field("allowed_sources", &self.allowed_sources)
            .field("should_terminate", &self.should_terminate.is_some())
            .field("start_attempts", &self.start_attempts)
            .field("retry_backoff", &self.retry_backoff)
            .field("supervise_interval", &self.supervise_interval)
            .field("listen_backlog", &self.listen_backlog)
            .field("max_restarts", &self.max_restarts)
            .field("body_wait", &self.body_wait)
            .finish()
    }
}

/// Settings of the hyper transport and its worker pool.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_workers: usize,
    pub worker_keep_alive: Duration,
    pub http1_keep_alive: bool,
    pub http1_half_close: bool,
    pub http1_max_buf_size: usize,
    pub http1_only: bool,
    #[cfg(feature = "http2")]
    pub http2_only: bool,
    pub idle_invocations: u32,
    pub max_body_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        ServerConfig::default().engine()
    }
}
