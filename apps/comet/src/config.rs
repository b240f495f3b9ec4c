use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::gateway::bucket::ConnectionPolicy;

/// Comet configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Plain TCP listener address.
    pub tcp_bind: SocketAddr,
    /// Plain WebSocket listener address.
    pub ws_bind: SocketAddr,
    /// TLS WebSocket listener address. Requires `tls_cert` and `tls_key`.
    pub wss_bind: Option<SocketAddr>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    /// Control-plane HTTP listener address.
    pub control_bind: SocketAddr,
    /// HS256 secret used to validate client auth tokens.
    pub jwt_secret: String,
    pub gateway: GatewayConfig,
    /// Comma-separated user ids; empty means every user is allowed.
    pub whitelist: Vec<String>,
    pub discovery: DiscoveryConfig,
}

/// Tunables for the connection core.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Number of buckets (shards). Fixed for the life of the process.
    pub buckets: usize,
    /// Largest accepted frame body in bytes.
    pub max_body: usize,
    /// Outbound queue bound per channel.
    pub queue_size: usize,
    /// Deadline for the transport handshake plus the AUTH frame.
    pub auth_timeout: Duration,
    /// A channel with no heartbeat for this long is closed.
    pub heartbeat_timeout: Duration,
    /// Dropped pushes tolerated before a slow consumer is closed.
    pub slow_consumer_threshold: u32,
    /// How long a closing channel may spend flushing its queue.
    pub drain_timeout: Duration,
    /// Upper bound on graceful shutdown before channels are force-closed.
    pub shutdown_grace: Duration,
    pub connection_policy: ConnectionPolicy,
}

/// Service-directory registration settings.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Directory node URL. `None` disables registration.
    pub url: Option<String>,
    pub server_tick: Duration,
    pub region: String,
    pub zone: String,
    pub env: String,
    pub hostname: String,
    pub weight: u32,
    /// Public addresses of this node, published as `ip_addrs`.
    pub ip_addrs: Vec<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            buckets: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            max_body: comet_common::frame::DEFAULT_MAX_BODY,
            queue_size: 64,
            auth_timeout: Duration::from_secs(8),
            heartbeat_timeout: Duration::from_secs(240),
            slow_consumer_threshold: 1,
            drain_timeout: Duration::from_millis(500),
            shutdown_grace: Duration::from_secs(10),
            connection_policy: ConnectionPolicy::Multi,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Panics with a descriptive message if a required variable is missing
    /// or a value does not parse.
    pub fn from_env() -> Self {
        let defaults = GatewayConfig::default();
        let gateway = GatewayConfig {
            buckets: parsed_var("COMET_BUCKETS").unwrap_or(defaults.buckets).max(1),
            max_body: parsed_var("COMET_MAX_BODY").unwrap_or(defaults.max_body),
            queue_size: parsed_var("COMET_QUEUE_SIZE")
                .unwrap_or(defaults.queue_size)
                .max(1),
            auth_timeout: parsed_var("COMET_AUTH_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.auth_timeout),
            heartbeat_timeout: parsed_var("COMET_HEARTBEAT_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.heartbeat_timeout),
            slow_consumer_threshold: parsed_var("COMET_SLOW_CONSUMER_THRESHOLD")
                .unwrap_or(defaults.slow_consumer_threshold)
                .max(1),
            drain_timeout: parsed_var("COMET_DRAIN_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.drain_timeout),
            shutdown_grace: parsed_var("COMET_SHUTDOWN_GRACE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.shutdown_grace),
            connection_policy: parsed_var("COMET_CONNECTION_POLICY")
                .unwrap_or(defaults.connection_policy),
        };

        let hostname = optional_var("COMET_HOSTNAME")
            .or_else(|| optional_var("HOSTNAME"))
            .unwrap_or_else(|| "localhost".to_string());

        Self {
            tcp_bind: parsed_var("COMET_TCP_BIND")
                .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 3101))),
            ws_bind: parsed_var("COMET_WS_BIND")
                .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 3102))),
            wss_bind: parsed_var("COMET_WSS_BIND"),
            tls_cert: optional_var("COMET_TLS_CERT").map(PathBuf::from),
            tls_key: optional_var("COMET_TLS_KEY").map(PathBuf::from),
            control_bind: parsed_var("COMET_CONTROL_BIND")
                .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 3109))),
            jwt_secret: required_var("COMET_JWT_SECRET"),
            gateway,
            whitelist: optional_var("COMET_WHITELIST")
                .map(|v| split_list(&v))
                .unwrap_or_default(),
            discovery: DiscoveryConfig {
                url: optional_var("COMET_DISCOVERY_URL"),
                server_tick: parsed_var("COMET_SERVER_TICK_SECS")
                    .map(Duration::from_secs)
                    .unwrap_or(Duration::from_secs(10)),
                region: optional_var("COMET_REGION").unwrap_or_else(|| "local".to_string()),
                zone: optional_var("COMET_ZONE").unwrap_or_else(|| "local".to_string()),
                env: optional_var("COMET_ENV").unwrap_or_else(|| "dev".to_string()),
                hostname,
                weight: parsed_var("COMET_WEIGHT").unwrap_or(10),
                ip_addrs: optional_var("COMET_IP_ADDRS")
                    .map(|v| split_list(&v))
                    .unwrap_or_default(),
            },
        }
    }
}

fn required_var(name: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| panic!("{name} env var is required"))
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.trim().is_empty())
}

fn parsed_var<T: FromStr>(name: &str) -> Option<T> {
    optional_var(name).map(|v| {
        v.trim()
            .parse()
            .unwrap_or_else(|_| panic!("{name} has an invalid value: {v}"))
    })
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
