//! Outer configuration layer: command-line parsing, TOML deserialization,
//! and validation. The core (session/supervisor/engine) never touches the
//! file system or `clap`; it only ever sees the validated [`TunnelConfig`]
//! and already-loaded TLS material produced here.

use std::{
    fs::read_to_string,
    net::{IpAddr, SocketAddr},
    path::PathBuf,
};

use clap::Parser;
use serde::Deserialize;

use crate::error::{CoreError, CoreResult};
use crate::transport::TlsMaterial;

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Server,
    Client,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum TlsVersionFloor {
    Tls12,
    Tls13,
}

impl Default for TlsVersionFloor {
    fn default() -> Self {
        Self::Tls12
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct InterfaceConfig {
    /// Device name or, when `server.max-sessions > 1`, a name template
    /// containing `{id}`, substituted with the session index per connection.
    pub name: String,
    pub address: IpAddr,
    pub netmask: IpAddr,
    #[serde(default = "InterfaceConfig::mtu")]
    pub mtu: u16,
}

impl InterfaceConfig {
    fn mtu() -> u16 {
        1500
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct TlsConfig {
    pub certificate_chain: PathBuf,
    pub private_key: PathBuf,
    pub trusted_cas: Vec<PathBuf>,
    #[serde(default)]
    pub min_version: TlsVersionFloor,
    /// Server name the client presents via SNI; the server validates its
    /// own chain presentation against it when set.
    #[serde(default)]
    pub server_name: Option<String>,
    /// Cipher suite allow-list, by rustls suite name (e.g.
    /// `TLS13_AES_256_GCM_SHA384`). Empty means "accept the crypto
    /// provider's defaults".
    #[serde(default)]
    pub cipher_suites: Vec<String>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct ReconnectPolicy {
    #[serde(default = "ReconnectPolicy::initial_ms")]
    pub initial_ms: u64,
    #[serde(default = "ReconnectPolicy::max_ms")]
    pub max_ms: u64,
    #[serde(default = "ReconnectPolicy::multiplier")]
    pub multiplier: f64,
    #[serde(default = "ReconnectPolicy::jitter")]
    pub jitter: f64,
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl ReconnectPolicy {
    fn initial_ms() -> u64 {
        500
    }

    fn max_ms() -> u64 {
        30_000
    }

    fn multiplier() -> f64 {
        2.0
    }

    fn jitter() -> f64 {
        0.2
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_ms: Self::initial_ms(),
            max_ms: Self::max_ms(),
            multiplier: Self::multiplier(),
            jitter: Self::jitter(),
            max_attempts: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct ServerTransportConfig {
    pub listen: SocketAddr,
    #[serde(default = "ServerTransportConfig::max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "ServerTransportConfig::handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "ServerTransportConfig::drain_grace_ms")]
    pub drain_grace_ms: u64,
}

impl ServerTransportConfig {
    fn max_sessions() -> usize {
        1
    }

    fn handshake_timeout_ms() -> u64 {
        10_000
    }

    fn drain_grace_ms() -> u64 {
        2_000
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct ClientTransportConfig {
    pub peer: SocketAddr,
    #[serde(default = "ClientTransportConfig::connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "ClientTransportConfig::handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
    #[serde(default = "ClientTransportConfig::drain_grace_ms")]
    pub drain_grace_ms: u64,
}

impl ClientTransportConfig {
    fn connect_timeout_ms() -> u64 {
        10_000
    }

    fn handshake_timeout_ms() -> u64 {
        10_000
    }

    fn drain_grace_ms() -> u64 {
        2_000
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RateLimitDirection {
    Both,
    EgressOnly,
    IngressOnly,
}

impl Default for RateLimitDirection {
    fn default() -> Self {
        Self::Both
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct RateLimitConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "RateLimitConfig::rate_bytes_per_sec")]
    pub rate_bytes_per_sec: u64,
    #[serde(default = "RateLimitConfig::burst_bytes")]
    pub burst_bytes: u64,
    #[serde(default = "RateLimitConfig::overhead_factor")]
    pub overhead_factor: f64,
    #[serde(default)]
    pub direction: RateLimitDirection,
}

impl RateLimitConfig {
    fn rate_bytes_per_sec() -> u64 {
        10_000_000
    }

    fn burst_bytes() -> u64 {
        1_000_000
    }

    fn overhead_factor() -> f64 {
        1.05
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rate_bytes_per_sec: Self::rate_bytes_per_sec(),
            burst_bytes: Self::burst_bytes(),
            overhead_factor: Self::overhead_factor(),
            direction: RateLimitDirection::default(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone, Copy)]
#[serde(rename_all = "kebab-case")]
pub struct Log {
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    pub role: Role,
    pub interface: InterfaceConfig,
    pub tls: TlsConfig,
    #[serde(default)]
    pub server: Option<ServerTransportConfig>,
    #[serde(default)]
    pub client: Option<ClientTransportConfig>,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub log: Log,
    /// Transport-internal keepalive cadence (§4.3). Off by default; unset
    /// disables heartbeats entirely.
    #[serde(default)]
    pub keepalive_interval_ms: Option<u64>,
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, short)]
    config: String,
}

impl Config {
    /// Load configuration from the file named on the command line.
    pub fn load() -> anyhow::Result<Self> {
        let cli = Cli::parse();
        let text = read_to_string(&cli.config)?;
        Ok(toml::from_str(&text)?)
    }

    /// Validate cross-field invariants the schema alone can't express:
    /// `max-sessions > 1` requires a `{id}`-templated interface name, among
    /// others.
    pub fn validate(&self) -> CoreResult<()> {
        match self.role {
            Role::Server => {
                let server = self
                    .server
                    .as_ref()
                    .ok_or_else(|| CoreError::ConfigInvalid("server role requires [server]".into()))?;

                if server.max_sessions == 0 {
                    return Err(CoreError::ConfigInvalid("max-sessions must be >= 1".into()));
                }

                if server.max_sessions > 1 && !self.interface.name.contains("{id}") {
                    return Err(CoreError::ConfigInvalid(
                        "max-sessions > 1 requires interface.name to contain \"{id}\"".into(),
                    ));
                }
            }
            Role::Client => {
                if self.client.is_none() {
                    return Err(CoreError::ConfigInvalid("client role requires [client]".into()));
                }
            }
        }

        if self.tls.trusted_cas.is_empty() {
            return Err(CoreError::ConfigInvalid(
                "at least one trusted CA is required for mutual authentication".into(),
            ));
        }

        if self.rate_limit.enabled && self.rate_limit.rate_bytes_per_sec == 0 {
            return Err(CoreError::ConfigInvalid("rate-bytes-per-sec must be > 0".into()));
        }

        if self.interface.mtu == 0 {
            return Err(CoreError::ConfigInvalid("mtu must be > 0".into()));
        }

        crate::transport::validate_cipher_suite_names(&self.tls.cipher_suites)?;

        Ok(())
    }

    /// Load the PEM-encoded certificate chain, private key, and CA set named
    /// by `self.tls` into rustls-native types. This is the one place the
    /// ambient layer touches the file system for crypto material; the core
    /// never does (§6).
    pub fn load_tls_material(&self) -> CoreResult<TlsMaterial> {
        TlsMaterial::load(&self.tls)
    }
}
