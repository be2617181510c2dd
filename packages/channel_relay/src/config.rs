use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::RelayError;

// =============================================================================
// File config (figment-deserialized from defaults / relay.toml / env / CLI)
// =============================================================================
//
// Equivalent ways to configure:
//
//   relay.toml:      [identity]
//                    enabled = false
//
//   env var:         RELAY_IDENTITY__ENABLED=false   (double underscore = nesting)
//                    PORT=9000                       (bare, shorthand for server.port)
//
//   CLI:             relay --noid --port 9000

pub const ENV_PREFIX: &str = "RELAY_";
pub const DEFAULT_CONFIG_FILE: &str = "relay.toml";

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub identity: IdentityFileConfig,
    #[serde(default)]
    pub logging: LoggingFileConfig,
    #[serde(default)]
    pub tls: TlsFileConfig,
}

/// Listener settings (lives under `[server]` in relay.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Identity assignment (lives under `[identity]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IdentityFileConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for IdentityFileConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Log verbosity (lives under `[logging]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingFileConfig {
    #[serde(default = "default_true")]
    pub verbose: bool,
}

impl Default for LoggingFileConfig {
    fn default() -> Self {
        Self { verbose: true }
    }
}

/// PEM certificate chain and private key (lives under `[tls]`).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TlsFileConfig {
    #[serde(default)]
    pub cert: Option<PathBuf>,
    #[serde(default)]
    pub key: Option<PathBuf>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

/// Build a figment that layers: defaults → relay.toml → RELAY_* env → PORT.
///
/// `config_file` replaces the default `relay.toml` in the working directory.
/// A missing file is not an error.
pub fn load_config(config_file: Option<&Path>) -> Figment {
    use figment::providers::{Env, Format, Serialized, Toml};

    let file = config_file
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(file))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .merge(Env::raw().only(&["PORT"]).map(|_| "server.port".into()))
}

/// Command-line values. Set fields win over every other layer.
#[derive(Clone, Debug, Default)]
pub struct CliOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub no_identity: bool,
    pub no_log: bool,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
}

impl CliOverrides {
    pub fn apply(&self, figment: Figment) -> Figment {
        use figment::providers::Serialized;

        let mut figment = figment;
        if let Some(host) = &self.host {
            figment = figment.merge(Serialized::default("server.host", host));
        }
        if let Some(port) = self.port {
            figment = figment.merge(Serialized::default("server.port", port));
        }
        if self.no_identity {
            figment = figment.merge(Serialized::default("identity.enabled", false));
        }
        if self.no_log {
            figment = figment.merge(Serialized::default("logging.verbose", false));
        }
        if let Some(cert) = &self.cert {
            figment = figment.merge(Serialized::default("tls.cert", cert));
        }
        if let Some(key) = &self.key {
            figment = figment.merge(Serialized::default("tls.key", key));
        }
        figment
    }
}

// =============================================================================
// Runtime config (derived from FileConfig)
// =============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub bind_addr: SocketAddr,
    /// Assign identity tokens and announce departures
    pub identity: bool,
    /// Log per-connection and per-message detail
    pub verbose: bool,
    /// Serve over TLS when set
    pub tls: Option<TlsConfig>,
}

impl RelayConfig {
    pub fn from_file(fc: &FileConfig) -> Result<Self, RelayError> {
        let ip = fc
            .server
            .host
            .parse::<IpAddr>()
            .map_err(|source| RelayError::InvalidBindAddress {
                addr: fc.server.host.clone(),
                source,
            })?;

        let tls = match (&fc.tls.cert, &fc.tls.key) {
            (Some(cert), Some(key)) => Some(TlsConfig {
                cert: cert.clone(),
                key: key.clone(),
            }),
            (None, None) => None,
            (Some(_), None) => return Err(RelayError::IncompleteTls { missing: "key" }),
            (None, Some(_)) => return Err(RelayError::IncompleteTls { missing: "cert" }),
        };

        Ok(Self {
            bind_addr: SocketAddr::new(ip, fc.server.port),
            identity: fc.identity.enabled,
            verbose: fc.logging.verbose,
            tls,
        })
    }

    /// Default `tracing` directive for this verbosity; `RUST_LOG` overrides it.
    pub fn log_directive(&self) -> &'static str {
        if self.verbose {
            "channel_relay=debug,relay=debug,tower_http=info,info"
        } else {
            "channel_relay=info,relay=info,warn"
        }
    }
}
