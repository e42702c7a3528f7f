use std::path::Path;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};

/// Default listen port for the relay.
pub const DEFAULT_PORT: u16 = 9234;

/// Relay configuration, layered from defaults, `relay.toml`, and
/// `CDP_RELAY_*` environment variables. CLI flags are applied on top by the
/// subcommands.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub limits: LimitsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface to bind. The relay is designed for host-local use.
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Bearer token required on `/cdp` upgrades. When unset, only loopback
    /// peers and non-browser clients (no Origin header) are admitted.
    pub bearer_token: Option<String>,
    /// Exact Origin values admitted on `/extension`. Empty means any
    /// `chrome-extension://` origin.
    pub extension_origins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Deadline for a command forwarded to the extension.
    pub request_timeout_ms: u64,
    /// Per-socket outbound queue depth. A consumer that falls this far
    /// behind is dropped rather than allowed to block the broker.
    pub write_queue_capacity: usize,
    /// How long a closing socket may spend draining its queue.
    pub drain_grace_ms: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            write_queue_capacity: 256,
            drain_grace_ms: 5_000,
        }
    }
}

impl Config {
    /// Load configuration. An explicit `path` must exist; the implicit
    /// `relay.toml` is optional.
    pub fn load(path: Option<&Path>) -> Result<Config> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        figment = match path {
            Some(p) => {
                if !p.exists() {
                    return Err(RelayError::Config(format!(
                        "Config file not found: {}",
                        p.display()
                    )));
                }
                figment.merge(Toml::file(p))
            }
            None => figment.merge(Toml::file("relay.toml")),
        };
        figment
            .merge(Env::prefixed("CDP_RELAY_").split("__"))
            .extract()
            .map_err(|e| RelayError::Config(e.to_string()))
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
