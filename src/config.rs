//! Configuration.
//!
//! The servers load a TOML file with sensible defaults; the environment
//! variables the deployment images already use (`SSH_HOST`, `SSH_PORT`,
//! `SSH_AUTHORIZED_KEYS`, `AUTH_URL`, `AUTH_TOKEN`) override it. The
//! outbound programs (`forward`, `manager`) are configured from the
//! environment alone.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Server configuration shared by the `web`, `pubsub` and `forward`
/// subcommands.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// SSH listen address (default: "0.0.0.0:2222")
    pub listen_addr: String,

    /// Path to the SSH host key; generated when missing.
    pub host_key_path: PathBuf,

    /// Path to an authorized_keys file. When unset and no auth service is
    /// configured, every key is accepted.
    pub authorized_keys: Option<PathBuf>,

    /// HTTP auth service endpoint; takes precedence over the keys file.
    pub auth_url: Option<String>,

    /// Bearer token sent to the auth service.
    pub auth_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("/var/lib"))
            .join("tunman");

        Self {
            listen_addr: "0.0.0.0:2222".to_string(),
            host_key_path: data_dir.join("host_key"),
            authorized_keys: None,
            auth_url: None,
            auth_token: None,
        }
    }
}

impl ServerConfig {
    /// Read the TOML file at `path`; a missing file means defaults. Other
    /// read errors and parse errors are reported, not papered over.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read config file: {}", path.display()));
            }
        };
        toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))
    }

    /// Apply the environment overrides the deployment images set.
    pub fn apply_env(&mut self) {
        self.apply_env_from(&env_lookup);
    }

    fn apply_env_from(&mut self, env: &dyn Fn(&str) -> Option<String>) {
        let host = env("SSH_HOST");
        let port = env("SSH_PORT");
        if host.is_some() || port.is_some() {
            let (default_host, default_port) = self
                .listen_addr
                .rsplit_once(':')
                .map(|(h, p)| (h.to_string(), p.to_string()))
                .unwrap_or_else(|| ("0.0.0.0".to_string(), "2222".to_string()));
            self.listen_addr = format!(
                "{}:{}",
                host.unwrap_or(default_host),
                port.unwrap_or(default_port)
            );
        }
        if let Some(path) = env("SSH_AUTHORIZED_KEYS") {
            self.authorized_keys = Some(PathBuf::from(path));
        }
        if let Some(url) = env("AUTH_URL") {
            self.auth_url = Some(url);
        }
        if let Some(token) = env("AUTH_TOKEN") {
            self.auth_token = Some(token);
        }
    }

    /// Ensure the host key directory exists.
    pub fn ensure_dirs(&self) -> Result<()> {
        if let Some(parent) = self.host_key_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create host key directory: {}", parent.display())
            })?;
        }
        Ok(())
    }
}

/// Outbound SSH client settings shared by `forward` and `manager`.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// `host:port` of the upstream SSH server (`REMOTE_HOST`).
    pub remote_host: String,

    /// Display name of the upstream, for logs (`REMOTE_HOSTNAME`).
    pub remote_hostname: String,

    /// User to authenticate as (`REMOTE_USER`).
    pub remote_user: String,

    /// Private key path (`KEY_LOCATION`), optionally passphrase-protected
    /// (`KEY_PASSPHRASE`).
    pub key_location: PathBuf,
    pub key_passphrase: Option<String>,

    /// Optional SHA256 host key pin (`HOST_KEY_FINGERPRINT`). Unset means
    /// any host key is accepted.
    pub host_key_fingerprint: Option<String>,
}

impl UpstreamConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(&env_lookup)
    }

    fn from_lookup(env: &dyn Fn(&str) -> Option<String>) -> Result<Self> {
        let remote_host = required(env, "REMOTE_HOST")?;
        let remote_hostname = env("REMOTE_HOSTNAME").unwrap_or_else(|| remote_host.clone());
        Ok(Self {
            remote_host,
            remote_hostname,
            remote_user: required(env, "REMOTE_USER")?,
            key_location: PathBuf::from(required(env, "KEY_LOCATION")?),
            key_passphrase: env("KEY_PASSPHRASE"),
            host_key_fingerprint: env("HOST_KEY_FINGERPRINT"),
        })
    }
}

/// Configuration for the `forward` server's fixed backend.
#[derive(Debug, Clone)]
pub struct RawForwardConfig {
    pub upstream: UpstreamConfig,

    /// `tcp` or `unix` (`REMOTE_PROTOCOL`).
    pub remote_protocol: String,

    /// Backend address dialed through the upstream (`REMOTE_ADDRESS`).
    pub remote_address: String,
}

impl RawForwardConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(&env_lookup)
    }

    fn from_lookup(env: &dyn Fn(&str) -> Option<String>) -> Result<Self> {
        Ok(Self {
            upstream: UpstreamConfig::from_lookup(env)?,
            remote_protocol: env("REMOTE_PROTOCOL").unwrap_or_else(|| "tcp".to_string()),
            remote_address: required(env, "REMOTE_ADDRESS")?,
        })
    }
}

/// Configuration for the container tunnel manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub upstream: UpstreamConfig,

    /// Networks to monitor (`NETWORKS`, comma-separated). When unset the
    /// manager inspects its own container and uses its networks.
    pub networks: Option<Vec<String>>,

    /// Health endpoint bind address (`HEALTH_ADDR`).
    pub health_addr: String,
}

impl ManagerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(&env_lookup)
    }

    fn from_lookup(env: &dyn Fn(&str) -> Option<String>) -> Result<Self> {
        let networks = env("NETWORKS").map(|raw| parse_network_list(&raw));
        Ok(Self {
            upstream: UpstreamConfig::from_lookup(env)?,
            networks,
            health_addr: env("HEALTH_ADDR").unwrap_or_else(|| "127.0.0.1:8080".to_string()),
        })
    }
}

/// Normalize a comma-separated network list: trimmed, lowercased, no
/// empties.
pub fn parse_network_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|network| network.trim().to_lowercase())
        .filter(|network| !network.is_empty())
        .collect()
}

fn env_lookup(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn required(env: &dyn Fn(&str) -> Option<String>, name: &str) -> Result<String> {
    env(name).with_context(|| format!("required environment variable {name} is not set"))
}
