//! Daemon configuration.
//!
//! The configuration file is TOML with a single `httpd` table and an array
//! of `hooks` tables:
//!
//! ```toml
//! [httpd]
//! ip = "127.0.0.1"
//! port = 8080
//! content_size_limit = 262144
//!
//! [[hooks]]
//! type = "pipeline"
//! uri_path = "/deploy"
//! name = "deploy website"
//! token = "secret"
//! job_name = "build"
//! command = "/usr/local/bin/deploy.sh"
//! timeout = 300
//! run_as = { user = "deploy" }
//! ```
//!
//! Loading is two phases: serde deserialization into the typed structs
//! below, then [`Config::validate`] for the cross-field rules serde cannot
//! express (TLS pairing, timeout range, connection minimums). Hook-level
//! semantic checks (command/run_as rules, job names) happen when the hook
//! chains are built from this configuration.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Errors that make a configuration unusable.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    /// The file is not valid TOML or does not match the schema.
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    /// `connection_timeout` is outside the supported range.
    #[error("httpd.connection_timeout must be within 0..=300 seconds, got {0}")]
    ConnectionTimeoutRange(u64),

    /// Only one of certificate/private_key was given.
    #[error("httpd.certificate and httpd.private_key must be configured together")]
    IncompleteTls,

    /// A connection limit of zero would refuse all traffic.
    #[error("httpd.{0} must be at least 1")]
    ZeroConnectionLimit(&'static str),
}

/// Top-level configuration tree.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// HTTP listener settings.
    pub httpd: HttpdConfig,

    /// Webhook definitions; hooks sharing a `uri_path` form a chain in
    /// file order.
    #[serde(default)]
    pub hooks: Vec<HookConfig>,
}

/// Settings for the HTTP(S) listener.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpdConfig {
    /// Address to bind; defaults to all interfaces.
    #[serde(default = "default_ip")]
    pub ip: String,

    /// TCP port to bind.
    pub port: u16,

    /// PEM certificate chain; enables TLS together with `private_key`.
    pub certificate: Option<PathBuf>,

    /// PEM private key; enables TLS together with `certificate`.
    pub private_key: Option<PathBuf>,

    /// Cap on simultaneously served connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Cap on simultaneous connections from one peer address.
    #[serde(default = "default_max_connections_per_ip")]
    pub max_connections_per_ip: usize,

    /// Read-buffer bound per connection, in bytes.
    #[serde(default = "default_memory_limit")]
    pub memory_limit: usize,

    /// Largest accepted request body, in bytes.
    #[serde(default = "default_content_size_limit")]
    pub content_size_limit: usize,

    /// Seconds of inactivity before a connection is dropped; 0 disables
    /// the timeout. At most 300.
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: u64,
}

impl HttpdConfig {
    /// True when both PEM paths are present.
    pub fn tls_enabled(&self) -> bool {
        self.certificate.is_some() && self.private_key.is_some()
    }

    /// The inactivity timeout, `None` when disabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        match self.connection_timeout {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

/// Which behavior a hook has.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookType {
    /// Filter GitLab pipeline events by status and job name.
    Pipeline,

    /// Dump every delivery to stdout.
    Debug,
}

/// A single `[[hooks]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct HookConfig {
    /// Hook behavior selector.
    #[serde(rename = "type")]
    pub kind: HookType,

    /// URI path the hook is served on.
    pub uri_path: String,

    /// Human-readable name, used for logging and as the action name.
    pub name: String,

    /// Shared secret expected in `X-Gitlab-Token`.
    pub token: String,

    /// When set, only this peer address may trigger the hook.
    pub peer_address: Option<String>,

    /// Command line to run, split on whitespace; first word is the
    /// program path.
    pub command: Option<String>,

    /// Extra `KEY=VALUE` entries for the command's environment.
    #[serde(default)]
    pub environment: Vec<String>,

    /// Per-action timeout in seconds.
    pub timeout: Option<u64>,

    /// Identity the command runs under. Mandatory for hooks with a
    /// command when the daemon runs as root.
    pub run_as: Option<RunAsConfig>,

    /// Pipeline hooks: job name(s) that select builds.
    pub job_name: Option<StringOrList>,

    /// Pipeline hooks: accepted `object_attributes.status` value(s);
    /// absent means any status.
    pub status: Option<StringOrList>,
}

impl HookConfig {
    /// The per-action timeout as a duration.
    pub fn action_timeout(&self) -> Duration {
        self.timeout
            .map(Duration::from_secs)
            .unwrap_or(crate::queue::DEFAULT_ACTION_TIMEOUT)
    }
}

/// The `run_as` sub-table.
#[derive(Debug, Clone, Deserialize)]
pub struct RunAsConfig {
    /// User to setuid to; also selects the primary group when `group` is
    /// absent.
    pub user: String,

    /// Group to setgid to.
    pub group: Option<String>,
}

/// A TOML value that may be a single string or a list of strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum StringOrList {
    One(String),
    Many(Vec<String>),
}

impl StringOrList {
    /// Normalizes to a list.
    pub fn into_vec(self) -> Vec<String> {
        match self {
            StringOrList::One(value) => vec![value],
            StringOrList::Many(values) => values,
        }
    }
}

impl Config {
    /// Loads and validates the configuration file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Config = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Cross-field checks not expressible in the serde schema.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.httpd.connection_timeout > 300 {
            return Err(ConfigError::ConnectionTimeoutRange(
                self.httpd.connection_timeout,
            ));
        }
        if self.httpd.certificate.is_some() != self.httpd.private_key.is_some() {
            return Err(ConfigError::IncompleteTls);
        }
        if self.httpd.max_connections == 0 {
            return Err(ConfigError::ZeroConnectionLimit("max_connections"));
        }
        if self.httpd.max_connections_per_ip == 0 {
            return Err(ConfigError::ZeroConnectionLimit("max_connections_per_ip"));
        }
        Ok(())
    }
}

fn default_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_max_connections() -> usize {
    64
}

fn default_max_connections_per_ip() -> usize {
    16
}

fn default_memory_limit() -> usize {
    128 * 1024
}

fn default_content_size_limit() -> usize {
    1024 * 1024
}

fn default_connection_timeout() -> u64 {
    120
}
