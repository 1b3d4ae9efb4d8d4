//! Client configuration.
//!
//! Supports programmatic construction via `ClientConfig::default()` plus
//! field tweaks, or loading from a TOML file with `[timeouts]`, `[routing]`,
//! `[features]`, and `[buffers]` sections.
//!
//! Also parses server specification strings: `host[:port][ alias]`, with a
//! leading `/` marking a UNIX-domain socket path.

use crate::hash::HashFunction;
use crate::io::MIN_BLOCK_CAPACITY;
use serde::Deserialize;
use std::path::PathBuf;
use std::str::FromStr;

/// Default memcached TCP port.
pub const DEFAULT_PORT: u16 = 11211;

/// Resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Overall poll deadline for one user call, in milliseconds.
    pub poll_timeout_ms: u64,
    /// Per-round connect poll deadline, in milliseconds.
    pub connect_timeout_ms: u64,
    /// Back-off before a dead server is probed again, in seconds.
    pub retry_timeout_s: u64,
    /// Reconnect attempts allowed within one user call.
    pub max_retries: u32,
    /// Hash used to place keys on the continuum.
    pub hash_function: HashFunction,
    /// Route around dead servers by walking the continuum forward.
    pub enable_failover: bool,
    /// flush_all is refused unless explicitly enabled.
    pub enable_flush_all: bool,
    /// Minimum capacity of receive buffer blocks.
    pub min_block_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: default_poll_ms(),
            connect_timeout_ms: default_connect_ms(),
            retry_timeout_s: default_retry_s(),
            max_retries: 0,
            hash_function: HashFunction::default(),
            enable_failover: false,
            enable_flush_all: false,
            min_block_size: MIN_BLOCK_CAPACITY,
        }
    }
}

impl ClientConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let contents =
            std::fs::read_to_string(&path).map_err(|e| ConfigError::FileRead(path.clone(), e))?;
        let toml_config: TomlConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::TomlParse(path, e))?;
        Ok(toml_config.resolve())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(contents: &str) -> Result<Self, toml::de::Error> {
        let toml_config: TomlConfig = toml::from_str(contents)?;
        Ok(toml_config.resolve())
    }
}

/// TOML configuration file structure.
#[derive(Debug, Deserialize, Default)]
struct TomlConfig {
    #[serde(default)]
    timeouts: TimeoutsConfig,
    #[serde(default)]
    routing: RoutingConfig,
    #[serde(default)]
    features: FeaturesConfig,
    #[serde(default)]
    buffers: BuffersConfig,
}

impl TomlConfig {
    fn resolve(self) -> ClientConfig {
        ClientConfig {
            poll_timeout_ms: self.timeouts.poll_ms,
            connect_timeout_ms: self.timeouts.connect_ms,
            retry_timeout_s: self.timeouts.retry_s,
            max_retries: self.timeouts.max_retries,
            hash_function: self.routing.hash_function,
            enable_failover: self.routing.enable_failover,
            enable_flush_all: self.features.enable_flush_all,
            min_block_size: self.buffers.min_block_size,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TimeoutsConfig {
    #[serde(default = "default_poll_ms")]
    poll_ms: u64,
    #[serde(default = "default_connect_ms")]
    connect_ms: u64,
    #[serde(default = "default_retry_s")]
    retry_s: u64,
    #[serde(default)]
    max_retries: u32,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            poll_ms: default_poll_ms(),
            connect_ms: default_connect_ms(),
            retry_s: default_retry_s(),
            max_retries: 0,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct RoutingConfig {
    #[serde(default)]
    hash_function: HashFunction,
    #[serde(default)]
    enable_failover: bool,
}

#[derive(Debug, Deserialize, Default)]
struct FeaturesConfig {
    #[serde(default)]
    enable_flush_all: bool,
}

#[derive(Debug, Deserialize)]
struct BuffersConfig {
    #[serde(default = "default_min_block_size")]
    min_block_size: usize,
}

impl Default for BuffersConfig {
    fn default() -> Self {
        Self {
            min_block_size: default_min_block_size(),
        }
    }
}

fn default_poll_ms() -> u64 {
    300
}

fn default_connect_ms() -> u64 {
    10
}

fn default_retry_s() -> u64 {
    5
}

fn default_min_block_size() -> usize {
    MIN_BLOCK_CAPACITY
}

/// One server address: `host[:port][ alias]`.
///
/// A leading `/` marks a UNIX-domain path, which never carries a port
/// (`port == 0`). A host accepts at most one unescaped `:port` suffix,
/// digits only. A backslash escapes the next character inside the host/path
/// field; an unescaped space starts the alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSpec {
    pub host: String,
    pub port: u16,
    pub alias: Option<String>,
}

impl ServerSpec {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            alias: None,
        }
    }

    pub fn unix(path: impl Into<String>) -> Self {
        Self {
            host: path.into(),
            port: 0,
            alias: None,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn is_unix(&self) -> bool {
        self.port == 0 && self.host.starts_with('/')
    }
}

impl FromStr for ServerSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut field = String::new();
        let mut unescaped_colons = Vec::new();
        let mut alias_part: Option<&str> = None;
        let mut escaped = false;
        for (i, c) in s.char_indices() {
            if escaped {
                field.push(c);
                escaped = false;
                continue;
            }
            match c {
                '\\' => escaped = true,
                ' ' => {
                    alias_part = Some(&s[i + 1..]);
                    break;
                }
                ':' => {
                    unescaped_colons.push(field.len());
                    field.push(':');
                }
                _ => field.push(c),
            }
        }
        if escaped {
            return Err(ConfigError::InvalidServer(
                s.to_string(),
                "trailing backslash",
            ));
        }
        if field.is_empty() {
            return Err(ConfigError::InvalidServer(s.to_string(), "empty host"));
        }
        let alias = alias_part
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(String::from);

        // a path never has a port; colons inside it are literal
        if field.starts_with('/') {
            return Ok(ServerSpec {
                host: field,
                port: 0,
                alias,
            });
        }

        match unescaped_colons.as_slice() {
            [] => Ok(ServerSpec {
                host: field,
                port: DEFAULT_PORT,
                alias,
            }),
            [pos] => {
                let (host, suffix) = field.split_at(*pos);
                let port_str = &suffix[1..];
                if host.is_empty() {
                    return Err(ConfigError::InvalidServer(s.to_string(), "empty host"));
                }
                if port_str.is_empty() || !port_str.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(ConfigError::InvalidServer(
                        s.to_string(),
                        "port must be digits",
                    ));
                }
                let port = port_str
                    .parse::<u16>()
                    .map_err(|_| ConfigError::InvalidServer(s.to_string(), "port out of range"))?;
                Ok(ServerSpec {
                    host: host.to_string(),
                    port,
                    alias,
                })
            }
            _ => Err(ConfigError::InvalidServer(
                s.to_string(),
                "more than one port separator",
            )),
        }
    }
}

/// Configuration loading and parsing errors.
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidServer(String, &'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::InvalidServer(spec, reason) => {
                write!(f, "invalid server spec '{spec}': {reason}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.poll_timeout_ms, 300);
        assert_eq!(config.connect_timeout_ms, 10);
        assert_eq!(config.retry_timeout_s, 5);
        assert_eq!(config.max_retries, 0);
        assert_eq!(config.hash_function, HashFunction::Md5);
        assert!(!config.enable_failover);
        assert!(!config.enable_flush_all);
        assert_eq!(config.min_block_size, 8192);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [timeouts]
            poll_ms = 500
            connect_ms = 25
            retry_s = 10
            max_retries = 3

            [routing]
            hash_function = "fnv1a_32"
            enable_failover = true

            [features]
            enable_flush_all = true

            [buffers]
            min_block_size = 4096
        "#;
        let config = ClientConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.poll_timeout_ms, 500);
        assert_eq!(config.connect_timeout_ms, 25);
        assert_eq!(config.retry_timeout_s, 10);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.hash_function, HashFunction::Fnv1a);
        assert!(config.enable_failover);
        assert!(config.enable_flush_all);
        assert_eq!(config.min_block_size, 4096);
    }

    #[test]
    fn test_toml_partial_sections_fall_back_to_defaults() {
        let config = ClientConfig::from_toml_str("[routing]\nenable_failover = true\n").unwrap();
        assert!(config.enable_failover);
        assert_eq!(config.poll_timeout_ms, 300);
        assert_eq!(config.min_block_size, 8192);
    }

    #[test]
    fn test_server_spec_host_only() {
        let spec: ServerSpec = "cache-a.example.com".parse().unwrap();
        assert_eq!(spec.host, "cache-a.example.com");
        assert_eq!(spec.port, DEFAULT_PORT);
        assert_eq!(spec.alias, None);
        assert!(!spec.is_unix());
    }

    #[test]
    fn test_server_spec_host_port_alias() {
        let spec: ServerSpec = "10.0.0.1:11212 main".parse().unwrap();
        assert_eq!(spec.host, "10.0.0.1");
        assert_eq!(spec.port, 11212);
        assert_eq!(spec.alias.as_deref(), Some("main"));
    }

    #[test]
    fn test_server_spec_unix_path() {
        let spec: ServerSpec = "/var/run/memcached.sock".parse().unwrap();
        assert_eq!(spec.host, "/var/run/memcached.sock");
        assert_eq!(spec.port, 0);
        assert!(spec.is_unix());

        // colons in a path are literal, not port separators
        let spec: ServerSpec = "/tmp/mc:0.sock backup".parse().unwrap();
        assert_eq!(spec.host, "/tmp/mc:0.sock");
        assert_eq!(spec.port, 0);
        assert_eq!(spec.alias.as_deref(), Some("backup"));
    }

    #[test]
    fn test_server_spec_escaped_space_in_path() {
        let spec: ServerSpec = r"/tmp/with\ space.sock".parse().unwrap();
        assert_eq!(spec.host, "/tmp/with space.sock");
        assert_eq!(spec.alias, None);
    }

    #[test]
    fn test_server_spec_escaped_backslash() {
        let spec: ServerSpec = r"host\\name:11211".parse().unwrap();
        assert_eq!(spec.host, r"host\name");
        assert_eq!(spec.port, 11211);
    }

    #[test]
    fn test_server_spec_rejects_bad_ports() {
        assert!("host:".parse::<ServerSpec>().is_err());
        assert!("host:abc".parse::<ServerSpec>().is_err());
        assert!("host:70000".parse::<ServerSpec>().is_err());
        assert!("a:1:2".parse::<ServerSpec>().is_err());
        assert!("".parse::<ServerSpec>().is_err());
    }
}
