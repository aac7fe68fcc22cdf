//! Connection configuration
//!
//! Settings come from three layers, later ones winning: a TOML file,
//! environment variables (optionally seeded from a `.env` file), and explicit
//! builder calls.
//!
//! ## Environment Variables
//!
//! - `ROWLINK_HOST` - Server host
//! - `ROWLINK_PORT` - Server port
//! - `ROWLINK_USER` - User name sent in the credential handshake
//! - `ROWLINK_PASSWORD` - Password sent in the credential handshake
//! - `ROWLINK_CONNECT_TIMEOUT_MS` - Socket connect timeout
//! - `ROWLINK_QUERY_TIMEOUT_MS` - Per-frame read timeout during an exchange
//! - `ROWLINK_LINGER_SECS` - SO_LINGER applied to new sockets
//! - `ROWLINK_HOLD_CURSORS` - Keep cursors open across commit (`true`/`false`)

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DriverError, DriverResult};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 7420;

pub const ENV_HOST: &str = "ROWLINK_HOST";
pub const ENV_PORT: &str = "ROWLINK_PORT";
pub const ENV_USER: &str = "ROWLINK_USER";
pub const ENV_PASSWORD: &str = "ROWLINK_PASSWORD";
pub const ENV_CONNECT_TIMEOUT_MS: &str = "ROWLINK_CONNECT_TIMEOUT_MS";
pub const ENV_QUERY_TIMEOUT_MS: &str = "ROWLINK_QUERY_TIMEOUT_MS";
pub const ENV_LINGER_SECS: &str = "ROWLINK_LINGER_SECS";
pub const ENV_HOLD_CURSORS: &str = "ROWLINK_HOLD_CURSORS";

/// Credentials and socket policy for one logical connection.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub connect_timeout_ms: Option<u64>,
    pub query_timeout_ms: Option<u64>,
    pub linger_secs: Option<u64>,
    pub hold_cursors_over_commit: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            user: String::new(),
            password: String::new(),
            connect_timeout_ms: Some(10_000),
            query_timeout_ms: None,
            linger_secs: None,
            hold_cursors_over_commit: false,
        }
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("query_timeout_ms", &self.query_timeout_ms)
            .field("linger_secs", &self.linger_secs)
            .field("hold_cursors_over_commit", &self.hold_cursors_over_commit)
            .finish()
    }
}

impl ConnectionConfig {
    /// Settings for `host:port` with every other field at its default
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            ..Self::default()
        }
    }

    /// Set the credentials sent on every new session
    pub fn credentials(mut self, user: &str, password: &str) -> Self {
        self.user = user.to_string();
        self.password = password.to_string();
        self
    }

    /// Bound the TCP connect and credential handshake
    pub fn connect_timeout_ms(mut self, ms: u64) -> Self {
        self.connect_timeout_ms = Some(ms);
        self
    }

    /// Bound the wait for each frame of a response
    pub fn query_timeout_ms(mut self, ms: u64) -> Self {
        self.query_timeout_ms = Some(ms);
        self
    }

    /// Set SO_LINGER on new sockets
    pub fn linger_secs(mut self, secs: u64) -> Self {
        self.linger_secs = Some(secs);
        self
    }

    /// Keep open cursors alive across a commit
    pub fn hold_cursors_over_commit(mut self, hold: bool) -> Self {
        self.hold_cursors_over_commit = hold;
        self
    }

    /// `host:port` as passed to the connector
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }

    pub fn query_timeout(&self) -> Option<Duration> {
        self.query_timeout_ms.map(Duration::from_millis)
    }

    pub fn linger(&self) -> Option<Duration> {
        self.linger_secs.map(Duration::from_secs)
    }

    /// Parse a TOML document. Missing keys keep their defaults.
    pub fn from_toml(content: &str) -> DriverResult<Self> {
        toml::from_str(content).map_err(|e| DriverError::Config(e.to_string()))
    }

    /// Load a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> DriverResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            DriverError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let mut config = Self::from_toml(&content)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply `ROWLINK_*` variables from the process environment.
    pub fn apply_env_overrides(&mut self) -> DriverResult<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup. Empty values are ignored;
    /// unparsable numbers are a configuration error.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> DriverResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(host) = get(ENV_HOST) {
            self.host = host;
        }
        if let Some(port) = get(ENV_PORT) {
            self.port = parse_var(ENV_PORT, &port)?;
        }
        if let Some(user) = get(ENV_USER) {
            self.user = user;
        }
        if let Some(password) = get(ENV_PASSWORD) {
            self.password = password;
        }
        if let Some(ms) = get(ENV_CONNECT_TIMEOUT_MS) {
            self.connect_timeout_ms = Some(parse_var(ENV_CONNECT_TIMEOUT_MS, &ms)?);
        }
        if let Some(ms) = get(ENV_QUERY_TIMEOUT_MS) {
            self.query_timeout_ms = Some(parse_var(ENV_QUERY_TIMEOUT_MS, &ms)?);
        }
        if let Some(secs) = get(ENV_LINGER_SECS) {
            self.linger_secs = Some(parse_var(ENV_LINGER_SECS, &secs)?);
        }
        if let Some(hold) = get(ENV_HOLD_CURSORS) {
            self.hold_cursors_over_commit = parse_var(ENV_HOLD_CURSORS, &hold)?;
        }
        Ok(())
    }

    /// Render these settings as a TOML document
    pub fn to_toml(&self) -> DriverResult<String> {
        toml::to_string_pretty(self).map_err(|e| DriverError::Config(e.to_string()))
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> DriverResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| DriverError::Config(format!("{key}: cannot parse '{value}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults_and_builder() {
        let config = ConnectionConfig::new("db.local", 9000)
            .credentials("ann", "secret")
            .query_timeout_ms(250)
            .hold_cursors_over_commit(true);
        assert_eq!(config.addr(), "db.local:9000");
        assert_eq!(config.query_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.connect_timeout(), Some(Duration::from_secs(10)));
        assert_eq!(config.linger(), None);
        assert!(config.hold_cursors_over_commit);
    }

    #[test]
    fn test_debug_redacts_password() {
        let config = ConnectionConfig::default().credentials("ann", "hunter2");
        let dbg = format!("{:?}", config);
        assert!(dbg.contains("ann"));
        assert!(!dbg.contains("hunter2"));
    }

    #[test]
    fn test_load_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "host = \"10.0.0.5\"\nport = 7001\nuser = \"svc\"\nlinger_secs = 0"
        )
        .unwrap();

        let config = ConnectionConfig::load(file.path()).unwrap();
        assert_eq!(config.host, "10.0.0.5");
        assert_eq!(config.port, 7001);
        assert_eq!(config.user, "svc");
        assert_eq!(config.password, "");
        assert_eq!(config.linger(), Some(Duration::ZERO));
        assert!(!config.hold_cursors_over_commit);
    }

    #[test]
    fn test_invalid_toml() {
        let err = ConnectionConfig::from_toml("port = \"not a number\"").unwrap_err();
        assert!(matches!(err, DriverError::Config(_)));

        let err = ConnectionConfig::load(Path::new("/nonexistent/rowlink.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read"));
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            (ENV_HOST, "override.local"),
            (ENV_PORT, "7777"),
            (ENV_PASSWORD, ""),
            (ENV_QUERY_TIMEOUT_MS, "1500"),
            (ENV_HOLD_CURSORS, "true"),
        ]
        .into_iter()
        .collect();

        let mut config = ConnectionConfig::default().credentials("ann", "keep");
        config
            .apply_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.host, "override.local");
        assert_eq!(config.port, 7777);
        assert_eq!(config.password, "keep");
        assert_eq!(config.query_timeout_ms, Some(1500));
        assert!(config.hold_cursors_over_commit);
    }

    #[test]
    fn test_bad_override_rejected() {
        let mut config = ConnectionConfig::default();
        let err = config
            .apply_overrides(|k| (k == ENV_PORT).then(|| "70000".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_PORT));
    }

    #[test]
    fn test_toml_round_trip() {
        let config = ConnectionConfig::new("h", 1).credentials("u", "p");
        let text = config.to_toml().unwrap();
        assert!(text.contains("host = \"h\""));
        assert_eq!(ConnectionConfig::from_toml(&text).unwrap(), config);
    }
}
