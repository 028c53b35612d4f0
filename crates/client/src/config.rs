//! Cluster configuration.
//!
//! Options are plain serde data so they can come from a JSON file, the command
//! line or code. Durations are written in milliseconds:
//!
//! ```json
//! {
//!   "url": "https://rv.example.com/session-id",
//!   "maxConnections": 4,
//!   "idleTimeout": 5000,
//!   "retryCount": 5,
//!   "retryDelay": 1000
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use http::{HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ConfigError;

/// Configuration of a [`TunnelCluster`](crate::TunnelCluster).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterConfig {
    /// Relay url, the path is the session
    pub url: String,
    pub max_connections: usize,
    #[serde(with = "duration_ms")]
    pub idle_timeout: Duration,
    pub retry_count: u32,
    #[serde(with = "duration_ms")]
    pub retry_delay: Duration,
    /// Inactivity timeout of the destination connection
    #[serde(with = "duration_ms")]
    pub destination_timeout: Duration,
    /// Treat a relay-side session close as terminal instead of retrying
    pub disconnect_is_fatal: bool,
    /// Accept any TLS certificate
    pub insecure: bool,
    /// Extra fields sent with the `CONNECT` handshake
    pub headers: BTreeMap<String, String>,
}

/// Helper module for serializing Duration as milliseconds
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: 2,
            idle_timeout: Duration::from_millis(5000),
            retry_count: 5,
            retry_delay: Duration::from_millis(1000),
            destination_timeout: Duration::from_secs(30),
            disconnect_is_fatal: false,
            insecure: false,
            headers: BTreeMap::new(),
        }
    }
}

impl ClusterConfig {
    pub fn builder() -> ClusterConfigBuilder {
        ClusterConfigBuilder::default()
    }

    /// Loads a config from a JSON file. Missing options take their defaults.
    ///
    /// # Errors
    ///
    /// Fails when the file can not be read or is not valid JSON. The result is
    /// not validated yet.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read(path)?;
        Ok(serde_json::from_slice(&content)?)
    }

    /// Checks every option and returns the parsed relay endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for a missing or invalid url, a url without a
    /// session path, or an out of range option.
    pub fn validate(&self) -> Result<Endpoint, ConfigError> {
        if self.url.trim().is_empty() {
            return Err(ConfigError::MissingUrl);
        }
        let relay = Endpoint::parse(&self.url)?;
        if relay.session().is_empty() {
            return Err(ConfigError::MissingSession);
        }

        if self.max_connections == 0 {
            return Err(ConfigError::invalid_option("maxConnections", "must be greater than 0"));
        }
        for (name, value) in [
            ("idleTimeout", self.idle_timeout),
            ("retryDelay", self.retry_delay),
            ("destinationTimeout", self.destination_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::invalid_option(name, "must be greater than 0"));
            }
        }

        for (name, value) in &self.headers {
            HeaderName::from_bytes(name.as_bytes()).map_err(|e| ConfigError::invalid_option("headers", format!("{name}: {e}")))?;
            HeaderValue::from_str(value).map_err(|e| ConfigError::invalid_option("headers", format!("{name}: {e}")))?;
        }

        Ok(relay)
    }
}

/// Builder for [`ClusterConfig`]
#[derive(Debug, Default)]
pub struct ClusterConfigBuilder {
    config: ClusterConfig,
}

impl ClusterConfigBuilder {
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.config.url = url.into();
        self
    }

    pub fn max_connections(mut self, max_connections: usize) -> Self {
        self.config.max_connections = max_connections;
        self
    }

    pub fn idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.config.idle_timeout = idle_timeout;
        self
    }

    pub fn retry_count(mut self, retry_count: u32) -> Self {
        self.config.retry_count = retry_count;
        self
    }

    pub fn retry_delay(mut self, retry_delay: Duration) -> Self {
        self.config.retry_delay = retry_delay;
        self
    }

    pub fn destination_timeout(mut self, destination_timeout: Duration) -> Self {
        self.config.destination_timeout = destination_timeout;
        self
    }

    pub fn disconnect_is_fatal(mut self, fatal: bool) -> Self {
        self.config.disconnect_is_fatal = fatal;
        self
    }

    pub fn insecure(mut self, insecure: bool) -> Self {
        self.config.insecure = insecure;
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.headers.insert(name.into(), value.into());
        self
    }

    /// # Errors
    ///
    /// See [`ClusterConfig::validate`].
    pub fn build(self) -> Result<ClusterConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Where a transport connection goes: the relay or a destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    host: String,
    port: u16,
    explicit_port: bool,
    tls: bool,
    path: String,
}

impl Endpoint {
    /// Parses an `http`, `https`, `ws` or `wss` url.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the url is malformed, has another scheme or no host.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let url = Url::parse(raw.trim()).map_err(|source| ConfigError::InvalidUrl { url: raw.to_owned(), source })?;

        let (tls, default_port) = match url.scheme() {
            "http" | "ws" => (false, 80),
            "https" | "wss" => (true, 443),
            scheme => return Err(ConfigError::UnsupportedScheme { scheme: scheme.to_owned() }),
        };
        let host = url.host_str().filter(|h| !h.is_empty()).ok_or_else(|| ConfigError::MissingHost { url: raw.to_owned() })?;

        let path = match url.query() {
            Some(query) => format!("{}?{query}", url.path()),
            None => url.path().to_owned(),
        };

        Ok(Self { host: host.to_owned(), port: url.port().unwrap_or(default_port), explicit_port: url.port().is_some(), tls, path })
    }

    /// Host name or address to connect to, without IPv6 brackets.
    pub fn host(&self) -> &str {
        self.host.trim_start_matches('[').trim_end_matches(']')
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_tls(&self) -> bool {
        self.tls
    }

    /// Request target of the handshake: path plus query.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The session token: the path without query and leading slashes.
    pub fn session(&self) -> &str {
        let path = self.path.split_once('?').map_or(self.path.as_str(), |(path, _)| path);
        path.trim_start_matches('/')
    }

    /// Value of the `Host` field: the port is included only when the url spelled it out.
    pub fn host_header(&self) -> String {
        if self.explicit_port { format!("{}:{}", self.host, self.port) } else { self.host.clone() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    #[test]
    fn defaults() {
        let config = ClusterConfig::default();
        assert_eq!(config.max_connections, 2);
        assert_eq!(config.idle_timeout, Duration::from_secs(5));
        assert_eq!(config.retry_count, 5);
        assert_eq!(config.retry_delay, Duration::from_secs(1));
        assert_eq!(config.destination_timeout, Duration::from_secs(30));
        assert!(!config.disconnect_is_fatal);
        assert!(!config.insecure);
    }

    #[test]
    fn from_json_with_defaults() {
        let config: ClusterConfig = serde_json::from_str(indoc! {r#"
            {
                "url": "http://localhost:9001/abc",
                "maxConnections": 4,
                "retryDelay": 100,
                "headers": { "X-Token": "secret" }
            }
        "#})
        .unwrap();

        assert_eq!(config.max_connections, 4);
        assert_eq!(config.retry_delay, Duration::from_millis(100));
        assert_eq!(config.idle_timeout, Duration::from_millis(5000));
        assert_eq!(config.headers.get("X-Token").map(String::as_str), Some("secret"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder_validates() {
        assert!(matches!(ClusterConfig::builder().build(), Err(ConfigError::MissingUrl)));
        assert!(matches!(ClusterConfig::builder().url("http://localhost:9001").build(), Err(ConfigError::MissingSession)));
        assert!(matches!(ClusterConfig::builder().url("ftp://localhost/abc").build(), Err(ConfigError::UnsupportedScheme { .. })));
        assert!(matches!(ClusterConfig::builder().url("not a url").build(), Err(ConfigError::InvalidUrl { .. })));
        assert!(matches!(
            ClusterConfig::builder().url("http://localhost/abc").max_connections(0).build(),
            Err(ConfigError::InvalidOption { name: "maxConnections", .. })
        ));
        assert!(matches!(
            ClusterConfig::builder().url("http://localhost/abc").retry_delay(Duration::ZERO).build(),
            Err(ConfigError::InvalidOption { name: "retryDelay", .. })
        ));
        assert!(matches!(
            ClusterConfig::builder().url("http://localhost/abc").header("Bad Name", "v").build(),
            Err(ConfigError::InvalidOption { name: "headers", .. })
        ));

        let config = ClusterConfig::builder().url("wss://rv.example.com/abc").retry_count(0).build().unwrap();
        assert_eq!(config.retry_count, 0);
    }

    #[test]
    fn endpoint_parts() {
        let relay = Endpoint::parse("https://rv.example.com//session-1?v=2").unwrap();
        assert!(relay.is_tls());
        assert_eq!(relay.port(), 443);
        assert_eq!(relay.path(), "//session-1?v=2");
        assert_eq!(relay.session(), "session-1");
        assert_eq!(relay.host_header(), "rv.example.com");

        let relay = Endpoint::parse("ws://127.0.0.1:9001/abc").unwrap();
        assert!(!relay.is_tls());
        assert_eq!(relay.port(), 9001);
        assert_eq!(relay.host_header(), "127.0.0.1:9001");

        let destination = Endpoint::parse("http://[::1]:8080").unwrap();
        assert_eq!(destination.host(), "::1");
        assert_eq!(destination.host_header(), "[::1]:8080");
        assert_eq!(destination.session(), "");
    }
}
