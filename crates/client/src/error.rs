use std::fmt;
use std::io;
use std::time::Duration;

use rv_http::protocol::ParseError;
use thiserror::Error;

/// Error code reported at the library boundary.
///
/// Only three failures have a stable code; everything else is [`ErrorCode::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// The relay rejected the handshake
    Forbidden,
    /// The relay closed an established session by answering with an HTTP response
    ServerDisconnect,
    /// Every reconnect attempt failed
    ServerUnreachable,
    Other,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Forbidden => "EFORBIDDEN",
            ErrorCode::ServerDisconnect => "ESERVERDISCONNECT",
            ErrorCode::ServerUnreachable => "ESERVERUNREACHABLE",
            ErrorCode::Other => "EOTHER",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything that can end a tunnel or a cluster.
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("unable to create tunnel: relay answered {status}")]
    Forbidden { status: u16 },

    #[error("relay closed the session{}", .status.map(|s| format!(" with status {s}")).unwrap_or_default())]
    ServerDisconnect { status: Option<u16> },

    #[error("relay unreachable after {attempts} reconnect attempts")]
    ServerUnreachable { attempts: u32 },

    #[error("relay closed the connection during handshake")]
    HandshakeClosed,

    #[error("invalid relay handshake response: {source}")]
    Handshake {
        #[from]
        source: ParseError,
    },

    #[error("relay did not provide a usable destination: {reason}")]
    InvalidDestination { reason: String },

    #[error("invalid tls server name: {host}")]
    InvalidServerName { host: String },

    #[error("destination idle for {}ms", .idle.as_millis())]
    DestinationTimeout { idle: Duration },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl TunnelError {
    pub fn forbidden(status: u16) -> Self {
        Self::Forbidden { status }
    }

    pub fn server_disconnect(status: Option<u16>) -> Self {
        Self::ServerDisconnect { status }
    }

    pub fn server_unreachable(attempts: u32) -> Self {
        Self::ServerUnreachable { attempts }
    }

    pub fn invalid_destination<S: ToString>(reason: S) -> Self {
        Self::InvalidDestination { reason: reason.to_string() }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            TunnelError::Forbidden { .. } => ErrorCode::Forbidden,
            TunnelError::ServerDisconnect { .. } => ErrorCode::ServerDisconnect,
            TunnelError::ServerUnreachable { .. } => ErrorCode::ServerUnreachable,
            _ => ErrorCode::Other,
        }
    }

    /// The HTTP status the relay answered with, when the error carries one.
    pub fn status(&self) -> Option<u16> {
        match self {
            TunnelError::Forbidden { status } => Some(*status),
            TunnelError::ServerDisconnect { status } => *status,
            _ => None,
        }
    }
}

/// Invalid or incomplete cluster configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("relay url must be set")]
    MissingUrl,

    #[error("invalid relay url {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("unsupported url scheme: {scheme}")]
    UnsupportedScheme { scheme: String },

    #[error("url {url} has no host")]
    MissingHost { url: String },

    #[error("relay url must carry a session path")]
    MissingSession,

    #[error("invalid option {name}: {reason}")]
    InvalidOption { name: &'static str, reason: String },

    #[error("failed to build tls client: {source}")]
    Tls {
        #[from]
        source: rustls::Error,
    },

    #[error("failed to read config file: {source}")]
    Read {
        #[from]
        source: io::Error,
    },

    #[error("failed to parse config file: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
}

impl ConfigError {
    pub fn invalid_option<S: ToString>(name: &'static str, reason: S) -> Self {
        Self::InvalidOption { name, reason: reason.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_at_the_boundary() {
        assert_eq!(TunnelError::forbidden(403).code().as_str(), "EFORBIDDEN");
        assert_eq!(TunnelError::server_disconnect(None).code().as_str(), "ESERVERDISCONNECT");
        assert_eq!(TunnelError::server_unreachable(5).code().as_str(), "ESERVERUNREACHABLE");
        assert_eq!(TunnelError::from(io::Error::from(io::ErrorKind::ConnectionRefused)).code(), ErrorCode::Other);
    }

    #[test]
    fn status_codes() {
        assert_eq!(TunnelError::forbidden(403).status(), Some(403));
        assert_eq!(TunnelError::server_disconnect(Some(502)).status(), Some(502));
        assert_eq!(TunnelError::server_disconnect(None).status(), None);
        assert_eq!(TunnelError::HandshakeClosed.status(), None);
    }

    #[test]
    fn messages() {
        assert_eq!(TunnelError::forbidden(403).to_string(), "unable to create tunnel: relay answered 403");
        assert_eq!(TunnelError::server_disconnect(Some(502)).to_string(), "relay closed the session with status 502");
        assert_eq!(TunnelError::server_disconnect(None).to_string(), "relay closed the session");
    }
}
