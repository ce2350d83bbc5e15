//! Error types for the swarm engine
//!
//! This module defines the error taxonomy shared by every component.
//! Errors are created through the constructor helpers and travel as
//! `anyhow::Error`; callers that need to decide what to do with a failure
//! downcast back to [`TorrentError`] and look at its [`ErrorKind`].

use std::fmt;

/// Coarse classification used to decide how far an error propagates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Peer broke the wire protocol; fatal to that session
    ProtocolViolation,
    /// Piece digest did not match; the piece is discarded
    ChecksumMismatch,
    /// A timer owned by a session, query or search expired
    Timeout,
    /// A bounded resource ran out (open handles, queues)
    ResourceExhausted,
    /// Metadata is corrupt or unusable; fatal to the whole swarm
    Metadata,
    /// Socket-level failure; disconnect with backoff
    Network,
    /// Block store read/write failure
    Storage,
    /// DHT packet or state error
    Dht,
    /// Invalid configuration value
    Config,
    /// Malformed encoded data outside the peer wire
    Parse,
}

/// Comprehensive error type for swarm operations
#[derive(Debug, Clone)]
pub enum TorrentError {
    /// Malformed or illegal peer-wire traffic
    ProtocolViolation {
        message: String,
        field: Option<String>,
        position: Option<usize>,
    },

    /// A completed piece failed digest validation
    ChecksumMismatch {
        piece: u32,
    },

    /// An owned timer expired
    Timeout {
        message: String,
        what: Option<String>,
    },

    /// A bounded resource is exhausted
    ResourceExhausted {
        message: String,
        resource: String,
    },

    /// Irrecoverable metadata problem
    MetadataError {
        message: String,
        source: Option<String>,
    },

    /// Network errors
    NetworkError {
        message: String,
        address: Option<String>,
        source: Option<String>,
    },

    /// Block store errors
    StorageError {
        message: String,
        path: Option<String>,
        source: Option<String>,
    },

    /// DHT errors
    DHTError {
        message: String,
        node: Option<String>,
        source: Option<String>,
    },

    /// Configuration errors
    ConfigError {
        message: String,
        field: Option<String>,
    },

    /// Encoded data parsing errors
    ParseError {
        message: String,
        source: Option<String>,
    },
}

impl TorrentError {
    /// Create a new ProtocolViolation
    pub fn protocol_violation(message: impl Into<String>) -> Self {
        TorrentError::ProtocolViolation {
            message: message.into(),
            field: None,
            position: None,
        }
    }

    /// Create a ProtocolViolation naming the offending field
    pub fn protocol_violation_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        TorrentError::ProtocolViolation {
            message: message.into(),
            field: Some(field.into()),
            position: None,
        }
    }

    /// Create a ProtocolViolation naming the offending field and byte position
    pub fn protocol_violation_at(message: impl Into<String>, field: impl Into<String>, position: usize) -> Self {
        TorrentError::ProtocolViolation {
            message: message.into(),
            field: Some(field.into()),
            position: Some(position),
        }
    }

    /// Create a new ChecksumMismatch
    pub fn checksum_mismatch(piece: u32) -> Self {
        TorrentError::ChecksumMismatch { piece }
    }

    /// Create a new Timeout
    pub fn timeout(message: impl Into<String>) -> Self {
        TorrentError::Timeout {
            message: message.into(),
            what: None,
        }
    }

    /// Create a new Timeout naming what timed out
    pub fn timeout_for(message: impl Into<String>, what: impl Into<String>) -> Self {
        TorrentError::Timeout {
            message: message.into(),
            what: Some(what.into()),
        }
    }

    /// Create a new ResourceExhausted
    pub fn resource_exhausted(message: impl Into<String>, resource: impl Into<String>) -> Self {
        TorrentError::ResourceExhausted {
            message: message.into(),
            resource: resource.into(),
        }
    }

    /// Create a new MetadataError
    pub fn metadata_error(message: impl Into<String>) -> Self {
        TorrentError::MetadataError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new MetadataError with source
    pub fn metadata_error_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::MetadataError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new NetworkError
    pub fn network_error(message: impl Into<String>) -> Self {
        TorrentError::NetworkError {
            message: message.into(),
            address: None,
            source: None,
        }
    }

    /// Create a new NetworkError with address
    pub fn network_error_with_address(message: impl Into<String>, address: impl Into<String>) -> Self {
        TorrentError::NetworkError {
            message: message.into(),
            address: Some(address.into()),
            source: None,
        }
    }

    /// Create a new NetworkError with address and source
    pub fn network_error_full(message: impl Into<String>, address: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::NetworkError {
            message: message.into(),
            address: Some(address.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new StorageError
    pub fn storage_error(message: impl Into<String>) -> Self {
        TorrentError::StorageError {
            message: message.into(),
            path: None,
            source: None,
        }
    }

    /// Create a new StorageError with path and source
    pub fn storage_error_full(message: impl Into<String>, path: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::StorageError {
            message: message.into(),
            path: Some(path.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new DHTError
    pub fn dht_error(message: impl Into<String>) -> Self {
        TorrentError::DHTError {
            message: message.into(),
            node: None,
            source: None,
        }
    }

    /// Create a new DHTError with node
    pub fn dht_error_with_node(message: impl Into<String>, node: impl Into<String>) -> Self {
        TorrentError::DHTError {
            message: message.into(),
            node: Some(node.into()),
            source: None,
        }
    }

    /// Create a new ConfigError with field
    pub fn config_error_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        TorrentError::ConfigError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a new ParseError with source
    pub fn parse_error_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::ParseError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            TorrentError::ProtocolViolation { .. } => ErrorKind::ProtocolViolation,
            TorrentError::ChecksumMismatch { .. } => ErrorKind::ChecksumMismatch,
            TorrentError::Timeout { .. } => ErrorKind::Timeout,
            TorrentError::ResourceExhausted { .. } => ErrorKind::ResourceExhausted,
            TorrentError::MetadataError { .. } => ErrorKind::Metadata,
            TorrentError::NetworkError { .. } => ErrorKind::Network,
            TorrentError::StorageError { .. } => ErrorKind::Storage,
            TorrentError::DHTError { .. } => ErrorKind::Dht,
            TorrentError::ConfigError { .. } => ErrorKind::Config,
            TorrentError::ParseError { .. } => ErrorKind::Parse,
        }
    }

    /// Whether the error must take down the whole swarm
    pub fn is_swarm_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Metadata | ErrorKind::Config)
    }

    /// Whether the error ends the session it occurred on
    pub fn closes_session(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ProtocolViolation | ErrorKind::Network | ErrorKind::Timeout
        )
    }

    /// Add context to the error
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        let ctx = context.into();
        let append = |source: &mut Option<String>| {
            *source = Some(source.as_ref().map_or_else(|| ctx.clone(), |s| format!("{}: {}", s, ctx)));
        };
        match &mut self {
            TorrentError::MetadataError { source, .. }
            | TorrentError::NetworkError { source, .. }
            | TorrentError::StorageError { source, .. }
            | TorrentError::DHTError { source, .. }
            | TorrentError::ParseError { source, .. } => append(source),
            TorrentError::ProtocolViolation { field, .. } => append(field),
            TorrentError::Timeout { what, .. } => append(what),
            _ => {}
        }
        self
    }
}

impl fmt::Display for TorrentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TorrentError::ProtocolViolation { message, field, position } => {
                match (field, position) {
                    (Some(fl), Some(p)) => write!(f, "Protocol violation: {} (field: {}, position: {})", message, fl, p),
                    (Some(fl), None) => write!(f, "Protocol violation: {} (field: {})", message, fl),
                    (None, Some(p)) => write!(f, "Protocol violation: {} (position: {})", message, p),
                    (None, None) => write!(f, "Protocol violation: {}", message),
                }
            }
            TorrentError::ChecksumMismatch { piece } => {
                write!(f, "Checksum mismatch for piece {}", piece)
            }
            TorrentError::Timeout { message, what } => {
                if let Some(w) = what {
                    write!(f, "Timeout: {} ({})", message, w)
                } else {
                    write!(f, "Timeout: {}", message)
                }
            }
            TorrentError::ResourceExhausted { message, resource } => {
                write!(f, "Resource exhausted: {} [{}]", message, resource)
            }
            TorrentError::MetadataError { message, source } => {
                if let Some(src) = source {
                    write!(f, "Metadata error: {} (source: {})", message, src)
                } else {
                    write!(f, "Metadata error: {}", message)
                }
            }
            TorrentError::NetworkError { message, address, source } => {
                match (address, source) {
                    (Some(a), Some(s)) => write!(f, "Network error: {} (address: {}, source: {})", message, a, s),
                    (Some(a), None) => write!(f, "Network error: {} (address: {})", message, a),
                    (None, Some(s)) => write!(f, "Network error: {} (source: {})", message, s),
                    (None, None) => write!(f, "Network error: {}", message),
                }
            }
            TorrentError::StorageError { message, path, source } => {
                match (path, source) {
                    (Some(p), Some(s)) => write!(f, "Storage error: {} (path: {}, source: {})", message, p, s),
                    (Some(p), None) => write!(f, "Storage error: {} (path: {})", message, p),
                    (None, Some(s)) => write!(f, "Storage error: {} (source: {})", message, s),
                    (None, None) => write!(f, "Storage error: {}", message),
                }
            }
            TorrentError::DHTError { message, node, source } => {
                match (node, source) {
                    (Some(n), Some(s)) => write!(f, "DHT error: {} (node: {}, source: {})", message, n, s),
                    (Some(n), None) => write!(f, "DHT error: {} (node: {})", message, n),
                    (None, Some(s)) => write!(f, "DHT error: {} (source: {})", message, s),
                    (None, None) => write!(f, "DHT error: {}", message),
                }
            }
            TorrentError::ConfigError { message, field } => {
                if let Some(field_val) = field {
                    write!(f, "Config error: {} (field: {})", message, field_val)
                } else {
                    write!(f, "Config error: {}", message)
                }
            }
            TorrentError::ParseError { message, source } => {
                if let Some(src) = source {
                    write!(f, "Parse error: {} (source: {})", message, src)
                } else {
                    write!(f, "Parse error: {}", message)
                }
            }
        }
    }
}

impl std::error::Error for TorrentError {}

impl From<std::io::Error> for TorrentError {
    fn from(err: std::io::Error) -> Self {
        TorrentError::storage_error_full(err.to_string(), "unknown".to_string(), err.kind().to_string())
    }
}

impl From<serde_bencode::Error> for TorrentError {
    fn from(err: serde_bencode::Error) -> Self {
        TorrentError::parse_error_with_source("Failed to decode bencode data", err.to_string())
    }
}

impl From<serde_json::Error> for TorrentError {
    fn from(err: serde_json::Error) -> Self {
        TorrentError::parse_error_with_source("Failed to decode JSON data", err.to_string())
    }
}

impl From<std::net::AddrParseError> for TorrentError {
    fn from(err: std::net::AddrParseError) -> Self {
        TorrentError::network_error_full("Failed to parse address", "unknown".to_string(), err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for TorrentError {
    fn from(_err: tokio::time::error::Elapsed) -> Self {
        TorrentError::timeout("Operation timed out")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_violation_display() {
        let err = TorrentError::protocol_violation_at("Request too long", "length", 9);
        let text = err.to_string();
        assert!(text.contains("Protocol violation"));
        assert!(text.contains("length"));
        assert!(text.contains("position: 9"));
    }

    #[test]
    fn test_kind_classification() {
        assert_eq!(TorrentError::checksum_mismatch(3).kind(), ErrorKind::ChecksumMismatch);
        assert!(TorrentError::metadata_error("bad pieces").is_swarm_fatal());
        assert!(!TorrentError::checksum_mismatch(3).is_swarm_fatal());
        assert!(TorrentError::protocol_violation("bad id").closes_session());
        assert!(!TorrentError::resource_exhausted("too many files", "fd").closes_session());
    }

    #[test]
    fn test_dht_error_names_node() {
        let err = TorrentError::dht_error_with_node("send failed", "10.0.0.1:6881").with_context("unreachable");
        assert_eq!(err.kind(), ErrorKind::Dht);
        assert_eq!(err.to_string(), "DHT error: send failed (node: 10.0.0.1:6881, source: unreachable)");
    }

    #[test]
    fn test_with_context() {
        let err = TorrentError::storage_error("write failed").with_context("piece 4");
        assert!(err.to_string().contains("piece 4"));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "File not found");
        let err: TorrentError = io_err.into();
        assert!(matches!(err, TorrentError::StorageError { .. }));
    }

    #[test]
    fn test_from_addr_parse_error() {
        let addr_err = "invalid:address".parse::<std::net::SocketAddr>().unwrap_err();
        let err: TorrentError = addr_err.into();
        assert!(matches!(err, TorrentError::NetworkError { .. }));
    }

    #[test]
    fn test_config_error_with_field() {
        let err = TorrentError::config_error_with_field("Invalid value", "max_uploaders");
        assert!(err.to_string().contains("Config error"));
        assert!(err.to_string().contains("max_uploaders"));
    }
}
