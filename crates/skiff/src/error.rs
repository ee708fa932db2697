//! Error types for the skiff library.
//!
//! One enum covers both halves of the system. Host-facing errors carry enough
//! context to explain a failed launch (raw handshake line, runner diagnosis,
//! negotiated versions) without the caller having to dig through logs.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::handshake::Protocol;

/// Main error type for skiff operations.
#[derive(Debug, Error)]
pub enum SkiffError {
    // Configuration errors: surfaced synchronously, never retried.
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Checksum mismatch for {path:?}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    // Spawn/attach errors.
    #[error("Failed to launch plugin: {message}")]
    Spawn {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Reattachment process not found: pid {pid}")]
    ProcessNotFound { pid: u32 },

    // Handshake errors. All fatal for the supervisor instance.
    #[error("Timed out after {waited:?} waiting for plugin to start{}", diagnosis_suffix(.diagnosis))]
    HandshakeTimeout {
        waited: Duration,
        diagnosis: Option<String>,
    },

    #[error("Plugin exited before completing the handshake{}", diagnosis_suffix(.diagnosis))]
    PluginExited { diagnosis: Option<String> },

    #[error("Unparseable handshake line {line:?}: {reason}")]
    HandshakeParse { line: String, reason: String },

    #[error(
        "Incompatible core API version {plugin} (host speaks {host}); \
         the plugin was likely built against a different version of the library"
    )]
    CoreVersionMismatch { plugin: u32, host: u32 },

    #[error("Incompatible API version {negotiated}; host supports {supported:?}")]
    VersionMismatch { negotiated: u32, supported: Vec<u32> },

    #[error("Plugin announced protocol {protocol}, which this host does not allow")]
    ProtocolDisallowed { protocol: Protocol },

    #[error("Invalid server certificate in handshake: {message}")]
    BadServerCert { message: String },

    // Runtime errors.
    #[error("Unknown plugin: {name}")]
    UnknownPlugin { name: String },

    #[error("Transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("TLS error: {message}")]
    Tls { message: String },

    #[error("Timeout waiting for connection info for brokered stream {id}")]
    BrokerTimeout { id: u32 },

    #[error("Broker is closed")]
    BrokerClosed,

    // Protocol-level errors, propagated verbatim.
    #[error("RPC error {code}: {message}")]
    Rpc { code: i32, message: String },

    #[error(transparent)]
    Grpc(#[from] tonic::Status),

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for skiff operations.
pub type Result<T> = std::result::Result<T, SkiffError>;

fn diagnosis_suffix(diagnosis: &Option<String>) -> String {
    match diagnosis {
        Some(d) if !d.is_empty() => format!("; {d}"),
        _ => String::new(),
    }
}

impl From<std::io::Error> for SkiffError {
    fn from(err: std::io::Error) -> Self {
        SkiffError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for SkiffError {
    fn from(err: serde_json::Error) -> Self {
        SkiffError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl SkiffError {
    /// Create a configuration error from anything printable.
    pub fn config(message: impl Into<String>) -> Self {
        SkiffError::Config {
            message: message.into(),
        }
    }

    /// Create a transport error wrapping an IO cause.
    pub fn transport(message: impl Into<String>, source: std::io::Error) -> Self {
        SkiffError::Transport {
            message: message.into(),
            source: Some(source),
        }
    }
}
