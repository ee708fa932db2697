//! Shared configuration: the handshake contract, environment variable names,
//! and system-wide constants.

use std::time::Duration;

/// Configuration used by host and plugin to agree that they were built to
/// talk to each other.
///
/// The magic cookie is a UX check, not a security boundary: it exists so a
/// user who runs a plugin binary by hand gets a friendly message instead of
/// a screenful of protocol output.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// The application protocol version the host speaks. Not required when
    /// versioned plugin sets are used.
    pub user_version: u32,
    /// Environment variable the host sets and the plugin checks.
    pub magic_cookie_key: String,
    /// Expected value of the magic cookie variable.
    pub magic_cookie_value: String,
}

/// Environment variable names that make up the host -> plugin contract.
pub mod env {
    /// Comma-separated user protocol versions the host supports.
    pub const PROTOCOL_VERSIONS: &str = "PLUGIN_PROTOCOL_VERSIONS";
    /// Inclusive lower bound of the TCP port range for plugin listeners.
    pub const MIN_PORT: &str = "PLUGIN_MIN_PORT";
    /// Inclusive upper bound of the TCP port range for plugin listeners.
    pub const MAX_PORT: &str = "PLUGIN_MAX_PORT";
    /// PEM certificate of the host's ephemeral identity; presence enables
    /// auto-mTLS on the plugin side.
    pub const CLIENT_CERT: &str = "PLUGIN_CLIENT_CERT";
    /// Parent directory for the plugin's Unix socket subdirectory.
    pub const UNIX_SOCKET_DIR: &str = "PLUGIN_UNIX_SOCKET_DIR";
    /// Numeric gid or group name to own the Unix socket.
    pub const UNIX_SOCKET_GROUP: &str = "PLUGIN_UNIX_SOCKET_GROUP";
    /// Set to "true" when the host supports gRPC broker multiplexing.
    pub const MULTIPLEX_GRPC: &str = "PLUGIN_MULTIPLEX_GRPC";
}

/// Timeouts for the supervisor and brokers.
pub struct TimeoutConfig;

impl TimeoutConfig {
    /// How long `start` waits for the handshake line.
    pub const START_TIMEOUT: Duration = Duration::from_secs(60);
    /// How long a broker `dial` waits for the peer's advertisement.
    pub const BROKER_DIAL_TIMEOUT: Duration = Duration::from_secs(5);
    /// How long an unclaimed broker slot is retained after publication.
    pub const BROKER_SLOT_TIMEOUT: Duration = Duration::from_secs(5);
    /// How long `kill` races the graceful quit call before escalating.
    pub const GRACEFUL_QUIT_TIMEOUT: Duration = Duration::from_secs(2);
    /// Liveness poll cadence for attached (reattached) processes.
    pub const ATTACH_POLL_INTERVAL: Duration = Duration::from_secs(5);
}

/// Buffer sizes and queue depths.
pub struct BufferConfig;

impl BufferConfig {
    /// Default stderr line-scanner buffer.
    pub const STDERR_SCAN_BUFFER: usize = 64 * 1024;
    /// Smallest stderr line-scanner buffer we accept.
    pub const STDERR_SCAN_MIN: usize = 32;
    /// Longest handshake line the host will read.
    pub const HANDSHAKE_LINE_MAX: usize = 16 * 1024;
    /// Queue depth for captured plugin stdout/stderr chunks.
    pub const STDIO_QUEUE_DEPTH: usize = 1000;
    /// Largest call envelope accepted on the request/response transport.
    pub const MAX_RPC_FRAME: usize = 4 * 1024 * 1024;
    /// Largest payload carried in one mux frame.
    pub const MUX_FRAME_MAX: usize = 16 * 1024;
    /// Per-substream receive window.
    pub const MUX_WINDOW: u32 = 256 * 1024;
}
