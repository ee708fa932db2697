//! Byte-stream transport: listeners and dialers over TCP and Unix domain
//! sockets, with optional TLS wrapping.
//!
//! Listeners own their filesystem state. A Unix listener creates a fresh
//! subdirectory (mode 0770, optional group owner) holding a mode-0660
//! socket, and removes both on close.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::task::{Context, Poll};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, warn};

use crate::config::env as plugin_env;
use crate::error::{Result, SkiffError};

/// Address family for a plugin listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Tcp,
    Unix,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Tcp => write!(f, "tcp"),
            Network::Unix => write!(f, "unix"),
        }
    }
}

impl FromStr for Network {
    type Err = SkiffError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tcp" => Ok(Network::Tcp),
            "unix" => Ok(Network::Unix),
            other => Err(SkiffError::config(format!("unknown network {other:?}"))),
        }
    }
}

/// A dialable address: network plus network-dependent address string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub network: Network,
    pub address: String,
}

impl Endpoint {
    pub fn tcp(addr: impl Into<String>) -> Self {
        Endpoint {
            network: Network::Tcp,
            address: addr.into(),
        }
    }

    pub fn unix(path: impl Into<String>) -> Self {
        Endpoint {
            network: Network::Unix,
            address: path.into(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.network, self.address)
    }
}

/// Configuration for Unix-socket listeners.
#[derive(Debug, Clone, Default)]
pub struct UnixSocketConfig {
    /// Parent directory for the ephemeral socket subdirectory. Falls back to
    /// `PLUGIN_UNIX_SOCKET_DIR`, then the OS temp dir.
    pub parent_dir: Option<PathBuf>,
    /// Numeric gid or group name to own the subdirectory and socket. Falls
    /// back to `PLUGIN_UNIX_SOCKET_GROUP`.
    pub group: Option<String>,
}

impl UnixSocketConfig {
    /// Merge explicit settings with the process environment.
    pub fn resolved(&self) -> UnixSocketConfig {
        UnixSocketConfig {
            parent_dir: self
                .parent_dir
                .clone()
                .or_else(|| std::env::var_os(plugin_env::UNIX_SOCKET_DIR).map(PathBuf::from)),
            group: self
                .group
                .clone()
                .or_else(|| std::env::var(plugin_env::UNIX_SOCKET_GROUP).ok()),
        }
    }
}

/// An established, unencrypted connection.
#[derive(Debug)]
pub enum Connection {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

macro_rules! conn_delegate {
    ($self:ident, $inner:ident => $e:expr) => {
        match Pin::get_mut($self) {
            Connection::Tcp($inner) => $e,
            #[cfg(unix)]
            Connection::Unix($inner) => $e,
        }
    };
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        conn_delegate!(self, s => Pin::new(s).poll_read(cx, buf))
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        conn_delegate!(self, s => Pin::new(s).poll_write(cx, buf))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        conn_delegate!(self, s => Pin::new(s).poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        conn_delegate!(self, s => Pin::new(s).poll_shutdown(cx))
    }
}

/// A connection that may or may not be wrapped in TLS. This is the byte
/// stream every RPC transport runs over.
#[derive(Debug)]
pub enum IoStream {
    Plain(Connection),
    ClientTls(Box<tokio_rustls::client::TlsStream<Connection>>),
    ServerTls(Box<tokio_rustls::server::TlsStream<Connection>>),
}

macro_rules! io_delegate {
    ($self:ident, $inner:ident => $e:expr) => {
        match Pin::get_mut($self) {
            IoStream::Plain($inner) => $e,
            IoStream::ClientTls($inner) => $e,
            IoStream::ServerTls($inner) => $e,
        }
    };
}

impl AsyncRead for IoStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        io_delegate!(self, s => Pin::new(s).poll_read(cx, buf))
    }
}

impl AsyncWrite for IoStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        io_delegate!(self, s => Pin::new(s).poll_write(cx, buf))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        io_delegate!(self, s => Pin::new(s).poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        io_delegate!(self, s => Pin::new(s).poll_shutdown(cx))
    }
}

impl tonic::transport::server::Connected for IoStream {
    type ConnectInfo = ();

    fn connect_info(&self) -> Self::ConnectInfo {}
}

impl IoStream {
    /// Wrap a freshly dialed connection with client-side TLS.
    pub async fn client_tls(
        conn: Connection,
        config: Arc<rustls::ClientConfig>,
        server_name: &str,
    ) -> Result<IoStream> {
        let name = rustls::pki_types::ServerName::try_from(server_name.to_string())
            .map_err(|e| SkiffError::Tls {
                message: format!("invalid server name {server_name:?}: {e}"),
            })?;
        let connector = tokio_rustls::TlsConnector::from(config);
        let stream = connector.connect(name, conn).await.map_err(|e| SkiffError::Tls {
            message: format!("client handshake failed: {e}"),
        })?;
        Ok(IoStream::ClientTls(Box::new(stream)))
    }

    /// Wrap a freshly accepted connection with server-side TLS.
    pub async fn server_tls(conn: Connection, config: Arc<rustls::ServerConfig>) -> Result<IoStream> {
        let acceptor = tokio_rustls::TlsAcceptor::from(config);
        let stream = acceptor.accept(conn).await.map_err(|e| SkiffError::Tls {
            message: format!("server handshake failed: {e}"),
        })?;
        Ok(IoStream::ServerTls(Box::new(stream)))
    }
}

/// Filesystem state owned by a Unix listener, removed on close.
#[derive(Debug)]
struct UnixCleanup {
    socket: PathBuf,
    dir: PathBuf,
}

impl UnixCleanup {
    fn remove(&self) {
        if let Err(e) = std::fs::remove_file(&self.socket) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.socket.display(), error = %e, "failed to remove plugin socket");
            }
        }
        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.dir.display(), error = %e, "failed to remove plugin socket dir");
            }
        }
    }
}

#[derive(Debug)]
enum ListenerKind {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

/// A bound plugin listener. Closing (or dropping) a Unix listener removes
/// its socket file and the subdirectory that holds it.
#[derive(Debug)]
pub struct Listener {
    kind: ListenerKind,
    endpoint: Endpoint,
    cleanup: Option<UnixCleanup>,
}

impl Listener {
    /// Bind the default listener for this platform and environment: a Unix
    /// socket where supported, TCP when a port range is configured via
    /// `PLUGIN_MIN_PORT`/`PLUGIN_MAX_PORT` (or on platforms without Unix
    /// sockets).
    pub async fn bind_default(unix_config: &UnixSocketConfig) -> Result<Listener> {
        let range = port_range_from_env()?;
        if cfg!(not(unix)) || range.is_some() {
            return Listener::bind_tcp(range).await;
        }
        #[cfg(unix)]
        {
            Listener::bind_unix(unix_config).await
        }
        #[cfg(not(unix))]
        {
            let _ = unix_config;
            Listener::bind_tcp(range).await
        }
    }

    /// Bind a loopback TCP listener, optionally restricted to an inclusive
    /// port range.
    pub async fn bind_tcp(range: Option<(u16, u16)>) -> Result<Listener> {
        let listener = match range {
            None => TcpListener::bind("127.0.0.1:0").await.map_err(|e| {
                SkiffError::transport("failed to bind plugin TCP listener", e)
            })?,
            Some((min, max)) => {
                if min > max {
                    return Err(SkiffError::config(format!(
                        "{} value of {min} is greater than {} value of {max}",
                        plugin_env::MIN_PORT,
                        plugin_env::MAX_PORT
                    )));
                }
                let mut bound = None;
                for port in min..=max {
                    match TcpListener::bind(("127.0.0.1", port)).await {
                        Ok(l) => {
                            bound = Some(l);
                            break;
                        }
                        Err(_) => continue,
                    }
                }
                bound.ok_or_else(|| {
                    SkiffError::config(format!(
                        "couldn't bind plugin TCP listener in port range {min}-{max}"
                    ))
                })?
            }
        };

        let addr = listener.local_addr()?;
        debug!(%addr, "bound plugin TCP listener");
        Ok(Listener {
            kind: ListenerKind::Tcp(listener),
            endpoint: Endpoint::tcp(addr.to_string()),
            cleanup: None,
        })
    }

    /// Bind a Unix socket inside a fresh subdirectory.
    ///
    /// The subdirectory is created mode 0770 and the socket mode 0660, with
    /// group ownership applied to both when a group is configured.
    #[cfg(unix)]
    pub async fn bind_unix(config: &UnixSocketConfig) -> Result<Listener> {
        use std::os::unix::fs::PermissionsExt;

        let config = config.resolved();
        let parent = config
            .parent_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        std::fs::create_dir_all(&parent)
            .map_err(|e| SkiffError::transport("failed to create socket parent dir", e))?;

        let dir = tempfile::Builder::new()
            .prefix("plugin-")
            .tempdir_in(&parent)
            .map_err(|e| SkiffError::transport("failed to create socket dir", e))?
            .keep();
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o770))?;

        let socket = dir.join("plugin.sock");
        let listener = UnixListener::bind(&socket).map_err(|e| {
            let _ = std::fs::remove_dir_all(&dir);
            SkiffError::transport("failed to bind plugin unix socket", e)
        })?;
        std::fs::set_permissions(&socket, std::fs::Permissions::from_mode(0o660))?;

        if let Some(ref group) = config.group {
            let gid = resolve_group(group)?;
            for path in [&dir, &socket] {
                nix::unistd::chown(path, None, Some(gid)).map_err(|e| {
                    SkiffError::config(format!(
                        "failed to set group {group:?} on {}: {e}",
                        path.display()
                    ))
                })?;
            }
        }

        debug!(path = %socket.display(), "bound plugin unix listener");
        Ok(Listener {
            endpoint: Endpoint::unix(socket.to_string_lossy().into_owned()),
            kind: ListenerKind::Unix(listener),
            cleanup: Some(UnixCleanup { socket, dir }),
        })
    }

    /// The address peers should dial.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Accept one connection.
    pub async fn accept(&self) -> Result<Connection> {
        match &self.kind {
            ListenerKind::Tcp(l) => {
                let (stream, _) = l
                    .accept()
                    .await
                    .map_err(|e| SkiffError::transport("accept failed", e))?;
                let _ = stream.set_nodelay(true);
                Ok(Connection::Tcp(stream))
            }
            #[cfg(unix)]
            ListenerKind::Unix(l) => {
                let (stream, _) = l
                    .accept()
                    .await
                    .map_err(|e| SkiffError::transport("accept failed", e))?;
                Ok(Connection::Unix(stream))
            }
        }
    }

    /// Remove any filesystem state. Idempotent; also runs on drop.
    pub fn close(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup.remove();
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.close();
    }
}

/// Dial an endpoint.
pub async fn dial(endpoint: &Endpoint) -> Result<Connection> {
    match endpoint.network {
        Network::Tcp => {
            let addr: SocketAddr = endpoint.address.parse().map_err(|_| {
                SkiffError::config(format!("invalid TCP address {:?}", endpoint.address))
            })?;
            let stream = TcpStream::connect(addr)
                .await
                .map_err(|e| SkiffError::transport(format!("failed to dial {endpoint}"), e))?;
            let _ = stream.set_nodelay(true);
            Ok(Connection::Tcp(stream))
        }
        #[cfg(unix)]
        Network::Unix => {
            let stream = UnixStream::connect(&endpoint.address)
                .await
                .map_err(|e| SkiffError::transport(format!("failed to dial {endpoint}"), e))?;
            Ok(Connection::Unix(stream))
        }
        #[cfg(not(unix))]
        Network::Unix => Err(SkiffError::config(
            "unix sockets are not supported on this platform".to_string(),
        )),
    }
}

/// Read the plugin TCP port range from the environment. Returns `None` when
/// neither bound is set; a half-set or inverted range is a configuration
/// error.
pub fn port_range_from_env() -> Result<Option<(u16, u16)>> {
    let parse = |name: &str| -> Result<Option<u16>> {
        match std::env::var(name) {
            Err(_) => Ok(None),
            Ok(v) if v.is_empty() => Ok(None),
            Ok(v) => v.parse::<u16>().map(Some).map_err(|_| {
                SkiffError::config(format!("couldn't get value from {name}: {v:?}"))
            }),
        }
    };

    let min = parse(plugin_env::MIN_PORT)?;
    let max = parse(plugin_env::MAX_PORT)?;
    match (min, max) {
        (None, None) => Ok(None),
        (min, max) => {
            let min = min.unwrap_or(0);
            let max = max.unwrap_or(u16::MAX);
            if min > max {
                return Err(SkiffError::config(format!(
                    "{} value of {min} is greater than {} value of {max}",
                    plugin_env::MIN_PORT,
                    plugin_env::MAX_PORT
                )));
            }
            Ok(Some((min, max)))
        }
    }
}

/// Resolve a group given as a numeric gid or a group name.
#[cfg(unix)]
fn resolve_group(group: &str) -> Result<nix::unistd::Gid> {
    if let Ok(gid) = group.parse::<u32>() {
        return Ok(nix::unistd::Gid::from_raw(gid));
    }
    match nix::unistd::Group::from_name(group) {
        Ok(Some(g)) => Ok(g.gid),
        Ok(None) => Err(SkiffError::config(format!("failed to find gid from {group:?}"))),
        Err(e) => Err(SkiffError::config(format!(
            "failed to look up group {group:?}: {e}"
        ))),
    }
}
