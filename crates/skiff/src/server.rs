//! The plugin side: serve registered plugins to a host.
//!
//! `serve` is the whole life of a plugin process: validate the magic
//! cookie, negotiate a user protocol version, bind a listener, set up TLS,
//! print the handshake line, redirect stdio, and serve until the host
//! disconnects or asks for shutdown.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};

use crate::config::{env as plugin_env, BufferConfig, HandshakeConfig};
use crate::error::{Result, SkiffError};
use crate::handshake::{HandshakeRecord, Protocol, CORE_PROTOCOL_VERSION};
use crate::mtls::{self, EphemeralIdentity, TlsContext};
use crate::plugin::{PluginSet, VersionedPluginSet};
use crate::runner::ReattachConfig;
use crate::transport::{IoStream, Listener, UnixSocketConfig};

/// Serving in test mode: no cookie check, no handshake line, no stdio
/// redirection; the reattach coordinates go out through a channel instead.
pub struct ServeTestConfig {
    /// Receives the coordinates a host can use to attach.
    pub reattach_tx: Option<oneshot::Sender<ReattachConfig>>,
    /// External shutdown signal for the test harness.
    pub shutdown_rx: Option<watch::Receiver<bool>>,
    /// Closed-notification, fired when serving has fully stopped.
    pub close_tx: Option<oneshot::Sender<()>>,
}

/// Configuration for serving plugins from this process.
pub struct ServeConfig {
    pub handshake: HandshakeConfig,
    /// Plugins for the implied version (`handshake.user_version`).
    pub plugins: PluginSet,
    /// Plugin sets for explicit versions.
    pub versioned_plugins: VersionedPluginSet,
    /// Which transport to announce and serve.
    pub protocol: Protocol,
    /// Static TLS; when absent, `PLUGIN_CLIENT_CERT` triggers auto-mTLS.
    pub tls_provider:
        Option<Box<dyn Fn() -> Result<Arc<rustls::ServerConfig>> + Send + Sync>>,
    /// Socket placement overrides; the environment fills the gaps.
    pub unix_socket_config: UnixSocketConfig,
    /// Present when running inside a test harness.
    pub test: Option<ServeTestConfig>,
}

impl ServeConfig {
    pub fn new(handshake: HandshakeConfig, plugins: PluginSet) -> ServeConfig {
        ServeConfig {
            handshake,
            plugins,
            versioned_plugins: BTreeMap::new(),
            protocol: Protocol::RequestResponse,
            tls_provider: None,
            unix_socket_config: UnixSocketConfig::default(),
            test: None,
        }
    }

    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn versioned_plugins(mut self, versioned: VersionedPluginSet) -> Self {
        self.versioned_plugins = versioned;
        self
    }

    pub fn test(mut self, test: ServeTestConfig) -> Self {
        self.test = Some(test);
        self
    }
}

/// Serve plugins until the host disconnects, the controller fires, or the
/// test harness signals shutdown. This function embodies the process: in
/// the non-test path a cookie mismatch terminates it with exit code 1.
pub async fn serve(config: ServeConfig) -> Result<()> {
    let ServeConfig {
        handshake,
        plugins,
        versioned_plugins,
        protocol,
        tls_provider,
        unix_socket_config,
        test,
    } = config;
    let mut test = test;
    let test_mode = test.is_some();

    if !test_mode {
        check_magic_cookie(&handshake);
    }

    // Version negotiation against the host-advertised list.
    let mut version_map = versioned_plugins;
    if !plugins.is_empty() {
        version_map.insert(handshake.user_version, plugins);
    }
    let client_versions = host_versions_from_env();
    let chosen_version = negotiate_version(&version_map, &client_versions)
        .ok_or_else(|| SkiffError::config("no plugins configured to serve"))?;
    let active_plugins = version_map
        .get(&chosen_version)
        .cloned()
        .expect("negotiated version is a map key");
    debug!(version = chosen_version, "negotiated user protocol version");

    // Broker multiplexing is only meaningful on the streaming transport.
    let multiplex_requested =
        std::env::var(plugin_env::MULTIPLEX_GRPC).map(|v| v == "true").unwrap_or(false);
    if multiplex_requested && protocol != Protocol::Streaming {
        return Err(SkiffError::config(
            "host requested gRPC broker multiplexing on a non-streaming protocol",
        ));
    }

    let listener = Listener::bind_default(&unix_socket_config).await?;
    let endpoint = listener.endpoint().clone();

    // TLS: static provider wins; otherwise the host's client certificate
    // in the environment bootstraps auto-mTLS.
    let (tls, cert_field) = build_tls(tls_provider.as_deref())?;

    let record = HandshakeRecord {
        core_version: CORE_PROTOCOL_VERSION,
        user_version: chosen_version,
        endpoint: endpoint.clone(),
        protocol,
        server_cert: cert_field,
        multiplex: multiplex_requested && protocol == Protocol::Streaming,
    };

    let (shutdown_tx, _) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);

    let (stdout_rx, stderr_rx) = if test_mode {
        (None, None)
    } else {
        // The handshake must hit the real stdout before redirection.
        emit_handshake(&record)?;
        redirect_stdio()
    };

    if test_mode {
        if let Some(tx) = test.as_mut().and_then(|t| t.reattach_tx.take()) {
            let _ = tx.send(ReattachConfig {
                protocol,
                endpoint: endpoint.clone(),
                pid: std::process::id(),
                user_version: chosen_version,
                test: true,
                owned: false,
            });
        }
        if let Some(mut rx) = test.as_mut().and_then(|t| t.shutdown_rx.take()) {
            let shutdown_tx = shutdown_tx.clone();
            tokio::spawn(async move {
                let _ = rx.changed().await;
                let _ = shutdown_tx.send(true);
            });
        }
    } else {
        // Only the host gets to stop us; the terminal's interrupt does not.
        tokio::spawn(async {
            loop {
                if tokio::signal::ctrl_c().await.is_err() {
                    return;
                }
                trace!("ignoring interrupt; the host controls plugin shutdown");
            }
        });

        // Stdin is reserved for the library: the host holds our stdin pipe
        // open for as long as it lives, so EOF here means the host is gone
        // and nobody will ever kill us. Shut down instead of lingering.
        let stdin_shutdown = shutdown_tx.clone();
        std::thread::spawn(move || {
            use std::io::Read;
            let mut stdin = std::io::stdin();
            let mut buf = [0u8; 1024];
            loop {
                match stdin.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
            debug!("host closed stdin; shutting down");
            let _ = stdin_shutdown.send(true);
        });
    }

    info!(%endpoint, %protocol, "plugin serving");
    let result = match protocol {
        Protocol::Streaming => {
            crate::grpc::serve_connection(
                listener,
                tls,
                active_plugins,
                shutdown_tx.clone(),
                stdout_rx,
                stderr_rx,
            )
            .await
        }
        Protocol::RequestResponse => {
            serve_request_response(
                listener,
                tls,
                active_plugins,
                shutdown_tx.clone(),
                stdout_rx,
                stderr_rx,
            )
            .await
        }
    };

    if let Some(tx) = test.as_mut().and_then(|t| t.close_tx.take()) {
        let _ = tx.send(());
    }
    info!("plugin server closed");
    result
}

/// Accept host sessions on the request/response transport until shutdown.
async fn serve_request_response(
    listener: Listener,
    tls: Option<TlsContext>,
    plugins: PluginSet,
    shutdown: Arc<watch::Sender<bool>>,
    stdout_rx: Option<mpsc::Receiver<Vec<u8>>>,
    stderr_rx: Option<mpsc::Receiver<Vec<u8>>>,
) -> Result<()> {
    let mut listener = listener;
    let mut shutdown_rx = shutdown.subscribe();
    let tls_server = tls.as_ref().and_then(|t| t.server.clone());
    let mut stdout_rx = stdout_rx;
    let mut stderr_rx = stderr_rx;

    loop {
        let conn = tokio::select! {
            conn = listener.accept() => conn,
            _ = shutdown_rx.changed() => break,
        };
        let conn = match conn {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "listener accept failed");
                break;
            }
        };

        let io = match tls_server.clone() {
            Some(config) => match IoStream::server_tls(conn, config).await {
                Ok(io) => io,
                Err(e) => {
                    warn!(error = %e, "TLS accept failed");
                    continue;
                }
            },
            None => IoStream::Plain(conn),
        };

        let plugins = plugins.clone();
        let shutdown = shutdown.clone();
        let so = stdout_rx.take();
        let se = stderr_rx.take();
        tokio::spawn(async move {
            if let Err(e) = crate::rpc::serve_session(io, plugins, shutdown, so, se).await {
                debug!(error = %e, "host session ended with error");
            }
        });
    }

    listener.close();
    Ok(())
}

/// Verify the magic cookie. On mismatch, print the human-facing
/// explanation and exit(1): this binary was run by hand.
fn check_magic_cookie(handshake: &HandshakeConfig) {
    let ok = std::env::var(&handshake.magic_cookie_key)
        .map(|v| v == handshake.magic_cookie_value)
        .unwrap_or(false);
    if ok {
        return;
    }

    eprintln!(
        "This binary is a plugin. These are not meant to be executed directly.\n\
         Please execute the program that consumes these plugins, which will\n\
         load any plugins automatically."
    );
    std::process::exit(1);
}

/// Parse `PLUGIN_PROTOCOL_VERSIONS`. Invalid entries are reported and
/// skipped, matching the lenient host contract.
fn host_versions_from_env() -> Vec<u32> {
    let raw = match std::env::var(plugin_env::PROTOCOL_VERSIONS) {
        Ok(v) if !v.is_empty() => v,
        _ => return Vec::new(),
    };
    raw.split(',')
        .filter_map(|part| match part.trim().parse::<u32>() {
            Ok(v) => Some(v),
            Err(_) => {
                eprintln!("host sent invalid plugin version {part:?}");
                None
            }
        })
        .collect()
}

/// Pick the highest version both sides speak. Falls back to the lowest
/// configured version so a legacy host that sent no list still gets
/// served; the host reports the mismatch.
fn negotiate_version(
    version_map: &BTreeMap<u32, PluginSet>,
    client_versions: &[u32],
) -> Option<u32> {
    for version in version_map.keys().rev() {
        if client_versions.contains(version) {
            return Some(*version);
        }
    }
    version_map.keys().next().copied()
}

/// Build the TLS context and handshake certificate field.
fn build_tls(
    provider: Option<&(dyn Fn() -> Result<Arc<rustls::ServerConfig>> + Send + Sync)>,
) -> Result<(Option<TlsContext>, Option<String>)> {
    if let Some(provider) = provider {
        return Ok((Some(TlsContext::server_only(provider()?)), None));
    }

    let client_cert_pem = match std::env::var(plugin_env::CLIENT_CERT) {
        Ok(pem) if !pem.is_empty() => pem,
        _ => return Ok((None, None)),
    };

    let identity = EphemeralIdentity::generate()?;
    let host_certs = mtls::certs_from_pem(&client_cert_pem)?;
    let server = mtls::server_config(&identity, &host_certs)?;
    let client = mtls::client_config(&identity, host_certs[0].as_ref())?;
    let field = identity.handshake_field();

    Ok((
        Some(TlsContext {
            client: Some(client),
            server: Some(server),
        }),
        Some(field),
    ))
}

/// Write the handshake record to the real stdout as one flush.
fn emit_handshake(record: &HandshakeRecord) -> Result<()> {
    use std::io::Write;
    let line = record.to_line();
    if line.len() > BufferConfig::HANDSHAKE_LINE_MAX {
        return Err(SkiffError::config("handshake line exceeds the line cap"));
    }
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(line.as_bytes())?;
    stdout.flush()?;
    Ok(())
}

/// Redirect this process's stdout and stderr into pipes whose contents
/// feed the RPC stdio streams. After this, user writes to stdout/stderr
/// land on the host, not the terminal.
#[cfg(unix)]
fn redirect_stdio() -> (
    Option<mpsc::Receiver<Vec<u8>>>,
    Option<mpsc::Receiver<Vec<u8>>>,
) {
    (redirect_fd(1), redirect_fd(2))
}

#[cfg(not(unix))]
fn redirect_stdio() -> (
    Option<mpsc::Receiver<Vec<u8>>>,
    Option<mpsc::Receiver<Vec<u8>>>,
) {
    (None, None)
}

#[cfg(unix)]
fn redirect_fd(target: std::os::fd::RawFd) -> Option<mpsc::Receiver<Vec<u8>>> {
    use std::io::Read;
    use std::os::fd::AsRawFd;

    let (read_fd, write_fd) = match nix::unistd::pipe() {
        Ok(fds) => fds,
        Err(e) => {
            warn!(error = %e, "failed to create stdio pipe");
            return None;
        }
    };
    if let Err(e) = nix::unistd::dup2(write_fd.as_raw_fd(), target) {
        warn!(error = %e, "failed to redirect fd {target}");
        return None;
    }
    drop(write_fd);

    let (tx, rx) = mpsc::channel(BufferConfig::STDIO_QUEUE_DEPTH);
    let mut file = std::fs::File::from(read_fd);
    std::thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match file.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });
    Some(rx)
}
