//! The host-side supervisor.
//!
//! Owns the plugin's whole lifetime: validates configuration, launches (or
//! attaches to) the process, reads the handshake, dials the negotiated
//! transport, dispenses typed service handles, and guarantees that killing
//! the supervisor leaves nothing behind: no process, no socket files, no
//! temp directories.

use std::any::Any;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::io::AsyncWrite;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::config::{env as plugin_env, BufferConfig, HandshakeConfig, TimeoutConfig};
use crate::error::{Result, SkiffError};
use crate::grpc::{AddrTranslator, GrpcClientProtocol};
use crate::handshake::{HandshakeRecord, Protocol, CORE_PROTOCOL_VERSION};
use crate::mtls::{self, EphemeralIdentity, TlsContext};
use crate::plugin::{PluginSet, VersionedPluginSet};
use crate::rpc::RpcClientProtocol;
use crate::runner::{AttachedRunner, CommandRunner, CommandSpec, ReattachConfig, Runner};
use crate::stdio::{forward_stderr, LineScanner};
use crate::transport::{self, Endpoint, IoStream, UnixSocketConfig};

/// Hash algorithms accepted for binary integrity checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha256,
}

/// Integrity check applied to the plugin binary before spawn.
#[derive(Debug, Clone)]
pub struct SecureConfig {
    /// Lowercase hex digest the binary must hash to.
    pub digest: String,
    pub algorithm: HashAlgorithm,
}

/// Everything the supervisor needs to launch and talk to one plugin.
pub struct SupervisorConfig {
    pub handshake: HandshakeConfig,
    /// Plugins for the implied version (`handshake.user_version`).
    pub plugins: PluginSet,
    /// Plugin sets for explicit versions; merged with `plugins` for
    /// negotiation.
    pub versioned_plugins: VersionedPluginSet,
    /// Command to launch. Exactly one of `command`, `reattach`, `runner`.
    pub command: Option<CommandSpec>,
    /// Reconnect to a running plugin instead of spawning.
    pub reattach: Option<ReattachConfig>,
    /// Caller-supplied runner (e.g. for sandboxed execution).
    pub runner: Option<Arc<dyn Runner>>,
    /// Transports the host accepts from the handshake.
    pub allowed_protocols: Vec<Protocol>,
    pub start_timeout: Duration,
    pub secure_config: Option<SecureConfig>,
    /// Generate ephemeral certificates and require mutual TLS.
    pub auto_mtls: bool,
    /// Static TLS configuration; mutually exclusive with `auto_mtls`.
    pub tls_config: Option<Arc<rustls::ClientConfig>>,
    /// Inclusive TCP port range passed to the plugin.
    pub port_range: Option<(u16, u16)>,
    /// When set, the host creates a group-owned temp directory for the
    /// plugin's Unix socket and passes it through the environment.
    pub unix_socket_config: Option<UnixSocketConfig>,
    /// Sink for the plugin's redirected stdout stream.
    pub sync_stdout: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    /// Sink for the plugin's redirected stderr stream.
    pub sync_stderr: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    /// Sink for raw (non-JSON) lines scanned off the child's stderr pipe.
    pub stderr_sink: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    /// Buffer for the stderr line scanner.
    pub stderr_scan_buffer: usize,
    /// Advertise gRPC broker multiplexing; the plugin must confirm.
    pub grpc_broker_multiplex: bool,
}

impl SupervisorConfig {
    pub fn new(handshake: HandshakeConfig, plugins: PluginSet) -> SupervisorConfig {
        SupervisorConfig {
            handshake,
            plugins,
            versioned_plugins: BTreeMap::new(),
            command: None,
            reattach: None,
            runner: None,
            allowed_protocols: vec![Protocol::RequestResponse],
            start_timeout: TimeoutConfig::START_TIMEOUT,
            secure_config: None,
            auto_mtls: false,
            tls_config: None,
            port_range: None,
            unix_socket_config: None,
            sync_stdout: None,
            sync_stderr: None,
            stderr_sink: None,
            stderr_scan_buffer: BufferConfig::STDERR_SCAN_BUFFER,
            grpc_broker_multiplex: false,
        }
    }

    pub fn command(mut self, spec: CommandSpec) -> Self {
        self.command = Some(spec);
        self
    }

    pub fn reattach(mut self, reattach: ReattachConfig) -> Self {
        self.reattach = Some(reattach);
        self
    }

    pub fn allowed_protocols(mut self, protocols: Vec<Protocol>) -> Self {
        self.allowed_protocols = protocols;
        self
    }

    pub fn start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    pub fn auto_mtls(mut self, enabled: bool) -> Self {
        self.auto_mtls = enabled;
        self
    }

    pub fn secure_config(mut self, secure: SecureConfig) -> Self {
        self.secure_config = Some(secure);
        self
    }

    pub fn versioned_plugins(mut self, versioned: VersionedPluginSet) -> Self {
        self.versioned_plugins = versioned;
        self
    }

    pub fn sync_stdout(mut self, sink: Box<dyn AsyncWrite + Send + Unpin>) -> Self {
        self.sync_stdout = Some(sink);
        self
    }

    pub fn sync_stderr(mut self, sink: Box<dyn AsyncWrite + Send + Unpin>) -> Self {
        self.sync_stderr = Some(sink);
        self
    }

    pub fn stderr_sink(mut self, sink: Box<dyn AsyncWrite + Send + Unpin>) -> Self {
        self.stderr_sink = Some(sink);
        self
    }
}

/// Immutable configuration after the move-only parts are split off.
struct ConfigParts {
    handshake: HandshakeConfig,
    command: Option<CommandSpec>,
    reattach: Option<ReattachConfig>,
    runner: Option<Arc<dyn Runner>>,
    allowed_protocols: Vec<Protocol>,
    start_timeout: Duration,
    secure_config: Option<SecureConfig>,
    auto_mtls: bool,
    tls_config: Option<Arc<rustls::ClientConfig>>,
    port_range: Option<(u16, u16)>,
    unix_socket_config: Option<UnixSocketConfig>,
    stderr_scan_buffer: usize,
    grpc_broker_multiplex: bool,
}

struct SinkSet {
    sync_stdout: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    sync_stderr: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    stderr_sink: Option<Box<dyn AsyncWrite + Send + Unpin>>,
}

#[derive(Default)]
struct SupState {
    endpoint: Option<Endpoint>,
    negotiated_version: Option<u32>,
    protocol: Option<Protocol>,
    exited: bool,
    identity: Option<Arc<EphemeralIdentity>>,
    server_cert: Option<Vec<u8>>,
    temp_dir: Option<tempfile::TempDir>,
    start_failed: bool,
}

/// An established per-protocol client session.
#[derive(Clone)]
pub enum ClientProtocol {
    Rpc(Arc<RpcClientProtocol>),
    Grpc(Arc<GrpcClientProtocol>),
}

impl ClientProtocol {
    pub async fn dispense(&self, name: &str) -> Result<Box<dyn Any + Send + Sync>> {
        match self {
            ClientProtocol::Rpc(p) => p.dispense(name).await,
            ClientProtocol::Grpc(p) => p.dispense(name).await,
        }
    }

    pub async fn ping(&self) -> Result<()> {
        match self {
            ClientProtocol::Rpc(p) => p.ping().await,
            ClientProtocol::Grpc(p) => p.ping().await,
        }
    }

    async fn quit(&self) -> Result<()> {
        match self {
            ClientProtocol::Rpc(p) => p.quit().await,
            ClientProtocol::Grpc(p) => p.quit().await,
        }
    }

    fn close(&self) {
        match self {
            ClientProtocol::Rpc(p) => p.close(),
            ClientProtocol::Grpc(p) => p.close(),
        }
    }

    /// The gRPC broker, when this session runs the streaming transport.
    pub fn grpc_broker(&self) -> Option<Arc<crate::grpc::GrpcBroker>> {
        match self {
            ClientProtocol::Rpc(_) => None,
            ClientProtocol::Grpc(p) => Some(p.broker()),
        }
    }
}

/// Manages the lifecycle of one plugin subprocess and the connection to it.
pub struct Supervisor {
    config: ConfigParts,
    sinks: Mutex<SinkSet>,
    state: Arc<Mutex<SupState>>,
    runner: Mutex<Option<Arc<dyn Runner>>>,
    active_plugins: Mutex<PluginSet>,
    version_map: BTreeMap<u32, PluginSet>,
    client: tokio::sync::Mutex<Option<ClientProtocol>>,
    start_lock: tokio::sync::Mutex<()>,
    kill_lock: tokio::sync::Mutex<()>,
    done: Arc<watch::Sender<bool>>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Supervisor {
        let SupervisorConfig {
            handshake,
            plugins,
            versioned_plugins,
            command,
            reattach,
            runner,
            allowed_protocols,
            start_timeout,
            secure_config,
            auto_mtls,
            tls_config,
            port_range,
            unix_socket_config,
            sync_stdout,
            sync_stderr,
            stderr_sink,
            stderr_scan_buffer,
            grpc_broker_multiplex,
        } = config;

        // Fold the implied version into the negotiation map.
        let mut version_map = versioned_plugins;
        if !plugins.is_empty() {
            version_map.insert(handshake.user_version, plugins);
        }

        let (done, _) = watch::channel(false);
        let done = Arc::new(done);
        Supervisor {
            config: ConfigParts {
                handshake,
                command,
                reattach,
                runner,
                allowed_protocols,
                start_timeout,
                secure_config,
                auto_mtls,
                tls_config,
                port_range,
                unix_socket_config,
                stderr_scan_buffer,
                grpc_broker_multiplex,
            },
            sinks: Mutex::new(SinkSet {
                sync_stdout,
                sync_stderr,
                stderr_sink,
            }),
            state: Arc::new(Mutex::new(SupState::default())),
            runner: Mutex::new(None),
            active_plugins: Mutex::new(PluginSet::new()),
            version_map,
            client: tokio::sync::Mutex::new(None),
            start_lock: tokio::sync::Mutex::new(()),
            kill_lock: tokio::sync::Mutex::new(()),
            done,
        }
    }

    /// Launch the plugin (or attach to it) and wait for the handshake.
    /// Idempotent: later calls return the already-negotiated address.
    pub async fn start(&self) -> Result<Endpoint> {
        let _guard = self.start_lock.lock().await;

        {
            let state = self.state.lock().unwrap();
            if let Some(ref endpoint) = state.endpoint {
                return Ok(endpoint.clone());
            }
            if state.start_failed {
                return Err(SkiffError::config("supervisor already failed to start"));
            }
        }

        let result = self.start_inner().await;
        if result.is_err() {
            self.state.lock().unwrap().start_failed = true;
            // The deferred-cleanup contract: any failed start kills the
            // process and removes temp state before surfacing the error.
            self.kill().await;
        }
        result
    }

    async fn start_inner(&self) -> Result<Endpoint> {
        self.validate_config()?;

        if let (Some(secure), Some(command)) = (&self.config.secure_config, &self.config.command) {
            verify_checksum(&command.program, secure).await?;
        }

        let runner = self.build_runner().await?;
        *self.runner.lock().unwrap() = Some(runner.clone());

        runner.start().await?;

        // Stderr pipeline.
        if let Some(stderr) = runner.take_stderr() {
            let sink = self.sinks.lock().unwrap().stderr_sink.take();
            tokio::spawn(forward_stderr(
                runner.name(),
                stderr,
                self.config.stderr_scan_buffer,
                sink,
            ));
        }

        // Stdout line scanner: first line is the handshake, the rest is
        // stray output drained at debug level.
        let handshake_rx = runner.take_stdout().map(|stdout| {
            let (tx, rx) = oneshot::channel();
            let name = runner.name();
            tokio::spawn(scan_stdout(name, stdout, tx));
            rx
        });

        // Waiter: flips `exited` and fires the shared cancellation signal
        // the moment the process goes away.
        {
            let runner = runner.clone();
            let done = self.done.clone();
            let state = self.state.clone();
            tokio::spawn(async move {
                if let Err(e) = runner.wait().await {
                    debug!(error = %e, "plugin wait failed");
                }
                state.lock().unwrap().exited = true;
                let _ = done.send(true);
            });
        }

        if let Some(reattach) = &self.config.reattach {
            return self.finish_reattach(reattach.clone()).await;
        }

        let handshake_rx = handshake_rx.ok_or_else(|| {
            SkiffError::config("runner produced no stdout stream for the handshake")
        })?;

        let line = self.await_handshake_line(&runner, handshake_rx).await?;
        self.finish_handshake(&runner, &line)
    }

    fn validate_config(&self) -> Result<()> {
        let sources = [
            self.config.command.is_some(),
            self.config.reattach.is_some(),
            self.config.runner.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count();
        if sources != 1 {
            return Err(SkiffError::config(
                "exactly one of command, reattach, or runner must be set",
            ));
        }
        if self.config.secure_config.is_some() && self.config.reattach.is_some() {
            return Err(SkiffError::config(
                "secure_config cannot be used when reattaching",
            ));
        }
        if self.config.auto_mtls && self.config.tls_config.is_some() {
            return Err(SkiffError::config(
                "auto_mtls and tls_config are mutually exclusive",
            ));
        }
        if let Some((min, max)) = self.config.port_range {
            if min > max {
                return Err(SkiffError::config(format!(
                    "port range minimum {min} is greater than maximum {max}"
                )));
            }
        }
        if self.config.grpc_broker_multiplex
            && !self.config.allowed_protocols.contains(&Protocol::Streaming)
        {
            return Err(SkiffError::config(
                "gRPC broker multiplexing requires the streaming protocol",
            ));
        }
        if self.version_map.is_empty() {
            return Err(SkiffError::config("no plugins configured"));
        }
        Ok(())
    }

    async fn build_runner(&self) -> Result<Arc<dyn Runner>> {
        if let Some(runner) = &self.config.runner {
            return Ok(runner.clone());
        }
        if let Some(reattach) = &self.config.reattach {
            return Ok(Arc::new(AttachedRunner::new(reattach.clone())));
        }

        let mut spec = self
            .config
            .command
            .clone()
            .expect("validated: command is set");
        spec = spec.env(
            self.config.handshake.magic_cookie_key.clone(),
            self.config.handshake.magic_cookie_value.clone(),
        );

        let versions: Vec<String> = self.version_map.keys().map(|v| v.to_string()).collect();
        spec = spec.env(plugin_env::PROTOCOL_VERSIONS, versions.join(","));

        if let Some((min, max)) = self.config.port_range {
            spec = spec.env(plugin_env::MIN_PORT, min.to_string());
            spec = spec.env(plugin_env::MAX_PORT, max.to_string());
        }
        if self.config.grpc_broker_multiplex {
            spec = spec.env(plugin_env::MULTIPLEX_GRPC, "true");
        }

        if let Some(unix_config) = &self.config.unix_socket_config {
            let dir = create_socket_dir(unix_config)?;
            spec = spec.env(
                plugin_env::UNIX_SOCKET_DIR,
                dir.path().to_string_lossy().into_owned(),
            );
            if let Some(ref group) = unix_config.group {
                spec = spec.env(plugin_env::UNIX_SOCKET_GROUP, group.clone());
            }
            self.state.lock().unwrap().temp_dir = Some(dir);
        }

        if self.config.auto_mtls {
            let identity = EphemeralIdentity::generate()?;
            spec = spec.env(plugin_env::CLIENT_CERT, identity.cert_pem.clone());
            self.state.lock().unwrap().identity = Some(Arc::new(identity));
        }

        Ok(Arc::new(CommandRunner::new(spec)))
    }

    async fn await_handshake_line(
        &self,
        runner: &Arc<dyn Runner>,
        handshake_rx: oneshot::Receiver<Vec<u8>>,
    ) -> Result<Vec<u8>> {
        let mut done_rx = self.done.subscribe();
        tokio::select! {
            // A handshake that raced with exit detection still counts.
            biased;
            line = handshake_rx => match line {
                Ok(line) => Ok(line),
                Err(_) => Err(SkiffError::PluginExited {
                    diagnosis: some_nonempty(runner.diagnose().await),
                }),
            },
            _ = tokio::time::sleep(self.config.start_timeout) => {
                Err(SkiffError::HandshakeTimeout {
                    waited: self.config.start_timeout,
                    diagnosis: some_nonempty(runner.diagnose().await),
                })
            }
            _ = done_rx.changed() => Err(SkiffError::PluginExited {
                diagnosis: some_nonempty(runner.diagnose().await),
            }),
        }
    }

    fn finish_handshake(&self, runner: &Arc<dyn Runner>, line: &[u8]) -> Result<Endpoint> {
        if !line.ends_with(b"\n") {
            return Err(SkiffError::HandshakeParse {
                line: String::from_utf8_lossy(line).into_owned(),
                reason: format!(
                    "handshake line exceeds {} bytes or was truncated",
                    BufferConfig::HANDSHAKE_LINE_MAX
                ),
            });
        }
        let text = String::from_utf8_lossy(line);
        let record = HandshakeRecord::parse(&text)?;

        if record.core_version != CORE_PROTOCOL_VERSION {
            return Err(SkiffError::CoreVersionMismatch {
                plugin: record.core_version,
                host: CORE_PROTOCOL_VERSION,
            });
        }

        let plugins = self.version_map.get(&record.user_version).ok_or_else(|| {
            SkiffError::VersionMismatch {
                negotiated: record.user_version,
                supported: self.version_map.keys().copied().collect(),
            }
        })?;
        *self.active_plugins.lock().unwrap() = plugins.clone();

        if !self.config.allowed_protocols.contains(&record.protocol) {
            return Err(SkiffError::ProtocolDisallowed {
                protocol: record.protocol,
            });
        }

        if self.config.grpc_broker_multiplex && !record.multiplex {
            return Err(SkiffError::config(
                "host requested gRPC broker multiplexing but the plugin did not confirm it",
            ));
        }

        let server_cert = match record.server_cert {
            Some(ref field) => Some(mtls::decode_handshake_cert(field)?),
            None => None,
        };

        let endpoint = runner.plugin_to_host(&record.endpoint)?;
        info!(
            %endpoint,
            version = record.user_version,
            protocol = %record.protocol,
            "plugin handshake complete"
        );

        let mut state = self.state.lock().unwrap();
        state.endpoint = Some(endpoint.clone());
        state.negotiated_version = Some(record.user_version);
        state.protocol = Some(record.protocol);
        state.server_cert = server_cert;
        Ok(endpoint)
    }

    async fn finish_reattach(&self, reattach: ReattachConfig) -> Result<Endpoint> {
        if !self.config.allowed_protocols.contains(&reattach.protocol) {
            return Err(SkiffError::ProtocolDisallowed {
                protocol: reattach.protocol,
            });
        }
        let plugins = self
            .version_map
            .get(&reattach.user_version)
            .ok_or_else(|| SkiffError::VersionMismatch {
                negotiated: reattach.user_version,
                supported: self.version_map.keys().copied().collect(),
            })?;
        *self.active_plugins.lock().unwrap() = plugins.clone();

        let mut state = self.state.lock().unwrap();
        state.endpoint = Some(reattach.endpoint.clone());
        state.negotiated_version = Some(reattach.user_version);
        state.protocol = Some(reattach.protocol);
        Ok(reattach.endpoint)
    }

    /// The per-protocol client session, dialing it on first use.
    pub async fn client(&self) -> Result<ClientProtocol> {
        let endpoint = self.start().await?;

        let mut slot = self.client.lock().await;
        if let Some(client) = &*slot {
            return Ok(client.clone());
        }

        let (protocol, tls) = {
            let state = self.state.lock().unwrap();
            (state.protocol.unwrap_or_default(), self.tls_context(&state)?)
        };
        let plugins = self.active_plugins.lock().unwrap().clone();
        let (sync_stdout, sync_stderr) = {
            let mut sinks = self.sinks.lock().unwrap();
            (sinks.sync_stdout.take(), sinks.sync_stderr.take())
        };
        let runner = self
            .runner
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| SkiffError::config("supervisor has no runner"))?;

        let client = match protocol {
            Protocol::RequestResponse => {
                let conn = transport::dial(&endpoint).await?;
                let io = match tls.as_ref().and_then(|t| t.client.clone()) {
                    Some(config) => {
                        IoStream::client_tls(conn, config, mtls::TLS_SERVER_NAME).await?
                    }
                    None => IoStream::Plain(conn),
                };
                ClientProtocol::Rpc(
                    RpcClientProtocol::connect(io, plugins, sync_stdout, sync_stderr).await?,
                )
            }
            Protocol::Streaming => {
                let translate: AddrTranslator = {
                    let runner = runner.clone();
                    Arc::new(move |ep: &Endpoint| runner.plugin_to_host(ep))
                };
                ClientProtocol::Grpc(
                    GrpcClientProtocol::connect(
                        endpoint,
                        tls,
                        plugins,
                        Some(translate),
                        sync_stdout,
                        sync_stderr,
                    )
                    .await?,
                )
            }
        };

        *slot = Some(client.clone());
        Ok(client)
    }

    fn tls_context(&self, state: &SupState) -> Result<Option<TlsContext>> {
        if let Some(ref config) = self.config.tls_config {
            return Ok(Some(TlsContext::client_only(config.clone())));
        }
        if !self.config.auto_mtls {
            return Ok(None);
        }
        let identity = state.identity.as_ref().ok_or_else(|| SkiffError::Tls {
            message: "auto-mTLS enabled but no identity was generated".to_string(),
        })?;
        let server_cert = state.server_cert.as_ref().ok_or_else(|| SkiffError::Tls {
            message: "auto-mTLS enabled but the plugin sent no certificate".to_string(),
        })?;
        Ok(Some(TlsContext::mutual(identity, server_cert)?))
    }

    /// Obtain a typed handle for a named service.
    pub async fn dispense(&self, name: &str) -> Result<Box<dyn Any + Send + Sync>> {
        self.client().await?.dispense(name).await
    }

    /// Prove the plugin is alive and serving.
    pub async fn ping(&self) -> Result<()> {
        self.client().await?.ping().await
    }

    /// Shut the plugin down: graceful quit raced against a short timer,
    /// then transport close, then a hard kill, then temp-state removal.
    /// Safe to call multiple times and from multiple tasks.
    pub async fn kill(&self) {
        let _guard = self.kill_lock.lock().await;

        let client = self.client.lock().await.take();
        if let Some(ref client) = client {
            match tokio::time::timeout(TimeoutConfig::GRACEFUL_QUIT_TIMEOUT, client.quit()).await
            {
                Ok(Ok(())) => debug!("plugin accepted graceful shutdown"),
                Ok(Err(e)) => debug!(error = %e, "graceful shutdown call failed"),
                Err(_) => debug!("graceful shutdown timed out"),
            }
            client.close();
        }

        let runner = self.runner.lock().unwrap().clone();
        if let Some(ref runner) = runner {
            if let Err(e) = runner.kill().await {
                warn!(error = %e, "failed to kill plugin process");
            }
        }

        let _ = self.done.send(true);

        // Give the waiter a moment to observe the exit so `exited()` is
        // truthful by the time we return. Only meaningful for processes we
        // spawned; attached processes are allowed to outlive us.
        if runner.is_some() && self.config.command.is_some() {
            for _ in 0..120 {
                if self.state.lock().unwrap().exited {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        }

        // Temp state last.
        let temp_dir = self.state.lock().unwrap().temp_dir.take();
        drop(temp_dir);
    }

    /// Coordinates for reconnecting to this plugin later. `None` until
    /// `start` has succeeded.
    pub fn reattach_config(&self) -> Option<ReattachConfig> {
        let state = self.state.lock().unwrap();
        let runner = self.runner.lock().unwrap();
        Some(ReattachConfig {
            protocol: state.protocol?,
            endpoint: state.endpoint.clone()?,
            pid: runner.as_ref().and_then(|r| r.pid())?,
            user_version: state.negotiated_version?,
            test: false,
            owned: false,
        })
    }

    /// True once the plugin process has exited. Never reverts.
    pub fn exited(&self) -> bool {
        self.state.lock().unwrap().exited
    }

    pub fn negotiated_version(&self) -> Option<u32> {
        self.state.lock().unwrap().negotiated_version
    }

    pub fn protocol(&self) -> Option<Protocol> {
        self.state.lock().unwrap().protocol
    }

    /// The shared cancellation signal: fires on kill, child exit, or
    /// transport teardown.
    pub fn done(&self) -> watch::Receiver<bool> {
        self.done.subscribe()
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        let _ = self.done.send(true);
        let exited = self.state.lock().unwrap().exited;
        if !exited && self.config.command.is_some() {
            // Last-resort, synchronous: never leave a child we spawned
            // running.
            if let Some(runner) = self.runner.get_mut().unwrap() {
                if let Some(pid) = runner.pid() {
                    let _ = crate::runner::kill_process(pid);
                }
            }
        }
    }
}

/// A collection of supervisors with one-shot collective teardown.
///
/// Hosts that launch many plugins register them here and call
/// `kill_all` from their own shutdown path so no child survives the host.
#[derive(Default)]
pub struct SupervisorSet {
    supervisors: Mutex<Vec<Arc<Supervisor>>>,
}

impl SupervisorSet {
    pub fn new() -> SupervisorSet {
        SupervisorSet::default()
    }

    /// Track a supervisor for collective cleanup.
    pub fn register(&self, supervisor: Arc<Supervisor>) {
        self.supervisors.lock().unwrap().push(supervisor);
    }

    /// Number of registered supervisors.
    pub fn len(&self) -> usize {
        self.supervisors.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Kill every registered plugin, concurrently, and wait for all of
    /// them. The set is drained; killing twice is a no-op.
    pub async fn kill_all(&self) {
        let supervisors: Vec<_> = self.supervisors.lock().unwrap().drain(..).collect();
        let mut tasks = Vec::with_capacity(supervisors.len());
        for supervisor in supervisors {
            tasks.push(tokio::spawn(async move { supervisor.kill().await }));
        }
        for task in tasks {
            let _ = task.await;
        }
    }
}

/// Read the handshake line, then drain stray stdout.
async fn scan_stdout(
    name: String,
    stdout: crate::runner::ChildStream,
    handshake_tx: oneshot::Sender<Vec<u8>>,
) {
    let mut scanner = LineScanner::new(stdout, BufferConfig::HANDSHAKE_LINE_MAX);
    match scanner.next_chunk().await {
        Ok(Some(line)) => {
            let _ = handshake_tx.send(line);
        }
        Ok(None) | Err(_) => return,
    }
    loop {
        match scanner.next_chunk().await {
            Ok(Some(line)) => {
                debug!(
                    target: "skiff::plugin",
                    plugin = %name,
                    "stray stdout: {}",
                    String::from_utf8_lossy(&line).trim_end()
                );
            }
            Ok(None) => return,
            Err(e) => {
                error!(plugin = %name, error = %e, "error draining plugin stdout");
                return;
            }
        }
    }
}

fn some_nonempty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

/// Hash the plugin binary and compare against the expected digest.
async fn verify_checksum(path: &Path, secure: &SecureConfig) -> Result<()> {
    let bytes = tokio::fs::read(path).await.map_err(|e| SkiffError::Spawn {
        message: format!("failed to read plugin binary {}", path.display()),
        source: Some(e),
    })?;
    let actual = match secure.algorithm {
        HashAlgorithm::Sha256 => hex::encode(Sha256::digest(&bytes)),
    };
    if !actual.eq_ignore_ascii_case(&secure.digest) {
        return Err(SkiffError::ChecksumMismatch {
            path: path.to_path_buf(),
            expected: secure.digest.to_lowercase(),
            actual,
        });
    }
    Ok(())
}

/// Create the group-owned directory the plugin's Unix socket will live in.
pub(crate) fn create_socket_dir(config: &UnixSocketConfig) -> Result<tempfile::TempDir> {
    let parent = config
        .parent_dir
        .clone()
        .unwrap_or_else(std::env::temp_dir);
    std::fs::create_dir_all(&parent)?;
    let dir = tempfile::Builder::new()
        .prefix("plugin-dir-")
        .tempdir_in(&parent)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o770))?;
        if let Some(ref group) = config.group {
            let gid = if let Ok(raw) = group.parse::<u32>() {
                nix::unistd::Gid::from_raw(raw)
            } else {
                nix::unistd::Group::from_name(group)
                    .ok()
                    .flatten()
                    .map(|g| g.gid)
                    .ok_or_else(|| {
                        SkiffError::config(format!("failed to find gid from {group:?}"))
                    })?
            };
            nix::unistd::chown(dir.path(), None, Some(gid)).map_err(|e| {
                SkiffError::config(format!("failed to set socket dir group: {e}"))
            })?;
        }
    }
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::PluginSet;

    fn handshake() -> HandshakeConfig {
        HandshakeConfig {
            user_version: 1,
            magic_cookie_key: "COOKIE".into(),
            magic_cookie_value: "value".into(),
        }
    }

    fn one_plugin() -> PluginSet {
        struct Null;
        impl crate::plugin::Plugin for Null {}
        crate::plugin_set([("p", Arc::new(Null) as Arc<dyn crate::plugin::Plugin>)])
    }

    fn reattach() -> ReattachConfig {
        ReattachConfig {
            protocol: Protocol::RequestResponse,
            endpoint: Endpoint::tcp("127.0.0.1:1"),
            pid: 1,
            user_version: 1,
            test: false,
            owned: false,
        }
    }

    #[tokio::test]
    async fn test_no_launch_source_is_config_error() {
        let supervisor = Supervisor::new(SupervisorConfig::new(handshake(), one_plugin()));
        let err = supervisor.start().await.unwrap_err();
        assert!(matches!(err, SkiffError::Config { .. }));
    }

    #[tokio::test]
    async fn test_secure_config_with_reattach_rejected() {
        let config = SupervisorConfig::new(handshake(), one_plugin())
            .reattach(reattach())
            .secure_config(SecureConfig {
                digest: "00".repeat(32),
                algorithm: HashAlgorithm::Sha256,
            });
        let err = Supervisor::new(config).start().await.unwrap_err();
        assert!(matches!(err, SkiffError::Config { .. }));
    }

    #[tokio::test]
    async fn test_inverted_port_range_rejected() {
        let mut config = SupervisorConfig::new(handshake(), one_plugin())
            .command(CommandSpec::new("/bin/true"));
        config.port_range = Some((2000, 1000));
        let err = Supervisor::new(config).start().await.unwrap_err();
        assert!(matches!(err, SkiffError::Config { .. }));
    }

    #[tokio::test]
    async fn test_multiplex_requires_streaming() {
        let mut config = SupervisorConfig::new(handshake(), one_plugin())
            .command(CommandSpec::new("/bin/true"));
        config.grpc_broker_multiplex = true;
        let err = Supervisor::new(config).start().await.unwrap_err();
        assert!(matches!(err, SkiffError::Config { .. }));
    }

    #[tokio::test]
    async fn test_no_plugins_rejected() {
        let config = SupervisorConfig::new(handshake(), PluginSet::new())
            .command(CommandSpec::new("/bin/true"));
        let err = Supervisor::new(config).start().await.unwrap_err();
        assert!(matches!(err, SkiffError::Config { .. }));
    }

    #[tokio::test]
    async fn test_start_failure_is_sticky() {
        let supervisor = Supervisor::new(SupervisorConfig::new(handshake(), one_plugin()));
        assert!(supervisor.start().await.is_err());
        let err = supervisor.start().await.unwrap_err();
        assert!(matches!(err, SkiffError::Config { .. }));
    }

    #[tokio::test]
    async fn test_supervisor_set_drains_on_kill_all() {
        let set = SupervisorSet::new();
        assert!(set.is_empty());

        // Never-started supervisors: kill is still safe and the set drains.
        set.register(Arc::new(Supervisor::new(SupervisorConfig::new(
            handshake(),
            one_plugin(),
        ))));
        set.register(Arc::new(Supervisor::new(SupervisorConfig::new(
            handshake(),
            one_plugin(),
        ))));
        assert_eq!(set.len(), 2);

        set.kill_all().await;
        assert!(set.is_empty());

        // Idempotent.
        set.kill_all().await;
    }

    #[tokio::test]
    async fn test_accessors_before_start() {
        let supervisor = Supervisor::new(
            SupervisorConfig::new(handshake(), one_plugin())
                .command(CommandSpec::new("/bin/true")),
        );
        assert!(!supervisor.exited());
        assert!(supervisor.negotiated_version().is_none());
        assert!(supervisor.protocol().is_none());
        assert!(supervisor.reattach_config().is_none());
    }
}
