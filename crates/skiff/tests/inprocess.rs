//! Integration tests that run host and plugin inside one process: custom
//! runners, test-mode serving, and handshake boundary behavior.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{oneshot, watch, Notify};

use skiff::config::BufferConfig;
use skiff::runner::{ChildStream, Runner};
use skiff::transport::Listener;
use skiff::{
    plugin_set, serve, CommandSpec, Endpoint, HandshakeConfig, Plugin, Protocol, ReattachConfig,
    Result, RpcHandler, RpcServiceHandle, ServeConfig, ServeTestConfig, SkiffError, Supervisor,
    SupervisorConfig,
};

fn handshake_config() -> HandshakeConfig {
    HandshakeConfig {
        user_version: 1,
        magic_cookie_key: "SKIFF_INPROC_COOKIE".to_string(),
        magic_cookie_value: "0ddba11".to_string(),
    }
}

struct EchoHandler;

#[async_trait]
impl RpcHandler for EchoHandler {
    async fn call(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value> {
        match method {
            "echo" => Ok(params),
            other => Err(SkiffError::config(format!("unknown method {other}"))),
        }
    }
}

struct EchoPlugin;

impl Plugin for EchoPlugin {
    fn rpc_server(&self) -> Result<Arc<dyn RpcHandler>> {
        Ok(Arc::new(EchoHandler))
    }
}

/// A grpc-capable plugin with no services of its own; `grpc_client` hands
/// back the shared channel.
struct BareGrpcPlugin;

impl Plugin for BareGrpcPlugin {
    fn grpc_server(
        &self,
        _broker: &Arc<skiff::GrpcBroker>,
        _routes: &mut tonic::service::RoutesBuilder,
    ) -> Result<()> {
        Ok(())
    }

    fn grpc_client(
        &self,
        _broker: Arc<skiff::GrpcBroker>,
        channel: tonic::transport::Channel,
    ) -> Result<Box<dyn std::any::Any + Send + Sync>> {
        Ok(Box::new(channel))
    }
}

fn echo_plugins() -> skiff::PluginSet {
    plugin_set([("echo", Arc::new(EchoPlugin) as Arc<dyn Plugin>)])
}

/// A runner with no real process behind it: "stdout" is a canned byte
/// buffer, `wait` parks until `kill`.
struct FakeRunner {
    stdout: Mutex<Option<ChildStream>>,
    killed: AtomicBool,
    exit: Arc<Notify>,
}

impl FakeRunner {
    fn new(stdout: Vec<u8>) -> FakeRunner {
        FakeRunner {
            stdout: Mutex::new(Some(Box::new(std::io::Cursor::new(stdout)))),
            killed: AtomicBool::new(false),
            exit: Arc::new(Notify::new()),
        }
    }
}

#[async_trait]
impl Runner for FakeRunner {
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn wait(&self) -> Result<()> {
        self.exit.notified().await;
        Ok(())
    }

    async fn kill(&self) -> Result<()> {
        self.killed.store(true, Ordering::SeqCst);
        self.exit.notify_one();
        Ok(())
    }

    fn take_stdout(&self) -> Option<ChildStream> {
        self.stdout.lock().unwrap().take()
    }

    fn take_stderr(&self) -> Option<ChildStream> {
        None
    }

    fn name(&self) -> String {
        "fake-runner".to_string()
    }

    fn pid(&self) -> Option<u32> {
        None
    }

    async fn diagnose(&self) -> String {
        String::new()
    }
}

fn supervisor_with_runner(runner: Arc<dyn Runner>) -> Supervisor {
    let mut config = SupervisorConfig::new(handshake_config(), echo_plugins());
    config.runner = Some(runner);
    Supervisor::new(config)
}

#[tokio::test(flavor = "multi_thread")]
async fn custom_runner_full_session() {
    // A real listener serving the request/response protocol in-process.
    let listener = Listener::bind_tcp(None).await.unwrap();
    let endpoint = listener.endpoint().clone();
    let (shutdown, _) = watch::channel(false);
    let shutdown = Arc::new(shutdown);
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            loop {
                let conn = match listener.accept().await {
                    Ok(c) => c,
                    Err(_) => break,
                };
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let _ = skiff::rpc::serve_session(
                        skiff::transport::IoStream::Plain(conn),
                        echo_plugins(),
                        shutdown,
                        None,
                        None,
                    )
                    .await;
                });
            }
        }
    });

    // The fake runner "prints" a handshake pointing at that listener.
    let line = format!("1|1|tcp|{}|request_response|\n", endpoint.address);
    let runner = Arc::new(FakeRunner::new(line.into_bytes()));
    let supervisor = supervisor_with_runner(runner.clone());

    let negotiated = supervisor.start().await.unwrap();
    assert_eq!(negotiated, endpoint);
    assert_eq!(supervisor.negotiated_version(), Some(1));

    let handle = supervisor
        .dispense("echo")
        .await
        .unwrap()
        .downcast::<RpcServiceHandle>()
        .unwrap();
    let result = handle
        .call("echo", serde_json::json!({"k": "v"}))
        .await
        .unwrap();
    assert_eq!(result, serde_json::json!({"k": "v"}));

    supervisor.kill().await;
    assert!(runner.killed.load(Ordering::SeqCst));
}

#[tokio::test(flavor = "multi_thread")]
async fn handshake_line_at_scanner_max_succeeds() {
    let prefix = "1|1|tcp|127.0.0.1:1|request_response|";
    // Pad with a base64-alphabet certificate field so the whole line,
    // newline included, sits exactly at the scanner cap.
    let pad = BufferConfig::HANDSHAKE_LINE_MAX - prefix.len() - 1;
    let line = format!("{prefix}{}\n", "A".repeat(pad));
    assert_eq!(line.len(), BufferConfig::HANDSHAKE_LINE_MAX);

    let runner = Arc::new(FakeRunner::new(line.into_bytes()));
    let supervisor = supervisor_with_runner(runner);
    let endpoint = supervisor.start().await.unwrap();
    assert_eq!(endpoint, Endpoint::tcp("127.0.0.1:1"));
    supervisor.kill().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn handshake_line_over_scanner_max_is_fatal() {
    let prefix = "1|1|tcp|127.0.0.1:1|request_response|";
    let pad = BufferConfig::HANDSHAKE_LINE_MAX - prefix.len();
    let line = format!("{prefix}{}\n", "A".repeat(pad));
    assert!(line.len() > BufferConfig::HANDSHAKE_LINE_MAX);

    let runner = Arc::new(FakeRunner::new(line.into_bytes()));
    let supervisor = supervisor_with_runner(runner);
    let err = supervisor.start().await.unwrap_err();
    match err {
        SkiffError::HandshakeParse { reason, .. } => assert!(reason.contains("exceeds")),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn disallowed_protocol_is_fatal() {
    // The plugin announces streaming but the host only allows
    // request/response.
    let line = "1|1|tcp|127.0.0.1:1|streaming|\n";
    let runner = Arc::new(FakeRunner::new(line.as_bytes().to_vec()));
    let supervisor = supervisor_with_runner(runner);
    let err = supervisor.start().await.unwrap_err();
    assert!(matches!(err, SkiffError::ProtocolDisallowed { .. }));
}

#[tokio::test(flavor = "multi_thread")]
async fn grpc_test_mode_reattach_health_and_dispense() {
    let plugins = plugin_set([("bare", Arc::new(BareGrpcPlugin) as Arc<dyn Plugin>)]);

    let (reattach_tx, reattach_rx) = oneshot::channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (close_tx, close_rx) = oneshot::channel();

    let serve_task = tokio::spawn(serve(
        ServeConfig::new(handshake_config(), plugins.clone())
            .protocol(Protocol::Streaming)
            .test(ServeTestConfig {
                reattach_tx: Some(reattach_tx),
                shutdown_rx: Some(shutdown_rx),
                close_tx: Some(close_tx),
            }),
    ));

    let reattach = reattach_rx.await.unwrap();
    assert_eq!(reattach.protocol, Protocol::Streaming);

    let supervisor = Supervisor::new(
        SupervisorConfig::new(handshake_config(), plugins)
            .reattach(reattach)
            .allowed_protocols(vec![Protocol::Streaming]),
    );

    // Health service answers the ping.
    supervisor.ping().await.unwrap();

    // Dispensing hands back the typed stub (here: the raw channel).
    let stub = supervisor.dispense("bare").await.unwrap();
    assert!(stub.downcast::<tonic::transport::Channel>().is_ok());

    supervisor.kill().await;
    close_rx.await.unwrap();
    serve_task.await.unwrap().unwrap();
    drop(shutdown_tx);
}

#[tokio::test(flavor = "multi_thread")]
async fn reattach_rejects_unknown_version() {
    let supervisor = Supervisor::new(
        SupervisorConfig::new(handshake_config(), echo_plugins()).reattach(ReattachConfig {
            protocol: Protocol::RequestResponse,
            endpoint: Endpoint::tcp("127.0.0.1:1"),
            pid: std::process::id(),
            user_version: 9,
            test: true,
            owned: false,
        }),
    );
    let err = supervisor.start().await.unwrap_err();
    assert!(matches!(
        err,
        SkiffError::VersionMismatch { negotiated: 9, .. }
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn command_and_runner_are_mutually_exclusive() {
    let mut config = SupervisorConfig::new(handshake_config(), echo_plugins())
        .command(CommandSpec::new("/bin/true"));
    config.runner = Some(Arc::new(FakeRunner::new(Vec::new())));
    let err = Supervisor::new(config).start().await.unwrap_err();
    assert!(matches!(err, SkiffError::Config { .. }));
}
