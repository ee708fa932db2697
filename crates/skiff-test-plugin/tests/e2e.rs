//! End-to-end tests: a real host supervising the real test-plugin binary
//! over both transports.

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::AsyncWrite;
use tokio::sync::{oneshot, watch};
use tonic::service::RoutesBuilder;
use tonic::transport::Channel;

use skiff::{
    serve, CommandSpec, HashAlgorithm, Protocol, ReattachConfig, RpcServiceHandle, SecureConfig,
    ServeConfig, ServeTestConfig, SkiffError, Supervisor, SupervisorConfig,
};
use skiff_test_plugin::{counter_plugins, proto, test_handshake, CounterClient, EchobackService};

fn plugin_command(mode: &str) -> CommandSpec {
    CommandSpec::new(env!("CARGO_BIN_EXE_skiff-test-plugin")).arg(mode)
}

fn supervisor_for(mode: &str) -> Supervisor {
    Supervisor::new(
        SupervisorConfig::new(test_handshake(), counter_plugins()).command(plugin_command(mode)),
    )
}

fn grpc_supervisor_config(mode: &str) -> SupervisorConfig {
    SupervisorConfig::new(test_handshake(), counter_plugins())
        .command(plugin_command(mode))
        .allowed_protocols(vec![Protocol::Streaming])
}

/// An `AsyncWrite` that collects everything into a shared buffer.
#[derive(Clone, Default)]
struct SharedSink {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl SharedSink {
    fn contents(&self) -> Vec<u8> {
        self.buf.lock().unwrap().clone()
    }
}

impl AsyncWrite for SharedSink {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.buf.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn happy_path_request_response() {
    let supervisor = supervisor_for("counter-rpc");

    let endpoint = supervisor.start().await.unwrap();
    assert_eq!(supervisor.start().await.unwrap(), endpoint);
    assert_eq!(supervisor.negotiated_version(), Some(1));
    assert_eq!(supervisor.protocol(), Some(Protocol::RequestResponse));

    let handle = supervisor
        .dispense("counter")
        .await
        .unwrap()
        .downcast::<RpcServiceHandle>()
        .unwrap();
    let result = handle
        .call("double", serde_json::json!({"x": 21}))
        .await
        .unwrap();
    assert_eq!(result, serde_json::json!(42));

    supervisor.ping().await.unwrap();

    supervisor.kill().await;
    assert!(supervisor.exited());
    assert!(*supervisor.done().borrow());
}

#[tokio::test(flavor = "multi_thread")]
async fn request_response_echo_roundtrip() {
    let supervisor = supervisor_for("counter-rpc");
    let handle = supervisor
        .dispense("counter")
        .await
        .unwrap()
        .downcast::<RpcServiceHandle>()
        .unwrap();

    let payload = serde_json::json!({
        "text": "bit-identical \u{1F980} payload",
        "nested": {"n": 42, "list": [1, 2, 3]},
    });
    let result = handle.call("echo", payload.clone()).await.unwrap();
    assert_eq!(result, payload);

    supervisor.kill().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn dispense_unknown_plugin_fails() {
    let supervisor = supervisor_for("counter-rpc");
    let err = supervisor.dispense("missing").await.unwrap_err();
    assert!(matches!(err, SkiffError::UnknownPlugin { .. }));
    supervisor.kill().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn kill_is_idempotent() {
    let supervisor = supervisor_for("counter-rpc");
    supervisor.ping().await.unwrap();

    supervisor.kill().await;
    assert!(supervisor.exited());
    supervisor.kill().await;
    assert!(supervisor.exited());
}

#[tokio::test(flavor = "multi_thread")]
async fn happy_path_grpc() {
    let supervisor = Supervisor::new(grpc_supervisor_config("counter-grpc"));

    supervisor.start().await.unwrap();
    assert_eq!(supervisor.protocol(), Some(Protocol::Streaming));

    // Health-backed ping.
    supervisor.ping().await.unwrap();

    let mut counter = *supervisor
        .dispense("counter")
        .await
        .unwrap()
        .downcast::<CounterClient<Channel>>()
        .unwrap();
    let reply = counter
        .double(proto::DoubleRequest { x: 21 })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(reply.y, 42);

    supervisor.kill().await;
    assert!(supervisor.exited());
}

#[tokio::test(flavor = "multi_thread")]
async fn grpc_bidirectional_broker() {
    let supervisor = Supervisor::new(grpc_supervisor_config("counter-grpc"));
    let client = supervisor.client().await.unwrap();
    let broker = client.grpc_broker().expect("streaming session has a broker");

    // Host side: reserve an id and serve an Echoback answering "pong".
    let id = broker.next_id();
    let mut routes = RoutesBuilder::default();
    routes.add_service(proto::echoback_server::EchobackServer::new(
        EchobackService {
            reply: "pong".to_string(),
        },
    ));
    tokio::spawn({
        let broker = broker.clone();
        let routes = routes.routes();
        async move { broker.accept_and_serve(id, routes).await }
    });

    // Plugin side dials id and relays the host's answer back.
    let mut counter = *supervisor
        .dispense("counter")
        .await
        .unwrap()
        .downcast::<CounterClient<Channel>>()
        .unwrap();
    let reply = counter
        .bidirectional(proto::BidiRequest { stream_id: id })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(reply.message, "pong");

    supervisor.kill().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn auto_mtls_request_response() {
    let supervisor = Supervisor::new(
        SupervisorConfig::new(test_handshake(), counter_plugins())
            .command(plugin_command("counter-rpc"))
            .auto_mtls(true),
    );

    let handle = supervisor
        .dispense("counter")
        .await
        .unwrap()
        .downcast::<RpcServiceHandle>()
        .unwrap();
    let result = handle
        .call("double", serde_json::json!({"x": 8}))
        .await
        .unwrap();
    assert_eq!(result, serde_json::json!(16));

    supervisor.ping().await.unwrap();
    supervisor.kill().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn auto_mtls_grpc() {
    let supervisor = Supervisor::new(grpc_supervisor_config("counter-grpc").auto_mtls(true));

    supervisor.ping().await.unwrap();

    let mut counter = *supervisor
        .dispense("counter")
        .await
        .unwrap()
        .downcast::<CounterClient<Channel>>()
        .unwrap();
    let reply = counter
        .double(proto::DoubleRequest { x: 100 })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(reply.y, 200);

    supervisor.kill().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn bad_handshake_line_is_fatal() {
    let supervisor = supervisor_for("bad-handshake");
    let err = supervisor.start().await.unwrap_err();
    assert!(matches!(err, SkiffError::HandshakeParse { .. }));
    // The failed start already killed the child.
    assert!(supervisor.exited());
}

#[tokio::test(flavor = "multi_thread")]
async fn wrong_core_version_is_fatal() {
    let supervisor = supervisor_for("wrong-core-version");
    let err = supervisor.start().await.unwrap_err();
    match err {
        SkiffError::CoreVersionMismatch { plugin, host } => {
            assert_eq!(plugin, 99);
            assert_eq!(host, skiff::CORE_PROTOCOL_VERSION);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(supervisor.exited());
}

#[tokio::test(flavor = "multi_thread")]
async fn wrong_user_version_is_fatal() {
    let supervisor = supervisor_for("wrong-user-version");
    let err = supervisor.start().await.unwrap_err();
    match err {
        SkiffError::VersionMismatch {
            negotiated,
            supported,
        } => {
            assert_eq!(negotiated, 11);
            assert_eq!(supported, vec![1]);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn reattach_to_missing_pid_fails() {
    let supervisor = Supervisor::new(
        SupervisorConfig::new(test_handshake(), counter_plugins()).reattach(ReattachConfig {
            protocol: Protocol::RequestResponse,
            endpoint: skiff::Endpoint::tcp("127.0.0.1:1"),
            pid: 1_999_999_999,
            user_version: 1,
            test: false,
            owned: false,
        }),
    );
    let err = supervisor.start().await.unwrap_err();
    assert!(matches!(err, SkiffError::ProcessNotFound { .. }));
}

#[tokio::test(flavor = "multi_thread")]
async fn checksum_mismatch_refuses_launch() {
    let supervisor = Supervisor::new(
        SupervisorConfig::new(test_handshake(), counter_plugins())
            .command(plugin_command("counter-rpc"))
            .secure_config(SecureConfig {
                digest: "0".repeat(64),
                algorithm: HashAlgorithm::Sha256,
            }),
    );
    let err = supervisor.start().await.unwrap_err();
    assert!(matches!(err, SkiffError::ChecksumMismatch { .. }));
}

#[tokio::test(flavor = "multi_thread")]
async fn checksum_match_launches() {
    use sha2::{Digest, Sha256};
    let binary = std::fs::read(env!("CARGO_BIN_EXE_skiff-test-plugin")).unwrap();
    let digest = hex::encode(Sha256::digest(&binary));

    let supervisor = Supervisor::new(
        SupervisorConfig::new(test_handshake(), counter_plugins())
            .command(plugin_command("counter-rpc"))
            .secure_config(SecureConfig {
                digest,
                algorithm: HashAlgorithm::Sha256,
            }),
    );
    supervisor.ping().await.unwrap();
    supervisor.kill().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn conflicting_launch_sources_rejected() {
    let supervisor = Supervisor::new(
        SupervisorConfig::new(test_handshake(), counter_plugins())
            .command(plugin_command("counter-rpc"))
            .reattach(ReattachConfig {
                protocol: Protocol::RequestResponse,
                endpoint: skiff::Endpoint::tcp("127.0.0.1:1"),
                pid: 1,
                user_version: 1,
                test: false,
                owned: false,
            }),
    );
    let err = supervisor.start().await.unwrap_err();
    assert!(matches!(err, SkiffError::Config { .. }));
}

#[tokio::test(flavor = "multi_thread")]
async fn stderr_pipeline_forwards_raw_lines() {
    let sink = SharedSink::default();
    let mut config = SupervisorConfig::new(test_handshake(), counter_plugins())
        .command(plugin_command("stderr-noise"))
        .stderr_sink(Box::new(sink.clone()));
    config.stderr_scan_buffer = 64;
    let supervisor = Supervisor::new(config);

    supervisor.ping().await.unwrap();

    // Give the pipeline a moment to drain the pre-serve noise.
    tokio::time::sleep(Duration::from_millis(500)).await;
    supervisor.kill().await;

    let contents = sink.contents();
    let text = String::from_utf8_lossy(&contents);

    // Raw lines are copied through byte-for-byte, including the oversized
    // one (scanned in multiple chunks whose concatenation is lossless).
    assert!(text.contains("plain noise line\n"));
    assert!(text.contains(&"x".repeat(200)));
    // The structured record went to the host logger, not the raw sink.
    assert!(!text.contains("structured noise"));
}

#[tokio::test(flavor = "multi_thread")]
async fn redirected_stdout_reaches_sync_sink_rpc() {
    let sink = SharedSink::default();
    let supervisor = Supervisor::new(
        SupervisorConfig::new(test_handshake(), counter_plugins())
            .command(plugin_command("noisy-stdout-rpc"))
            .sync_stdout(Box::new(sink.clone())),
    );

    supervisor.ping().await.unwrap();

    // Wait for the plugin's post-redirect writes to travel the stdio
    // substream.
    let mut saw_line = false;
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if String::from_utf8_lossy(&sink.contents()).contains("streamed stdout line\n") {
            saw_line = true;
            break;
        }
    }
    supervisor.kill().await;
    assert!(saw_line, "redirected stdout never reached the sync sink");
}

#[tokio::test(flavor = "multi_thread")]
async fn redirected_stdout_reaches_sync_sink_grpc() {
    let sink = SharedSink::default();
    let supervisor = Supervisor::new(
        grpc_supervisor_config("noisy-stdout-grpc").sync_stdout(Box::new(sink.clone())),
    );

    supervisor.ping().await.unwrap();

    let mut saw_line = false;
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if String::from_utf8_lossy(&sink.contents()).contains("streamed stdout line\n") {
            saw_line = true;
            break;
        }
    }
    supervisor.kill().await;
    assert!(saw_line, "redirected stdout never reached the sync sink");
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread")]
async fn host_provided_socket_dir_is_used_and_removed() {
    let parent = tempfile::tempdir().unwrap();
    let mut config = SupervisorConfig::new(test_handshake(), counter_plugins())
        .command(plugin_command("counter-rpc"));
    config.unix_socket_config = Some(skiff::UnixSocketConfig {
        parent_dir: Some(parent.path().to_path_buf()),
        group: None,
    });
    let supervisor = Supervisor::new(config);

    let endpoint = supervisor.start().await.unwrap();
    assert_eq!(endpoint.network, skiff::Network::Unix);
    // The socket lives inside the directory the host created for it.
    assert!(
        endpoint.address.starts_with(parent.path().to_str().unwrap()),
        "socket {} not under {}",
        endpoint.address,
        parent.path().display()
    );
    supervisor.ping().await.unwrap();

    let socket_dir = std::path::Path::new(&endpoint.address)
        .parent()
        .unwrap()
        .parent()
        .unwrap()
        .to_path_buf();
    supervisor.kill().await;
    assert!(
        !socket_dir.exists(),
        "host-created socket dir survived kill"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn reattach_config_describes_running_plugin() {
    let supervisor = supervisor_for("counter-rpc");
    assert!(supervisor.reattach_config().is_none());

    supervisor.start().await.unwrap();
    let reattach = supervisor.reattach_config().unwrap();
    assert_eq!(reattach.user_version, 1);
    assert_eq!(reattach.protocol, Protocol::RequestResponse);
    assert!(reattach.pid > 0);

    supervisor.kill().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn reattach_to_test_mode_server() {
    let (reattach_tx, reattach_rx) = oneshot::channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (close_tx, close_rx) = oneshot::channel();

    let serve_task = tokio::spawn(serve(
        ServeConfig::new(test_handshake(), counter_plugins()).test(ServeTestConfig {
            reattach_tx: Some(reattach_tx),
            shutdown_rx: Some(shutdown_rx),
            close_tx: Some(close_tx),
        }),
    ));

    let reattach = reattach_rx.await.unwrap();
    assert!(reattach.test);

    let supervisor = Supervisor::new(
        SupervisorConfig::new(test_handshake(), counter_plugins()).reattach(reattach),
    );
    supervisor.ping().await.unwrap();

    let handle = supervisor
        .dispense("counter")
        .await
        .unwrap()
        .downcast::<RpcServiceHandle>()
        .unwrap();
    let result = handle
        .call("double", serde_json::json!({"x": -3}))
        .await
        .unwrap();
    assert_eq!(result, serde_json::json!(-6));

    // Kill delivers the graceful quit; the in-process server observes it
    // and closes down.
    supervisor.kill().await;
    close_rx.await.unwrap();
    serve_task.await.unwrap().unwrap();
    drop(shutdown_tx);
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_helper_command_exits_2() {
    let output = tokio::process::Command::new(env!("CARGO_BIN_EXE_skiff-test-plugin"))
        .arg("bogus")
        .output()
        .await
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_magic_cookie_exits_1() {
    let output = tokio::process::Command::new(env!("CARGO_BIN_EXE_skiff-test-plugin"))
        .arg("counter-rpc")
        .env_remove("SKIFF_TEST_COOKIE")
        .output()
        .await
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("This binary is a plugin"));
}
