//! Plugin half of the request/response transport.

use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::config::BufferConfig;
use crate::error::{Result, SkiffError};
use crate::mux::broker::MuxBroker;
use crate::mux::{MuxStream, Role, Session};
use crate::plugin::{PluginSet, RpcHandler};
use crate::transport::IoStream;

use super::protocol::{code, error_code, Call, Envelope};

/// Serve one host session until the host quits, the session dies, or the
/// shutdown signal fires.
///
/// The host opens three substreams in order: control, stdout, stderr. The
/// stdio substreams are fed from the channels capturing the plugin's own
/// output; everything after that is brokered.
pub async fn serve_session(
    io: IoStream,
    plugins: PluginSet,
    shutdown: Arc<watch::Sender<bool>>,
    stdout_rx: Option<mpsc::Receiver<Vec<u8>>>,
    stderr_rx: Option<mpsc::Receiver<Vec<u8>>>,
) -> Result<()> {
    let session = Session::new(io, Role::Server);

    let mut control = expect_stream(&session, "control").await?;
    let stdout = expect_stream(&session, "stdout").await?;
    let stderr = expect_stream(&session, "stderr").await?;

    if let Some(rx) = stdout_rx {
        tokio::spawn(pump_stdio(rx, stdout));
    }
    if let Some(rx) = stderr_rx {
        tokio::spawn(pump_stdio(rx, stderr));
    }

    let broker = MuxBroker::new(session.clone());
    tokio::spawn({
        let broker = broker.clone();
        async move { broker.run().await }
    });

    let mut shutdown_rx = shutdown.subscribe();
    loop {
        let message = tokio::select! {
            message = control.recv_message(BufferConfig::MAX_RPC_FRAME) => message,
            _ = shutdown_rx.changed() => break,
        };
        let message = match message? {
            Some(m) => m,
            None => {
                debug!("host closed the control channel");
                break;
            }
        };

        let reply = match Envelope::decode(&message) {
            Ok(Envelope::Call(call)) => dispatch_control(call, &plugins, &broker, &shutdown),
            Ok(Envelope::Reply(reply)) => Envelope::reply_err(
                reply.seq,
                code::MALFORMED,
                "control stream expects calls, got a reply",
            ),
            Err(e) => Envelope::reply_err(0, code::MALFORMED, e.to_string()),
        };
        control.send_message(&reply.encode()?).await?;

        if *shutdown.borrow() {
            break;
        }
    }

    broker.close();
    session.close();
    Ok(())
}

async fn expect_stream(session: &Session, what: &str) -> Result<MuxStream> {
    session
        .accept_stream()
        .await
        .ok_or_else(|| SkiffError::Transport {
            message: format!("session closed before the host opened the {what} stream"),
            source: None,
        })
}

async fn pump_stdio(mut rx: mpsc::Receiver<Vec<u8>>, mut stream: MuxStream) {
    while let Some(chunk) = rx.recv().await {
        if stream.write_all(&chunk).await.is_err() {
            break;
        }
    }
    let _ = stream.shutdown().await;
}

fn dispatch_control(
    call: Call,
    plugins: &PluginSet,
    broker: &Arc<MuxBroker>,
    shutdown: &Arc<watch::Sender<bool>>,
) -> Envelope {
    match (call.service.as_str(), call.method.as_str()) {
        ("Dispenser", "dispense") => {
            let name = match call.args.as_str() {
                Some(name) => name,
                None => {
                    return Envelope::reply_err(
                        call.seq,
                        code::BAD_ARGS,
                        "dispense takes a plugin name",
                    )
                }
            };
            match dispense(name, plugins, broker) {
                Ok(id) => Envelope::reply_ok(call.seq, serde_json::json!(id)),
                Err(e) => Envelope::reply_err(call.seq, error_code(&e), e.to_string()),
            }
        }
        ("Control", "ping") => Envelope::reply_ok(call.seq, serde_json::json!("pong")),
        ("Control", "quit") => {
            let _ = shutdown.send(true);
            Envelope::reply_ok(call.seq, serde_json::Value::Null)
        }
        (service, method) => Envelope::reply_err(
            call.seq,
            code::UNKNOWN_TARGET,
            format!("no control target {service}.{method}"),
        ),
    }
}

/// Reserve a stream id for `name` and start serving it as soon as the host
/// dials.
fn dispense(name: &str, plugins: &PluginSet, broker: &Arc<MuxBroker>) -> Result<u32> {
    let plugin = plugins.get(name).ok_or_else(|| SkiffError::UnknownPlugin {
        name: name.to_string(),
    })?;
    let handler = plugin.rpc_server()?;

    let id = broker.next_id();
    let broker = broker.clone();
    tokio::spawn(async move {
        match broker.accept(id).await {
            Ok(stream) => serve_handler(stream, handler).await,
            Err(e) => warn!(id, error = %e, "host never dialed dispensed stream"),
        }
    });
    Ok(id)
}

/// Serve one dispensed substream: read calls, dispatch, reply.
async fn serve_handler(mut stream: MuxStream, handler: Arc<dyn RpcHandler>) {
    loop {
        let message = match stream.recv_message(BufferConfig::MAX_RPC_FRAME).await {
            Ok(Some(m)) => m,
            Ok(None) => return,
            Err(e) => {
                debug!(error = %e, "dispensed stream read failed");
                return;
            }
        };

        let reply = match Envelope::decode(&message) {
            Ok(Envelope::Call(call)) => match handler.call(&call.method, call.args).await {
                Ok(value) => Envelope::reply_ok(call.seq, value),
                Err(e) => Envelope::reply_err(call.seq, error_code(&e), e.to_string()),
            },
            Ok(Envelope::Reply(reply)) => Envelope::reply_err(
                reply.seq,
                code::MALFORMED,
                "dispensed stream expects calls, got a reply",
            ),
            Err(e) => Envelope::reply_err(0, code::MALFORMED, e.to_string()),
        };

        let bytes = match reply.encode() {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "failed to serialize reply");
                return;
            }
        };
        if stream.send_message(&bytes).await.is_err() {
            return;
        }
    }
}
