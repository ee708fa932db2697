//! Host half of the request/response transport.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::AsyncWrite;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::BufferConfig;
use crate::error::{Result, SkiffError};
use crate::mux::broker::MuxBroker;
use crate::mux::{MuxStream, Role, Session};
use crate::plugin::PluginSet;
use crate::transport::IoStream;

use super::protocol::Envelope;

/// Issue one call on a serialized substream and wait for its reply.
async fn roundtrip(
    stream: &mut MuxStream,
    seq: u64,
    service: &str,
    method: &str,
    args: serde_json::Value,
) -> Result<serde_json::Value> {
    let call = Envelope::call(seq, service, method, args);
    stream
        .send_message(&call.encode()?)
        .await
        .map_err(|e| SkiffError::transport(format!("failed to send {service}.{method}"), e))?;

    let bytes = stream
        .recv_message(BufferConfig::MAX_RPC_FRAME)
        .await?
        .ok_or_else(|| SkiffError::Transport {
            message: format!("connection closed during {service}.{method}"),
            source: None,
        })?;

    match Envelope::decode(&bytes)? {
        Envelope::Reply(reply) if reply.seq == seq => reply.into_result(),
        Envelope::Reply(reply) => Err(SkiffError::Transport {
            message: format!(
                "reply for call {} arrived while waiting on call {seq}",
                reply.seq
            ),
            source: None,
        }),
        Envelope::Call(_) => Err(SkiffError::Transport {
            message: "peer issued a call on a caller-owned stream".to_string(),
            source: None,
        }),
    }
}

/// A dispensed service connection: call into one named plugin over its own
/// substream. This is what `rpc_client` factories wrap.
pub struct RpcServiceHandle {
    service: String,
    stream: Mutex<MuxStream>,
    next_seq: AtomicU64,
}

impl std::fmt::Debug for RpcServiceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServiceHandle")
            .field("service", &self.service)
            .finish()
    }
}

impl RpcServiceHandle {
    pub(crate) fn new(service: impl Into<String>, stream: MuxStream) -> Self {
        RpcServiceHandle {
            service: service.into(),
            stream: Mutex::new(stream),
            next_seq: AtomicU64::new(1),
        }
    }

    /// The plugin name this handle was dispensed for.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Call a method on the dispensed service.
    pub async fn call(&self, method: &str, args: serde_json::Value) -> Result<serde_json::Value> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let mut stream = self.stream.lock().await;
        roundtrip(&mut stream, seq, &self.service, method, args).await
    }
}

/// Host-side session over the request/response transport.
pub struct RpcClientProtocol {
    broker: Arc<MuxBroker>,
    control: Mutex<MuxStream>,
    next_seq: AtomicU64,
    plugins: PluginSet,
}

impl RpcClientProtocol {
    /// Establish the session: open the control and stdio substreams, start
    /// the broker, and begin syncing the plugin's stdio into the given
    /// sinks (discarded when `None`).
    pub async fn connect(
        io: IoStream,
        plugins: PluginSet,
        sync_stdout: Option<Box<dyn AsyncWrite + Send + Unpin>>,
        sync_stderr: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    ) -> Result<Arc<RpcClientProtocol>> {
        let session = Session::new(io, Role::Client);

        let control = session.open_stream()?;
        let stdout = session.open_stream()?;
        let stderr = session.open_stream()?;
        tokio::spawn(copy_stream(stdout, sync_stdout));
        tokio::spawn(copy_stream(stderr, sync_stderr));

        let broker = MuxBroker::new(session);
        tokio::spawn({
            let broker = broker.clone();
            async move { broker.run().await }
        });

        Ok(Arc::new(RpcClientProtocol {
            broker,
            control: Mutex::new(control),
            next_seq: AtomicU64::new(1),
            plugins,
        }))
    }

    async fn call_control(
        &self,
        service: &str,
        method: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let mut control = self.control.lock().await;
        roundtrip(&mut control, seq, service, method, args).await
    }

    /// The broker, for plugins that arrange their own secondary streams.
    pub fn broker(&self) -> Arc<MuxBroker> {
        self.broker.clone()
    }

    /// Obtain a typed handle for the named service.
    pub async fn dispense(&self, name: &str) -> Result<Box<dyn Any + Send + Sync>> {
        let plugin = self
            .plugins
            .get(name)
            .cloned()
            .ok_or_else(|| SkiffError::UnknownPlugin {
                name: name.to_string(),
            })?;

        let result = self
            .call_control("Dispenser", "dispense", serde_json::json!(name))
            .await?;
        let id = result
            .as_u64()
            .filter(|id| *id <= u64::from(u32::MAX))
            .ok_or_else(|| SkiffError::Transport {
                message: format!("dispenser returned a non-id value: {result}"),
                source: None,
            })? as u32;

        debug!(name, id, "dispensing plugin over substream");
        let stream = self.broker.dial(id).await?;
        plugin.rpc_client(RpcServiceHandle::new(name, stream))
    }

    /// Prove the control channel is alive.
    pub async fn ping(&self) -> Result<()> {
        self.call_control("Control", "ping", serde_json::Value::Null)
            .await?;
        Ok(())
    }

    /// Ask the plugin to exit gracefully.
    pub async fn quit(&self) -> Result<()> {
        self.call_control("Control", "quit", serde_json::Value::Null)
            .await?;
        Ok(())
    }

    /// Drop the session. The supervisor escalates to `Runner::kill` when
    /// the graceful quit fails.
    pub fn close(&self) {
        self.broker.close();
    }
}

async fn copy_stream(mut stream: MuxStream, sink: Option<Box<dyn AsyncWrite + Send + Unpin>>) {
    let result = match sink {
        Some(mut sink) => tokio::io::copy(&mut stream, &mut sink).await,
        None => tokio::io::copy(&mut stream, &mut tokio::io::sink()).await,
    };
    if let Err(e) = result {
        debug!(error = %e, "plugin stdio stream ended");
    }
}
