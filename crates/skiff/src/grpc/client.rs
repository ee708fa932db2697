//! Host half of the streaming transport.

use std::any::Any;
use std::sync::Arc;

use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tonic::transport::Channel;
use tracing::debug;

use crate::error::{Result, SkiffError};
use crate::mtls::TlsContext;
use crate::plugin::PluginSet;
use crate::transport::Endpoint;

use super::broker::{AddrTranslator, BrokerStreamPair};
use super::proto::stdio_request::Channel as StdioChannel;
use super::{connect_channel, proto, GrpcBroker, GRPC_SERVICE_NAME};

/// Host-side session over the streaming transport.
pub struct GrpcClientProtocol {
    channel: Channel,
    broker: Arc<GrpcBroker>,
    plugins: PluginSet,
}

impl GrpcClientProtocol {
    /// Dial the plugin's listener, start the broker stream, and begin
    /// pulling the plugin's stdio into the given sinks.
    pub async fn connect(
        endpoint: Endpoint,
        tls: Option<TlsContext>,
        plugins: PluginSet,
        translate: Option<AddrTranslator>,
        sync_stdout: Option<Box<dyn AsyncWrite + Send + Unpin>>,
        sync_stderr: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    ) -> Result<Arc<GrpcClientProtocol>> {
        let channel =
            connect_channel(endpoint, tls.as_ref().and_then(|t| t.client.clone())).await?;

        let pair = BrokerStreamPair::new();
        tokio::spawn(pair.clone().run_client(channel.clone()));
        let broker = GrpcBroker::new(pair, tls, translate);
        tokio::spawn({
            let broker = broker.clone();
            async move { broker.run().await }
        });

        tokio::spawn(pump_stdio(channel.clone(), StdioChannel::Stdout, sync_stdout));
        tokio::spawn(pump_stdio(channel.clone(), StdioChannel::Stderr, sync_stderr));

        Ok(Arc::new(GrpcClientProtocol {
            channel,
            broker,
            plugins,
        }))
    }

    /// The broker, for plugins that open secondary streams.
    pub fn broker(&self) -> Arc<GrpcBroker> {
        self.broker.clone()
    }

    /// Build a typed stub for the named service over the shared channel.
    pub async fn dispense(&self, name: &str) -> Result<Box<dyn Any + Send + Sync>> {
        let plugin = self
            .plugins
            .get(name)
            .cloned()
            .ok_or_else(|| SkiffError::UnknownPlugin {
                name: name.to_string(),
            })?;
        plugin.grpc_client(self.broker.clone(), self.channel.clone())
    }

    /// Check the plugin's health service.
    pub async fn ping(&self) -> Result<()> {
        let mut health =
            tonic_health::pb::health_client::HealthClient::new(self.channel.clone());
        let response = health
            .check(tonic_health::pb::HealthCheckRequest {
                service: GRPC_SERVICE_NAME.to_string(),
            })
            .await?;
        let status = response.into_inner().status();
        if status != tonic_health::pb::health_check_response::ServingStatus::Serving {
            return Err(SkiffError::Other(format!(
                "plugin health is {status:?}, not serving"
            )));
        }
        Ok(())
    }

    /// Ask the plugin to shut down gracefully.
    pub async fn quit(&self) -> Result<()> {
        let mut controller =
            proto::controller_client::ControllerClient::new(self.channel.clone());
        controller.shutdown(proto::Empty {}).await?;
        Ok(())
    }

    /// Tear down the broker; the channel itself closes when the last clone
    /// is dropped.
    pub fn close(&self) {
        self.broker.close();
    }
}

/// Stream one stdio channel into a sink (or the void).
async fn pump_stdio(
    channel: Channel,
    which: StdioChannel,
    sink: Option<Box<dyn AsyncWrite + Send + Unpin>>,
) {
    let mut client = proto::stdio_client::StdioClient::new(channel);
    let mut stream = match client
        .read_stdio(proto::StdioRequest {
            channel: which as i32,
        })
        .await
    {
        Ok(resp) => resp.into_inner(),
        Err(e) => {
            debug!(channel = ?which, error = %e, "stdio stream unavailable");
            return;
        }
    };

    let mut sink = sink;
    loop {
        match stream.message().await {
            Ok(Some(chunk)) => {
                if let Some(ref mut sink) = sink {
                    if sink.write_all(&chunk.data).await.is_err() {
                        return;
                    }
                    let _ = sink.flush().await;
                }
            }
            Ok(None) => return,
            Err(e) => {
                debug!(channel = ?which, error = %e, "stdio stream ended");
                return;
            }
        }
    }
}
