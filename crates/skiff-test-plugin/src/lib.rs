//! Shared pieces of the test-helper plugin: the toy `counter` service over
//! both transports, and the `echoback` service hosts serve back to plugins
//! over brokered streams.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use tonic::service::RoutesBuilder;
use tonic::transport::Channel;
use tonic::{Request, Response, Status};

use skiff::grpc::GrpcBroker;
use skiff::{HandshakeConfig, Plugin, PluginSet, RpcHandler};

pub mod proto {
    tonic::include_proto!("skifftest.v1");
}

pub use proto::counter_client::CounterClient;

/// The cookie both halves of the test setup agree on.
pub fn test_handshake() -> HandshakeConfig {
    HandshakeConfig {
        user_version: 1,
        magic_cookie_key: "SKIFF_TEST_COOKIE".to_string(),
        magic_cookie_value: "53b1a5".to_string(),
    }
}

/// The standard plugin set used by host and plugin in tests.
pub fn counter_plugins() -> PluginSet {
    skiff::plugin_set([("counter", Arc::new(CounterPlugin) as Arc<dyn Plugin>)])
}

/// The `counter` service over both transports.
pub struct CounterPlugin;

impl Plugin for CounterPlugin {
    fn rpc_server(&self) -> skiff::Result<Arc<dyn RpcHandler>> {
        Ok(Arc::new(CounterHandler))
    }

    fn grpc_server(&self, broker: &Arc<GrpcBroker>, routes: &mut RoutesBuilder) -> skiff::Result<()> {
        routes.add_service(proto::counter_server::CounterServer::new(CounterService {
            broker: broker.clone(),
        }));
        Ok(())
    }

    fn grpc_client(
        &self,
        _broker: Arc<GrpcBroker>,
        channel: Channel,
    ) -> skiff::Result<Box<dyn Any + Send + Sync>> {
        Ok(Box::new(CounterClient::new(channel)))
    }
}

/// Request/response dispatcher for `counter`.
struct CounterHandler;

#[async_trait]
impl RpcHandler for CounterHandler {
    async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> skiff::Result<serde_json::Value> {
        match method {
            "double" => {
                let x = params.get("x").and_then(|v| v.as_i64()).unwrap_or(0);
                Ok(serde_json::json!(x * 2))
            }
            "echo" => Ok(params),
            other => Err(skiff::SkiffError::config(format!(
                "unknown counter method {other:?}"
            ))),
        }
    }
}

/// gRPC implementation of `counter`.
struct CounterService {
    broker: Arc<GrpcBroker>,
}

#[tonic::async_trait]
impl proto::counter_server::Counter for CounterService {
    async fn double(
        &self,
        request: Request<proto::DoubleRequest>,
    ) -> Result<Response<proto::DoubleReply>, Status> {
        let x = request.into_inner().x;
        Ok(Response::new(proto::DoubleReply { y: x * 2 }))
    }

    async fn bidirectional(
        &self,
        request: Request<proto::BidiRequest>,
    ) -> Result<Response<proto::BidiReply>, Status> {
        let stream_id = request.into_inner().stream_id;
        let channel = self
            .broker
            .dial(stream_id)
            .await
            .map_err(|e| Status::internal(format!("broker dial failed: {e}")))?;

        let mut host = proto::echoback_client::EchobackClient::new(channel);
        let reply = host.ping(proto::PingRequest {}).await?;
        Ok(Response::new(proto::BidiReply {
            message: reply.into_inner().message,
        }))
    }
}

/// Host-side service plugins call back into over brokered streams.
pub struct EchobackService {
    pub reply: String,
}

#[tonic::async_trait]
impl proto::echoback_server::Echoback for EchobackService {
    async fn ping(
        &self,
        _request: Request<proto::PingRequest>,
    ) -> Result<Response<proto::PingReply>, Status> {
        Ok(Response::new(proto::PingReply {
            message: self.reply.clone(),
        }))
    }
}
