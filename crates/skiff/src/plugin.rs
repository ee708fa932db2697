//! The plugin registry: named services and the factories that connect them
//! to a transport.
//!
//! A `Plugin` describes one named service. On the plugin side it knows how
//! to serve itself (`rpc_server` / `grpc_server`); on the host side it
//! builds a typed client from an established connection (`rpc_client` /
//! `grpc_client`). A plugin only has to implement the pair for the
//! transport it actually uses.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tonic::service::RoutesBuilder;
use tonic::transport::Channel;

use crate::error::{Result, SkiffError};
use crate::grpc::GrpcBroker;
use crate::rpc::RpcServiceHandle;

/// Server half of a request/response plugin: a method dispatcher.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn call(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value>;
}

/// A named service, registered by both host and plugin under the same name.
///
/// Dispensed handles come back as `Box<dyn Any>`; callers downcast to the
/// concrete client type the factory produced.
pub trait Plugin: Send + Sync + 'static {
    /// Plugin side, request/response transport: produce the dispatcher
    /// served on dispensed substreams.
    fn rpc_server(&self) -> Result<Arc<dyn RpcHandler>> {
        Err(SkiffError::config(
            "plugin does not support the request/response protocol",
        ))
    }

    /// Host side, request/response transport: wrap a dispensed substream.
    /// The default hands back the raw call handle.
    fn rpc_client(&self, conn: RpcServiceHandle) -> Result<Box<dyn Any + Send + Sync>> {
        Ok(Box::new(conn))
    }

    /// Plugin side, streaming transport: register gRPC services.
    fn grpc_server(&self, broker: &Arc<GrpcBroker>, routes: &mut RoutesBuilder) -> Result<()> {
        let _ = (broker, routes);
        Err(SkiffError::config(
            "plugin does not support the streaming protocol",
        ))
    }

    /// Host side, streaming transport: build a typed stub over the shared
    /// connection.
    fn grpc_client(
        &self,
        broker: Arc<GrpcBroker>,
        channel: Channel,
    ) -> Result<Box<dyn Any + Send + Sync>> {
        let _ = (broker, channel);
        Err(SkiffError::config(
            "plugin does not support the streaming protocol",
        ))
    }
}

/// Mapping of service name to plugin.
pub type PluginSet = HashMap<String, Arc<dyn Plugin>>;

/// Plugin sets keyed by user protocol version, for negotiation.
pub type VersionedPluginSet = BTreeMap<u32, PluginSet>;

/// Convenience constructor for a one-service set.
pub fn plugin_set<I, S>(entries: I) -> PluginSet
where
    I: IntoIterator<Item = (S, Arc<dyn Plugin>)>,
    S: Into<String>,
{
    entries
        .into_iter()
        .map(|(name, plugin)| (name.into(), plugin))
        .collect()
}
