//! RPC transport B: the streaming (gRPC) transport.
//!
//! A single long-lived tonic connection carries every registered service.
//! The plugin always registers four core services: health (so the host's
//! ping has something to check), the broker rendezvous stream, the
//! controller (graceful shutdown), and stdio streaming. Reflection is
//! served as well so generic tooling can inspect a running plugin.

pub mod proto {
    #![allow(clippy::doc_markdown)]
    tonic::include_proto!("skiff.v1");

    pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("skiff_descriptor");
}

mod broker;
mod client;
mod controller;
mod server;
mod stdio;

pub use broker::{AddrTranslator, ConnStreamer, GrpcBroker};
pub use client::GrpcClientProtocol;
pub use server::serve_connection;

use std::str::FromStr;

use crate::error::{Result, SkiffError};
use crate::transport::{Endpoint, IoStream, Network};

/// Health-check service name the plugin reports as serving.
pub const GRPC_SERVICE_NAME: &str = "plugin";

impl proto::ConnInfo {
    pub(crate) fn endpoint(&self) -> Result<Endpoint> {
        Ok(Endpoint {
            network: Network::from_str(&self.network)?,
            address: self.address.clone(),
        })
    }

    pub(crate) fn for_stream(service_id: u32, endpoint: &Endpoint) -> proto::ConnInfo {
        proto::ConnInfo {
            service_id,
            network: endpoint.network.to_string(),
            address: endpoint.address.clone(),
        }
    }
}

/// Open a tonic channel to an endpoint, optionally wrapped in TLS. Uses a
/// custom connector so unix sockets and pinned-certificate TLS both work.
pub(crate) async fn connect_channel(
    endpoint: Endpoint,
    tls: Option<std::sync::Arc<rustls::ClientConfig>>,
) -> Result<tonic::transport::Channel> {
    let connector = tower::service_fn(move |_uri: tonic::transport::Uri| {
        let endpoint = endpoint.clone();
        let tls = tls.clone();
        async move {
            let conn = crate::transport::dial(&endpoint)
                .await
                .map_err(into_io_error)?;
            let io = match tls {
                Some(config) => {
                    IoStream::client_tls(conn, config, crate::mtls::TLS_SERVER_NAME)
                        .await
                        .map_err(into_io_error)?
                }
                None => IoStream::Plain(conn),
            };
            Ok::<_, std::io::Error>(hyper_util::rt::TokioIo::new(io))
        }
    });

    // The URI is never dialed; the connector carries the real address.
    tonic::transport::Endpoint::from_static("http://plugin.localhost")
        .connect_with_connector(connector)
        .await
        .map_err(|e| SkiffError::Transport {
            message: format!("failed to establish gRPC channel: {e}"),
            source: None,
        })
}

fn into_io_error(err: SkiffError) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conn_info_endpoint_roundtrip() {
        let endpoint = Endpoint::tcp("127.0.0.1:9999");
        let info = proto::ConnInfo::for_stream(7, &endpoint);
        assert_eq!(info.service_id, 7);
        assert_eq!(info.network, "tcp");
        assert_eq!(info.endpoint().unwrap(), endpoint);
    }

    #[test]
    fn test_conn_info_bad_network() {
        let info = proto::ConnInfo {
            service_id: 1,
            network: "smoke-signal".to_string(),
            address: "nowhere".to_string(),
        };
        assert!(info.endpoint().is_err());
    }
}
