//! Plugin half of the streaming transport.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tonic::service::RoutesBuilder;
use tracing::{debug, warn};

use crate::error::{Result, SkiffError};
use crate::mtls::TlsContext;
use crate::plugin::PluginSet;
use crate::transport::{IoStream, Listener};

use super::broker::{BrokerService, BrokerStreamPair};
use super::controller::ControllerService;
use super::stdio::StdioService;
use super::{proto, GrpcBroker, GRPC_SERVICE_NAME};

/// Serve the plugin's gRPC surface on `listener` until the shutdown signal
/// fires (controller call, host disconnect, or local close).
///
/// Always registers health, reflection, the broker stream, the controller
/// and stdio, then every user plugin.
pub async fn serve_connection(
    listener: Listener,
    tls: Option<TlsContext>,
    plugins: PluginSet,
    shutdown: Arc<watch::Sender<bool>>,
    stdout_rx: Option<mpsc::Receiver<Vec<u8>>>,
    stderr_rx: Option<mpsc::Receiver<Vec<u8>>>,
) -> Result<()> {
    let pair = BrokerStreamPair::new();
    let broker = GrpcBroker::new(pair.clone(), tls.clone(), None);
    tokio::spawn({
        let broker = broker.clone();
        async move { broker.run().await }
    });

    let mut routes = RoutesBuilder::default();

    let (mut reporter, health_service) = tonic_health::server::health_reporter();
    reporter
        .set_service_status(GRPC_SERVICE_NAME, tonic_health::ServingStatus::Serving)
        .await;
    routes.add_service(health_service);

    let reflection = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(proto::FILE_DESCRIPTOR_SET)
        .build_v1()
        .map_err(|e| SkiffError::config(format!("failed to build reflection service: {e}")))?;
    routes.add_service(reflection);

    routes.add_service(proto::broker_server::BrokerServer::new(BrokerService {
        pair,
    }));
    routes.add_service(proto::controller_server::ControllerServer::new(
        ControllerService {
            shutdown: shutdown.clone(),
        },
    ));
    routes.add_service(proto::stdio_server::StdioServer::new(StdioService::new(
        stdout_rx, stderr_rx,
    )));

    for (name, plugin) in &plugins {
        plugin
            .grpc_server(&broker, &mut routes)
            .map_err(|e| SkiffError::config(format!("error registering {name:?}: {e}")))?;
    }

    let tls_server = tls.as_ref().and_then(|t| t.server.clone());
    let incoming = incoming_stream(listener, tls_server, shutdown.subscribe());
    let mut signal = shutdown.subscribe();

    let result = tonic::transport::Server::builder()
        .add_routes(routes.routes())
        .serve_with_incoming_shutdown(incoming, async move {
            let _ = signal.changed().await;
        })
        .await;

    broker.close();
    result.map_err(|e| SkiffError::Transport {
        message: format!("gRPC server failed: {e}"),
        source: None,
    })
}

/// Adapt a listener (plus optional TLS) into the connection stream tonic's
/// `serve_with_incoming` wants. The accept loop stops on shutdown and the
/// listener's filesystem state is removed when it does.
pub(crate) fn incoming_stream(
    listener: Listener,
    tls: Option<Arc<rustls::ServerConfig>>,
    mut shutdown: watch::Receiver<bool>,
) -> ReceiverStream<std::io::Result<IoStream>> {
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        let mut listener = listener;
        loop {
            let conn = tokio::select! {
                conn = listener.accept() => conn,
                _ = shutdown.changed() => break,
            };
            match conn {
                Ok(conn) => {
                    let io = match tls.clone() {
                        Some(config) => match IoStream::server_tls(conn, config).await {
                            Ok(io) => io,
                            Err(e) => {
                                warn!(error = %e, "TLS accept failed");
                                continue;
                            }
                        },
                        None => IoStream::Plain(conn),
                    };
                    if tx.send(Ok(io)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(error = %e, "listener accept failed");
                    let _ = tx
                        .send(Err(std::io::Error::new(
                            std::io::ErrorKind::Other,
                            e.to_string(),
                        )))
                        .await;
                    break;
                }
            }
        }
        listener.close();
    });
    ReceiverStream::new(rx)
}
