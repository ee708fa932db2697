//! The gRPC connection broker.
//!
//! Either side reserves a stream id, opens a fresh local listener for it,
//! and advertises the listener over the broker stream as a `ConnInfo`. The
//! peer dials the advertised address in response to the same id. When the
//! broker carries a TLS identity, every secondary listener and dialer
//! reuses it.

use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tonic::transport::Channel;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, error, warn};

use crate::broker::PendingSlots;
use crate::config::TimeoutConfig;
use crate::error::{Result, SkiffError};
use crate::mtls::TlsContext;
use crate::transport::{Endpoint, Listener, UnixSocketConfig};

use super::proto;

/// Hook that rewrites a peer-advertised address before dialing. The host
/// installs the runner's `plugin_to_host` translation here.
pub type AddrTranslator = Arc<dyn Fn(&Endpoint) -> Result<Endpoint> + Send + Sync>;

/// Bidirectional `ConnInfo` pipe between the broker and its peer.
#[async_trait]
pub trait ConnStreamer: Send + Sync {
    async fn send(&self, info: proto::ConnInfo) -> Result<()>;
    async fn recv(&self) -> Result<proto::ConnInfo>;
    fn close(&self);
}

/// Channel-backed streamer shared by the service impl (plugin side) and
/// the stream task (host side).
pub(crate) struct BrokerStreamPair {
    out_tx: mpsc::Sender<proto::ConnInfo>,
    out_rx: std::sync::Mutex<Option<mpsc::Receiver<proto::ConnInfo>>>,
    in_tx: mpsc::Sender<proto::ConnInfo>,
    in_rx: Mutex<mpsc::Receiver<proto::ConnInfo>>,
    quit: watch::Sender<bool>,
}

impl BrokerStreamPair {
    pub(crate) fn new() -> Arc<BrokerStreamPair> {
        let (out_tx, out_rx) = mpsc::channel(16);
        let (in_tx, in_rx) = mpsc::channel(16);
        let (quit, _) = watch::channel(false);
        Arc::new(BrokerStreamPair {
            out_tx,
            out_rx: std::sync::Mutex::new(Some(out_rx)),
            in_tx,
            in_rx: Mutex::new(in_rx),
            quit,
        })
    }

    fn take_outbound(&self) -> Option<mpsc::Receiver<proto::ConnInfo>> {
        self.out_rx.lock().unwrap().take()
    }

    /// Drive the host half: open the bidirectional stream and pump both
    /// directions until the session dies.
    pub(crate) async fn run_client(self: Arc<Self>, channel: Channel) {
        let mut client = proto::broker_client::BrokerClient::new(channel);
        let outbound = match self.take_outbound() {
            Some(rx) => ReceiverStream::new(rx),
            None => return,
        };
        let mut inbound = match client.start_stream(Request::new(outbound)).await {
            Ok(resp) => resp.into_inner(),
            Err(e) => {
                debug!(error = %e, "broker stream failed to start");
                self.close();
                return;
            }
        };

        let mut quit = self.quit.subscribe();
        loop {
            tokio::select! {
                msg = inbound.next() => match msg {
                    Some(Ok(info)) => {
                        if self.in_tx.send(info).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        debug!(error = %e, "broker stream errored");
                        break;
                    }
                    None => break,
                },
                _ = quit.changed() => break,
            }
        }
        self.close();
    }
}

#[async_trait]
impl ConnStreamer for BrokerStreamPair {
    async fn send(&self, info: proto::ConnInfo) -> Result<()> {
        if *self.quit.borrow() {
            return Err(SkiffError::BrokerClosed);
        }
        self.out_tx
            .send(info)
            .await
            .map_err(|_| SkiffError::BrokerClosed)
    }

    async fn recv(&self) -> Result<proto::ConnInfo> {
        let mut quit = self.quit.subscribe();
        let mut in_rx = self.in_rx.lock().await;
        tokio::select! {
            msg = in_rx.recv() => msg.ok_or(SkiffError::BrokerClosed),
            _ = quit.changed() => Err(SkiffError::BrokerClosed),
        }
    }

    fn close(&self) {
        let _ = self.quit.send(true);
    }
}

/// Plugin-side service implementation for the broker stream.
pub(crate) struct BrokerService {
    pub(crate) pair: Arc<BrokerStreamPair>,
}

#[tonic::async_trait]
impl proto::broker_server::Broker for BrokerService {
    type StartStreamStream =
        Pin<Box<dyn tokio_stream::Stream<Item = std::result::Result<proto::ConnInfo, Status>> + Send>>;

    async fn start_stream(
        &self,
        request: Request<Streaming<proto::ConnInfo>>,
    ) -> std::result::Result<Response<Self::StartStreamStream>, Status> {
        let outbound = self
            .pair
            .take_outbound()
            .ok_or_else(|| Status::already_exists("broker stream already started"))?;

        let mut inbound = request.into_inner();
        let in_tx = self.pair.in_tx.clone();
        let pair = self.pair.clone();
        tokio::spawn(async move {
            loop {
                match inbound.next().await {
                    Some(Ok(info)) => {
                        if in_tx.send(info).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        debug!(error = %e, "broker stream errored");
                        break;
                    }
                    None => break,
                }
            }
            pair.close();
        });

        let stream = ReceiverStream::new(outbound).map(Ok);
        Ok(Response::new(Box::pin(stream) as Self::StartStreamStream))
    }
}

/// A streamer with no peer: every operation fails closed. Used before a
/// session exists.
struct DisconnectedStreamer;

#[async_trait]
impl ConnStreamer for DisconnectedStreamer {
    async fn send(&self, _info: proto::ConnInfo) -> Result<()> {
        Err(SkiffError::BrokerClosed)
    }

    async fn recv(&self) -> Result<proto::ConnInfo> {
        Err(SkiffError::BrokerClosed)
    }

    fn close(&self) {}
}

/// Brokered secondary connections by integer stream id, symmetric between
/// host and plugin.
pub struct GrpcBroker {
    streamer: Arc<dyn ConnStreamer>,
    slots: PendingSlots<proto::ConnInfo>,
    next_id: AtomicU32,
    tls: Option<TlsContext>,
    translate: Option<AddrTranslator>,
    unix_config: UnixSocketConfig,
    done: watch::Sender<bool>,
}

impl GrpcBroker {
    pub(crate) fn new(
        streamer: Arc<dyn ConnStreamer>,
        tls: Option<TlsContext>,
        translate: Option<AddrTranslator>,
    ) -> Arc<GrpcBroker> {
        let (done, _) = watch::channel(false);
        Arc::new(GrpcBroker {
            streamer,
            slots: PendingSlots::new(),
            next_id: AtomicU32::new(0),
            tls,
            translate,
            unix_config: UnixSocketConfig::default(),
            done,
        })
    }

    /// A broker that fails every operation. Placeholder for plugins
    /// registered outside a live session.
    pub fn disconnected() -> Arc<GrpcBroker> {
        GrpcBroker::new(Arc::new(DisconnectedStreamer), None, None)
    }

    /// Reserve a stream id. Wrapping is permitted but pathological.
    pub fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    /// Open a fresh local listener for `id` and advertise it to the peer.
    pub async fn accept(&self, id: u32) -> Result<Listener> {
        let listener = Listener::bind_default(&self.unix_config).await?;
        self.streamer
            .send(proto::ConnInfo::for_stream(id, listener.endpoint()))
            .await?;
        Ok(listener)
    }

    /// `accept`, then serve the given gRPC routes on the listener until the
    /// broker closes. Errors are logged, not returned, mirroring its role
    /// as a background responder.
    pub async fn accept_and_serve(self: &Arc<Self>, id: u32, routes: tonic::service::Routes) {
        let listener = match self.accept(id).await {
            Ok(l) => l,
            Err(e) => {
                error!(id, error = %e, "broker accept failed");
                return;
            }
        };

        let tls = self.tls.as_ref().and_then(|t| t.server.clone());
        let mut done = self.done.subscribe();
        let incoming = super::server::incoming_stream(listener, tls, self.done.subscribe());
        let serve = tonic::transport::Server::builder()
            .add_routes(routes)
            .serve_with_incoming_shutdown(incoming, async move {
                let _ = done.changed().await;
            });
        if let Err(e) = serve.await {
            warn!(id, error = %e, "brokered gRPC server ended with error");
        }
    }

    /// Wait for the peer's advertisement for `id` and dial it.
    pub async fn dial(&self, id: u32) -> Result<Channel> {
        let info = self
            .slots
            .wait(id, TimeoutConfig::BROKER_DIAL_TIMEOUT)
            .await?;
        let mut endpoint = info.endpoint()?;
        if let Some(ref translate) = self.translate {
            endpoint = translate(&endpoint)?;
        }
        let tls = self.tls.as_ref().and_then(|t| t.client.clone());
        super::connect_channel(endpoint, tls).await
    }

    /// Drain peer advertisements into the pending slots. Runs until the
    /// stream closes.
    pub async fn run(&self) {
        loop {
            match self.streamer.recv().await {
                Ok(info) => {
                    self.slots.publish(info.service_id, info);
                }
                Err(_) => break,
            }
        }
        self.slots.clear();
    }

    /// Close the stream, drop pending slots, fire the done signal.
    pub fn close(&self) {
        self.streamer.close();
        self.slots.clear();
        let _ = self.done.send(true);
    }

    /// Observe broker shutdown.
    pub fn done(&self) -> watch::Receiver<bool> {
        self.done.subscribe()
    }
}
