//! Substream rendezvous for the request/response transport.
//!
//! Either side reserves an integer id (`next_id`), tells the peer about it
//! in-band (the dispenser returns it as a call result), and then one side
//! `accept`s while the other `dial`s. A dialed substream starts with the
//! four-byte id so the run loop can route it to the waiting acceptor.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, trace};

use crate::broker::PendingSlots;
use crate::config::TimeoutConfig;
use crate::error::{Result, SkiffError};

use super::{MuxStream, Session};

/// Brokered substream rendezvous over a mux session. Used symmetrically by
/// host and plugin.
pub struct MuxBroker {
    session: Session,
    slots: PendingSlots<MuxStream>,
    next_id: AtomicU32,
}

impl MuxBroker {
    pub fn new(session: Session) -> Arc<MuxBroker> {
        Arc::new(MuxBroker {
            session,
            slots: PendingSlots::new(),
            next_id: AtomicU32::new(0),
        })
    }

    /// Reserve a stream id. Wrapping is permitted but pathological.
    pub fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    /// Open a substream for `id` toward the peer's `accept`.
    pub async fn dial(&self, id: u32) -> Result<MuxStream> {
        let mut stream = self.session.open_stream()?;
        stream
            .write_u32(id)
            .await
            .map_err(|e| SkiffError::transport("failed to send brokered stream id", e))?;
        trace!(id, "dialed brokered substream");
        Ok(stream)
    }

    /// Wait (up to the broker dial timeout) for the peer to dial `id`.
    pub async fn accept(&self, id: u32) -> Result<MuxStream> {
        self.slots.wait(id, TimeoutConfig::BROKER_DIAL_TIMEOUT).await
    }

    /// Route inbound substreams to their acceptors. Runs until the session
    /// closes; host and plugin each run one of these.
    pub async fn run(&self) {
        loop {
            let mut stream = match self.session.accept_stream().await {
                Some(s) => s,
                None => break,
            };
            match stream.read_u32().await {
                Ok(id) => {
                    trace!(id, "brokered substream arrived");
                    self.slots.publish(id, stream);
                }
                Err(e) => {
                    debug!(error = %e, "brokered substream died before sending its id");
                }
            }
        }
        self.slots.clear();
    }

    /// Drop all pending slots and close the underlying session.
    pub fn close(&self) {
        self.slots.clear();
        self.session.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::Role;

    fn broker_pair() -> (Arc<MuxBroker>, Arc<MuxBroker>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let host = MuxBroker::new(Session::new(a, Role::Client));
        let plugin = MuxBroker::new(Session::new(b, Role::Server));
        (host, plugin)
    }

    #[tokio::test]
    async fn test_accept_dial_rendezvous() {
        let (host, plugin) = broker_pair();
        tokio::spawn({
            let plugin = plugin.clone();
            async move { plugin.run().await }
        });

        let id = plugin.next_id();
        let acceptor = {
            let plugin = plugin.clone();
            tokio::spawn(async move { plugin.accept(id).await })
        };

        let mut dialed = host.dial(id).await.unwrap();
        dialed.write_all(b"brokered").await.unwrap();

        let mut accepted = acceptor.await.unwrap().unwrap();
        let mut buf = vec![0u8; 8];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"brokered");
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_times_out() {
        let (_host, plugin) = broker_pair();
        let err = plugin.accept(42).await.unwrap_err();
        assert!(matches!(err, SkiffError::BrokerTimeout { id: 42 }));
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        let (host, _plugin) = broker_pair();
        let a = host.next_id();
        let b = host.next_id();
        assert_ne!(a, b);
        assert!(b > a);
    }
}
