//! Stream-id rendezvous slots, shared by both brokers.
//!
//! A slot is the pending half of an `accept`/`dial` pair: one side waits on
//! an id, the other publishes into it. For any id at most one slot exists
//! at a time; a published value that nobody claims is reclaimed after
//! `TimeoutConfig::BROKER_SLOT_TIMEOUT`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::TimeoutConfig;
use crate::error::{Result, SkiffError};

struct Slot<T> {
    tx: mpsc::Sender<T>,
    rx: Option<mpsc::Receiver<T>>,
}

impl<T> Slot<T> {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Slot { tx, rx: Some(rx) }
    }
}

/// The shared `stream_id -> pending slot` map.
pub(crate) struct PendingSlots<T> {
    slots: Arc<Mutex<HashMap<u32, Slot<T>>>>,
}

impl<T> Clone for PendingSlots<T> {
    fn clone(&self) -> Self {
        PendingSlots {
            slots: self.slots.clone(),
        }
    }
}

impl<T: Send + 'static> PendingSlots<T> {
    pub fn new() -> Self {
        PendingSlots {
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Wait for the peer to publish a value for `id`. The slot is removed
    /// whether the wait resolves, times out, or the broker closes.
    pub async fn wait(&self, id: u32, timeout: Duration) -> Result<T> {
        let rx = {
            let mut slots = self.slots.lock().unwrap();
            slots.entry(id).or_insert_with(Slot::new).rx.take()
        };
        let mut rx = rx.ok_or_else(|| {
            SkiffError::config(format!("stream id {id} already has a pending dial"))
        })?;

        let outcome = tokio::time::timeout(timeout, rx.recv()).await;
        self.slots.lock().unwrap().remove(&id);

        match outcome {
            Ok(Some(value)) => Ok(value),
            Ok(None) => Err(SkiffError::BrokerClosed),
            Err(_) => Err(SkiffError::BrokerTimeout { id }),
        }
    }

    /// Publish a value for `id`. Non-blocking: the slot queue has capacity
    /// one and duplicates are dropped. Starts a janitor that reclaims the
    /// slot if nobody collects it in time.
    pub fn publish(&self, id: u32, value: T) {
        let tx = {
            let mut slots = self.slots.lock().unwrap();
            slots.entry(id).or_insert_with(Slot::new).tx.clone()
        };
        let _ = tx.try_send(value);

        let slots = self.slots.clone();
        tokio::spawn(async move {
            tokio::time::sleep(TimeoutConfig::BROKER_SLOT_TIMEOUT).await;
            slots.lock().unwrap().remove(&id);
        });
    }

    /// Drop every pending slot, failing all waiters with `BrokerClosed`.
    pub fn clear(&self) {
        self.slots.lock().unwrap().clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.slots.lock().unwrap().len()
    }
}
