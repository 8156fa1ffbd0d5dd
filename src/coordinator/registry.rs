//! In-flight operation registry.
//!
//! Two views of the same entries: inbound gossip arrives keyed by correlator,
//! while admission scans running class names through the channel-id view.
//! All mutation happens under one lock; contention is a handful of
//! operations at most.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::debug;

use crate::error::TssError;
use crate::models::{GossipMessage, Protocol};

/// Bound of every operation's inbound queue.
pub const INBOUND_QUEUE_CAPACITY: usize = 100;

#[derive(Debug, Clone)]
pub struct OperationEntry {
    pub correlator: String,
    pub channel_id: String,
    pub protocol: Protocol,
    pub class_name: String,
    pub queue: mpsc::Sender<GossipMessage>,
    pub started_at: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    by_correlator: HashMap<String, OperationEntry>,
    by_channel_id: HashMap<String, OperationEntry>,
}

#[derive(Debug, Default)]
pub struct Registry {
    inner: Mutex<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    /// Registers an operation; at most one entry may exist per correlator.
    pub fn insert(&self, entry: OperationEntry) -> Result<(), TssError> {
        let mut inner = self.inner.lock().expect("registry poisoned");
        if inner.by_correlator.contains_key(&entry.correlator) {
            return Err(TssError::DuplicatedMessageId);
        }
        debug!(
            correlator = %entry.correlator,
            channel_id = %entry.channel_id,
            "operation registered"
        );
        inner
            .by_channel_id
            .insert(entry.channel_id.clone(), entry.clone());
        inner.by_correlator.insert(entry.correlator.clone(), entry);
        Ok(())
    }

    /// The inbound queue of a registered operation, if any.
    pub fn queue_for(&self, correlator: &str) -> Option<mpsc::Sender<GossipMessage>> {
        let inner = self.inner.lock().expect("registry poisoned");
        inner
            .by_correlator
            .get(correlator)
            .map(|entry| entry.queue.clone())
    }

    pub fn contains(&self, correlator: &str) -> bool {
        let inner = self.inner.lock().expect("registry poisoned");
        inner.by_correlator.contains_key(correlator)
    }

    /// Snapshot of the class names currently running; admission scans this.
    pub fn running_class_names(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("registry poisoned");
        inner
            .by_channel_id
            .values()
            .map(|entry| entry.class_name.clone())
            .collect()
    }

    /// Drops both views of an operation. The last queue sender goes with the
    /// entry, so late producers observe a closed queue.
    pub fn remove(&self, correlator: &str, channel_id: &str) {
        let mut inner = self.inner.lock().expect("registry poisoned");
        inner.by_correlator.remove(correlator);
        inner.by_channel_id.remove(channel_id);
        debug!(%correlator, %channel_id, "operation deregistered");
    }

    pub fn is_empty(&self) -> bool {
        let inner = self.inner.lock().expect("registry poisoned");
        inner.by_correlator.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(correlator: &str, class_name: &str) -> (OperationEntry, mpsc::Receiver<GossipMessage>) {
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
        (
            OperationEntry {
                correlator: correlator.to_string(),
                channel_id: format!("{class_name}{correlator}"),
                protocol: Protocol::Eddsa,
                class_name: class_name.to_string(),
                queue: tx,
                started_at: Instant::now(),
            },
            rx,
        )
    }

    #[test]
    fn duplicate_correlator_is_rejected() {
        let registry = Registry::new();
        let (first, _rx1) = entry("eddsaKeygen", "eddsaKeygen");
        let (second, _rx2) = entry("eddsaKeygen", "eddsaKeygen");

        registry.insert(first).unwrap();
        assert!(matches!(
            registry.insert(second),
            Err(TssError::DuplicatedMessageId)
        ));
    }

    #[test]
    fn running_class_names_snapshot() {
        let registry = Registry::new();
        let (keygen, _rx1) = entry("eddsaKeygen", "eddsaKeygen");
        let (sign, _rx2) = entry("ecdsaff00", "ecdsaSign");
        registry.insert(keygen).unwrap();
        registry.insert(sign).unwrap();

        let mut classes = registry.running_class_names();
        classes.sort();
        assert_eq!(classes, ["ecdsaSign", "eddsaKeygen"]);
    }

    #[tokio::test]
    async fn remove_closes_the_queue() {
        let registry = Registry::new();
        let (operation, rx) = entry("eddsaKeygen", "eddsaKeygen");
        registry.insert(operation).unwrap();

        let queue = registry.queue_for("eddsaKeygen").unwrap();
        registry.remove("eddsaKeygen", "eddsaKeygeneddsaKeygen");
        assert!(registry.is_empty());
        assert!(registry.queue_for("eddsaKeygen").is_none());

        // the driver side is gone; a late send observes the closed queue
        drop(rx);
        let gossip = GossipMessage {
            message_id: "eddsaKeygen".to_string(),
            message: String::new(),
            sender_id: "p2".to_string(),
            receiver_id: String::new(),
        };
        assert!(queue.send(gossip).await.is_err());
    }
}
