//! Per-operation supervisor.
//!
//! One driver owns one in-flight operation: it builds and starts the party,
//! pumps the party's outgoing traffic to the transport, feeds inbound gossip
//! into the party, watches the per-request timeout, and delivers the outcome
//! to the requester's callback URL. The driver exits through a tagged
//! [`Termination`] and deregisters the operation afterwards, so a caller can
//! never observe an empty registry before receiving its callback.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::meta::MetaCache;
use super::registry::Registry;
use crate::config::Settings;
use crate::models::GossipMessage;
use crate::network::Transport;
use crate::party::{EndData, Party, PartyChannels, PartyFactory, PartyMessage};
use crate::storage::KeyStore;
use crate::TssdResult;
use anyhow::anyhow;

/// Shared capability handles an operation needs to finish.
pub(crate) struct Capabilities {
    pub transport: Arc<dyn Transport>,
    pub keystore: Arc<dyn KeyStore>,
    pub meta: Arc<MetaCache>,
}

/// One admitted keygen or sign run, as seen by the driver.
#[async_trait]
pub(crate) trait Operation: Send + Sync {
    fn class_name(&self) -> String;
    fn correlator(&self) -> String;
    fn channel_id(&self) -> String;
    fn local_id(&self) -> &str;
    fn party_count(&self) -> usize;
    fn operation_timeout(&self) -> Duration;

    fn build_party(
        &self,
        factory: &dyn PartyFactory,
        channels: PartyChannels,
    ) -> TssdResult<Arc<dyn Party>>;

    /// Consumes the party's terminal value: persists what must be persisted
    /// and posts the success callback.
    async fn handle_end(&self, end: EndData, capabilities: &Capabilities) -> TssdResult<()>;

    /// Posts the operation's failure-shaped callback.
    async fn report_failure(&self, error: &str, transport: &dyn Transport);
}

/// How a driver run ends.
#[derive(Debug)]
pub(crate) enum Termination {
    Completed,
    Failed(anyhow::Error),
    CloseRequested,
}

type PartySlot = Arc<RwLock<Option<Arc<dyn Party>>>>;

pub(crate) struct Driver {
    operation: Arc<dyn Operation>,
    registry: Arc<Registry>,
    capabilities: Arc<Capabilities>,
    factory: Arc<dyn PartyFactory>,
    settings: Arc<Settings>,
}

impl Driver {
    pub fn new(
        operation: Arc<dyn Operation>,
        registry: Arc<Registry>,
        capabilities: Arc<Capabilities>,
        factory: Arc<dyn PartyFactory>,
        settings: Arc<Settings>,
    ) -> Self {
        Driver {
            operation,
            registry,
            capabilities,
            factory,
            settings,
        }
    }

    pub async fn run(self, mut inbound: mpsc::Receiver<GossipMessage>) {
        let class_name = self.operation.class_name();
        let correlator = self.operation.correlator();
        let channel_id = self.operation.channel_id();

        info!(%class_name, %correlator, "starting operation");

        match self.supervise(&mut inbound).await {
            Ok(Termination::Completed) => info!(%class_name, "end of operation"),
            Ok(_) => {
                // quiet teardown still owes the requester a failure callback
                warn!(%class_name, "party channels closed before completion");
                self.operation
                    .report_failure("close channel", self.capabilities.transport.as_ref())
                    .await;
            }
            Err(err) => {
                error!(%class_name, error = %err, "operation failed");
                self.operation
                    .report_failure(&err.to_string(), self.capabilities.transport.as_ref())
                    .await;
            }
        }

        // callback precedes deregistration
        self.registry.remove(&correlator, &channel_id);
    }

    async fn supervise(
        &self,
        inbound: &mut mpsc::Receiver<GossipMessage>,
    ) -> TssdResult<Termination> {
        let (term_tx, mut term_rx) = mpsc::unbounded_channel::<Termination>();
        let party_slot: PartySlot = Arc::new(RwLock::new(None));

        self.arm_timeout(term_tx.clone());

        // channel capacity covers a full round of traffic from every peer
        let capacity = 4 * self.operation.party_count().max(1) + 4;
        let (out_tx, out_rx) = mpsc::channel(capacity);
        let (end_tx, end_rx) = mpsc::channel(capacity);

        let party = self.operation.build_party(
            self.factory.as_ref(),
            PartyChannels {
                out: out_tx,
                end: end_tx,
            },
        )?;
        self.spawn_pump(out_rx, end_rx, term_tx.clone());
        party.start()?;
        *party_slot.write().expect("party slot poisoned") = Some(party.clone());
        info!(waiting_for = ?party.waiting_for(), "party started");

        loop {
            tokio::select! {
                termination = term_rx.recv() => match termination {
                    Some(Termination::Completed) => return Ok(Termination::Completed),
                    Some(Termination::CloseRequested) => {
                        inbound.close();
                        return Ok(Termination::CloseRequested);
                    }
                    Some(Termination::Failed(err)) => return Err(err),
                    None => return Err(anyhow!("termination channel closed")),
                },
                message = inbound.recv() => match message {
                    Some(gossip) => {
                        debug!(sender = %gossip.sender_id, "received new message on communication channel");
                        let party_message = PartyMessage::from_wire(&gossip.message)?;
                        self.spawn_update(party_message, party_slot.clone(), term_tx.clone());
                    }
                    None => {
                        if let Some(party) = party_slot.read().expect("party slot poisoned").as_ref() {
                            info!(waiting_for = ?party.waiting_for(), "party was waiting");
                        }
                        return Err(anyhow!("communication channel is closed"));
                    }
                },
            }
        }
    }

    /// Arms the per-request timer; it only fires into the termination channel
    /// while the operation is still registered.
    fn arm_timeout(&self, term_tx: mpsc::UnboundedSender<Termination>) {
        let registry = self.registry.clone();
        let correlator = self.operation.correlator();
        let class_name = self.operation.class_name();
        let timeout = self.operation.operation_timeout();

        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if registry.queue_for(&correlator).is_some() {
                warn!(%class_name, "operation timed out");
                let _ = term_tx.send(Termination::Failed(anyhow!(
                    "{class_name} operation timeout"
                )));
            }
        });
    }

    /// Applies one inbound party message in its own task, waiting for the
    /// party to be constructed first.
    fn spawn_update(
        &self,
        message: PartyMessage,
        party_slot: PartySlot,
        term_tx: mpsc::UnboundedSender<Termination>,
    ) {
        let wait = Duration::from_millis(self.settings.wait_in_party_message_handling.max(1));
        let local_id = self.operation.local_id().to_string();

        tokio::spawn(async move {
            let party = loop {
                let current = party_slot.read().expect("party slot poisoned").clone();
                match current {
                    Some(party) => break party,
                    None => tokio::time::sleep(wait).await,
                }
            };
            if let Err(err) = apply_update(party.as_ref(), &message, &local_id) {
                error!(error = %err, "there was an error in handling party message");
                let _ = term_tx.send(Termination::Failed(err));
                return;
            }
            debug!(waiting_for = ?party.waiting_for(), "party state updated");
        });
    }

    /// Drains the party's out and end channels. Outgoing messages go to the
    /// transport; the terminal value finishes the operation. Both channels
    /// closing without a terminal value requests a quiet teardown.
    fn spawn_pump(
        &self,
        mut out_rx: mpsc::Receiver<PartyMessage>,
        mut end_rx: mpsc::Receiver<EndData>,
        term_tx: mpsc::UnboundedSender<Termination>,
    ) {
        let operation = self.operation.clone();
        let capabilities = self.capabilities.clone();
        let correlator = operation.correlator();
        let local_id = operation.local_id().to_string();

        tokio::spawn(async move {
            let mut out_open = true;
            loop {
                tokio::select! {
                    outgoing = out_rx.recv(), if out_open => match outgoing {
                        Some(message) => {
                            let published = publish_party_message(
                                &message,
                                &correlator,
                                &local_id,
                                capabilities.transport.as_ref(),
                            )
                            .await;
                            if let Err(err) = published {
                                let _ = term_tx.send(Termination::Failed(err));
                                return;
                            }
                        }
                        None => out_open = false,
                    },
                    end = end_rx.recv() => match end {
                        Some(data) => {
                            match operation.handle_end(data, &capabilities).await {
                                Ok(()) => {
                                    let _ = term_tx.send(Termination::Completed);
                                }
                                Err(err) => {
                                    let _ = term_tx.send(Termination::Failed(err));
                                }
                            }
                            return;
                        }
                        None => {
                            let _ = term_tx.send(Termination::CloseRequested);
                            return;
                        }
                    },
                }
            }
        });
    }
}

/// Forwards a received message to the party, dropping our own broadcast
/// echoes. A point-to-point frame addressed back to its sender is a protocol
/// violation that kills the operation.
fn apply_update(party: &dyn Party, message: &PartyMessage, local_id: &str) -> TssdResult<()> {
    if message.is_broadcast || message.to.is_empty() {
        if message.from.id == local_id {
            return Ok(());
        }
        debug!("updating party state with broadcast message");
    } else {
        if message.to[0].id == message.from.id {
            return Err(anyhow!(
                "party {} tried to send a message to itself",
                message.from.id
            ));
        }
        if message.from.id == local_id {
            return Ok(());
        }
        debug!("updating party state with p2p message");
    }
    party.update(message)
}

/// Hex-encodes the party message and publishes it: once with an empty
/// receiver for broadcasts, once per destination otherwise.
async fn publish_party_message(
    message: &PartyMessage,
    correlator: &str,
    local_id: &str,
    transport: &dyn Transport,
) -> TssdResult<()> {
    let wire = message.to_wire()?;
    let gossip = GossipMessage {
        message_id: correlator.to_string(),
        message: wire,
        sender_id: local_id.to_string(),
        receiver_id: String::new(),
    };

    if message.is_broadcast || message.to.is_empty() {
        transport.publish(&gossip).await?;
    } else {
        for dest in &message.to {
            let mut addressed = gossip.clone();
            addressed.receiver_id = dest.id.clone();
            transport.publish(&addressed).await?;
        }
    }
    Ok(())
}
