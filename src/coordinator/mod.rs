//! Coordinator facade.
//!
//! Owns the shared capability handles and the operation registry, admits new
//! keygen/sign requests, fans inbound gossip into the right operation queue
//! and answers metadata queries. Each admitted operation is handed to its own
//! [`driver::Driver`] task.

pub mod driver;
pub mod meta;
pub mod registry;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::TssError;
use crate::keygen::{self, KeygenOperation};
use crate::models::{GossipMessage, KeygenRequest, Message, MetaData, Protocol, SignRequest};
use crate::network::Transport;
use crate::party::PartyFactory;
use crate::sign::{self, SignOperation};
use crate::storage::KeyStore;
use crate::TssdResult;

use driver::{Capabilities, Driver, Operation};
use meta::MetaCache;
use registry::{OperationEntry, Registry, INBOUND_QUEUE_CAPACITY};

pub struct Coordinator {
    settings: Arc<Settings>,
    registry: Arc<Registry>,
    capabilities: Arc<Capabilities>,
    factory: Arc<dyn PartyFactory>,
    peer_home: PathBuf,
    p2p_id: String,
}

impl Coordinator {
    /// Creates the peer home, resolves our transport identity and warms the
    /// metadata cache from any key shares already on disk.
    pub async fn new(
        settings: Settings,
        transport: Arc<dyn Transport>,
        keystore: Arc<dyn KeyStore>,
        factory: Arc<dyn PartyFactory>,
    ) -> TssdResult<Arc<Self>> {
        let peer_home = settings.peer_home()?;
        std::fs::create_dir_all(&peer_home)?;

        let p2p_id = transport.get_peer_id().await?;
        info!(%p2p_id, home = %peer_home.display(), "setting up home directory");

        let meta = Arc::new(MetaCache::new());
        for protocol in [Protocol::Eddsa, Protocol::Ecdsa] {
            if let Ok(config) = keystore.load_keygen(protocol) {
                info!(%protocol, "metadata restored from stored keygen data");
                meta.set(protocol, config.meta_data);
            }
        }

        Ok(Arc::new(Coordinator {
            settings: Arc::new(settings),
            registry: Arc::new(Registry::new()),
            capabilities: Arc::new(Capabilities {
                transport,
                keystore,
                meta,
            }),
            factory,
            peer_home,
            p2p_id,
        }))
    }

    pub fn p2p_id(&self) -> &str {
        &self.p2p_id
    }

    pub fn peer_home(&self) -> &std::path::Path {
        &self.peer_home
    }

    /// Snapshot of running operation classes, for admission checks.
    pub fn running_class_names(&self) -> Vec<String> {
        self.registry.running_class_names()
    }

    /// Keygen, sign and regroup of one protocol are mutually exclusive: a
    /// requested operation is rejected while a conflicting class runs.
    pub fn check_operation(&self, operation: &str, protocol: Protocol) -> Result<(), TssError> {
        let forbidden = match operation {
            "keygen" => [protocol.sign_class(), protocol.regroup_class()],
            "sign" => [protocol.keygen_class(), protocol.regroup_class()],
            _ => return Err(TssError::WrongOperation),
        };
        for class in self.registry.running_class_names() {
            if forbidden.contains(&class) {
                return Err(TssError::OperationIsRunning(class));
            }
        }
        Ok(())
    }

    pub fn meta_data(&self, protocol: Protocol) -> Result<MetaData, TssError> {
        self.capabilities.meta.get(protocol)
    }

    pub fn threshold(&self, protocol: Protocol) -> Result<u32, TssError> {
        Ok(self.meta_data(protocol)?.threshold)
    }

    pub fn start_keygen(self: &Arc<Self>, request: KeygenRequest) -> Result<(), TssError> {
        info!("starting new keygen process");
        let protocol = Protocol::parse(&request.crypto)?;
        if self.capabilities.keystore.keygen_exists(protocol) {
            return Err(TssError::KeygenFileExist);
        }
        // reject duplicates before init touches the metadata cache
        let correlator = keygen::correlator(protocol);
        if self.registry.contains(&correlator) {
            return Err(TssError::DuplicatedMessageId);
        }

        let operation =
            KeygenOperation::init(request, protocol, &self.p2p_id, &self.capabilities.meta)?;
        self.admit_and_spawn(protocol, Arc::new(operation))
    }

    pub fn start_sign(self: &Arc<Self>, request: SignRequest) -> Result<(), TssError> {
        info!("starting new sign process");
        let protocol = Protocol::parse(&request.crypto)?;
        if protocol == Protocol::Ecdsa && request.derivation_path.is_empty() {
            return Err(TssError::WrongDerivationPath);
        }
        let correlator = sign::correlator(protocol, &request.message)?;
        if self.registry.contains(&correlator) {
            return Err(TssError::DuplicatedMessageId);
        }

        let operation = SignOperation::init(
            request,
            protocol,
            &self.p2p_id,
            self.capabilities.keystore.as_ref(),
            &self.capabilities.meta,
        )?;
        self.admit_and_spawn(protocol, Arc::new(operation))
    }

    /// Binds the inbound queue, registers the operation and spawns its
    /// driver. Returns immediately; progress is reported via callback.
    fn admit_and_spawn(
        self: &Arc<Self>,
        protocol: Protocol,
        operation: Arc<dyn Operation>,
    ) -> Result<(), TssError> {
        let correlator = operation.correlator();
        let (queue_tx, queue_rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);

        self.registry.insert(OperationEntry {
            correlator: correlator.clone(),
            channel_id: operation.channel_id(),
            protocol,
            class_name: operation.class_name(),
            queue: queue_tx,
            started_at: Instant::now(),
        })?;
        info!(%correlator, "new communication channel registered");

        let driver = Driver::new(
            operation,
            self.registry.clone(),
            self.capabilities.clone(),
            self.factory.clone(),
            self.settings.clone(),
        );
        tokio::spawn(driver.run(queue_rx));
        Ok(())
    }

    /// Routes one relay envelope towards its operation queue. The wait loop
    /// tolerates gossip racing ahead of local admission; every outcome is
    /// swallowed here because the relay must always get a 200.
    pub fn handle_inbound(self: &Arc<Self>, message: Message) {
        let gossip: GossipMessage = match serde_json::from_str(&message.message) {
            Ok(gossip) => gossip,
            Err(err) => {
                warn!(error = %err, "discarding malformed gossip envelope");
                return;
            }
        };
        debug!(
            message_id = %gossip.message_id,
            sender = %gossip.sender_id,
            "message route called"
        );

        let registry = self.registry.clone();
        let timeout = Duration::from_secs(self.settings.message_timeout);
        let retry = Duration::from_millis(self.settings.write_msg_retry_time.max(1));

        tokio::spawn(async move {
            let deadline = Instant::now() + timeout;
            loop {
                if let Some(queue) = registry.queue_for(&gossip.message_id) {
                    // the queue can close between lookup and push when the
                    // operation completes or times out; the frame is stale then
                    if queue.send(gossip.clone()).await.is_err() {
                        warn!(message_id = %gossip.message_id, "unable to send");
                    }
                    return;
                }
                if Instant::now() >= deadline {
                    warn!(message_id = %gossip.message_id, "message timeout, channel not found");
                    return;
                }
                tokio::time::sleep(retry).await;
            }
        });
    }

    #[cfg(test)]
    pub(crate) fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }
}
