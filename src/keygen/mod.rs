//! Distributed key generation operation.
//!
//! One keygen per protocol may be in flight; its correlator is simply
//! `"<crypto>Keygen"`. Peers are submitted as bare transport ids, and each
//! party's Shamir index is seeded from the base58 decoding of its id, so all
//! nodes derive the same party ordering without prior coordination.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use num_bigint::BigUint;
use tracing::{error, info};

use crate::coordinator::driver::{Capabilities, Operation};
use crate::coordinator::meta::MetaCache;
use crate::models::{KeyShare, KeygenFailure, KeygenRequest, KeygenSuccess, MetaData, Protocol, TssConfig};
use crate::network::Transport;
use crate::party::{
    EndData, KeygenContext, Party, PartyChannels, PartyFactory, PartyIdentifier, SortedParties,
};
use crate::TssdResult;
use anyhow::anyhow;

/// Keygen correlator; doubles as the class name.
pub fn correlator(protocol: Protocol) -> String {
    protocol.keygen_class()
}

pub(crate) struct KeygenOperation {
    request: KeygenRequest,
    protocol: Protocol,
    local: PartyIdentifier,
    parties: SortedParties,
}

impl KeygenOperation {
    /// Resolves the local party against the submitted peer list and caches
    /// the group parameters.
    pub fn init(
        request: KeygenRequest,
        protocol: Protocol,
        p2p_id: &str,
        meta: &MetaCache,
    ) -> TssdResult<Self> {
        info!(protocol = %protocol, "initiation keygen process");

        meta.set(
            protocol,
            MetaData {
                peers_count: request.peers_count,
                threshold: request.threshold,
            },
        );

        let mut local = None;
        let mut identifiers = Vec::with_capacity(request.p2p_ids.len());
        for peer in &request.p2p_ids {
            let decoded = bs58::decode(peer)
                .into_vec()
                .map_err(|_| anyhow!("peer id {peer} is not base58"))?;
            let identifier = PartyIdentifier::new(peer.clone(), BigUint::from_bytes_be(&decoded));
            if peer == p2p_id {
                local = Some(identifier.clone());
            }
            identifiers.push(identifier);
        }
        let local =
            local.ok_or_else(|| anyhow!("own peer id {p2p_id} is not in the participant list"))?;

        info!(local = %local.id, "local party resolved");

        Ok(KeygenOperation {
            request,
            protocol,
            local,
            parties: SortedParties::new(identifiers),
        })
    }
}

#[async_trait]
impl Operation for KeygenOperation {
    fn class_name(&self) -> String {
        self.protocol.keygen_class()
    }

    fn correlator(&self) -> String {
        correlator(self.protocol)
    }

    fn channel_id(&self) -> String {
        format!("{}{}", self.class_name(), self.correlator())
    }

    fn local_id(&self) -> &str {
        &self.local.id
    }

    fn party_count(&self) -> usize {
        self.parties.len()
    }

    fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.request.operation_timeout)
    }

    fn build_party(
        &self,
        factory: &dyn PartyFactory,
        channels: PartyChannels,
    ) -> TssdResult<Arc<dyn Party>> {
        factory.keygen_party(
            KeygenContext {
                protocol: self.protocol,
                local: self.local.clone(),
                parties: self.parties.clone(),
                threshold: self.request.threshold,
            },
            channels,
        )
    }

    async fn handle_end(&self, end: EndData, capabilities: &Capabilities) -> TssdResult<()> {
        let EndData::Keygen(outcome) = end else {
            return Err(anyhow!("keygen party emitted a signature"));
        };

        let share_id = outcome.share_id.to_string();
        let pub_key = hex::encode(&outcome.public_key);
        info!(%share_id, %pub_key, protocol = %self.protocol, "keygen process finished");

        // the share must be on disk before the requester hears of success
        let config = TssConfig {
            meta_data: capabilities.meta.get(self.protocol)?,
            keygen_data: KeyShare {
                share_id: share_id.clone(),
                pub_key: pub_key.clone(),
                payload: outcome.payload,
            },
        };
        capabilities.keystore.write_keygen(self.protocol, &config)?;

        let body = KeygenSuccess {
            share_id,
            pub_key,
            status: "success".to_string(),
        };
        capabilities
            .transport
            .callback(&self.request.call_back_url, serde_json::to_value(body)?)
            .await
    }

    async fn report_failure(&self, error: &str, transport: &dyn Transport) {
        let body = KeygenFailure {
            error: error.to_string(),
            status: "fail".to_string(),
        };
        let payload = match serde_json::to_value(body) {
            Ok(payload) => payload,
            Err(err) => {
                error!(error = %err, "failure callback could not be serialised");
                return;
            }
        };
        if let Err(err) = transport
            .callback(&self.request.call_back_url, payload)
            .await
        {
            error!(error = %err, "failure callback could not be delivered");
        }
    }
}
