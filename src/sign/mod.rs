//! Threshold signing operation.
//!
//! A sign run is correlated by the BLAKE2b-256 digest of the payload, so
//! every node that receives the same request converges on the same inbound
//! queue. Signing requires the key share persisted by an earlier keygen; for
//! ECDSA the group key is first tweaked along the requested BIP-32 path.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use blake2::{digest::consts::U32, Blake2b, Digest};
use num_bigint::BigUint;
use tracing::{error, info, warn};

use crate::coordinator::driver::{Capabilities, Operation};
use crate::coordinator::meta::MetaCache;
use crate::error::TssError;
use crate::models::{KeyShare, Protocol, SignFailure, SignRequest, SignSuccess};
use crate::network::Transport;
use crate::party::{
    DerivationTweak, EndData, Party, PartyChannels, PartyFactory, PartyIdentifier, SignContext,
    SortedParties,
};
use crate::storage::{KeyStore, StorageError};
use crate::TssdResult;
use anyhow::anyhow;

pub mod derive;

type Blake2b256 = Blake2b<U32>;

/// Sign correlator: `"<crypto><hex(blake2b-256(message bytes))>"`.
pub fn correlator(protocol: Protocol, message_hex: &str) -> TssdResult<String> {
    let bytes =
        hex::decode(message_hex).map_err(|err| anyhow!("sign message is not hex: {err}"))?;
    let digest = Blake2b256::digest(&bytes);
    Ok(format!("{}{}", protocol.as_str(), hex::encode(digest)))
}

pub(crate) struct SignOperation {
    request: SignRequest,
    protocol: Protocol,
    correlator: String,
    local: PartyIdentifier,
    parties: SortedParties,
    threshold: u32,
    message: Vec<u8>,
    key_share: KeyShare,
    derivation: Option<DerivationTweak>,
}

impl SignOperation {
    /// Loads the key share, refreshes the protocol's metadata slot and
    /// resolves the signing committee.
    pub fn init(
        request: SignRequest,
        protocol: Protocol,
        p2p_id: &str,
        keystore: &dyn KeyStore,
        meta: &MetaCache,
    ) -> Result<Self, TssError> {
        info!(protocol = %protocol, "initiation signing process");

        let config = keystore.load_keygen(protocol).map_err(|err| match err {
            StorageError::DirMissingErr(_) | StorageError::FileMissingErr(_) => {
                warn!(protocol = %protocol, error = %err, "no keygen data on disk");
                TssError::no_keygen_data(protocol)
            }
            other => TssError::Internal(other.into()),
        })?;
        meta.set(protocol, config.meta_data);

        let correlator = correlator(protocol, &request.message)?;
        let message = hex::decode(&request.message)
            .map_err(|err| TssError::Internal(anyhow!("sign message is not hex: {err}")))?;

        // the loaded share id plus the live transport id form the local party
        let share_id = config
            .keygen_data
            .share_id
            .parse::<BigUint>()
            .map_err(|_| TssError::Internal(anyhow!("stored shareID is malformed")))?;
        let local = PartyIdentifier::new(p2p_id, share_id);

        let identifiers = request
            .peers
            .iter()
            .map(PartyIdentifier::from_peer)
            .collect::<TssdResult<Vec<_>>>()?;
        let parties = SortedParties::new(identifiers);
        if parties.find(&local.id).is_none() {
            return Err(TssError::Internal(anyhow!(
                "own peer id {p2p_id} is not in the signing peer list"
            )));
        }

        let derivation = match protocol {
            Protocol::Ecdsa => {
                let master = hex::decode(&config.keygen_data.pub_key)
                    .map_err(|_| TssError::Internal(anyhow!("stored pubKey is malformed")))?;
                Some(derive::derive_child_key(
                    &master,
                    request.chain_code.as_bytes(),
                    &request.derivation_path,
                )?)
            }
            Protocol::Eddsa => None,
        };

        info!(local = %local.id, %correlator, "local party resolved");

        Ok(SignOperation {
            threshold: config.meta_data.threshold,
            key_share: config.keygen_data,
            request,
            protocol,
            correlator,
            local,
            parties,
            message,
            derivation,
        })
    }
}

#[async_trait]
impl Operation for SignOperation {
    fn class_name(&self) -> String {
        self.protocol.sign_class()
    }

    fn correlator(&self) -> String {
        self.correlator.clone()
    }

    fn channel_id(&self) -> String {
        format!(
            "{}{}{}",
            self.class_name(),
            self.request.chain_code,
            self.correlator
        )
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
        factory.sign_party(
            SignContext {
                protocol: self.protocol,
                local: self.local.clone(),
                parties: self.parties.clone(),
                threshold: self.threshold,
                message: self.message.clone(),
                key_share: self.key_share.clone(),
                derivation: self.derivation.clone(),
            },
            channels,
        )
    }

    async fn handle_end(&self, end: EndData, capabilities: &Capabilities) -> TssdResult<()> {
        let EndData::Sign(outcome) = end else {
            return Err(anyhow!("sign party emitted save data"));
        };

        let body = SignSuccess {
            message: hex::encode(&outcome.message),
            signature: hex::encode(&outcome.signature),
            signature_recovery: outcome.recovery.as_deref().map(hex::encode),
            status: "success".to_string(),
        };
        info!(
            message = %self.request.message,
            protocol = %self.protocol,
            "signing process finished"
        );

        capabilities
            .transport
            .callback(&self.request.call_back_url, serde_json::to_value(body)?)
            .await
    }

    async fn report_failure(&self, error: &str, transport: &dyn Transport) {
        let body = SignFailure {
            message: self.request.message.clone(),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correlator_is_protocol_prefixed_digest() {
        let id = correlator(Protocol::Eddsa, "deadbeef").unwrap();
        assert!(id.starts_with("eddsa"));
        // blake2b-256 digest is 32 bytes, hex doubles it
        assert_eq!(id.len(), "eddsa".len() + 64);

        let digest: [u8; 32] = Blake2b256::digest(hex::decode("deadbeef").unwrap()).into();
        assert_eq!(id, format!("eddsa{}", hex::encode(digest)));
    }

    #[test]
    fn correlator_is_stable_per_message() {
        let first = correlator(Protocol::Ecdsa, "00ff").unwrap();
        let second = correlator(Protocol::Ecdsa, "00ff").unwrap();
        let other = correlator(Protocol::Ecdsa, "00fe").unwrap();
        assert_eq!(first, second);
        assert_ne!(first, other);
    }

    #[test]
    fn correlator_rejects_non_hex_messages() {
        assert!(correlator(Protocol::Eddsa, "not-hex").is_err());
    }
}
