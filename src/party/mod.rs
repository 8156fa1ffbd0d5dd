//! The round-based cryptographic party abstraction.
//!
//! A party is an opaque state machine with three channels: it emits outbound
//! wire messages on `out`, accepts peer messages through [`Party::update`],
//! and delivers exactly one terminal value on `end`. The MPC round math lives
//! behind [`PartyFactory`]; the coordinator only drives the channel protocol.

use std::sync::Arc;

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::models::{KeyShare, Peer, Protocol};
use crate::TssdResult;
use anyhow::anyhow;

pub mod simulated;

/// One participant of a TSS run. Ordering follows `key` (the Shamir index)
/// so every node arrives at the same party order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartyIdentifier {
    pub id: String,
    pub moniker: String,
    #[serde(with = "biguint_decimal")]
    pub key: BigUint,
}

impl PartyIdentifier {
    pub fn new(id: impl Into<String>, key: BigUint) -> Self {
        let id = id.into();
        let moniker = format!("tssPeer/{id}");
        PartyIdentifier { id, moniker, key }
    }

    /// Builds an identifier from a submitted peer entry.
    pub fn from_peer(peer: &Peer) -> TssdResult<Self> {
        let key = peer
            .share_id
            .parse::<BigUint>()
            .map_err(|_| anyhow!("peer {} has a malformed shareID", peer.p2p_id))?;
        Ok(PartyIdentifier::new(peer.p2p_id.clone(), key))
    }
}

impl PartialOrd for PartyIdentifier {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PartyIdentifier {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key.cmp(&other.key).then_with(|| self.id.cmp(&other.id))
    }
}

/// Participant list sorted by share index.
#[derive(Debug, Clone)]
pub struct SortedParties(Vec<PartyIdentifier>);

impl SortedParties {
    pub fn new(mut parties: Vec<PartyIdentifier>) -> Self {
        parties.sort();
        SortedParties(parties)
    }

    pub fn find(&self, id: &str) -> Option<&PartyIdentifier> {
        self.0.iter().find(|party| party.id == id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PartyIdentifier> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[PartyIdentifier] {
        &self.0
    }
}

/// One message produced or consumed by a party. An empty `to` means
/// broadcast. `payload` is the party library's wire format, never inspected.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartyMessage {
    #[serde(with = "hex_bytes")]
    pub payload: Vec<u8>,
    pub from: PartyIdentifier,
    #[serde(default)]
    pub to: Vec<PartyIdentifier>,
    pub is_broadcast: bool,
    #[serde(default)]
    pub is_to_old_committee: bool,
    #[serde(default)]
    pub is_to_old_and_new: bool,
}

impl PartyMessage {
    /// Wire form carried inside a gossip frame: hex over JSON.
    pub fn to_wire(&self) -> TssdResult<String> {
        Ok(hex::encode(serde_json::to_vec(self)?))
    }

    pub fn from_wire(wire: &str) -> TssdResult<Self> {
        let bytes = hex::decode(wire)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Terminal value of a keygen party.
#[derive(Debug, Clone)]
pub struct KeygenOutcome {
    pub share_id: BigUint,
    /// Serialised group public key (32-byte Edwards point or 33-byte
    /// compressed secp256k1 point).
    pub public_key: Vec<u8>,
    /// Library save data, persisted verbatim.
    pub payload: serde_json::Value,
}

/// Terminal value of a sign party.
#[derive(Debug, Clone)]
pub struct SignOutcome {
    pub message: Vec<u8>,
    pub signature: Vec<u8>,
    pub recovery: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub enum EndData {
    Keygen(KeygenOutcome),
    Sign(SignOutcome),
}

/// Sending halves handed to a party at construction; the driver keeps the
/// receiving halves.
pub struct PartyChannels {
    pub out: mpsc::Sender<PartyMessage>,
    pub end: mpsc::Sender<EndData>,
}

/// A running party. `start` is non-blocking; `update` must be callable from
/// any task.
pub trait Party: Send + Sync {
    fn start(&self) -> TssdResult<()>;
    fn update(&self, message: &PartyMessage) -> TssdResult<()>;
    /// Ids of the parties whose messages are still needed; diagnostics only.
    fn waiting_for(&self) -> Vec<String>;
}

/// Everything a backend needs to build a keygen party.
#[derive(Clone)]
pub struct KeygenContext {
    pub protocol: Protocol,
    pub local: PartyIdentifier,
    pub parties: SortedParties,
    pub threshold: u32,
}

/// ECDSA child-key tweak applied before signing: the accumulated BIP-32
/// delta and the derived public key, both in raw encodings.
#[derive(Debug, Clone)]
pub struct DerivationTweak {
    pub delta: [u8; 32],
    pub child_public_key: Vec<u8>,
}

/// Everything a backend needs to build a sign party.
#[derive(Clone)]
pub struct SignContext {
    pub protocol: Protocol,
    pub local: PartyIdentifier,
    pub parties: SortedParties,
    pub threshold: u32,
    pub message: Vec<u8>,
    pub key_share: KeyShare,
    pub derivation: Option<DerivationTweak>,
}

/// Seam to the MPC library implementing the round logic.
pub trait PartyFactory: Send + Sync {
    fn keygen_party(
        &self,
        context: KeygenContext,
        channels: PartyChannels,
    ) -> TssdResult<Arc<dyn Party>>;

    fn sign_party(
        &self,
        context: SignContext,
        channels: PartyChannels,
    ) -> TssdResult<Arc<dyn Party>>;
}

mod biguint_decimal {
    use num_bigint::BigUint;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &BigUint, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BigUint, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse::<BigUint>()
            .map_err(|_| de::Error::custom("expected a decimal big integer"))
    }
}

mod hex_bytes {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(&text).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identifier(id: &str, key: u64) -> PartyIdentifier {
        PartyIdentifier::new(id, BigUint::from(key))
    }

    #[test]
    fn parties_sort_by_share_index() {
        let parties = SortedParties::new(vec![
            identifier("c", 30),
            identifier("a", 10),
            identifier("b", 20),
        ]);
        let ids: Vec<_> = parties.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
        assert_eq!(parties.find("b").unwrap().key, BigUint::from(20u64));
        assert!(parties.find("d").is_none());
    }

    #[test]
    fn moniker_is_derived_from_id() {
        assert_eq!(identifier("p1", 1).moniker, "tssPeer/p1");
    }

    #[test]
    fn party_message_wire_round_trip() {
        let msg = PartyMessage {
            payload: vec![1, 2, 3],
            from: identifier("a", 10),
            to: vec![identifier("b", 20)],
            is_broadcast: false,
            is_to_old_committee: false,
            is_to_old_and_new: false,
        };
        let wire = msg.to_wire().unwrap();
        let parsed = PartyMessage::from_wire(&wire).unwrap();
        assert_eq!(parsed.payload, vec![1, 2, 3]);
        assert_eq!(parsed.from.id, "a");
        assert_eq!(parsed.to[0].key, BigUint::from(20u64));
        assert!(!parsed.is_broadcast);
    }

    #[test]
    fn from_wire_rejects_bad_hex() {
        assert!(PartyMessage::from_wire("zz").is_err());
    }
}
