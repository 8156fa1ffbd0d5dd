//! Simulated party backend.
//!
//! Runs the real channel protocol (commitment broadcast round, point-to-point
//! ack round, terminal value) but replaces the MPC math with a single-key
//! simulation: every party derives the same keypair from the sorted share-ID
//! set and produces a deterministic signature that verifies against the
//! published group key. Insecure by construction; intended for local devnets
//! and the test suite. Production deployments plug a library-backed
//! [`PartyFactory`] instead.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use blake2::{digest::consts::U32, Blake2b, Digest};
use ed25519_dalek::Signer;
use k256::ecdsa::SigningKey as EcdsaSigningKey;
use k256::elliptic_curve::ff::{Field, PrimeField};
use k256::elliptic_curve::ops::Reduce;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::{ProjectivePoint, PublicKey, Scalar, U256};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::sync::mpsc;
use tracing::debug;

use super::{
    EndData, KeygenContext, KeygenOutcome, Party, PartyChannels, PartyFactory, PartyIdentifier,
    PartyMessage, SignContext, SignOutcome, SortedParties,
};
use crate::models::Protocol;
use crate::TssdResult;
use anyhow::anyhow;

type Blake2b256 = Blake2b<U32>;

/// JSON field of the persisted save data holding the simulated group secret.
const DEV_SECRET_FIELD: &str = "devSecret";

#[derive(Debug, Default)]
pub struct SimulatedFactory;

impl SimulatedFactory {
    pub fn new() -> Self {
        SimulatedFactory
    }
}

impl PartyFactory for SimulatedFactory {
    fn keygen_party(
        &self,
        context: KeygenContext,
        channels: PartyChannels,
    ) -> TssdResult<Arc<dyn Party>> {
        Ok(Arc::new(SimulatedKeygenParty {
            context,
            channels,
            state: Mutex::new(KeygenState::default()),
        }))
    }

    fn sign_party(
        &self,
        context: SignContext,
        channels: PartyChannels,
    ) -> TssdResult<Arc<dyn Party>> {
        Ok(Arc::new(SimulatedSignParty {
            context,
            channels,
            state: Mutex::new(SignState::default()),
        }))
    }
}

/// Round marker carried in the simulated wire payload.
#[derive(Debug, Serialize, Deserialize)]
struct RoundPayload {
    round: u8,
}

fn round_message(
    round: u8,
    from: &PartyIdentifier,
    to: Vec<PartyIdentifier>,
) -> TssdResult<PartyMessage> {
    Ok(PartyMessage {
        payload: serde_json::to_vec(&RoundPayload { round })?,
        from: from.clone(),
        is_broadcast: to.is_empty(),
        to,
        is_to_old_committee: false,
        is_to_old_and_new: false,
    })
}

fn send_out(out: &mpsc::Sender<PartyMessage>, message: PartyMessage) -> TssdResult<()> {
    out.try_send(message)
        .map_err(|_| anyhow!("party out channel is full or closed"))
}

/// Joint seed every simulated party converges on: a digest over the sorted
/// share indices of the group.
fn joint_seed(protocol: Protocol, parties: &SortedParties) -> [u8; 32] {
    let mut hasher = Blake2b256::new();
    hasher.update(protocol.as_str().as_bytes());
    for party in parties.iter() {
        hasher.update(party.key.to_string().as_bytes());
        hasher.update(b"/");
    }
    hasher.finalize().into()
}

fn ecdsa_scalar_from_seed(seed: &[u8; 32]) -> Scalar {
    let scalar = <Scalar as Reduce<U256>>::reduce(U256::from_be_slice(seed));
    if bool::from(scalar.is_zero()) {
        Scalar::ONE
    } else {
        scalar
    }
}

fn ecdsa_public_key(secret: &Scalar) -> TssdResult<Vec<u8>> {
    let point = (ProjectivePoint::GENERATOR * *secret).to_affine();
    let public = PublicKey::from_affine(point).map_err(|_| anyhow!("derived identity point"))?;
    Ok(public.to_encoded_point(true).as_bytes().to_vec())
}

#[derive(Debug, Default)]
struct KeygenState {
    commits: BTreeSet<String>,
    acks: BTreeSet<String>,
    acked: bool,
    finished: bool,
}

struct SimulatedKeygenParty {
    context: KeygenContext,
    channels: PartyChannels,
    state: Mutex<KeygenState>,
}

impl SimulatedKeygenParty {
    fn advance(&self, state: &mut KeygenState) -> TssdResult<()> {
        let others = self.context.parties.len() - 1;

        // commitment round complete: ack every co-party point-to-point
        if state.commits.len() == others && !state.acked {
            state.acked = true;
            for peer in self.context.parties.iter() {
                if peer.id != self.context.local.id {
                    send_out(
                        &self.channels.out,
                        round_message(2, &self.context.local, vec![peer.clone()])?,
                    )?;
                }
            }
        }

        if state.commits.len() == others && state.acks.len() == others && !state.finished {
            state.finished = true;
            self.finish()?;
        }
        Ok(())
    }

    fn finish(&self) -> TssdResult<()> {
        let seed = joint_seed(self.context.protocol, &self.context.parties);
        let (secret, public_key) = match self.context.protocol {
            Protocol::Eddsa => {
                let signing_key = ed25519_dalek::SigningKey::from_bytes(&seed);
                (seed.to_vec(), signing_key.verifying_key().to_bytes().to_vec())
            }
            Protocol::Ecdsa => {
                let scalar = ecdsa_scalar_from_seed(&seed);
                (scalar.to_bytes().to_vec(), ecdsa_public_key(&scalar)?)
            }
        };

        debug!(
            protocol = %self.context.protocol,
            "simulated keygen finished, publishing group key"
        );

        let outcome = KeygenOutcome {
            share_id: self.context.local.key.clone(),
            public_key,
            payload: serde_json::json!({ DEV_SECRET_FIELD: hex::encode(secret) }),
        };
        self.channels
            .end
            .try_send(EndData::Keygen(outcome))
            .map_err(|_| anyhow!("party end channel is full or closed"))
    }
}

impl Party for SimulatedKeygenParty {
    fn start(&self) -> TssdResult<()> {
        send_out(
            &self.channels.out,
            round_message(1, &self.context.local, vec![])?,
        )?;
        let mut state = self.state.lock().expect("keygen state poisoned");
        self.advance(&mut state)
    }

    fn update(&self, message: &PartyMessage) -> TssdResult<()> {
        let payload: RoundPayload = serde_json::from_slice(&message.payload)?;
        let mut state = self.state.lock().expect("keygen state poisoned");
        match payload.round {
            1 => {
                state.commits.insert(message.from.id.clone());
            }
            2 => {
                state.acks.insert(message.from.id.clone());
            }
            round => return Err(anyhow!("unexpected keygen round {round}")),
        }
        self.advance(&mut state)
    }

    fn waiting_for(&self) -> Vec<String> {
        let state = self.state.lock().expect("keygen state poisoned");
        self.context
            .parties
            .iter()
            .filter(|peer| {
                peer.id != self.context.local.id
                    && (!state.commits.contains(&peer.id) || !state.acks.contains(&peer.id))
            })
            .map(|peer| peer.id.clone())
            .collect()
    }
}

#[derive(Debug, Default)]
struct SignState {
    nonces: BTreeSet<String>,
    finished: bool,
}

struct SimulatedSignParty {
    context: SignContext,
    channels: PartyChannels,
    state: Mutex<SignState>,
}

impl SimulatedSignParty {
    fn advance(&self, state: &mut SignState) -> TssdResult<()> {
        if state.nonces.len() == self.context.parties.len() - 1 && !state.finished {
            state.finished = true;
            self.finish()?;
        }
        Ok(())
    }

    fn group_secret(&self) -> TssdResult<[u8; 32]> {
        let encoded = self
            .context
            .key_share
            .payload
            .get(DEV_SECRET_FIELD)
            .and_then(|value| value.as_str())
            .ok_or_else(|| anyhow!("save data has no {DEV_SECRET_FIELD} entry"))?;
        let bytes = hex::decode(encoded)?;
        bytes
            .try_into()
            .map_err(|_| anyhow!("{DEV_SECRET_FIELD} is not 32 bytes"))
    }

    fn finish(&self) -> TssdResult<()> {
        let secret = self.group_secret()?;
        let outcome = match self.context.protocol {
            Protocol::Eddsa => {
                let signing_key = ed25519_dalek::SigningKey::from_bytes(&secret);
                let signature = signing_key.sign(&self.context.message);
                SignOutcome {
                    message: self.context.message.clone(),
                    signature: signature.to_bytes().to_vec(),
                    recovery: None,
                }
            }
            Protocol::Ecdsa => {
                let mut scalar = Option::<Scalar>::from(Scalar::from_repr(secret.into()))
                    .ok_or_else(|| anyhow!("stored secret is not a valid scalar"))?;
                if let Some(tweak) = &self.context.derivation {
                    let delta = Option::<Scalar>::from(Scalar::from_repr(tweak.delta.into()))
                        .ok_or_else(|| anyhow!("derivation delta is not a valid scalar"))?;
                    scalar += delta;
                }
                let signing_key = EcdsaSigningKey::from_bytes(&scalar.to_bytes())
                    .map_err(|err| anyhow!("signing key: {err}"))?;
                let digest: [u8; 32] = Sha256::digest(&self.context.message).into();
                let (signature, recovery_id) = signing_key
                    .sign_prehash_recoverable(&digest)
                    .map_err(|err| anyhow!("signing failed: {err}"))?;
                SignOutcome {
                    message: self.context.message.clone(),
                    signature: signature.to_bytes().to_vec(),
                    recovery: Some(vec![recovery_id.to_byte()]),
                }
            }
        };

        debug!(
            protocol = %self.context.protocol,
            "simulated sign finished"
        );

        self.channels
            .end
            .try_send(EndData::Sign(outcome))
            .map_err(|_| anyhow!("party end channel is full or closed"))
    }
}

impl Party for SimulatedSignParty {
    fn start(&self) -> TssdResult<()> {
        send_out(
            &self.channels.out,
            round_message(1, &self.context.local, vec![])?,
        )?;
        let mut state = self.state.lock().expect("sign state poisoned");
        self.advance(&mut state)
    }

    fn update(&self, message: &PartyMessage) -> TssdResult<()> {
        let payload: RoundPayload = serde_json::from_slice(&message.payload)?;
        if payload.round != 1 {
            return Err(anyhow!("unexpected sign round {}", payload.round));
        }
        let mut state = self.state.lock().expect("sign state poisoned");
        state.nonces.insert(message.from.id.clone());
        self.advance(&mut state)
    }

    fn waiting_for(&self) -> Vec<String> {
        let state = self.state.lock().expect("sign state poisoned");
        self.context
            .parties
            .iter()
            .filter(|peer| peer.id != self.context.local.id && !state.nonces.contains(&peer.id))
            .map(|peer| peer.id.clone())
            .collect()
    }
}
