//! Wire-level data model: requests, gossip envelopes, callback payloads and
//! the persisted key-share record.

use serde::{Deserialize, Serialize};

use crate::error::TssError;

/// Crypto protocol an operation is parameterised by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Eddsa,
    Ecdsa,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Eddsa => "eddsa",
            Protocol::Ecdsa => "ecdsa",
        }
    }

    /// Parses the `crypto` field of a request.
    pub fn parse(crypto: &str) -> Result<Self, TssError> {
        match crypto {
            "eddsa" => Ok(Protocol::Eddsa),
            "ecdsa" => Ok(Protocol::Ecdsa),
            _ => Err(TssError::WrongCryptoProtocol),
        }
    }

    pub fn keygen_class(&self) -> String {
        format!("{}Keygen", self.as_str())
    }

    pub fn sign_class(&self) -> String {
        format!("{}Sign", self.as_str())
    }

    pub fn regroup_class(&self) -> String {
        format!("{}Regroup", self.as_str())
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A co-signer: Shamir index as a decimal string plus its transport address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    #[serde(rename = "shareID")]
    pub share_id: String,
    #[serde(rename = "p2pID")]
    pub p2p_id: String,
}

/// Per-protocol group parameters, cached in memory and persisted with the
/// key share.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaData {
    pub peers_count: u32,
    pub threshold: u32,
}

/// Request body of `POST /keygen`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeygenRequest {
    pub peers_count: u32,
    pub threshold: u32,
    pub crypto: String,
    pub call_back_url: String,
    #[serde(rename = "p2pIDs")]
    pub p2p_ids: Vec<String>,
    pub operation_timeout: u64,
}

/// Request body of `POST /sign`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignRequest {
    pub crypto: String,
    pub message: String,
    pub call_back_url: String,
    pub peers: Vec<Peer>,
    pub operation_timeout: u64,
    #[serde(default)]
    pub chain_code: String,
    #[serde(default)]
    pub derivation_path: Vec<u32>,
}

/// Envelope delivered by the p2p relay to `POST /message`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message: String,
    pub sender: String,
    #[serde(rename = "channel")]
    pub topic: String,
}

/// One gossip frame of a TSS run. `message` carries a hex-encoded,
/// JSON-serialised party message; an empty `receiver_id` means broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GossipMessage {
    pub message_id: String,
    pub message: String,
    pub sender_id: String,
    #[serde(default)]
    pub receiver_id: String,
}

/// Successful sign callback payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignSuccess {
    pub message: String,
    pub signature: String,
    #[serde(rename = "signatureRecovery", skip_serializing_if = "Option::is_none")]
    pub signature_recovery: Option<String>,
    pub status: String,
}

/// Failed sign callback payload; `message` echoes the original hex input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignFailure {
    pub message: String,
    pub error: String,
    pub status: String,
}

/// Successful keygen callback payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeygenSuccess {
    #[serde(rename = "shareID")]
    pub share_id: String,
    #[serde(rename = "pubKey")]
    pub pub_key: String,
    pub status: String,
}

/// Failed keygen callback payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeygenFailure {
    pub error: String,
    pub status: String,
}

/// Persisted key-share record. `payload` is the party library's save data,
/// kept opaque; the coordinator only interprets the envelope fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyShare {
    #[serde(rename = "shareID")]
    pub share_id: String,
    #[serde(rename = "pubKey")]
    pub pub_key: String,
    pub payload: serde_json::Value,
}

/// On-disk blob written after a successful keygen:
/// `<peer_home>/<protocol>/keygen_data.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TssConfig {
    pub meta_data: MetaData,
    pub keygen_data: KeyShare,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_parse() {
        assert_eq!(Protocol::parse("eddsa").unwrap(), Protocol::Eddsa);
        assert_eq!(Protocol::parse("ecdsa").unwrap(), Protocol::Ecdsa);
        assert!(matches!(
            Protocol::parse("rsa"),
            Err(TssError::WrongCryptoProtocol)
        ));
    }

    #[test]
    fn class_names() {
        assert_eq!(Protocol::Eddsa.keygen_class(), "eddsaKeygen");
        assert_eq!(Protocol::Ecdsa.sign_class(), "ecdsaSign");
        assert_eq!(Protocol::Ecdsa.regroup_class(), "ecdsaRegroup");
    }

    #[test]
    fn sign_request_defaults() {
        let req: SignRequest = serde_json::from_value(serde_json::json!({
            "crypto": "eddsa",
            "message": "deadbeef",
            "callBackUrl": "http://localhost:9000/callback",
            "peers": [{"shareID": "123", "p2pID": "p1"}],
            "operationTimeout": 60,
        }))
        .unwrap();
        assert!(req.chain_code.is_empty());
        assert!(req.derivation_path.is_empty());
    }

    #[test]
    fn sign_success_skips_absent_recovery() {
        let body = SignSuccess {
            message: "deadbeef".to_string(),
            signature: "00".to_string(),
            signature_recovery: None,
            status: "success".to_string(),
        };
        let value = serde_json::to_value(&body).unwrap();
        assert!(value.get("signatureRecovery").is_none());
    }
}
