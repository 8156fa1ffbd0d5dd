//! Gossip transport adapter: publish, subscribe and callbacks over the p2p
//! relay's HTTP API.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use crate::models::GossipMessage;
use crate::TssdResult;
use anyhow::anyhow;

/// The relay channel every coordinator publishes and subscribes on.
const GOSSIP_CHANNEL: &str = "tss";

#[async_trait]
pub trait Transport: Send + Sync {
    /// Publishes one gossip frame; an empty `receiver_id` broadcasts.
    async fn publish(&self, message: &GossipMessage) -> TssdResult<()>;
    /// Registers `self_url + "/message"` on the relay channel; called once at
    /// startup.
    async fn subscribe(&self, self_url: &str) -> TssdResult<()>;
    /// The relay-assigned identity of this node.
    async fn get_peer_id(&self) -> TssdResult<String>;
    /// POSTs an operation outcome to the requester-supplied URL.
    async fn callback(&self, url: &str, payload: serde_json::Value) -> TssdResult<()>;
}

#[derive(Debug, Deserialize)]
struct RelayResponse {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct PeerIdResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    message: String,
}

pub struct HttpTransport {
    client: reqwest::Client,
    publish_url: String,
    subscribe_url: String,
    peer_id_url: String,
}

impl HttpTransport {
    pub fn new(p2p_base: &str) -> Self {
        let base = p2p_base.trim_end_matches('/');
        HttpTransport {
            client: reqwest::Client::new(),
            publish_url: format!("{base}/p2p/send"),
            subscribe_url: format!("{base}/p2p/channel/subscribe"),
            peer_id_url: format!("{base}/p2p/getPeerID"),
        }
    }

    /// POSTs `body` and checks both the status code and the relay's
    /// `{"message":"ok"}` acknowledgement.
    async fn post_expecting_ok(&self, url: &str, body: serde_json::Value) -> TssdResult<()> {
        let response = self.client.post(url).json(&body).send().await?;
        if !response.status().is_success() {
            return Err(anyhow!("not ok response code: {}", response.status()));
        }
        let parsed: RelayResponse = response.json().await?;
        if parsed.message != "ok" {
            return Err(anyhow!("not ok response message: {}", parsed.message));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn publish(&self, message: &GossipMessage) -> TssdResult<()> {
        debug!(message_id = %message.message_id, receiver = %message.receiver_id, "publishing gossip message");
        let body = serde_json::json!({
            "message": serde_json::to_string(message)?,
            "channel": GOSSIP_CHANNEL,
            "receiver": message.receiver_id,
        });
        self.post_expecting_ok(&self.publish_url, body).await
    }

    async fn subscribe(&self, self_url: &str) -> TssdResult<()> {
        info!(url = %self.subscribe_url, "subscribing to gossip channel");
        let body = serde_json::json!({
            "channel": GOSSIP_CHANNEL,
            "url": format!("{self_url}/message"),
        });
        self.post_expecting_ok(&self.subscribe_url, body).await
    }

    async fn get_peer_id(&self) -> TssdResult<String> {
        let response = self.client.get(&self.peer_id_url).send().await?;
        if !response.status().is_success() {
            return Err(anyhow!("not ok response code: {}", response.status()));
        }
        let parsed: PeerIdResponse = response.json().await?;
        if parsed.status != "ok" {
            return Err(anyhow!("not ok response status: {}", parsed.status));
        }
        if parsed.message.is_empty() {
            return Err(anyhow!("nil peerId"));
        }
        info!(peer_id = %parsed.message, "resolved own peer id");
        Ok(parsed.message)
    }

    async fn callback(&self, url: &str, payload: serde_json::Value) -> TssdResult<()> {
        debug!(%url, "sending callback data");
        let response = self.client.post(url).json(&payload).send().await?;
        if !response.status().is_success() {
            return Err(anyhow!("not ok response code: {}", response.status()));
        }
        Ok(())
    }
}
