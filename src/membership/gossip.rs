use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CadenceError, Result};

/// One member's entry in a gossip exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberDigest {
    pub name: String,
    pub addr: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub heartbeat: u64,
    #[serde(default)]
    pub left: bool,
}

/// Request and response body of `POST /internal/gossip`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipMessage {
    pub from: String,
    pub members: Vec<MemberDigest>,
}

#[derive(Debug, Clone)]
pub struct GossipClient {
    client: reqwest::Client,
}

impl GossipClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CadenceError::Internal(format!("failed to build http client: {}", e)))?;
        Ok(Self { client })
    }

    /// Push our view to `addr` and return the peer's view.
    pub async fn exchange(&self, addr: &str, message: &GossipMessage) -> Result<GossipMessage> {
        let url = format!("http://{}/internal/gossip", addr);
        let response = self
            .client
            .post(&url)
            .json(message)
            .send()
            .await
            .map_err(|e| CadenceError::Internal(format!("gossip to {} failed: {}", addr, e)))?;

        if !response.status().is_success() {
            return Err(CadenceError::Internal(format!(
                "gossip to {} returned {}",
                addr,
                response.status()
            )));
        }

        response
            .json::<GossipMessage>()
            .await
            .map_err(|e| CadenceError::Internal(format!("invalid gossip reply from {}: {}", addr, e)))
    }
}
