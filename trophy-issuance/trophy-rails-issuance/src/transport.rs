//! HTTP collaborators for the rail service
//!
//! [`HttpTransport`] delivers relay messages to the `relay/receive` route of
//! peer rails; [`HttpMinter`] forwards mint requests to a ledger minting
//! endpoint.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use trophy_issuance::{MintError, MintRequest, Minter};
use trophy_relay::{ChainId, Transport};

pub const PEER_ENDPOINTS_ENV: &str = "TROPHY_PEER_ENDPOINTS";
pub const MINT_ENDPOINT_ENV: &str = "TROPHY_MINT_ENDPOINT";

/// Path on a peer rail that accepts relay messages
pub const RECEIVE_PATH: &str = "/rails/trophy/relay/receive";

/// Parse `chain=url,chain=url` into a peer endpoint map.
pub fn parse_peer_endpoints(raw: &str) -> anyhow::Result<HashMap<ChainId, String>> {
    let mut endpoints = HashMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (chain, url) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("peer endpoint '{pair}' is not chain=url"))?;
        let chain = ChainId::new(chain);
        let url = url.trim().trim_end_matches('/');
        if chain.is_empty() || url.is_empty() {
            bail!("peer endpoint '{pair}' is not chain=url");
        }
        if endpoints.insert(chain.clone(), url.to_string()).is_some() {
            bail!("duplicate peer endpoint for {chain}");
        }
    }
    Ok(endpoints)
}

#[derive(Serialize)]
struct ReceiveBody<'a> {
    payload: &'a str,
}

// ═══════════════════════════════════════════════════════════════════════════════
// RELAY TRANSPORT
// ═══════════════════════════════════════════════════════════════════════════════

/// Posts hex-encoded relay messages to peer rail services.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoints: HashMap<ChainId, String>,
}

impl HttpTransport {
    pub fn new(endpoints: HashMap<ChainId, String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build relay HTTP client")?;
        Ok(Self { client, endpoints })
    }

    /// Endpoints from `TROPHY_PEER_ENDPOINTS`; empty when unset.
    pub fn from_env(timeout: Duration) -> anyhow::Result<Self> {
        let raw = std::env::var(PEER_ENDPOINTS_ENV).unwrap_or_default();
        Self::new(parse_peer_endpoints(&raw)?, timeout)
    }

    pub fn endpoint(&self, chain: &ChainId) -> Option<&str> {
        self.endpoints.get(chain).map(String::as_str)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn deliver(&self, destination: &ChainId, bytes: Vec<u8>) -> anyhow::Result<()> {
        let base = self
            .endpoint(destination)
            .ok_or_else(|| anyhow!("no endpoint configured for {destination}"))?;
        let url = format!("{base}{RECEIVE_PATH}");
        let payload = format!("0x{}", hex::encode(&bytes));

        let response = self
            .client
            .post(&url)
            .json(&ReceiveBody { payload: &payload })
            .send()
            .await
            .with_context(|| format!("relay POST to {url} failed"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("peer {destination} answered {status}: {body}");
        }
        debug!(%destination, bytes = bytes.len(), "Relay message delivered");
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// MINTER
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Deserialize)]
struct MintResponse {
    tx_ref: String,
}

/// Forwards mint requests to an HTTP minting service.
///
/// 4xx answers are treated as permanent rejections; connection errors and
/// any other status are retryable.
pub struct HttpMinter {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpMinter {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build mint HTTP client")?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    pub fn from_env(timeout: Duration) -> anyhow::Result<Self> {
        let endpoint = std::env::var(MINT_ENDPOINT_ENV)
            .with_context(|| format!("{MINT_ENDPOINT_ENV} must be set"))?;
        Self::new(endpoint, timeout)
    }
}

#[async_trait]
impl Minter for HttpMinter {
    async fn mint(&self, request: &MintRequest) -> Result<String, MintError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| MintError::Retryable(format!("mint request failed: {e}")))?;

        let status = response.status();
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(MintError::NonRetryable(format!("minter rejected ({status}): {body}")));
        }
        if !status.is_success() {
            return Err(MintError::Retryable(format!("minter answered {status}")));
        }

        let body: MintResponse = response
            .json()
            .await
            .map_err(|e| MintError::Retryable(format!("invalid mint response: {e}")))?;
        Ok(body.tx_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_peer_endpoints() {
        let endpoints =
            parse_peer_endpoints("Arbitrum=http://arb:3010/, base = http://base:3010").unwrap();
        assert_eq!(endpoints.len(), 2);
        assert_eq!(endpoints[&ChainId::new("arbitrum")], "http://arb:3010");
        assert_eq!(endpoints[&ChainId::new("base")], "http://base:3010");

        assert!(parse_peer_endpoints("").unwrap().is_empty());
        assert!(parse_peer_endpoints("arbitrum").is_err());
        assert!(parse_peer_endpoints("=http://x").is_err());
        assert!(parse_peer_endpoints("a=http://x,a=http://y").is_err());
    }

    #[tokio::test]
    async fn test_missing_endpoint_fails_delivery() {
        let transport = HttpTransport::new(HashMap::new(), Duration::from_secs(1)).unwrap();
        let err = transport
            .deliver(&ChainId::new("arbitrum"), vec![1, 2, 3])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no endpoint"));
    }
}
