//! The Agent ↔ Backend HTTP surface (spec §6): connection-service
//! discovery, identity-token minting, and control-channel discovery — all
//! GETs. Only identity-token minting carries `message`/`signature` query
//! params (the MrTAP bootstrap handshake signature); control-channel
//! discovery is bearer-token-only.

use std::time::Duration;

use agent_core::error::TransportError;
use reqwest::Client;
use serde::de::DeserializeOwned;
use tracing::debug;

/// A thin `reqwest`-backed client for the Bootstrap HTTP calls (spec §4.F).
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    base_url: String,
}

impl HttpClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Io(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    /// `GET /api/v2/connection-service/url` → `{connectionServiceUrl}`.
    pub async fn connection_service_url(&self) -> Result<String, TransportError> {
        #[derive(serde::Deserialize)]
        struct Response {
            #[serde(rename = "connectionServiceUrl")]
            connection_service_url: String,
        }
        let resp: Response = self
            .get_json(&format!("{}/api/v2/connection-service/url", self.base_url), &[])
            .await?;
        Ok(resp.connection_service_url)
    }

    /// `GET /api/v2/agent/identity/{target_id}?message=<b64>&signature=<b64>` → `{token}`.
    pub async fn agent_identity_token(
        &self,
        target_id: &str,
        message_b64: &str,
        signature_b64: &str,
    ) -> Result<String, TransportError> {
        #[derive(serde::Deserialize)]
        struct Response {
            token: String,
        }
        let resp: Response = self
            .get_json(
                &format!("{}/api/v2/agent/identity/{target_id}", self.base_url),
                &[("message", message_b64), ("signature", signature_b64)],
            )
            .await?;
        Ok(resp.token)
    }

    /// `GET <connection-service>/control-channel` with
    /// `Authorization: Bearer <token>` → `{connectionUrl, controlChannelId}`.
    pub async fn control_channel(
        &self,
        connection_service_url: &str,
        bearer_token: &str,
    ) -> Result<ControlChannelInfo, TransportError> {
        let url = format!("{connection_service_url}/control-channel");
        debug!(url, "requesting control channel info");
        let resp = self
            .client
            .get(&url)
            .bearer_auth(bearer_token)
            .send()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;

        Self::check_status(&resp)?;
        resp.json().await.map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str, query: &[(&str, &str)]) -> Result<T, TransportError> {
        let resp = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        Self::check_status(&resp)?;
        resp.json().await.map_err(|e| TransportError::Io(e.to_string()))
    }

    fn check_status(resp: &reqwest::Response) -> Result<(), TransportError> {
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(TransportError::Io(format!("HTTP {} from {}", resp.status(), resp.url())))
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ControlChannelInfo {
    #[serde(rename = "connectionUrl")]
    pub connection_url: String,
    #[serde(rename = "controlChannelId")]
    pub control_channel_id: String,
}
