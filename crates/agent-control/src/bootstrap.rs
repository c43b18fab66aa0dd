//! Authenticated Bootstrap (spec §4.F): produces the URL and bearer token a
//! Connection Manager variant needs to dial, resolving connection-service
//! discovery, agent-identity tokens, and control-channel placement along the
//! way.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use agent_core::signing::Signer;
use agent_transport::HttpClient;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::BootstrapError;

/// A previously-minted agent-identity token, reused while it still validates.
#[derive(Debug, Clone)]
struct StoredToken {
    raw: String,
    expires_at: SystemTime,
}

#[derive(Debug, Deserialize)]
struct IdentityClaims {
    exp: u64,
    iss: String,
    aud: String,
}

/// Produces dial credentials for Control and Data Connections alike.
pub struct Bootstrap {
    http: HttpClient,
    target_id: String,
    signer: Arc<dyn Signer>,
    oidc_key: DecodingKey,
    stored_token: RwLock<Option<StoredToken>>,
}

impl Bootstrap {
    pub fn new(http: HttpClient, target_id: impl Into<String>, signer: Arc<dyn Signer>, oidc_key: DecodingKey) -> Self {
        Self {
            http,
            target_id: target_id.into(),
            signer,
            oidc_key,
            stored_token: RwLock::new(None),
        }
    }

    /// Runs the full bootstrap sequence and returns `(hub_url, bearer_token)`
    /// for `hub_path` (e.g. `"hub/agent-control"` or `"hub/agent"`). Step 3
    /// (control-channel discovery) is bearer-token-only; the base64
    /// `open_message_type` message and its signature are attached as query
    /// parameters only on the final hub URL (spec §4.F step 3-4, §6).
    pub async fn resolve(&self, hub_path: &str, open_message_type: &str) -> Result<(String, Option<String>), BootstrapError> {
        let connection_service_url = self.http.connection_service_url().await?;
        info!(connection_service_url, "resolved connection-service url");

        let token = self.agent_identity_token(&connection_service_url).await?;

        let control_channel = self.http.control_channel(&connection_service_url, &token).await?;
        debug!(connection_id = control_channel.control_channel_id, "resolved control channel");

        let (open_message_b64, open_signature_b64) = self.sign_message(open_message_type).await?;

        let url = format!(
            "{}/{hub_path}?message={}&signature={}",
            control_channel.connection_url, open_message_b64, open_signature_b64
        );
        Ok((url, Some(token)))
    }

    async fn agent_identity_token(&self, connection_service_url: &str) -> Result<String, BootstrapError> {
        if let Some(token) = self.reusable_stored_token(connection_service_url) {
            return Ok(token);
        }

        let (message_b64, signature_b64) = self.sign_message("getAgentIdentityToken").await?;
        let token = self
            .http
            .agent_identity_token(&self.target_id, &message_b64, &signature_b64)
            .await?;

        if let Some(claims) = self.validate_token(&token, connection_service_url) {
            *self.stored_token.write() = Some(StoredToken {
                raw: token.clone(),
                expires_at: UNIX_EPOCH + Duration::from_secs(claims.exp),
            });
        }
        Ok(token)
    }

    fn reusable_stored_token(&self, connection_service_url: &str) -> Option<String> {
        let stored = self.stored_token.read().clone();
        let stored = stored?;
        if stored.expires_at <= SystemTime::now() {
            return None;
        }
        self.validate_token(&stored.raw, connection_service_url)?;
        Some(stored.raw)
    }

    /// OIDC-style validation: ES256 signature, issuer equal to the
    /// connection-service URL, audience `connection-service`.
    fn validate_token(&self, token: &str, connection_service_url: &str) -> Option<IdentityClaims> {
        let mut validation = Validation::new(Algorithm::ES256);
        validation.set_audience(&["connection-service"]);
        validation.set_issuer(&[connection_service_url]);
        decode::<IdentityClaims>(token, &self.oidc_key, &validation)
            .ok()
            .map(|data| data.claims)
    }

    async fn sign_message(&self, message_type: &str) -> Result<(String, String), BootstrapError> {
        let payload = SignedRequestPayload {
            message_type: message_type.to_string(),
            timestamp: now_unix(),
        };
        let bytes = serde_json::to_vec(&payload).expect("signed request payload is always serializable");
        let signature = self
            .signer
            .sign(&bytes)
            .await
            .map_err(|e| BootstrapError::SignatureFailure(e.to_string()))?;

        Ok((base64_encode(&bytes), base64_encode(&signature)))
    }
}

#[derive(Debug, Serialize)]
struct SignedRequestPayload {
    #[serde(rename = "messageType")]
    message_type: String,
    timestamp: u64,
}

fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

fn base64_encode(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}
