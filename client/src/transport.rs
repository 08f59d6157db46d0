//! Hub transport.
//!
//! Two endpoints, both relative to the hub URL:
//!
//! | Method | Path          | Body                             |
//! |--------|---------------|----------------------------------|
//! | POST   | `/api/sync`   | `SyncRequest` → `SyncResponse`   |
//! | HEAD   | `/api/health` | none, any 2xx means reachable    |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tether_engine::{NodeId, SyncRequest, SyncResponse};
use tracing::debug;

use crate::error::{Error, Result};

/// Header carrying the device id on every request.
pub const DEVICE_ID_HEADER: &str = "X-Device-Id";

/// Who this device is and where its hub lives.
pub trait IdentityProvider: Send + Sync {
    fn device_id(&self) -> NodeId;

    fn hub_url(&self) -> String;

    fn auth_token(&self) -> Option<String> {
        None
    }
}

/// Fixed identity, typically loaded from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    pub device_id: NodeId,
    pub hub_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

impl IdentityProvider for DeviceIdentity {
    fn device_id(&self) -> NodeId {
        self.device_id.clone()
    }

    fn hub_url(&self) -> String {
        self.hub_url.clone()
    }

    fn auth_token(&self) -> Option<String> {
        self.auth_token.clone()
    }
}

/// Request/response channel to the hub.
#[async_trait]
pub trait Transport: Send + Sync {
    /// One sync round trip.
    async fn sync(&self, request: &SyncRequest) -> Result<SyncResponse>;

    /// Whether the hub answers at all. Never errors.
    async fn health(&self) -> bool;
}

/// HTTP transport over reqwest.
pub struct HttpTransport {
    client: reqwest::Client,
    identity: Arc<dyn IdentityProvider>,
    sync_timeout: Duration,
    health_timeout: Duration,
}

impl HttpTransport {
    pub fn new(
        identity: Arc<dyn IdentityProvider>,
        sync_timeout: Duration,
        health_timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(health_timeout)
            .build()?;
        Ok(Self {
            client,
            identity,
            sync_timeout,
            health_timeout,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.identity.hub_url().trim_end_matches('/'), path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let request = request.header(DEVICE_ID_HEADER, self.identity.device_id());
        match self.identity.auth_token() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn classify(&self, error: reqwest::Error) -> Error {
        if error.is_timeout() {
            Error::Timeout(self.sync_timeout)
        } else {
            Error::Transport(error)
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn sync(&self, request: &SyncRequest) -> Result<SyncResponse> {
        let url = self.endpoint("/api/sync");
        let builder = self
            .authorize(self.client.post(&url))
            .timeout(self.sync_timeout)
            .json(request);

        let round_trip = async {
            let response = builder.send().await.map_err(|e| self.classify(e))?;
            let status = response.status();
            if !status.is_success() {
                return Err(Error::HubStatus(status.as_u16()));
            }
            response
                .json::<SyncResponse>()
                .await
                .map_err(|e| self.classify(e))
        };

        let response = tokio::time::timeout(self.sync_timeout, round_trip)
            .await
            .map_err(|_| Error::Timeout(self.sync_timeout))??;

        debug!(
            url = %url,
            sent = request.deltas.len(),
            received = response.deltas.len(),
            accepted = response.accepted_delta_ids.len(),
            rejected = response.rejected_deltas.len(),
            "Sync round trip completed"
        );
        Ok(response)
    }

    async fn health(&self) -> bool {
        let probe = self
            .authorize(self.client.head(self.endpoint("/api/health")))
            .timeout(self.health_timeout)
            .send();

        match tokio::time::timeout(self.health_timeout, probe).await {
            Ok(Ok(response)) => response.status().is_success(),
            Ok(Err(e)) => {
                debug!(error = %e, "Hub health probe failed");
                false
            }
            Err(_) => {
                debug!("Hub health probe timed out");
                false
            }
        }
    }
}
