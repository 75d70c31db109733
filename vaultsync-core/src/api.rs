//! The sync-server interface the core consumes, and its wire types.
//!
//! The server is untrusted: it stores opaque encrypted payloads and never
//! sees plaintext nor the root key.

use crate::payload::RawPayload;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Protocol date of the sync API this client speaks.
pub const API_VERSION: &str = "20200115";

/// Default number of items uploaded per round.
pub const SYNC_UP_LIMIT: usize = 150;

#[derive(Error, Debug)]
pub enum ApiError {
    /// Server returned 401; the session is no longer valid.
    #[error("Invalid session")]
    InvalidSession,

    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),
}

/// POST body of the sync endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
    pub api: String,
    pub items: Vec<RawPayload>,
    pub sync_token: Option<String>,
    pub cursor_token: Option<String>,
    pub limit: usize,
    pub compute_integrity: bool,
}

impl SyncRequest {
    pub fn new(
        items: Vec<RawPayload>,
        sync_token: Option<String>,
        cursor_token: Option<String>,
        compute_integrity: bool,
    ) -> Self {
        Self {
            api: API_VERSION.to_string(),
            items,
            sync_token,
            cursor_token,
            limit: SYNC_UP_LIMIT,
            compute_integrity,
        }
    }
}

/// A server-reported conflict: the client's uuid collided with a
/// differing server record, carried here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictEntry {
    #[serde(rename = "type")]
    pub conflict_type: String,
    pub server_item: RawPayload,
}

/// Response body of the sync endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncResponse {
    #[serde(default)]
    pub retrieved_items: Vec<RawPayload>,
    #[serde(default)]
    pub saved_items: Vec<RawPayload>,
    #[serde(default)]
    pub conflicts: Vec<ConflictEntry>,
    pub sync_token: Option<String>,
    pub cursor_token: Option<String>,
    pub integrity_hash: Option<String>,
}

/// The sync transport. One POST per round; pagination via `cursor_token`.
#[allow(async_fn_in_trait)]
pub trait SyncApi {
    async fn sync(&self, request: &SyncRequest) -> Result<SyncResponse, ApiError>;
}

impl<T: SyncApi> SyncApi for std::sync::Arc<T> {
    async fn sync(&self, request: &SyncRequest) -> Result<SyncResponse, ApiError> {
        T::sync(self, request).await
    }
}

/// HTTP implementation of [`SyncApi`].
pub struct HttpSyncApi {
    client: reqwest::Client,
    host: String,
    session_token: Option<String>,
}

impl HttpSyncApi {
    pub fn new(host: &str, session_token: Option<String>) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| ApiError::Network(e.to_string()))?;
        Ok(Self {
            client,
            host: host.trim_end_matches('/').to_string(),
            session_token,
        })
    }

    pub fn set_session_token(&mut self, token: Option<String>) {
        self.session_token = token;
    }
}

impl SyncApi for HttpSyncApi {
    async fn sync(&self, request: &SyncRequest) -> Result<SyncResponse, ApiError> {
        let url = format!("{}/items/sync", self.host);
        let mut builder = self.client.post(&url).json(request);
        if let Some(token) = &self.session_token {
            builder = builder.bearer_auth(token);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 401 {
            return Err(ApiError::InvalidSession);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_else(|_| "unknown".to_string());
            return Err(ApiError::Server {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json()
            .await
            .map_err(|e| ApiError::Network(format!("invalid sync response: {}", e)))
    }
}
