//!
//! src/credentials.rs
//!
//! Process wide access token for the catalog api. Lazily refreshed from
//! the accounts endpoint with a client credentials grant; the check and
//! the refresh happen under one lock so concurrent callers never race.
//!

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::errors::SyncError;
use crate::fetch::SpotifyClient;
use crate::wire::{AuthErrorResponse, TokenResponse};

/// ten years; anything longer is treated as this
const MAX_LIFETIME_SECS: u64 = 315_360_000;

#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
    pub token_type: String,
    pub expires_in: u64,
    pub issued_at: DateTime<Utc>
}

impl Credential {
    pub fn expires_at(&self) -> DateTime<Utc> {
        let secs = self.expires_in.min(MAX_LIFETIME_SECS) as i64;
        self.issued_at + chrono::Duration::seconds(secs)
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at() > now
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("issued_at", &self.issued_at)
            .finish()
    }
}

pub struct CredentialCache {
    client: SpotifyClient,
    cached: Mutex<Option<Credential>>
}

impl CredentialCache {
    pub fn new(client: SpotifyClient) -> Self {
        Self { client, cached: Mutex::new(None) }
    }

    /// Cached credential while it is valid, otherwise a fresh one that
    /// replaces it wholesale
    pub async fn acquire(&self) -> Result<Credential, SyncError> {
        let mut cached = self.cached.lock().await;

        if let Some(credential) = cached.as_ref() {
            if credential.is_valid_at(Utc::now()) {
                return Ok(credential.clone());
            }
            debug!(expired_at = %credential.expires_at(), "credential.expired");
        }

        let fresh = self.request_credential().await?;
        *cached = Some(fresh.clone());
        Ok(fresh)
    }

    async fn request_credential(&self) -> Result<Credential, SyncError> {
        info!("credential.refresh");
        let response = self.client.token_request().send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            let err = match serde_json::from_str::<AuthErrorResponse>(&body) {
                Ok(e) => SyncError::auth(e.error, e.error_description),
                Err(_) => SyncError::auth(
                    status.canonical_reason().unwrap_or("http error"),
                    body
                ),
            };
            warn!(status = %status, error = %err, "credential.refresh.failed");
            return Err(err);
        }

        // an empty 2xx is a protocol violation, not something to retry
        if body.trim().is_empty() {
            return Err(SyncError::auth(
                "unexpected error",
                "body was empty on success"
            ));
        }

        let token: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| SyncError::auth(
                "unexpected error",
                format!("malformed token response: {e}")
            ))?;

        let credential = Credential {
            token: token.access_token,
            token_type: token.token_type,
            expires_in: token.expires_in,
            issued_at: Utc::now()
        };
        info!(
            token_type = %credential.token_type,
            expires_at = %credential.expires_at(),
            "credential.refresh.done"
        );
        Ok(credential)
    }
}
