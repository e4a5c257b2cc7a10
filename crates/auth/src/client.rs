//! The choke point every remote call goes through.
//!
//! [`ClientFactory::authenticate`] reads the stored credential, refreshes an
//! OAuth2 token that is about to expire, and builds a fresh
//! [`AuthenticatedClient`]. Handles are never cached so a refresh done by one
//! caller is seen by the next.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::credentials::{expiry_after, OAuth2Credential, ServerCredential};
use crate::error::AuthError;
use crate::provider::{normalize_url, TokenClient};
use crate::store::CredentialStore;

pub const REFRESH_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Path of the "current user" resource on the remote content server.
pub const PEOPLE_ME_PATH: &str = "/alfresco/api/-default-/public/alfresco/versions/1/people/-me-";

/// What the refresh step produced. A failed refresh still carries the
/// credential it started from so the caller can carry on with it.
#[derive(Debug)]
pub enum RefreshOutcome {
    Refreshed(OAuth2Credential),
    Failed {
        reason: String,
        stale: OAuth2Credential,
    },
}

impl RefreshOutcome {
    /// The credential to authenticate with, whichever way the refresh went.
    pub fn into_credential(self) -> OAuth2Credential {
        match self {
            RefreshOutcome::Refreshed(cred) => cred,
            RefreshOutcome::Failed { reason, stale } => {
                tracing::warn!(%reason, "Token refresh failed, continuing with existing token");
                stale
            }
        }
    }
}

#[derive(Clone)]
enum ClientAuth {
    Basic { username: String, password: String },
    Bearer(String),
}

impl std::fmt::Debug for ClientAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientAuth::Basic { username, .. } => {
                f.debug_struct("Basic").field("username", username).finish_non_exhaustive()
            }
            ClientAuth::Bearer(_) => f.write_str("Bearer(<redacted>)"),
        }
    }
}

/// Handle for calling one remote server with its current credential.
#[derive(Debug, Clone)]
pub struct AuthenticatedClient {
    server_id: String,
    base_url: String,
    auth: ClientAuth,
    http: reqwest::Client,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentUser {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub capabilities: Capabilities,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    #[serde(default)]
    pub is_admin: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Entry<T> {
    pub entry: T,
}

impl AuthenticatedClient {
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn is_bearer(&self) -> bool {
        matches!(self.auth, ClientAuth::Bearer(_))
    }

    /// Builds a request for `path` (relative to the base URL) with auth applied.
    pub fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        let builder = self.http.request(method, url);
        match &self.auth {
            ClientAuth::Basic { username, password } => builder.basic_auth(username, Some(password)),
            ClientAuth::Bearer(token) => builder.bearer_auth(token),
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, AuthError> {
        let resp = self.request(Method::GET, path).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AuthError::from_status(status, body));
        }
        Ok(resp.json().await?)
    }

    pub async fn current_user(&self) -> Result<CurrentUser, AuthError> {
        let entry: Entry<CurrentUser> = self.get_json(PEOPLE_ME_PATH).await?;
        Ok(entry.entry)
    }
}

pub struct ClientFactory {
    store: Arc<dyn CredentialStore>,
    tokens: TokenClient,
    http: reqwest::Client,
    refresh_window: Duration,
    refresh_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ClientFactory {
    pub fn new(store: Arc<dyn CredentialStore>, tokens: TokenClient, http: reqwest::Client) -> Self {
        Self {
            store,
            tokens,
            http,
            refresh_window: REFRESH_WINDOW,
            refresh_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_refresh_window(mut self, window: Duration) -> Self {
        self.refresh_window = window;
        self
    }

    fn refresh_window(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.refresh_window).unwrap_or(chrono::Duration::MAX)
    }

    fn refresh_lock(&self, server_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.refresh_locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(server_id.to_string()).or_default())
    }

    fn load(&self, server_id: &str) -> Result<ServerCredential, AuthError> {
        match self.store.get_credentials(server_id)? {
            Some(cred) if cred.is_complete() => Ok(cred),
            Some(_) => {
                tracing::warn!(server_id, "Stored credentials are incomplete");
                Err(AuthError::Unauthorized(server_id.to_string()))
            }
            None => Err(AuthError::Unauthorized(server_id.to_string())),
        }
    }

    pub async fn authenticate(
        &self,
        server_id: &str,
        remote_base_url: &str,
    ) -> Result<AuthenticatedClient, AuthError> {
        let base_url = normalize_url(remote_base_url)?;
        let credential = self.load(server_id)?;

        let auth = match credential {
            ServerCredential::Basic(basic) => ClientAuth::Basic {
                username: basic.username,
                password: basic.secret,
            },
            ServerCredential::OAuth2(oauth) => {
                let current = if oauth.expires_within(self.refresh_window(), Utc::now()) {
                    self.refresh_if_still_expiring(server_id).await?
                } else {
                    oauth
                };
                ClientAuth::Bearer(current.secret)
            }
        };

        Ok(AuthenticatedClient {
            server_id: server_id.to_string(),
            base_url: base_url.as_str().trim_end_matches('/').to_string(),
            auth,
            http: self.http.clone(),
        })
    }

    /// Single-flight per server: whoever gets the lock first refreshes, later
    /// callers re-read the store and usually find a fresh token.
    async fn refresh_if_still_expiring(&self, server_id: &str) -> Result<OAuth2Credential, AuthError> {
        let lock = self.refresh_lock(server_id);
        let _guard = lock.lock().await;

        let oauth = match self.load(server_id)? {
            ServerCredential::OAuth2(oauth) => oauth,
            ServerCredential::Basic(_) => return Err(AuthError::Unauthorized(server_id.to_string())),
        };
        if !oauth.expires_within(self.refresh_window(), Utc::now()) {
            tracing::debug!(server_id, "Token already refreshed by another caller");
            return Ok(oauth);
        }

        Ok(self.refresh(server_id, oauth).await.into_credential())
    }

    /// Runs the refresh grant and persists the result. Never fails; a failure
    /// comes back as [`RefreshOutcome::Failed`] holding the original credential.
    pub async fn refresh(&self, server_id: &str, stale: OAuth2Credential) -> RefreshOutcome {
        let Some(refresh_token) = stale.refresh_token.clone() else {
            return RefreshOutcome::Failed {
                reason: "no refresh token stored".to_string(),
                stale,
            };
        };

        tracing::info!(server_id, "Refreshing access token");
        let tokens = match self.tokens.refresh(&stale.endpoints, &refresh_token).await {
            Ok(tokens) => tokens,
            Err(e) => {
                return RefreshOutcome::Failed {
                    reason: e.to_string(),
                    stale,
                }
            }
        };

        let refreshed = OAuth2Credential {
            secret: tokens.access_token,
            refresh_token: tokens.refresh_token.or(Some(refresh_token)),
            token_expiry: expiry_after(tokens.expires_in, Utc::now()),
            endpoints: stale.endpoints.clone(),
        };

        let patch = ServerCredential::OAuth2(refreshed.clone());
        if let Err(e) = self.store.set_credentials(server_id, &patch) {
            return RefreshOutcome::Failed {
                reason: format!("refreshed token could not be stored: {e}"),
                stale,
            };
        }

        RefreshOutcome::Refreshed(refreshed)
    }
}
