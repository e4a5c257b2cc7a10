//! Interactive authorization-code + PKCE login.
//!
//! [`AuthorizationFlow::begin`] validates input, opens the surface, records a
//! [`PendingAuthorization`] and points the surface at the provider.
//! [`LoginAttempt::wait`] then polls the [`CodeSlot`] until the redirect
//! lands, the user gives up, or the ceiling is hit.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::delivery::{CodeSlot, DeliveredCode};
use crate::error::AuthError;
use crate::pkce::{self, CHALLENGE_METHOD};
use crate::provider::{normalize_url, ProviderEndpoints, DEFAULT_SCOPE};
use crate::session::{state_prefix, AuthorizationSessions, PendingAuthorization};
use crate::surface::InteractiveSurface;

pub const POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const MAX_POLL_ATTEMPTS: u32 = 300;
pub const CLOSE_GRACE_PERIOD: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct FlowTiming {
    pub poll_interval: Duration,
    pub max_poll_attempts: u32,
    /// How long a closed surface is tolerated before the login counts as cancelled.
    pub close_grace: Duration,
}

impl Default for FlowTiming {
    fn default() -> Self {
        Self {
            poll_interval: POLL_INTERVAL,
            max_poll_attempts: MAX_POLL_ATTEMPTS,
            close_grace: CLOSE_GRACE_PERIOD,
        }
    }
}

impl FlowTiming {
    fn ceiling_secs(&self) -> u64 {
        self.poll_interval.as_secs() * u64::from(self.max_poll_attempts)
    }
}

#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub provider_host: String,
    pub realm: String,
    pub client_id: String,
    pub remote_base_url: String,
}

impl LoginRequest {
    /// Normalized endpoints and remote base URL, or a validation error.
    fn validate(&self) -> Result<(ProviderEndpoints, String), AuthError> {
        if self.realm.trim().is_empty() {
            return Err(AuthError::Validation("realm is required".to_string()));
        }
        if self.client_id.trim().is_empty() {
            return Err(AuthError::Validation("client id is required".to_string()));
        }
        let provider = normalize_url(&self.provider_host)?;
        let remote = normalize_url(&self.remote_base_url)?;
        let endpoints = ProviderEndpoints::new(
            provider.as_str().trim_end_matches('/'),
            self.realm.trim(),
            self.client_id.trim(),
        );
        Ok((endpoints, remote.as_str().trim_end_matches('/').to_string()))
    }
}

pub fn build_authorize_url(
    endpoints: &ProviderEndpoints,
    redirect_uri: &str,
    scope: &str,
    challenge: &str,
    state: &str,
) -> Result<Url, AuthError> {
    let mut url = endpoints.authorize_url()?;
    url.query_pairs_mut()
        .append_pair("client_id", &endpoints.client_id)
        .append_pair("redirect_uri", redirect_uri)
        .append_pair("response_type", "code")
        .append_pair("scope", scope)
        .append_pair("code_challenge", challenge)
        .append_pair("code_challenge_method", CHALLENGE_METHOD)
        .append_pair("state", state);
    Ok(url)
}

pub struct AuthorizationFlow {
    sessions: Arc<AuthorizationSessions>,
    slot: Arc<CodeSlot>,
    redirect_uri: String,
    scope: String,
    timing: FlowTiming,
}

impl AuthorizationFlow {
    pub fn new(
        sessions: Arc<AuthorizationSessions>,
        slot: Arc<CodeSlot>,
        redirect_uri: impl Into<String>,
    ) -> Self {
        Self {
            sessions,
            slot,
            redirect_uri: redirect_uri.into(),
            scope: DEFAULT_SCOPE.to_string(),
            timing: FlowTiming::default(),
        }
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    pub fn with_timing(mut self, timing: FlowTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn redirect_uri(&self) -> &str {
        &self.redirect_uri
    }

    pub fn begin(
        &self,
        request: &LoginRequest,
        mut surface: Box<dyn InteractiveSurface>,
    ) -> Result<LoginAttempt, AuthError> {
        let (endpoints, remote_base_url) = request.validate()?;

        surface.open()?;

        let pkce = pkce::generate_challenge_pair();
        let state = pkce::generate_state();
        let authorize_url = match build_authorize_url(
            &endpoints,
            &self.redirect_uri,
            &self.scope,
            &pkce.challenge,
            &state,
        ) {
            Ok(url) => url,
            Err(e) => {
                surface.close();
                return Err(e);
            }
        };

        let pending = PendingAuthorization {
            state: state.clone(),
            code_verifier: pkce.verifier,
            endpoints: endpoints.clone(),
            redirect_uri: self.redirect_uri.clone(),
            remote_base_url: remote_base_url.clone(),
            created_at: Instant::now(),
        };
        if let Err(e) = self.sessions.put(pending) {
            surface.close();
            return Err(e);
        }

        if let Err(e) = surface.navigate(&authorize_url) {
            self.sessions.release(&state);
            surface.close();
            return Err(e);
        }

        tracing::info!(
            realm = %endpoints.realm,
            state = state_prefix(&state),
            "Authorization started"
        );

        Ok(LoginAttempt {
            state,
            authorize_url,
            endpoints,
            remote_base_url,
            surface,
            sessions: Arc::clone(&self.sessions),
            slot: Arc::clone(&self.slot),
            timing: self.timing.clone(),
        })
    }
}

/// One in-flight login, waiting for its code.
pub struct LoginAttempt {
    state: String,
    authorize_url: Url,
    endpoints: ProviderEndpoints,
    remote_base_url: String,
    surface: Box<dyn InteractiveSurface>,
    sessions: Arc<AuthorizationSessions>,
    slot: Arc<CodeSlot>,
    timing: FlowTiming,
}

impl std::fmt::Debug for LoginAttempt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginAttempt")
            .field("state", &state_prefix(&self.state))
            .field("endpoints", &self.endpoints)
            .field("remote_base_url", &self.remote_base_url)
            .finish_non_exhaustive()
    }
}

impl LoginAttempt {
    pub fn state(&self) -> &str {
        &self.state
    }

    pub fn authorize_url(&self) -> &Url {
        &self.authorize_url
    }

    pub fn endpoints(&self) -> &ProviderEndpoints {
        &self.endpoints
    }

    pub fn remote_base_url(&self) -> &str {
        &self.remote_base_url
    }

    /// Polls until a code for this attempt arrives.
    ///
    /// On any error the pending authorization is released; on success it is
    /// left for the token exchanger.
    pub async fn wait(mut self, cancel: &CancellationToken) -> Result<DeliveredCode, AuthError> {
        let outcome = self.poll_loop(cancel).await;
        self.surface.close();
        if let Err(e) = &outcome {
            self.sessions.release(&self.state);
            if e.is_user_cancelled() {
                tracing::info!(state = state_prefix(&self.state), "Login cancelled");
            } else {
                tracing::warn!(state = state_prefix(&self.state), error = %e, "Login failed");
            }
        }
        outcome
    }

    async fn poll_loop(&mut self, cancel: &CancellationToken) -> Result<DeliveredCode, AuthError> {
        let mut ticker = tokio::time::interval(self.timing.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut closed_since: Option<Instant> = None;
        let mut polls: u32 = 0;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AuthError::Cancelled),
                _ = ticker.tick() => {}
            }

            if let Some(delivered) = self.slot.poll() {
                if delivered.state != self.state {
                    return Err(AuthError::Security(
                        "authorization state mismatch, possible forged redirect".to_string(),
                    ));
                }
                tracing::debug!(polls, "Authorization code collected");
                return Ok(delivered);
            }

            if self.surface.is_closed() {
                let since = *closed_since.get_or_insert_with(Instant::now);
                if since.elapsed() >= self.timing.close_grace {
                    return Err(AuthError::Cancelled);
                }
            } else {
                closed_since = None;
            }

            if polls >= self.timing.max_poll_attempts {
                return Err(AuthError::Timeout(self.timing.ceiling_secs()));
            }
            polls += 1;
        }
    }
}
