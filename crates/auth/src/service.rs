//! Process-wide owner of the login state.
//!
//! One [`AuthService`] is built at startup and shared. It owns the pending
//! session map, the code slot and the callback listener, and exposes the
//! operations the front end calls.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cmsdesk_config::AuthSettings;
use tokio_util::sync::CancellationToken;

use crate::callback::CallbackServer;
use crate::client::{AuthenticatedClient, ClientFactory};
use crate::credentials::{expiry_after, OAuth2Credential, ServerCredential};
use crate::delivery::{CodeSlot, DeliveredCode};
use crate::error::AuthError;
use crate::exchange::TokenExchanger;
use crate::flow::{AuthorizationFlow, FlowTiming, LoginAttempt, LoginRequest};
use crate::provider::{normalize_url, TokenClient, TokenSet};
use crate::session::AuthorizationSessions;
use crate::store::{CredentialStore, SqliteCredentialStore};
use crate::surface::InteractiveSurface;
use crate::validate::{CredentialValidator, ValidationReport};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub struct AuthService {
    sessions: Arc<AuthorizationSessions>,
    slot: Arc<CodeSlot>,
    callback: CallbackServer,
    flow: AuthorizationFlow,
    exchanger: TokenExchanger,
    store: Arc<SqliteCredentialStore>,
    clients: ClientFactory,
    validator: CredentialValidator,
    shutdown: CancellationToken,
}

impl AuthService {
    /// Binds the callback listener and starts the stale-session sweeper.
    pub async fn start(
        settings: &AuthSettings,
        store: Arc<SqliteCredentialStore>,
    ) -> Result<Self, AuthError> {
        let session_ttl = Duration::from_secs(settings.session_ttl_secs);
        let http_timeout = Duration::from_secs(settings.http_timeout_secs);

        let sessions = Arc::new(AuthorizationSessions::new(session_ttl));
        let slot = Arc::new(CodeSlot::new());
        let callback =
            CallbackServer::bind(&settings.callback_host, settings.callback_port, Arc::clone(&slot))
                .await?;

        let timing = FlowTiming {
            poll_interval: Duration::from_secs(settings.poll_interval_secs.max(1)),
            max_poll_attempts: settings.max_poll_attempts,
            close_grace: Duration::from_secs(settings.close_grace_secs),
        };
        let flow = AuthorizationFlow::new(
            Arc::clone(&sessions),
            Arc::clone(&slot),
            callback.redirect_uri(),
        )
        .with_scope(settings.scope.clone())
        .with_timing(timing);

        let http = reqwest::Client::builder()
            .timeout(http_timeout)
            .build()
            .unwrap_or_default();
        let tokens = TokenClient::with_http(http.clone());
        let exchanger = TokenExchanger::new(Arc::clone(&sessions), tokens.clone());
        let clients = ClientFactory::new(store.clone(), tokens, http.clone())
            .with_refresh_window(Duration::from_secs(settings.refresh_window_secs));
        let validator = CredentialValidator::with_http(http);

        let shutdown = CancellationToken::new();
        tokio::spawn(sweep_sessions(
            Arc::clone(&sessions),
            session_ttl,
            shutdown.clone(),
        ));

        Ok(Self {
            sessions,
            slot,
            callback,
            flow,
            exchanger,
            store,
            clients,
            validator,
            shutdown,
        })
    }

    pub fn redirect_uri(&self) -> String {
        self.callback.redirect_uri()
    }

    pub fn store(&self) -> &SqliteCredentialStore {
        &self.store
    }

    pub fn pending_logins(&self) -> usize {
        self.sessions.len()
    }

    pub fn begin_login(
        &self,
        request: &LoginRequest,
        surface: Box<dyn InteractiveSurface>,
    ) -> Result<LoginAttempt, AuthError> {
        self.flow.begin(request, surface)
    }

    /// Poll RPC: the staged `(code, state)`, at most once.
    pub fn poll(&self) -> Option<DeliveredCode> {
        self.slot.poll()
    }

    pub async fn exchange(&self, code: &str, state: &str) -> Result<TokenSet, AuthError> {
        self.exchanger.exchange(code, state).await
    }

    /// Full interactive login for `server_id`: authorize, exchange, persist.
    ///
    /// An existing credential of either type is replaced.
    pub async fn login(
        &self,
        server_id: &str,
        request: &LoginRequest,
        surface: Box<dyn InteractiveSurface>,
        cancel: &CancellationToken,
    ) -> Result<OAuth2Credential, AuthError> {
        let attempt = self.begin_login(request, surface)?;
        let delivered = attempt.wait(cancel).await?;
        let exchanged = self
            .exchanger
            .exchange_with_session(&delivered.code, &delivered.state)
            .await?;

        let credential = OAuth2Credential {
            secret: exchanged.tokens.access_token,
            refresh_token: exchanged.tokens.refresh_token,
            token_expiry: expiry_after(exchanged.tokens.expires_in, Utc::now()),
            endpoints: exchanged.session.endpoints,
        };

        self.store
            .register_server(server_id, &exchanged.session.remote_base_url)?;
        self.store
            .replace_credentials(server_id, &ServerCredential::OAuth2(credential.clone()))?;

        tracing::info!(server_id, "OAuth2 login complete");
        Ok(credential)
    }

    /// Validate RPC. Never fails.
    pub async fn validate(&self, base_url: &str, username: &str, password: &str) -> ValidationReport {
        self.validator.validate(base_url, username, password).await
    }

    /// Checks password credentials and stores them if the server accepts them.
    pub async fn register_basic(
        &self,
        server_id: &str,
        base_url: &str,
        username: &str,
        password: &str,
    ) -> Result<ValidationReport, AuthError> {
        let base = normalize_url(base_url)?;
        let base = base.as_str().trim_end_matches('/');
        let report = self.validate(base, username, password).await;
        if !report.valid {
            return Ok(report);
        }

        self.store.register_server(server_id, base)?;
        self.store
            .replace_credentials(server_id, &ServerCredential::basic(username, password))?;
        tracing::info!(server_id, is_admin = report.is_admin, "Registered server with password credentials");
        Ok(report)
    }

    /// Authenticated handle for a registered server.
    pub async fn authenticate(&self, server_id: &str) -> Result<AuthenticatedClient, AuthError> {
        let server = self
            .store
            .get_server(server_id)?
            .ok_or_else(|| AuthError::ServerNotFound(server_id.to_string()))?;
        self.clients.authenticate(server_id, &server.base_url).await
    }

    pub fn logout(&self, server_id: &str) -> Result<bool, AuthError> {
        let removed = self.store.delete_credentials(server_id)?;
        if removed {
            tracing::info!(server_id, "Credentials removed");
        }
        Ok(removed)
    }

    pub fn remove_server(&self, server_id: &str) -> Result<bool, AuthError> {
        self.store.remove_server(server_id)
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.callback.shutdown();
    }
}

impl Drop for AuthService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn sweep_sessions(
    sessions: Arc<AuthorizationSessions>,
    ttl: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                sessions.expire_older_than(ttl);
            }
        }
    }
}
