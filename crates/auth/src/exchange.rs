use std::sync::Arc;

use crate::error::AuthError;
use crate::provider::{TokenClient, TokenSet};
use crate::session::{state_prefix, AuthorizationSessions, PendingAuthorization};

/// Tokens from a completed login, together with the session that produced them.
#[derive(Debug, Clone)]
pub struct ExchangedTokens {
    pub tokens: TokenSet,
    pub session: PendingAuthorization,
}

/// Redeems a delivered authorization code for tokens.
#[derive(Debug, Clone)]
pub struct TokenExchanger {
    sessions: Arc<AuthorizationSessions>,
    client: TokenClient,
}

impl TokenExchanger {
    pub fn new(sessions: Arc<AuthorizationSessions>, client: TokenClient) -> Self {
        Self { sessions, client }
    }

    pub async fn exchange(&self, code: &str, state: &str) -> Result<TokenSet, AuthError> {
        self.exchange_with_session(code, state)
            .await
            .map(|exchanged| exchanged.tokens)
    }

    /// The session is consumed before the network call, so a code can only be tried once.
    pub async fn exchange_with_session(
        &self,
        code: &str,
        state: &str,
    ) -> Result<ExchangedTokens, AuthError> {
        let Some(session) = self.sessions.take(state) else {
            tracing::warn!(state = state_prefix(state), "Token exchange for unknown state");
            return Err(AuthError::Security(
                "unknown or expired authorization session".to_string(),
            ));
        };

        tracing::info!(
            realm = %session.endpoints.realm,
            state = state_prefix(state),
            "Exchanging authorization code for tokens"
        );

        let tokens = self
            .client
            .exchange_code(
                &session.endpoints,
                code,
                &session.redirect_uri,
                &session.code_verifier,
            )
            .await?;

        Ok(ExchangedTokens { tokens, session })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderEndpoints;
    use crate::session::pending_for_test;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn unknown_state_makes_no_network_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let sessions = Arc::new(AuthorizationSessions::default());
        let exchanger = TokenExchanger::new(sessions, TokenClient::default());
        let err = exchanger.exchange("abc", "forged").await.unwrap_err();
        assert!(matches!(err, AuthError::Security(_)));
    }

    #[tokio::test]
    async fn exchange_sends_verifier_and_redirect() {
        let server = MockServer::start().await;
        let sessions = Arc::new(AuthorizationSessions::default());
        let pending = pending_for_test("st", ProviderEndpoints::new(server.uri(), "content", "desk"));
        let verifier = pending.code_verifier.clone();
        sessions.put(pending).unwrap();

        Mock::given(method("POST"))
            .and(path("/realms/content/protocol/openid-connect/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code=abc"))
            .and(body_string_contains(format!("code_verifier={verifier}")))
            .and(body_string_contains(
                "redirect_uri=http%3A%2F%2F127.0.0.1%3A4711%2Fauth%2Fcallback",
            ))
            .and(body_string_contains("client_id=desk"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "at",
                "refresh_token": "rt",
                "expires_in": 300,
                "token_type": "Bearer",
            })))
            .expect(1)
            .mount(&server)
            .await;

        let exchanger = TokenExchanger::new(Arc::clone(&sessions), TokenClient::default());
        let tokens = exchanger.exchange("abc", "st").await.unwrap();
        assert_eq!(tokens.access_token, "at");
        assert_eq!(tokens.refresh_token.as_deref(), Some("rt"));
        assert_eq!(tokens.expires_in, Some(300));
        assert!(sessions.is_empty());
    }

    #[tokio::test]
    async fn failed_exchange_still_consumes_session() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "invalid_grant",
                "error_description": "Code not valid",
            })))
            .expect(1)
            .mount(&server)
            .await;

        let sessions = Arc::new(AuthorizationSessions::default());
        sessions
            .put(pending_for_test("st", ProviderEndpoints::new(server.uri(), "r", "desk")))
            .unwrap();

        let exchanger = TokenExchanger::new(Arc::clone(&sessions), TokenClient::default());
        let err = exchanger.exchange("abc", "st").await.unwrap_err();
        assert!(err.to_string().contains("Code not valid"));

        let replay = exchanger.exchange("abc", "st").await.unwrap_err();
        assert!(matches!(replay, AuthError::Security(_)));
    }
}
