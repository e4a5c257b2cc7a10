//! Authorization-server coordinates and the token endpoint client.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::AuthError;

pub const DEFAULT_SCOPE: &str = "openid profile email offline_access";

/// Where a realm's OAuth2 endpoints live; enough to refresh without asking the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderEndpoints {
    pub provider_host: String,
    pub realm: String,
    pub client_id: String,
}

impl ProviderEndpoints {
    pub fn new(
        provider_host: impl Into<String>,
        realm: impl Into<String>,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            provider_host: provider_host.into(),
            realm: realm.into(),
            client_id: client_id.into(),
        }
    }

    fn realm_url(&self, leaf: &str) -> Result<Url, AuthError> {
        let mut url = normalize_url(&self.provider_host)?;
        url.path_segments_mut()
            .map_err(|()| {
                AuthError::Validation(format!("'{}' cannot be a base URL", self.provider_host))
            })?
            .pop_if_empty()
            .extend(["realms", self.realm.as_str(), "protocol", "openid-connect", leaf]);
        Ok(url)
    }

    pub fn authorize_url(&self) -> Result<Url, AuthError> {
        self.realm_url("auth")
    }

    pub fn token_url(&self) -> Result<Url, AuthError> {
        self.realm_url("token")
    }
}

/// Prepends `http://` when the input has no scheme, then parses it.
pub fn normalize_url(input: &str) -> Result<Url, AuthError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(AuthError::Validation("URL is empty".to_string()));
    }
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    };
    let url = Url::parse(&with_scheme)
        .map_err(|e| AuthError::Validation(format!("'{trimmed}' is not a valid URL: {e}")))?;
    match url.scheme() {
        "http" | "https" if url.host_str().is_some() => Ok(url),
        _ => Err(AuthError::Validation(format!(
            "'{trimmed}' is not an http(s) URL"
        ))),
    }
}

/// Result of a successful token endpoint call.
#[derive(Clone, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Seconds until the access token expires.
    #[serde(default)]
    pub expires_in: Option<u64>,
}

impl std::fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSet")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// Token endpoint client shared by the code exchanger and the refresh path.
#[derive(Debug, Clone)]
pub struct TokenClient {
    http: reqwest::Client,
}

impl Default for TokenClient {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl TokenClient {
    pub fn new(timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { http }
    }

    pub fn with_http(http: reqwest::Client) -> Self {
        Self { http }
    }

    pub async fn exchange_code(
        &self,
        endpoints: &ProviderEndpoints,
        code: &str,
        redirect_uri: &str,
        code_verifier: &str,
    ) -> Result<TokenSet, AuthError> {
        self.post_form(
            endpoints,
            &[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", redirect_uri),
                ("client_id", endpoints.client_id.as_str()),
                ("code_verifier", code_verifier),
            ],
        )
        .await
    }

    pub async fn refresh(
        &self,
        endpoints: &ProviderEndpoints,
        refresh_token: &str,
    ) -> Result<TokenSet, AuthError> {
        self.post_form(
            endpoints,
            &[
                ("grant_type", "refresh_token"),
                ("client_id", endpoints.client_id.as_str()),
                ("refresh_token", refresh_token),
            ],
        )
        .await
    }

    async fn post_form(
        &self,
        endpoints: &ProviderEndpoints,
        form: &[(&str, &str)],
    ) -> Result<TokenSet, AuthError> {
        let token_url = endpoints.token_url()?;
        let resp = self.http.post(token_url).form(form).send().await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AuthError::from_status(status, body));
        }

        Ok(resp.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn normalize_prepends_scheme() {
        let url = normalize_url("auth.example.com:8080").unwrap();
        assert_eq!(url.as_str(), "http://auth.example.com:8080/");
        let url = normalize_url("https://auth.example.com").unwrap();
        assert_eq!(url.scheme(), "https");
    }

    #[test]
    fn normalize_rejects_garbage() {
        assert!(matches!(normalize_url(""), Err(AuthError::Validation(_))));
        assert!(matches!(normalize_url("http://"), Err(AuthError::Validation(_))));
        assert!(matches!(
            normalize_url("ftp://files.example.com"),
            Err(AuthError::Validation(_))
        ));
    }

    #[test]
    fn realm_endpoints() {
        let ep = ProviderEndpoints::new("https://sso.example.com/", "content", "desk");
        assert_eq!(
            ep.authorize_url().unwrap().as_str(),
            "https://sso.example.com/realms/content/protocol/openid-connect/auth"
        );
        assert_eq!(
            ep.token_url().unwrap().as_str(),
            "https://sso.example.com/realms/content/protocol/openid-connect/token"
        );
    }

    #[test]
    fn provider_host_with_context_path() {
        let ep = ProviderEndpoints::new("sso.example.com/auth", "content", "desk");
        assert_eq!(
            ep.token_url().unwrap().as_str(),
            "http://sso.example.com/auth/realms/content/protocol/openid-connect/token"
        );
    }

    #[test]
    fn realm_is_percent_encoded_as_a_path_segment() {
        let ep = ProviderEndpoints::new("https://sso.example.com", "my realm+x/y", "desk");
        assert_eq!(
            ep.token_url().unwrap().path(),
            "/realms/my%20realm+x%2Fy/protocol/openid-connect/token"
        );
    }

    #[tokio::test]
    async fn refresh_posts_refresh_grant() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/realms/r/protocol/openid-connect/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=rt-1"))
            .and(body_string_contains("client_id=desk"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "at-2",
                "expires_in": 300,
            })))
            .expect(1)
            .mount(&server)
            .await;

        let ep = ProviderEndpoints::new(server.uri(), "r", "desk");
        let tokens = TokenClient::default().refresh(&ep, "rt-1").await.unwrap();
        assert_eq!(tokens.access_token, "at-2");
        assert_eq!(tokens.expires_in, Some(300));
        assert!(tokens.refresh_token.is_none());
    }

    #[tokio::test]
    async fn provider_error_body_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "invalid_grant",
                "error_description": "Token is not active",
            })))
            .mount(&server)
            .await;

        let ep = ProviderEndpoints::new(server.uri(), "r", "desk");
        let err = TokenClient::default().refresh(&ep, "rt").await.unwrap_err();
        match err {
            AuthError::Provider { status, .. } => assert_eq!(status, 400),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn token_set_debug_redacts() {
        let tokens = TokenSet {
            access_token: "secret-at".into(),
            refresh_token: Some("secret-rt".into()),
            expires_in: Some(60),
        };
        let rendered = format!("{tokens:?}");
        assert!(!rendered.contains("secret-at"));
        assert!(!rendered.contains("secret-rt"));
    }
}
