//! Password check used when a server is registered.

use std::time::Duration;

use reqwest::StatusCode;
use serde::Serialize;

use crate::client::{CurrentUser, Entry, PEOPLE_ME_PATH};
use crate::error::extract_error_message;
use crate::provider::normalize_url;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub valid: bool,
    pub is_admin: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ValidationReport {
    fn ok(is_admin: bool) -> Self {
        Self {
            valid: true,
            is_admin,
            error: None,
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            valid: false,
            is_admin: false,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CredentialValidator {
    http: reqwest::Client,
}

impl Default for CredentialValidator {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl CredentialValidator {
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

    /// Never fails: every problem is reported through [`ValidationReport::error`].
    pub async fn validate(&self, base_url: &str, username: &str, password: &str) -> ValidationReport {
        if username.trim().is_empty() {
            return ValidationReport::failed("username is required");
        }
        let base = match normalize_url(base_url) {
            Ok(url) => url,
            Err(e) => return ValidationReport::failed(e.to_string()),
        };
        let url = format!("{}{PEOPLE_ME_PATH}", base.as_str().trim_end_matches('/'));

        let resp = match self
            .http
            .get(&url)
            .basic_auth(username, Some(password))
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                tracing::debug!(error = %e, "Credential validation request failed");
                return ValidationReport::failed(format!("could not reach server: {e}"));
            }
        };

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return ValidationReport::failed("invalid username or password");
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return ValidationReport::failed(format!(
                "server returned {}: {}",
                status.as_u16(),
                extract_error_message(&body)
            ));
        }

        match resp.json::<Entry<CurrentUser>>().await {
            Ok(entry) => {
                tracing::info!(user = %entry.entry.id, is_admin = entry.entry.capabilities.is_admin, "Credentials validated");
                ValidationReport::ok(entry.entry.capabilities.is_admin)
            }
            Err(e) => ValidationReport::failed(format!("unexpected response from server: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    // base64("admin:admin")
    const ADMIN_BASIC: &str = "Basic YWRtaW46YWRtaW4=";

    #[tokio::test]
    async fn admin_user_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(PEOPLE_ME_PATH))
            .and(header("authorization", ADMIN_BASIC))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "entry": {
                    "id": "admin",
                    "displayName": "Administrator",
                    "capabilities": { "isAdmin": true, "isGuest": false }
                }
            })))
            .mount(&server)
            .await;

        let report = CredentialValidator::default()
            .validate(&server.uri(), "admin", "admin")
            .await;
        assert_eq!(report, ValidationReport::ok(true));
    }

    #[tokio::test]
    async fn regular_user_is_valid_but_not_admin() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(PEOPLE_ME_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "entry": { "id": "jdoe" }
            })))
            .mount(&server)
            .await;

        let report = CredentialValidator::default()
            .validate(&server.uri(), "jdoe", "pw")
            .await;
        assert!(report.valid);
        assert!(!report.is_admin);
    }

    #[tokio::test]
    async fn wrong_password_is_not_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let report = CredentialValidator::default()
            .validate(&server.uri(), "admin", "nope")
            .await;
        assert!(!report.valid);
        assert_eq!(report.error.as_deref(), Some("invalid username or password"));
    }

    #[tokio::test]
    async fn server_error_collapses_to_report() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let report = CredentialValidator::default()
            .validate(&server.uri(), "admin", "admin")
            .await;
        assert!(!report.valid);
        assert!(report.error.unwrap().contains("500"));
    }

    #[tokio::test]
    async fn unreachable_or_malformed_input_collapses_to_report() {
        let report = CredentialValidator::default()
            .validate("http://", "admin", "admin")
            .await;
        assert!(!report.valid);

        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let report = CredentialValidator::new(Duration::from_secs(2))
            .validate(&format!("127.0.0.1:{port}"), "admin", "admin")
            .await;
        assert!(!report.valid);
        assert!(report.error.is_some());
    }
}
