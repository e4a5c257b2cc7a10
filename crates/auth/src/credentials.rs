//! Per-server credentials. Basic and OAuth2 are separate variants, so an
//! OAuth2-only field can never sit on a basic credential.

use chrono::{DateTime, Utc};

use crate::error::AuthError;
use crate::provider::ProviderEndpoints;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthType {
    Basic,
    OAuth2,
}

impl AuthType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthType::Basic => "basic",
            AuthType::OAuth2 => "oauth2",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "basic" => Some(AuthType::Basic),
            "oauth2" => Some(AuthType::OAuth2),
            _ => None,
        }
    }
}

impl std::fmt::Display for AuthType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct BasicCredential {
    pub username: String,
    pub secret: String,
}

impl std::fmt::Debug for BasicCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicCredential")
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct OAuth2Credential {
    /// Current access token.
    pub secret: String,
    pub refresh_token: Option<String>,
    /// `None` means the expiry is unknown and the token is never refreshed proactively.
    pub token_expiry: Option<DateTime<Utc>>,
    pub endpoints: ProviderEndpoints,
}

impl std::fmt::Debug for OAuth2Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuth2Credential")
            .field("secret", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("token_expiry", &self.token_expiry)
            .field("endpoints", &self.endpoints)
            .finish()
    }
}

impl OAuth2Credential {
    /// True once `now` is inside `window` of the expiry.
    pub fn expires_within(&self, window: chrono::Duration, now: DateTime<Utc>) -> bool {
        match self.token_expiry {
            Some(expiry) => expiry
                .checked_sub_signed(window)
                .map_or(true, |refresh_at| now >= refresh_at),
            None => false,
        }
    }
}

/// Absolute expiry for a token response's `expires_in`, counted from `now`.
///
/// A lifetime too large to represent is treated as unknown.
pub(crate) fn expiry_after(expires_in: Option<u64>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let secs = i64::try_from(expires_in?).ok()?;
    now.checked_add_signed(chrono::Duration::try_seconds(secs)?)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerCredential {
    Basic(BasicCredential),
    OAuth2(OAuth2Credential),
}

impl ServerCredential {
    pub fn auth_type(&self) -> AuthType {
        match self {
            ServerCredential::Basic(_) => AuthType::Basic,
            ServerCredential::OAuth2(_) => AuthType::OAuth2,
        }
    }

    /// Whether every field the variant needs to authenticate is present.
    pub fn is_complete(&self) -> bool {
        match self {
            ServerCredential::Basic(b) => !b.username.is_empty() && !b.secret.is_empty(),
            ServerCredential::OAuth2(o) => {
                !o.secret.is_empty()
                    && !o.endpoints.provider_host.is_empty()
                    && !o.endpoints.realm.is_empty()
                    && !o.endpoints.client_id.is_empty()
            }
        }
    }
}

/// Input to `set_credentials`. Writes the whole record for its variant.
pub type CredentialPatch = ServerCredential;

impl ServerCredential {
    pub fn basic(username: impl Into<String>, secret: impl Into<String>) -> Self {
        ServerCredential::Basic(BasicCredential {
            username: username.into(),
            secret: secret.into(),
        })
    }

    pub fn oauth2(
        secret: impl Into<String>,
        refresh_token: Option<String>,
        token_expiry: Option<DateTime<Utc>>,
        endpoints: ProviderEndpoints,
    ) -> Self {
        ServerCredential::OAuth2(OAuth2Credential {
            secret: secret.into(),
            refresh_token,
            token_expiry,
            endpoints,
        })
    }

    pub(crate) fn validate(&self) -> Result<(), AuthError> {
        match self {
            ServerCredential::Basic(b) => {
                if b.username.trim().is_empty() {
                    return Err(AuthError::Validation("username is required".to_string()));
                }
                if b.secret.is_empty() {
                    return Err(AuthError::Validation("password is required".to_string()));
                }
            }
            ServerCredential::OAuth2(o) => {
                if o.secret.is_empty() {
                    return Err(AuthError::Validation("access token is required".to_string()));
                }
                if o.endpoints.provider_host.trim().is_empty()
                    || o.endpoints.realm.trim().is_empty()
                    || o.endpoints.client_id.trim().is_empty()
                {
                    return Err(AuthError::Validation(
                        "provider host, realm and client id are required".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints() -> ProviderEndpoints {
        ProviderEndpoints::new("http://sso", "r", "c")
    }

    #[test]
    fn expiry_window() {
        let now = Utc::now();
        let window = chrono::Duration::minutes(5);
        let soon = OAuth2Credential {
            secret: "at".into(),
            refresh_token: None,
            token_expiry: Some(now + chrono::Duration::minutes(2)),
            endpoints: endpoints(),
        };
        assert!(soon.expires_within(window, now));

        let later = OAuth2Credential {
            token_expiry: Some(now + chrono::Duration::hours(1)),
            ..soon.clone()
        };
        assert!(!later.expires_within(window, now));

        let unknown = OAuth2Credential {
            token_expiry: None,
            ..soon
        };
        assert!(!unknown.expires_within(window, now));
    }

    #[test]
    fn expiry_after_counts_from_now() {
        let now = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        assert_eq!(
            expiry_after(Some(300), now),
            Some(now + chrono::Duration::seconds(300))
        );
        assert_eq!(expiry_after(None, now), None);
    }

    #[test]
    fn unrepresentable_lifetime_is_unknown() {
        let now = Utc::now();
        assert_eq!(expiry_after(Some(10_000_000_000_000), now), None);
        assert_eq!(expiry_after(Some(u64::MAX), now), None);
        assert_eq!(expiry_after(Some(i64::MAX as u64 + 1), now), None);
    }

    #[test]
    fn validation_rules() {
        assert!(ServerCredential::basic("admin", "pw").validate().is_ok());
        assert!(ServerCredential::basic("", "pw").validate().is_err());
        assert!(ServerCredential::basic("admin", "").validate().is_err());
        assert!(ServerCredential::oauth2("at", None, None, endpoints()).validate().is_ok());
        assert!(ServerCredential::oauth2("", None, None, endpoints()).validate().is_err());
        assert!(ServerCredential::oauth2(
            "at",
            None,
            None,
            ProviderEndpoints::new("http://sso", "", "c")
        )
        .validate()
        .is_err());
    }

    #[test]
    fn auth_type_round_trips_through_text() {
        for t in [AuthType::Basic, AuthType::OAuth2] {
            assert_eq!(AuthType::parse(t.as_str()), Some(t));
        }
        assert_eq!(AuthType::parse("kerberos"), None);
    }

    #[test]
    fn debug_redacts_secrets() {
        let rendered = format!("{:?}", ServerCredential::basic("admin", "hunter2"));
        assert!(rendered.contains("admin"));
        assert!(!rendered.contains("hunter2"));
    }
}
