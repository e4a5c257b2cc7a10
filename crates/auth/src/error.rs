/// Pulls a human-readable message out of an OAuth2 / REST error body.
pub(crate) fn extract_error_message(body: &str) -> String {
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(msg) = v["error_description"].as_str() {
            return msg.to_string();
        }
        if let Some(msg) = v["error"]["briefSummary"].as_str() {
            return msg.to_string();
        }
        if let Some(msg) = v["error"]["message"].as_str() {
            return msg.to_string();
        }
        if let Some(msg) = v["error"].as_str() {
            return msg.to_string();
        }
    }
    let trimmed = body.trim();
    if trimmed.chars().count() > 200 {
        let cut: String = trimmed.chars().take(200).collect();
        format!("{cut}...")
    } else {
        trimmed.to_string()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Could not open the login window: {0}. Allow popups or open the URL manually and retry.")]
    PopupBlocked(String),

    #[error("Login cancelled")]
    Cancelled,

    #[error("Authorization timed out after {0} seconds")]
    Timeout(u64),

    #[error("Security error: {0}")]
    Security(String),

    #[error("Provider returned {status}: {}", extract_error_message(body))]
    Provider { status: u16, body: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Not authenticated for server '{0}'")]
    Unauthorized(String),

    #[error("Server '{server_id}' uses {stored} authentication; recreate the credential to switch to {requested}")]
    AuthTypeMismatch {
        server_id: String,
        stored: String,
        requested: String,
    },

    #[error("Unknown server '{0}'")]
    ServerNotFound(String),

    #[error("Credential store error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Callback listener error: {0}")]
    Listener(#[from] std::io::Error),
}

impl AuthError {
    /// User closed the login window or aborted; not worth an error report.
    pub fn is_user_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub(crate) fn from_status(status: reqwest::StatusCode, body: String) -> Self {
        Self::Provider {
            status: status.as_u16(),
            body,
        }
    }
}
