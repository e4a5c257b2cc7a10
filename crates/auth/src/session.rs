//! Pending authorizations keyed by their `state` token.
//!
//! An entry lives from the moment a login starts until the token exchanger
//! takes it, or until it is older than the TTL. `take` is destructive, so a
//! `state` can never be redeemed twice.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

use crate::error::AuthError;
use crate::provider::ProviderEndpoints;

pub const SESSION_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Clone)]
pub struct PendingAuthorization {
    pub state: String,
    pub code_verifier: String,
    pub endpoints: ProviderEndpoints,
    pub redirect_uri: String,
    pub remote_base_url: String,
    pub created_at: Instant,
}

impl std::fmt::Debug for PendingAuthorization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingAuthorization")
            .field("state", &state_prefix(&self.state))
            .field("endpoints", &self.endpoints)
            .field("redirect_uri", &self.redirect_uri)
            .field("remote_base_url", &self.remote_base_url)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// First few characters of a state token, safe for logs.
pub(crate) fn state_prefix(state: &str) -> &str {
    match state.char_indices().nth(8) {
        Some((idx, _)) => &state[..idx],
        None => state,
    }
}

#[derive(Debug)]
pub struct AuthorizationSessions {
    entries: Mutex<HashMap<String, PendingAuthorization>>,
    ttl: Duration,
}

impl Default for AuthorizationSessions {
    fn default() -> Self {
        Self::new(SESSION_TTL)
    }
}

impl AuthorizationSessions {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingAuthorization>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn sweep(entries: &mut HashMap<String, PendingAuthorization>, max_age: Duration) -> usize {
        let before = entries.len();
        entries.retain(|_, p| p.created_at.elapsed() < max_age);
        before - entries.len()
    }

    /// Stores a pending authorization. A `state` that is still live is never overwritten.
    pub fn put(&self, pending: PendingAuthorization) -> Result<(), AuthError> {
        let mut entries = self.lock();
        Self::sweep(&mut entries, self.ttl);
        if entries.contains_key(&pending.state) {
            return Err(AuthError::Security(
                "authorization state already in use".to_string(),
            ));
        }
        tracing::debug!(state = state_prefix(&pending.state), "Stored pending authorization");
        entries.insert(pending.state.clone(), pending);
        Ok(())
    }

    pub fn take(&self, state: &str) -> Option<PendingAuthorization> {
        let mut entries = self.lock();
        let pending = entries.remove(state);
        Self::sweep(&mut entries, self.ttl);
        pending.filter(|p| p.created_at.elapsed() < self.ttl)
    }

    /// Drops a pending authorization without using it (cancelled or failed login).
    pub fn release(&self, state: &str) {
        if self.lock().remove(state).is_some() {
            tracing::debug!(state = state_prefix(state), "Released pending authorization");
        }
    }

    pub fn expire_older_than(&self, max_age: Duration) -> usize {
        let removed = Self::sweep(&mut self.lock(), max_age);
        if removed > 0 {
            tracing::debug!(removed, "Expired pending authorizations");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
pub(crate) fn pending_for_test(state: &str, endpoints: ProviderEndpoints) -> PendingAuthorization {
    PendingAuthorization {
        state: state.to_string(),
        code_verifier: crate::pkce::generate_challenge_pair().verifier,
        endpoints,
        redirect_uri: "http://127.0.0.1:4711/auth/callback".to_string(),
        remote_base_url: "http://cms.example.com".to_string(),
        created_at: Instant::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints() -> ProviderEndpoints {
        ProviderEndpoints::new("http://sso.example.com", "content", "desk")
    }

    #[test]
    fn take_is_single_use() {
        let sessions = AuthorizationSessions::default();
        sessions.put(pending_for_test("s1", endpoints())).unwrap();

        let first = sessions.take("s1").unwrap();
        assert_eq!(first.state, "s1");
        assert!(sessions.take("s1").is_none());
        assert!(sessions.is_empty());
    }

    #[test]
    fn live_state_is_not_overwritten() {
        let sessions = AuthorizationSessions::default();
        sessions.put(pending_for_test("dup", endpoints())).unwrap();
        let err = sessions.put(pending_for_test("dup", endpoints())).unwrap_err();
        assert!(matches!(err, AuthError::Security(_)));
        assert_eq!(sessions.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_unreachable() {
        let sessions = AuthorizationSessions::default();
        sessions.put(pending_for_test("old", endpoints())).unwrap();

        tokio::time::advance(SESSION_TTL + Duration::from_secs(1)).await;
        assert!(sessions.take("old").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_happens_without_access_to_the_entry() {
        let sessions = AuthorizationSessions::default();
        sessions.put(pending_for_test("old", endpoints())).unwrap();
        tokio::time::advance(Duration::from_secs(200)).await;
        sessions.put(pending_for_test("young", endpoints())).unwrap();

        tokio::time::advance(Duration::from_secs(101)).await;
        assert_eq!(sessions.expire_older_than(SESSION_TTL), 1);
        assert!(sessions.take("young").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn put_sweeps_stale_entries() {
        let sessions = AuthorizationSessions::default();
        sessions.put(pending_for_test("a", endpoints())).unwrap();
        tokio::time::advance(SESSION_TTL).await;
        sessions.put(pending_for_test("b", endpoints())).unwrap();
        assert_eq!(sessions.len(), 1);
    }

    #[test]
    fn release_drops_entry() {
        let sessions = AuthorizationSessions::default();
        sessions.put(pending_for_test("gone", endpoints())).unwrap();
        sessions.release("gone");
        assert!(sessions.take("gone").is_none());
    }

    #[test]
    fn state_prefix_is_short() {
        assert_eq!(state_prefix("abcdefghijkl"), "abcdefgh");
        assert_eq!(state_prefix("abc"), "abc");
    }
}
