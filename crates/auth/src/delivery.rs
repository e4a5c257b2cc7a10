use std::sync::Mutex;

use tokio::time::Instant;

use crate::session::state_prefix;

/// An authorization code handed back by the provider redirect.
#[derive(Clone, PartialEq, Eq)]
pub struct DeliveredCode {
    pub code: String,
    pub state: String,
    pub received_at: Instant,
}

impl std::fmt::Debug for DeliveredCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveredCode")
            .field("code", &"<redacted>")
            .field("state", &state_prefix(&self.state))
            .field("received_at", &self.received_at)
            .finish()
    }
}

/// Single-slot buffer between the callback endpoint and the poller.
///
/// A delivery overwrites anything not yet polled; `poll` empties the slot.
#[derive(Debug, Default)]
pub struct CodeSlot {
    slot: Mutex<Option<DeliveredCode>>,
}

impl CodeSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deliver(&self, code: impl Into<String>, state: impl Into<String>) {
        let delivered = DeliveredCode {
            code: code.into(),
            state: state.into(),
            received_at: Instant::now(),
        };
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            tracing::warn!("Overwriting an authorization code that was never collected");
        }
        tracing::debug!(state = state_prefix(&delivered.state), "Authorization code staged");
        *slot = Some(delivered);
    }

    pub fn poll(&self) -> Option<DeliveredCode> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}
