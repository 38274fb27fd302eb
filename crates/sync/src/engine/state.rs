use serde::Serialize;

use crate::error::ErrorKind;

/// Ephemeral synchronization status, published alongside the cart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    /// A fetch or mutation is in progress.
    pub loading: bool,
    /// Retries performed by the current fetch.
    pub retry_attempt: u32,
    /// The most recent remote failure, cleared by the next success.
    pub last_error: Option<ErrorKind>,
    /// The service rejected the credential, or none was obtainable.
    /// Advisory: the cart stays usable from cache.
    pub auth_issue_detected: bool,
    /// Local changes the server has not confirmed yet.
    pub unconfirmed: bool,
    /// Whether any intent has run since start-up.
    pub settled: bool,
}

/// Coarse engine phase derived from [`SyncState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", content = "attempt", rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Loading(u32),
    Ready,
    AuthIssue,
}

impl SyncState {
    /// Current phase.
    #[must_use]
    pub const fn phase(&self) -> SyncPhase {
        if self.loading {
            SyncPhase::Loading(self.retry_attempt)
        } else if !self.settled {
            SyncPhase::Idle
        } else if self.auth_issue_detected {
            SyncPhase::AuthIssue
        } else {
            SyncPhase::Ready
        }
    }
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Loading(attempt) => write!(f, "loading (attempt {attempt})"),
            Self::Ready => f.write_str("ready"),
            Self::AuthIssue => f.write_str("auth_issue"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_derivation() {
        let mut state = SyncState::default();
        assert_eq!(state.phase(), SyncPhase::Idle);

        state.loading = true;
        state.retry_attempt = 2;
        assert_eq!(state.phase(), SyncPhase::Loading(2));

        state.loading = false;
        state.settled = true;
        assert_eq!(state.phase(), SyncPhase::Ready);

        state.auth_issue_detected = true;
        assert_eq!(state.phase(), SyncPhase::AuthIssue);
    }

    #[test]
    fn test_phase_serializes_with_attempt() {
        let json = serde_json::to_value(SyncPhase::Loading(1)).unwrap_or_default();
        assert_eq!(json, serde_json::json!({"phase": "loading", "attempt": 1}));
        let json = serde_json::to_value(SyncPhase::Ready).unwrap_or_default();
        assert_eq!(json, serde_json::json!({"phase": "ready"}));
    }
}
