//! Credential lifecycle coordination.
//!
//! # Architecture
//!
//! - [`CredentialStore`] persists the raw token and the logout opt-out flag
//! - [`TokenSource`] issues fresh tokens (HTTP refresh in production)
//! - [`CredentialCoordinator`] owns both and is the only component that reads
//!   or writes the credential
//!
//! # Guarantees
//!
//! - At most one acquisition is in flight at a time. Concurrent callers of
//!   [`CredentialCoordinator::ensure`] join the pending acquisition instead of
//!   starting their own, and the slot is freed once it settles.
//! - Malformed or expired tokens are cleared on sight and read as "absent".
//! - Acquisition failures resolve to `None`; nothing here returns an error.
//! - After an explicit logout nothing re-acquires a credential until
//!   [`CredentialCoordinator::login`] clears the opt-out flag.
//!
//! # Example
//!
//! ```rust,ignore
//! let coordinator = CredentialCoordinator::new(
//!     CredentialStore::new(storage.clone()),
//!     Arc::new(HttpTokenSource::new(client, token_url, AuthScheme::Bearer)),
//!     CoordinatorSettings::default(),
//! );
//!
//! // Fast path: synchronous, no I/O beyond the local store
//! if let Some(token) = coordinator.peek() { /* ... */ }
//!
//! // Slow path: refreshes if needed, coalescing concurrent callers
//! let token = coordinator.ensure().await;
//! ```

mod source;
mod store;

pub use source::{AcquireError, HttpTokenSource, NoTokenSource, TokenSource};
pub use store::CredentialStore;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use cartsync_core::{BearerToken, TokenError};
use chrono::Utc;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::config::SyncConfig;
use crate::storage::StorageError;

type PendingAcquisition = Shared<BoxFuture<'static, Option<BearerToken>>>;

/// Why a credential could not be stored.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// The credential is not a usable bearer token.
    #[error("Invalid credential: {0}")]
    Invalid(#[from] TokenError),

    /// The credential could not be written to durable storage.
    #[error("Failed to persist credential: {0}")]
    Unpersisted(#[from] StorageError),
}

/// Expiry handling for stored credentials.
#[derive(Debug, Clone, Copy)]
pub struct CoordinatorSettings {
    /// Discard tokens whose `exp` has passed. Disabled in development.
    pub enforce_expiry: bool,
    /// Tokens expiring within this window count as expired.
    pub expiry_leeway: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            enforce_expiry: true,
            expiry_leeway: Duration::from_secs(60),
        }
    }
}

impl From<&SyncConfig> for CoordinatorSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            enforce_expiry: config.environment.enforces_expiry(),
            expiry_leeway: config.expiry_leeway,
        }
    }
}

/// Single owner of the bearer credential.
///
/// Cheaply cloneable; clones share the same store, source and in-flight slot.
#[derive(Clone)]
pub struct CredentialCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    store: CredentialStore,
    source: Arc<dyn TokenSource>,
    settings: CoordinatorSettings,
    /// `true` while a usable credential is stored
    ready: watch::Sender<bool>,
    /// The acquisition currently in flight, if any
    pending: Mutex<Option<PendingAcquisition>>,
    /// Last credential the server rejected, presented on the next refresh
    rejected: Mutex<Option<String>>,
    acquisitions: AtomicU64,
}

impl CredentialCoordinator {
    /// Create a coordinator.
    #[must_use]
    pub fn new(
        store: CredentialStore,
        source: Arc<dyn TokenSource>,
        settings: CoordinatorSettings,
    ) -> Self {
        let (ready, _) = watch::channel(false);
        let coordinator = Self {
            inner: Arc::new(CoordinatorInner {
                store,
                source,
                settings,
                ready,
                pending: Mutex::new(None),
                rejected: Mutex::new(None),
                acquisitions: AtomicU64::new(0),
            }),
        };
        let has_token = coordinator.peek().is_some();
        coordinator.inner.ready.send_replace(has_token);
        coordinator
    }

    /// Return the stored credential if it is usable right now.
    ///
    /// Never touches the network. Clears the store when the stored value is
    /// malformed or expired. Always `None` after an explicit logout.
    #[must_use]
    pub fn peek(&self) -> Option<BearerToken> {
        if self.inner.store.opted_out() {
            return None;
        }

        let raw = self.inner.store.get()?;
        match BearerToken::parse(&raw) {
            Err(e) => {
                warn!(error = %e, "Discarding malformed credential");
                self.invalidate();
                None
            }
            Ok(token) if self.is_expired(&token) => {
                info!(expires_at = ?token.expires_at(), "Discarding expired credential");
                self.invalidate();
                None
            }
            Ok(token) => Some(token),
        }
    }

    /// Return a usable credential, acquiring one if needed.
    ///
    /// Concurrent callers share one acquisition. Resolves to `None` when the
    /// user has logged out or acquisition fails.
    pub async fn ensure(&self) -> Option<BearerToken> {
        // Read before peek: peek clears an expired token that a refresh needs
        let previous = self
            .inner
            .store
            .get()
            .or_else(|| self.rejected_slot().clone())
            .filter(|raw| BearerToken::parse(raw).is_ok());

        if let Some(token) = self.peek() {
            return Some(token);
        }

        let pending = {
            let mut slot = self.pending_slot();
            if let Some(pending) = slot.as_ref() {
                debug!("Joining in-flight credential acquisition");
                pending.clone()
            } else {
                let this = self.clone();
                let pending = async move { this.acquire(previous).await }
                    .boxed()
                    .shared();
                *slot = Some(pending.clone());
                pending
            }
        };

        pending.await
    }

    /// [`ensure`](Self::ensure) bounded by `timeout`.
    pub async fn ensure_within(&self, timeout: Duration) -> Option<BearerToken> {
        if let Ok(token) = tokio::time::timeout(timeout, self.ensure()).await {
            token
        } else {
            warn!(timeout_ms = timeout.as_millis(), "Timed out waiting for credential");
            None
        }
    }

    /// Validate and persist a credential, then signal readiness.
    ///
    /// # Errors
    ///
    /// Returns `CredentialError::Invalid` if the credential is empty or
    /// structurally invalid, and `CredentialError::Unpersisted` if it could
    /// not be written. Readiness is not signalled in either case.
    pub fn store(&self, raw: &str) -> Result<BearerToken, CredentialError> {
        let token = BearerToken::parse(raw)?;
        if let Err(e) = self.inner.store.set(token.expose()) {
            warn!(error = %e, "Failed to persist credential");
            return Err(e.into());
        }
        *self.rejected_slot() = None;
        self.inner.ready.send_replace(true);
        debug!(subject = ?token.subject(), "Stored credential");
        Ok(token)
    }

    /// Explicit re-login: lifts the logout opt-out and stores the credential.
    ///
    /// # Errors
    ///
    /// Returns `CredentialError` if the credential is invalid or could not be
    /// persisted.
    pub fn login(&self, raw: &str) -> Result<BearerToken, CredentialError> {
        let token = BearerToken::parse(raw)?;
        self.inner.store.set_opted_out(false);
        self.store(token.expose())
    }

    /// Remove the stored credential.
    ///
    /// With `is_logout`, also sets the persistent opt-out flag so nothing
    /// re-acquires a credential until the next [`login`](Self::login).
    pub fn clear(&self, is_logout: bool) {
        self.inner.store.clear();
        if is_logout {
            *self.rejected_slot() = None;
            self.inner.store.set_opted_out(true);
            info!("Credential cleared on logout");
        }
        self.inner.ready.send_replace(false);
    }

    /// Drop a credential the server rejected, without opting out.
    ///
    /// The rejected value is kept aside so the next acquisition can still
    /// present it to the token source.
    pub fn invalidate(&self) {
        if let Some(raw) = self.inner.store.get() {
            *self.rejected_slot() = Some(raw);
        }
        self.clear(false);
    }

    /// Wait for a credential to become ready, up to `timeout`.
    pub async fn wait_until_ready(&self, timeout: Duration) -> Option<BearerToken> {
        if let Some(token) = self.peek() {
            return Some(token);
        }

        let mut ready = self.inner.ready.subscribe();
        match tokio::time::timeout(timeout, ready.wait_for(|is_ready| *is_ready)).await {
            Ok(Ok(_)) => self.peek(),
            Ok(Err(_)) | Err(_) => {
                debug!(timeout_ms = timeout.as_millis(), "Credential not ready in time");
                None
            }
        }
    }

    /// Whether the user explicitly logged out.
    #[must_use]
    pub fn opted_out(&self) -> bool {
        self.inner.store.opted_out()
    }

    /// Number of acquisitions started since construction.
    #[must_use]
    pub fn acquisition_count(&self) -> u64 {
        self.inner.acquisitions.load(Ordering::SeqCst)
    }

    /// Whether an acquisition is currently in flight.
    #[must_use]
    pub fn is_acquiring(&self) -> bool {
        self.pending_slot().is_some()
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn is_expired(&self, token: &BearerToken) -> bool {
        if !self.inner.settings.enforce_expiry {
            return false;
        }
        let leeway = chrono::Duration::from_std(self.inner.settings.expiry_leeway)
            .unwrap_or_else(|_| chrono::Duration::zero());
        token.is_expired_at(Utc::now(), leeway)
    }

    fn pending_slot(&self) -> MutexGuard<'_, Option<PendingAcquisition>> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn rejected_slot(&self) -> MutexGuard<'_, Option<String>> {
        self.inner
            .rejected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Run one acquisition and free the in-flight slot once it settles.
    async fn acquire(&self, previous: Option<String>) -> Option<BearerToken> {
        let token = self.run_acquisition(previous).await;
        *self.pending_slot() = None;
        token
    }

    #[instrument(skip(self, previous))]
    async fn run_acquisition(&self, previous: Option<String>) -> Option<BearerToken> {
        if self.inner.store.opted_out() {
            debug!("Skipping credential acquisition after logout");
            return None;
        }

        self.inner.acquisitions.fetch_add(1, Ordering::SeqCst);

        match self.inner.source.acquire(previous.as_deref()).await {
            Ok(Some(_)) if self.inner.store.opted_out() => {
                info!("Discarding credential issued after logout");
                None
            }
            Ok(Some(raw)) => match self.store(&raw) {
                Ok(token) => {
                    info!(subject = ?token.subject(), "Acquired credential");
                    Some(token)
                }
                Err(e) => {
                    warn!(error = %e, "Could not store issued credential");
                    None
                }
            },
            Ok(None) => {
                info!("Token source issued no credential");
                None
            }
            Err(e) => {
                warn!(error = %e, "Credential acquisition failed");
                None
            }
        }
    }
}
