//! Raw credential persistence.
//!
//! Pure get/set/clear over the durable store: no parsing, no network. Read
//! failures are logged and read as "absent" so that a broken disk degrades to
//! the unauthenticated path instead of an error. Write failures are returned.

use tracing::warn;

use crate::storage::{CREDENTIAL_KEY, OPT_OUT_KEY, SharedStore, StorageError};

/// Holds the raw credential string and the logout opt-out flag.
#[derive(Clone)]
pub struct CredentialStore {
    storage: SharedStore,
}

impl CredentialStore {
    /// Create a credential store over shared storage.
    #[must_use]
    pub fn new(storage: SharedStore) -> Self {
        Self { storage }
    }

    /// Read the raw credential.
    #[must_use]
    pub fn get(&self) -> Option<String> {
        match self.storage.get(CREDENTIAL_KEY) {
            Ok(value) => value.filter(|v| !v.trim().is_empty()),
            Err(e) => {
                warn!(error = %e, "Failed to read stored credential");
                None
            }
        }
    }

    /// Persist the raw credential.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the credential could not be written.
    pub fn set(&self, raw: &str) -> Result<(), StorageError> {
        self.storage.set(CREDENTIAL_KEY, raw)
    }

    /// Delete the raw credential.
    pub fn clear(&self) {
        if let Err(e) = self.storage.remove(CREDENTIAL_KEY) {
            warn!(error = %e, "Failed to remove stored credential");
        }
    }

    /// Whether the user explicitly logged out.
    #[must_use]
    pub fn opted_out(&self) -> bool {
        match self.storage.get(OPT_OUT_KEY) {
            Ok(value) => value.is_some_and(|v| v.trim() == "true"),
            Err(e) => {
                warn!(error = %e, "Failed to read opt-out flag");
                false
            }
        }
    }

    /// Set or clear the opt-out flag.
    pub fn set_opted_out(&self, opted_out: bool) {
        let result = if opted_out {
            self.storage.set(OPT_OUT_KEY, "true")
        } else {
            self.storage.remove(OPT_OUT_KEY)
        };
        if let Err(e) = result {
            warn!(error = %e, opted_out, "Failed to update opt-out flag");
        }
    }
}
