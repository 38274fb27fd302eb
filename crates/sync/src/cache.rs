//! Local cart cache.
//!
//! Write-through persistence of the last published canonical cart. Only the
//! engine writes here. Corrupt records, including ones whose amounts cannot
//! be summed, read as absent.

use cartsync_core::Cart;
use tracing::{debug, warn};

use crate::storage::{CART_KEY, SharedStore, StorageError};

/// Durable copy of the last-known cart.
#[derive(Clone)]
pub struct CartCache {
    storage: SharedStore,
}

impl CartCache {
    /// Create a cache over shared storage.
    #[must_use]
    pub fn new(storage: SharedStore) -> Self {
        Self { storage }
    }

    /// Persist a cart.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the cart cannot be encoded or written.
    pub fn save(&self, cart: &Cart) -> Result<(), StorageError> {
        let json = serde_json::to_string(cart)?;
        self.storage.set(CART_KEY, &json)
    }

    /// Load the cached cart, if there is a readable one.
    #[must_use]
    pub fn load(&self) -> Option<Cart> {
        let raw = match self.storage.get(CART_KEY) {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(error = %e, "Failed to read cached cart");
                return None;
            }
        };

        match serde_json::from_str::<Cart>(&raw) {
            Ok(mut cart) => {
                if !cart.is_consistent() {
                    debug!("Cached cart totals out of step, recomputing");
                    if let Err(e) = cart.recompute_totals() {
                        warn!(error = %e, "Discarding cached cart with unusable amounts");
                        return None;
                    }
                }
                Some(cart)
            }
            Err(e) => {
                warn!(error = %e, "Discarding corrupt cached cart");
                None
            }
        }
    }

    /// Load the cached cart, or the canonical empty cart.
    #[must_use]
    pub fn load_or_empty(&self) -> Cart {
        self.load().unwrap_or_default()
    }
}
