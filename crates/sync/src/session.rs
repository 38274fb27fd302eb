//! Wiring of the sync components for one shopper session.

use std::sync::Arc;

use secrecy::ExposeSecret;
use tracing::{info, warn};

use crate::cache::CartCache;
use crate::config::SyncConfig;
use crate::credential::{CoordinatorSettings, CredentialCoordinator, CredentialStore, HttpTokenSource};
use crate::engine::{CartSyncEngine, EngineSettings};
use crate::error::Result;
use crate::gateway::{Endpoints, HttpCartGateway};
use crate::storage::{FileStore, SharedStore};

/// Everything a shopper session needs, constructed once.
///
/// This struct is cheaply cloneable via `Arc`.
#[derive(Clone)]
pub struct CartSession {
    inner: Arc<CartSessionInner>,
}

struct CartSessionInner {
    config: SyncConfig,
    storage: SharedStore,
    engine: CartSyncEngine,
}

impl CartSession {
    /// Create a session persisting to `config.data_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the data directory cannot be created, the token
    /// URL is invalid, or the HTTP client cannot be built.
    pub fn new(config: SyncConfig) -> Result<Self> {
        let storage: SharedStore = Arc::new(FileStore::open(&config.data_dir)?);
        Self::with_storage(config, storage)
    }

    /// Create a session over the given storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the token URL is invalid or the HTTP client cannot
    /// be built.
    pub fn with_storage(config: SyncConfig, storage: SharedStore) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(concat!("cartsync/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let credentials = CredentialCoordinator::new(
            CredentialStore::new(storage.clone()),
            Arc::new(HttpTokenSource::new(
                client.clone(),
                config.token_url()?,
                config.auth_scheme,
            )),
            CoordinatorSettings::from(&config),
        );
        bootstrap_credential(&config, &credentials);

        let gateway = HttpCartGateway::new(
            client,
            Endpoints::new(config.api_base_url.clone()),
            credentials.clone(),
            config.auth_scheme,
            config.credential_timeout,
        );

        let engine = CartSyncEngine::new(
            Arc::new(gateway),
            credentials,
            CartCache::new(storage.clone()),
            EngineSettings::from(&config),
        );

        Ok(Self {
            inner: Arc::new(CartSessionInner {
                config,
                storage,
                engine,
            }),
        })
    }

    /// Get a reference to the configuration.
    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Get a reference to the durable storage.
    #[must_use]
    pub fn storage(&self) -> &SharedStore {
        &self.inner.storage
    }

    /// Get a reference to the cart engine.
    #[must_use]
    pub fn engine(&self) -> &CartSyncEngine {
        &self.inner.engine
    }

    /// Get a reference to the credential coordinator.
    #[must_use]
    pub fn credentials(&self) -> &CredentialCoordinator {
        self.inner.engine.credentials()
    }
}

/// Store the configured bootstrap token unless a usable credential exists
/// or the shopper logged out.
fn bootstrap_credential(config: &SyncConfig, credentials: &CredentialCoordinator) {
    let Some(token) = &config.bootstrap_token else {
        return;
    };
    if credentials.opted_out() || credentials.peek().is_some() {
        return;
    }
    match credentials.store(token.expose_secret()) {
        Ok(token) => info!(subject = ?token.subject(), "Stored bootstrap credential"),
        Err(e) => warn!(error = %e, "Could not store bootstrap credential"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use secrecy::SecretString;
    use url::Url;

    use super::*;
    use crate::credential::tests::jwt;
    use crate::storage::MemoryStore;

    fn config() -> SyncConfig {
        SyncConfig::new(Url::parse("http://127.0.0.1:9/api/").unwrap())
    }

    #[test]
    fn test_bootstrap_token_is_stored() {
        let mut config = config();
        config.bootstrap_token = Some(SecretString::from(jwt("shopper", 3600)));
        let session = CartSession::with_storage(config, MemoryStore::shared()).unwrap();
        assert_eq!(
            session.credentials().peek().unwrap().subject(),
            Some("shopper")
        );
    }

    #[test]
    fn test_bootstrap_token_respects_logout() {
        let storage = MemoryStore::shared();
        CredentialStore::new(storage.clone()).set_opted_out(true);

        let mut config = config();
        config.bootstrap_token = Some(SecretString::from(jwt("shopper", 3600)));
        let session = CartSession::with_storage(config, storage).unwrap();
        assert!(session.credentials().peek().is_none());
    }

    #[test]
    fn test_file_backed_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config();
        config.data_dir = dir.path().join("cartsync");
        let session = CartSession::new(config).unwrap();
        assert!(session.engine().snapshot().is_empty());
        assert!(dir.path().join("cartsync").is_dir());
    }
}
