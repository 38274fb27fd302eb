//! Error taxonomy for the sync engine.
//!
//! Most failures in this crate never reach callers as errors: the gateway
//! converts transport and protocol problems into [`GatewayError`] values that
//! the engine absorbs into its local fallback, and the credential coordinator
//! resolves acquisition failures to "no credential". [`SyncError`] covers the
//! few cases that must be surfaced explicitly.

use cartsync_core::TokenError;
use serde::Serialize;
use thiserror::Error;

use crate::config::ConfigError;
use crate::credential::CredentialError;
use crate::storage::StorageError;

/// Public classification of remote failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The credential was missing, rejected or expired.
    Unauthorized,
    /// The service could not be reached or returned a server error.
    Transport,
    /// The service answered with something that is not a cart envelope.
    MalformedResponse,
    /// The service refused the request's content.
    ValidationRejected,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Unauthorized => "unauthorized",
            Self::Transport => "transport",
            Self::MalformedResponse => "malformed_response",
            Self::ValidationRejected => "validation_rejected",
        };
        f.write_str(name)
    }
}

/// Errors surfaced to callers of the engine.
#[derive(Debug, Error)]
pub enum SyncError {
    /// No credential is obtainable and the operation cannot proceed without one.
    #[error("Authentication required")]
    AuthenticationRequired,

    /// A credential handed to login is not a usable bearer token.
    #[error("Invalid credential: {0}")]
    InvalidCredential(#[from] TokenError),

    /// Durable storage failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Configuration is missing or invalid.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The HTTP client could not be constructed.
    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),
}

impl From<CredentialError> for SyncError {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::Invalid(e) => Self::InvalidCredential(e),
            CredentialError::Unpersisted(e) => Self::Storage(e),
        }
    }
}

/// Result type alias for `SyncError`.
pub type Result<T> = std::result::Result<T, SyncError>;
