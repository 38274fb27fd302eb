//! Command implementations.
//!
//! Every command writes one pretty-printed JSON document to stdout.
//! Failures are written to stderr as `{ "error": ..., "message": ... }`.

pub mod cart;
pub mod session;

use std::io::Write;

use cartsync::{ConfigError, SyncError};
use cartsync_core::{Cart, CartError};
use serde::Serialize;
use thiserror::Error;

/// Errors that end a CLI invocation.
#[derive(Debug, Error)]
pub enum CliError {
    /// Required configuration is missing or invalid.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The engine surfaced an error.
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// A price given on the command line cannot be held by a cart line.
    #[error("Invalid price: {0}")]
    Price(#[from] CartError),

    /// Output could not be encoded.
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Output could not be written.
    #[error("Output error: {0}")]
    Output(#[from] std::io::Error),
}

impl CliError {
    /// Process exit code for this error.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) | Self::Sync(SyncError::Config(_)) => 2,
            Self::Sync(SyncError::AuthenticationRequired) => 3,
            _ => 1,
        }
    }

    const fn code(&self) -> &'static str {
        match self {
            Self::Config(_) | Self::Sync(SyncError::Config(_)) => "configuration",
            Self::Sync(SyncError::AuthenticationRequired) => "authentication_required",
            Self::Sync(SyncError::InvalidCredential(_)) => "invalid_credential",
            Self::Sync(SyncError::Storage(_)) => "storage",
            Self::Sync(SyncError::Client(_)) => "http_client",
            Self::Price(_) => "invalid_price",
            Self::Json(_) | Self::Output(_) => "output",
        }
    }
}

#[derive(Serialize)]
struct Failure<'a> {
    error: &'a str,
    message: String,
}

/// Write a failure document to stderr.
pub fn report_failure(error: &CliError) {
    let failure = Failure {
        error: error.code(),
        message: error.to_string(),
    };
    let mut err = std::io::stderr().lock();
    // Nothing left to report to if stderr is gone
    let _ = serde_json::to_writer_pretty(&mut err, &failure);
    let _ = writeln!(err);
}

/// Write a JSON document to stdout.
///
/// # Errors
///
/// Returns `CliError` if the value cannot be encoded or stdout is closed.
pub fn print_json<T: Serialize>(value: &T) -> Result<(), CliError> {
    let mut out = std::io::stdout().lock();
    serde_json::to_writer_pretty(&mut out, value)?;
    writeln!(out)?;
    Ok(())
}

/// The cart plus the engine's view of how it got there.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CartReport<'a> {
    pub cart: &'a Cart,
    pub phase: String,
    pub state: cartsync::SyncState,
}

/// Print `cart` with the session's current sync state.
///
/// # Errors
///
/// Returns `CliError` if output fails.
pub fn print_cart(session: &cartsync::CartSession, cart: &Cart) -> Result<(), CliError> {
    let engine = session.engine();
    print_json(&CartReport {
        cart,
        phase: engine.phase().to_string(),
        state: engine.state(),
    })
}
