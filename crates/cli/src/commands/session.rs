//! Session commands: login, logout, status and the checkout gate.

use cartsync::CartSession;
use cartsync_core::Cart;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{CliError, print_cart, print_json};

/// Store a credential and reload the cart.
pub async fn login(session: &CartSession, token: &str) -> Result<(), CliError> {
    let cart = session.engine().login(token).await?;
    print_cart(session, &cart)
}

/// Forget the credential. The cached cart is kept.
pub fn logout(session: &CartSession) -> Result<(), CliError> {
    session.engine().logout();
    status(session)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CredentialStatus {
    subject: Option<String>,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusReport {
    credential: Option<CredentialStatus>,
    opted_out: bool,
    data_dir: String,
    cart: Cart,
}

/// Print credential and cache status without contacting the service.
pub fn status(session: &CartSession) -> Result<(), CliError> {
    let credentials = session.credentials();
    let credential = credentials.peek().map(|token| CredentialStatus {
        subject: token.subject().map(str::to_string),
        expires_at: token.expires_at(),
    });

    print_json(&StatusReport {
        credential,
        opted_out: credentials.opted_out(),
        data_dir: session.config().data_dir.display().to_string(),
        cart: session.engine().snapshot(),
    })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CheckoutReport {
    ready: bool,
    subject: Option<String>,
    cart: Cart,
}

/// Verify a credential is available, then print the confirmed cart.
pub async fn checkout(session: &CartSession) -> Result<(), CliError> {
    let engine = session.engine();
    let token = engine.require_credential().await?;
    let cart = engine.fetch().await;

    print_json(&CheckoutReport {
        ready: !cart.is_empty() && !engine.state().unconfirmed,
        subject: token.subject().map(str::to_string),
        cart,
    })
}
