//! Remote cart gateway.
//!
//! # Architecture
//!
//! - [`CartApi`] is the seam the engine drives: four operations, each
//!   resolving to a normalized [`RemoteCart`] or a typed [`GatewayError`]
//! - [`HttpCartGateway`] implements it over `reqwest`, attaching the bearer
//!   credential obtained from the [`CredentialCoordinator`]
//! - [`normalize`] maps the three accepted response shapes onto [`Cart`]
//!
//! The gateway never retries and never lets a transport or parsing failure
//! escape as anything but a [`GatewayError`]. Retry policy lives in the engine.
//!
//! [`Cart`]: cartsync_core::Cart

mod endpoints;
mod normalize;

pub use endpoints::{AuthScheme, Endpoints};
pub use normalize::{Envelope, PayloadShape, RemoteCart, normalize};

use std::sync::Arc;
use std::time::Duration;

use cartsync_core::{LineId, ProductId, Quantity};
use futures::future::BoxFuture;
use reqwest::{Method, StatusCode};
use serde_json::json;
use thiserror::Error;
use tracing::instrument;
use url::Url;

use crate::credential::CredentialCoordinator;
use crate::error::ErrorKind;

/// Errors from a gateway call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    /// No credential could be obtained; the call was not attempted.
    #[error("No credential available")]
    NoCredential,

    /// The service rejected the credential.
    #[error("Unauthorized")]
    Unauthorized,

    /// The service was unreachable or failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The response was not a cart envelope.
    #[error("Malformed response: {0}")]
    Malformed(String),

    /// The service refused the request.
    #[error("Request rejected: {0}")]
    Rejected(String),
}

impl GatewayError {
    /// Public classification of this failure.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NoCredential | Self::Unauthorized => ErrorKind::Unauthorized,
            Self::Transport(_) => ErrorKind::Transport,
            Self::Malformed(_) => ErrorKind::MalformedResponse,
            Self::Rejected(_) => ErrorKind::ValidationRejected,
        }
    }

    /// Whether the engine may retry the call.
    ///
    /// Only a rejected credential is worth retrying: the retry acquires a
    /// fresh one. A missing credential has nothing to retry with.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unauthorized)
    }
}

/// Result type alias for gateway calls.
pub type GatewayResult = Result<RemoteCart, GatewayError>;

/// The remote cart operations.
///
/// Returns boxed futures so the engine can hold the gateway as a trait object.
pub trait CartApi: Send + Sync {
    /// Read the cart.
    fn fetch(&self) -> BoxFuture<'_, GatewayResult>;

    /// Add `quantity` units of a product.
    fn add<'a>(&'a self, product_id: &'a ProductId, quantity: Quantity)
    -> BoxFuture<'a, GatewayResult>;

    /// Set a line's quantity.
    fn set_quantity<'a>(
        &'a self,
        line_id: &'a LineId,
        quantity: Quantity,
    ) -> BoxFuture<'a, GatewayResult>;

    /// Remove a line.
    fn remove<'a>(&'a self, line_id: &'a LineId) -> BoxFuture<'a, GatewayResult>;
}

// =============================================================================
// HttpCartGateway
// =============================================================================

/// Cart service client over HTTP.
///
/// Cheaply cloneable; clones share the HTTP client and credential coordinator.
#[derive(Clone)]
pub struct HttpCartGateway {
    inner: Arc<GatewayInner>,
}

struct GatewayInner {
    client: reqwest::Client,
    endpoints: Endpoints,
    credentials: CredentialCoordinator,
    scheme: AuthScheme,
    credential_timeout: Duration,
}

impl HttpCartGateway {
    /// Create a gateway.
    #[must_use]
    pub fn new(
        client: reqwest::Client,
        endpoints: Endpoints,
        credentials: CredentialCoordinator,
        scheme: AuthScheme,
        credential_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(GatewayInner {
                client,
                endpoints,
                credentials,
                scheme,
                credential_timeout,
            }),
        }
    }

    /// Execute a cart request with the current credential attached.
    async fn execute(
        &self,
        method: Method,
        url: Url,
        body: Option<serde_json::Value>,
    ) -> GatewayResult {
        let Some(token) = self
            .inner
            .credentials
            .ensure_within(self.inner.credential_timeout)
            .await
        else {
            tracing::debug!("No credential, skipping remote call");
            return Err(GatewayError::NoCredential);
        };

        let mut request = self
            .inner
            .client
            .request(method, url)
            .header(
                reqwest::header::AUTHORIZATION,
                self.inner.scheme.format(token.expose()),
            );
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(|e| {
            tracing::warn!(error = %e, "Cart service unreachable");
            GatewayError::Transport(e.to_string())
        })?;

        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(1);
            tracing::warn!(retry_after, "Cart service rate limited");
            return Err(GatewayError::Transport(format!(
                "rate limited, retry after {retry_after}s"
            )));
        }

        // Get response body as text first for better error diagnostics
        let response_text = response
            .text()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        interpret_response(status, &response_text)
    }
}

/// Map an HTTP status and body onto a gateway result.
fn interpret_response(status: StatusCode, body: &str) -> GatewayResult {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        tracing::info!(status = %status, "Cart service rejected credential");
        return Err(GatewayError::Unauthorized);
    }

    if !status.is_success() {
        tracing::error!(
            status = %status,
            body = %body.chars().take(500).collect::<String>(),
            "Cart service returned non-success status"
        );
        let detail = format!("HTTP {status}: {}", body.chars().take(200).collect::<String>());
        return Err(
            if matches!(
                status,
                StatusCode::BAD_REQUEST | StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY
            ) {
                GatewayError::Rejected(detail)
            } else {
                GatewayError::Transport(detail)
            },
        );
    }

    let envelope: Envelope = match serde_json::from_str(body) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::error!(
                error = %e,
                body = %body.chars().take(500).collect::<String>(),
                "Failed to parse cart response"
            );
            return Err(GatewayError::Malformed(e.to_string()));
        }
    };

    if !envelope.success {
        let message = envelope
            .message
            .unwrap_or_else(|| "success: false".to_string());
        tracing::debug!(message = %message, "Cart service reported failure");
        return Err(GatewayError::Rejected(message));
    }

    normalize(envelope.into_payload()).map_err(|e| {
        tracing::error!(error = %e, "Cart response amounts out of range");
        GatewayError::Malformed(e.to_string())
    })
}

impl CartApi for HttpCartGateway {
    fn fetch(&self) -> BoxFuture<'_, GatewayResult> {
        Box::pin(self.fetch_cart())
    }

    fn add<'a>(
        &'a self,
        product_id: &'a ProductId,
        quantity: Quantity,
    ) -> BoxFuture<'a, GatewayResult> {
        Box::pin(self.add_item(product_id, quantity))
    }

    fn set_quantity<'a>(
        &'a self,
        line_id: &'a LineId,
        quantity: Quantity,
    ) -> BoxFuture<'a, GatewayResult> {
        Box::pin(self.update_item(line_id, quantity))
    }

    fn remove<'a>(&'a self, line_id: &'a LineId) -> BoxFuture<'a, GatewayResult> {
        Box::pin(self.delete_item(line_id))
    }
}

impl HttpCartGateway {
    #[instrument(skip(self))]
    async fn fetch_cart(&self) -> GatewayResult {
        self.execute(Method::GET, self.inner.endpoints.cart(), None)
            .await
    }

    #[instrument(skip_all, fields(product_id = %product_id, quantity = %quantity))]
    async fn add_item(&self, product_id: &ProductId, quantity: Quantity) -> GatewayResult {
        let body = json!({ "productId": product_id, "quantity": quantity });
        self.execute(Method::POST, self.inner.endpoints.cart_items(), Some(body))
            .await
    }

    #[instrument(skip_all, fields(line_id = %line_id, quantity = %quantity))]
    async fn update_item(&self, line_id: &LineId, quantity: Quantity) -> GatewayResult {
        let body = json!({ "quantity": quantity });
        self.execute(Method::PUT, self.inner.endpoints.cart_item(line_id), Some(body))
            .await
    }

    #[instrument(skip_all, fields(line_id = %line_id))]
    async fn delete_item(&self, line_id: &LineId) -> GatewayResult {
        self.execute(Method::DELETE, self.inner.endpoints.cart_item(line_id), None)
            .await
    }
}
