//! Credential acquisition.
//!
//! A [`TokenSource`] produces a fresh raw credential. The coordinator is the
//! only caller and it never lets an acquisition error escape: every failure
//! here becomes "no credential" one layer up.

use futures::future::BoxFuture;
use serde::Deserialize;
use thiserror::Error;
use tracing::instrument;
use url::Url;

use crate::gateway::AuthScheme;

/// Errors from a token acquisition attempt.
#[derive(Debug, Error)]
pub enum AcquireError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The token endpoint refused to issue a credential.
    #[error("Token request rejected: {0}")]
    Rejected(String),

    /// The token endpoint answered with an unexpected body.
    #[error("Malformed token response: {0}")]
    Malformed(String),
}

/// Something that can issue a credential.
///
/// Returns a boxed future so sources can be held as trait objects.
pub trait TokenSource: Send + Sync {
    /// Acquire a fresh raw credential.
    ///
    /// `previous` is the last stored credential, possibly expired, which
    /// refresh-style sources present to the issuer. `Ok(None)` means the
    /// issuer had nothing to hand out.
    fn acquire<'a>(
        &'a self,
        previous: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Option<String>, AcquireError>>;
}

/// A source that never issues anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTokenSource;

impl TokenSource for NoTokenSource {
    fn acquire<'a>(
        &'a self,
        _previous: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Option<String>, AcquireError>> {
        Box::pin(async { Ok(None) })
    }
}

// =============================================================================
// HttpTokenSource
// =============================================================================

/// Token endpoint body, either bare or wrapped in the service envelope.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TokenResponse {
    Envelope {
        success: bool,
        #[serde(default)]
        data: Option<TokenBody>,
        #[serde(default)]
        message: Option<String>,
    },
    Bare(TokenBody),
}

#[derive(Debug, Deserialize)]
struct TokenBody {
    #[serde(alias = "accessToken", alias = "access_token")]
    token: Option<String>,
}

/// Refreshes the credential against the service's token endpoint.
#[derive(Debug, Clone)]
pub struct HttpTokenSource {
    client: reqwest::Client,
    url: Url,
    scheme: AuthScheme,
}

impl HttpTokenSource {
    /// Create a source posting to `url`.
    #[must_use]
    pub const fn new(client: reqwest::Client, url: Url, scheme: AuthScheme) -> Self {
        Self {
            client,
            url,
            scheme,
        }
    }

    #[instrument(skip(self, previous), fields(url = %self.url, has_previous = previous.is_some()))]
    async fn request(&self, previous: Option<&str>) -> Result<Option<String>, AcquireError> {
        let mut request = self.client.post(self.url.clone());
        if let Some(previous) = previous {
            request = request.header(reqwest::header::AUTHORIZATION, self.scheme.format(previous));
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(AcquireError::Rejected(format!("HTTP {status}")));
        }
        if !status.is_success() {
            return Err(AcquireError::Rejected(format!(
                "HTTP {status}: {}",
                body.chars().take(200).collect::<String>()
            )));
        }

        let parsed: TokenResponse =
            serde_json::from_str(&body).map_err(|e| AcquireError::Malformed(e.to_string()))?;

        let token = match parsed {
            TokenResponse::Envelope {
                success: false,
                message,
                ..
            } => {
                return Err(AcquireError::Rejected(
                    message.unwrap_or_else(|| "success: false".to_string()),
                ));
            }
            TokenResponse::Envelope { data, .. } => data.and_then(|d| d.token),
            TokenResponse::Bare(body) => body.token,
        };

        // The endpoint may echo the scheme prefix back
        Ok(token
            .map(|t| AuthScheme::strip(&t).to_string())
            .filter(|t| !t.is_empty()))
    }
}

impl TokenSource for HttpTokenSource {
    fn acquire<'a>(
        &'a self,
        previous: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Option<String>, AcquireError>> {
        Box::pin(self.request(previous))
    }
}
