//! Bearer token types.
//!
//! A [`BearerToken`] is an opaque JWT-shaped string. Only the structure
//! (three dot-separated segments) and the payload claims `exp` and `sub` are
//! inspected; the signature is never verified client-side.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use thiserror::Error;

/// Reasons a raw credential string is not a usable bearer token.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    /// The credential is empty or whitespace.
    #[error("credential is empty")]
    Empty,

    /// The credential does not have exactly three non-empty segments.
    #[error("expected 3 dot-separated segments, found {0}")]
    Segments(usize),

    /// The payload segment is not base64url-encoded JSON.
    #[error("undecodable payload: {0}")]
    Payload(String),
}

/// Claims decoded from the token payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenClaims {
    /// Token subject (`sub`).
    pub subject: Option<String>,
    /// Expiry instant (`exp`).
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct RawClaims {
    #[serde(default)]
    sub: Option<serde_json::Value>,
    #[serde(default)]
    exp: Option<f64>,
}

/// A structurally valid bearer token.
///
/// Implements `Debug` manually to redact the raw token.
#[derive(Clone)]
pub struct BearerToken {
    raw: SecretString,
    claims: TokenClaims,
}

impl std::fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BearerToken")
            .field("raw", &"[REDACTED]")
            .field("claims", &self.claims)
            .finish()
    }
}

impl PartialEq for BearerToken {
    fn eq(&self, other: &Self) -> bool {
        self.raw.expose_secret() == other.raw.expose_secret()
    }
}

impl Eq for BearerToken {}

impl BearerToken {
    /// Parse and structurally validate a raw credential.
    ///
    /// # Errors
    ///
    /// Returns `TokenError` if the credential is empty, does not have three
    /// segments, or its payload cannot be decoded.
    pub fn parse(raw: &str) -> Result<Self, TokenError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(TokenError::Empty);
        }

        let segments: Vec<&str> = raw.split('.').collect();
        let [_, payload, _] = segments.as_slice() else {
            return Err(TokenError::Segments(segments.len()));
        };
        if segments.iter().any(|s| s.is_empty()) {
            return Err(TokenError::Segments(
                segments.iter().filter(|s| !s.is_empty()).count(),
            ));
        }

        let claims = decode_claims(payload)?;

        Ok(Self {
            raw: SecretString::from(raw.to_owned()),
            claims,
        })
    }

    /// The raw token, for attaching to requests.
    #[must_use]
    pub fn expose(&self) -> &str {
        self.raw.expose_secret()
    }

    /// Decoded claims.
    #[must_use]
    pub const fn claims(&self) -> &TokenClaims {
        &self.claims
    }

    /// Token subject, if present.
    #[must_use]
    pub fn subject(&self) -> Option<&str> {
        self.claims.subject.as_deref()
    }

    /// Expiry instant, if present.
    #[must_use]
    pub const fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.claims.expires_at
    }

    /// Whether the token is expired at `now`, counting tokens that expire
    /// within `leeway` as already expired. Tokens without `exp` never expire.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>, leeway: Duration) -> bool {
        self.claims
            .expires_at
            .is_some_and(|expires_at| now >= expires_at - leeway)
    }
}

fn decode_claims(payload: &str) -> Result<TokenClaims, TokenError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| TokenError::Payload(e.to_string()))?;
    let raw: RawClaims =
        serde_json::from_slice(&bytes).map_err(|e| TokenError::Payload(e.to_string()))?;

    let subject = raw.sub.map(|sub| match sub {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    });

    #[allow(clippy::cast_possible_truncation)] // exp is seconds since epoch
    let expires_at = raw
        .exp
        .and_then(|exp| DateTime::<Utc>::from_timestamp(exp as i64, 0));

    Ok(TokenClaims {
        subject,
        expires_at,
    })
}
