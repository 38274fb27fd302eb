//! Sync engine configuration loaded from environment variables.
//!
//! # Environment Variables
//!
//! ## Required
//! - `CARTSYNC_API_BASE_URL` - Base URL of the cart service
//!
//! ## Optional
//! - `CARTSYNC_TOKEN_PATH` - Token acquisition path, relative to the base URL (default: auth/refresh)
//! - `CARTSYNC_DATA_DIR` - Directory for the durable cart and credential records
//! - `CARTSYNC_ENVIRONMENT` - `production` or `development` (default: production)
//! - `CARTSYNC_AUTH_SCHEME` - `bearer` or `raw` (default: bearer)
//! - `CARTSYNC_MAX_RETRY_ATTEMPTS` - Unauthorized fetch retries (default: 3)
//! - `CARTSYNC_BACKOFF_BASE_MS` - Backoff base delay (default: 1000)
//! - `CARTSYNC_BACKOFF_CAP_MS` - Backoff delay cap (default: 5000)
//! - `CARTSYNC_CREDENTIAL_TIMEOUT_MS` - Bounded credential wait (default: 5000)
//! - `CARTSYNC_REQUEST_TIMEOUT_SECS` - HTTP request timeout (default: 30)
//! - `CARTSYNC_DEBOUNCE_MS` - Quantity input debounce window (default: 300)
//! - `CARTSYNC_SETTLE_DELAY_MS` - Delay after login before the first fetch (default: 150)
//! - `CARTSYNC_EXPIRY_LEEWAY_SECS` - Expiry buffer for stored tokens (default: 60)
//! - `CARTSYNC_BOOTSTRAP_TOKEN` - Credential to store at start-up
//! - `SENTRY_DSN` - Sentry error tracking DSN

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;
use thiserror::Error;
use url::Url;

use crate::engine::RetryPolicy;
use crate::gateway::AuthScheme;

/// Configuration errors that can occur during loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid environment variable {0}: {1}")]
    InvalidEnvVar(String, String),
}

/// Deployment environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    /// Expired credentials are discarded.
    #[default]
    Production,
    /// Credential expiry is not enforced.
    Development,
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(Self::Production),
            "development" | "dev" => Ok(Self::Development),
            other => Err(format!("unknown environment '{other}'")),
        }
    }
}

impl Environment {
    /// Whether credential expiry is enforced.
    #[must_use]
    pub const fn enforces_expiry(self) -> bool {
        matches!(self, Self::Production)
    }
}

/// Sync engine configuration.
///
/// Implements `Debug` manually to redact the bootstrap token.
#[derive(Clone)]
pub struct SyncConfig {
    /// Base URL of the cart service
    pub api_base_url: Url,
    /// Token acquisition path, relative to the base URL
    pub token_path: String,
    /// Directory for durable records
    pub data_dir: PathBuf,
    /// Deployment environment
    pub environment: Environment,
    /// How the credential is written into the `Authorization` header
    pub auth_scheme: AuthScheme,
    /// Retry policy for unauthorized fetches
    pub retry: RetryPolicy,
    /// Upper bound on waiting for a credential
    pub credential_timeout: Duration,
    /// HTTP request timeout
    pub request_timeout: Duration,
    /// Quantity input debounce window
    pub debounce: Duration,
    /// Delay after storing a fresh credential before using it
    pub settle_delay: Duration,
    /// Tokens expiring within this window are treated as expired
    pub expiry_leeway: Duration,
    /// Credential to store at start-up
    pub bootstrap_token: Option<SecretString>,
    /// Sentry DSN for error tracking
    pub sentry_dsn: Option<String>,
}

impl std::fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncConfig")
            .field("api_base_url", &self.api_base_url.as_str())
            .field("token_path", &self.token_path)
            .field("data_dir", &self.data_dir)
            .field("environment", &self.environment)
            .field("auth_scheme", &self.auth_scheme)
            .field("retry", &self.retry)
            .field("credential_timeout", &self.credential_timeout)
            .field("request_timeout", &self.request_timeout)
            .field("debounce", &self.debounce)
            .field("settle_delay", &self.settle_delay)
            .field("expiry_leeway", &self.expiry_leeway)
            .field(
                "bootstrap_token",
                &self.bootstrap_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("sentry_dsn", &self.sentry_dsn)
            .finish()
    }
}

impl SyncConfig {
    /// Configuration with default settings for the given service.
    #[must_use]
    pub fn new(api_base_url: Url) -> Self {
        Self {
            api_base_url,
            token_path: "auth/refresh".to_string(),
            data_dir: default_data_dir(),
            environment: Environment::default(),
            auth_scheme: AuthScheme::default(),
            retry: RetryPolicy::default(),
            credential_timeout: Duration::from_millis(5000),
            request_timeout: Duration::from_secs(30),
            debounce: Duration::from_millis(300),
            settle_delay: Duration::from_millis(150),
            expiry_leeway: Duration::from_secs(60),
            bootstrap_token: None,
            sentry_dsn: None,
        }
    }

    /// Load configuration from environment variables.
    ///
    /// Calls `dotenvy::dotenv()` to load from `.env` file if present.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if required variables are missing or invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if required variables are missing or invalid.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let vars = Vars(&lookup);

        let base = vars.required("CARTSYNC_API_BASE_URL")?;
        let api_base_url = parse_base_url(&base)
            .map_err(|e| ConfigError::InvalidEnvVar("CARTSYNC_API_BASE_URL".to_string(), e))?;

        let mut config = Self::new(api_base_url);

        if let Some(path) = vars.optional("CARTSYNC_TOKEN_PATH") {
            config.token_path = path;
        }
        if let Some(dir) = vars.optional("CARTSYNC_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        config.environment = vars.parsed("CARTSYNC_ENVIRONMENT", config.environment)?;
        config.auth_scheme = vars.parsed("CARTSYNC_AUTH_SCHEME", config.auth_scheme)?;
        config.retry = RetryPolicy {
            max_attempts: vars.parsed("CARTSYNC_MAX_RETRY_ATTEMPTS", config.retry.max_attempts)?,
            base_delay: vars.millis("CARTSYNC_BACKOFF_BASE_MS", config.retry.base_delay)?,
            max_delay: vars.millis("CARTSYNC_BACKOFF_CAP_MS", config.retry.max_delay)?,
        };
        config.credential_timeout =
            vars.millis("CARTSYNC_CREDENTIAL_TIMEOUT_MS", config.credential_timeout)?;
        config.request_timeout = Duration::from_secs(vars.parsed(
            "CARTSYNC_REQUEST_TIMEOUT_SECS",
            config.request_timeout.as_secs(),
        )?);
        config.debounce = vars.millis("CARTSYNC_DEBOUNCE_MS", config.debounce)?;
        config.settle_delay = vars.millis("CARTSYNC_SETTLE_DELAY_MS", config.settle_delay)?;
        config.expiry_leeway = Duration::from_secs(vars.parsed(
            "CARTSYNC_EXPIRY_LEEWAY_SECS",
            config.expiry_leeway.as_secs(),
        )?);
        config.bootstrap_token = vars
            .optional("CARTSYNC_BOOTSTRAP_TOKEN")
            .map(SecretString::from);
        config.sentry_dsn = vars.optional("SENTRY_DSN");

        Ok(config)
    }

    /// Absolute URL of the token acquisition endpoint.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the token path cannot be joined to the base URL.
    pub fn token_url(&self) -> Result<Url, ConfigError> {
        self.api_base_url
            .join(self.token_path.trim_start_matches('/'))
            .map_err(|e| ConfigError::InvalidEnvVar("CARTSYNC_TOKEN_PATH".to_string(), e.to_string()))
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Variable lookup with typed accessors.
struct Vars<'a, F>(&'a F);

impl<F: Fn(&str) -> Option<String>> Vars<'_, F> {
    /// Get a required variable.
    fn required(&self, key: &str) -> Result<String, ConfigError> {
        self.optional(key)
            .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
    }

    /// Get an optional variable, treating blank values as unset.
    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    /// Parse a variable, falling back to a default when unset.
    fn parsed<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.optional(key).map_or(Ok(default), |value| {
            value
                .trim()
                .parse::<T>()
                .map_err(|e| ConfigError::InvalidEnvVar(key.to_string(), e.to_string()))
        })
    }

    /// Parse a millisecond duration.
    fn millis(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
        self.parsed(key, default_ms).map(Duration::from_millis)
    }
}

/// Parse the base URL, ensuring a trailing slash so relative joins append.
fn parse_base_url(value: &str) -> Result<Url, String> {
    let mut url = Url::parse(value.trim()).map_err(|e| e.to_string())?;
    if url.cannot_be_a_base() {
        return Err("URL cannot be used as a base".to_string());
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

/// Default durable storage directory.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir().map_or_else(|| PathBuf::from(".cartsync"), |dir| dir.join("cartsync"))
}
