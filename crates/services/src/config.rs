use std::env;
use std::time::Duration;

use url::Url;

use crate::error::ConfigError;

/// Connection settings for the remote attempt API.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiConfig {
    base_url: Url,
    token: Option<String>,
    timeout: Duration,
}

impl ApiConfig {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

    /// Build a config for `base_url`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the URL does not parse or is not http(s).
    pub fn new(base_url: &str) -> Result<Self, ConfigError> {
        let parsed = Url::parse(base_url.trim()).map_err(|err| ConfigError::InvalidBaseUrl {
            raw: base_url.to_string(),
            reason: err.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ConfigError::UnsupportedScheme(parsed.scheme().to_string()));
        }
        Ok(Self {
            base_url: parsed,
            token: None,
            timeout: Self::DEFAULT_TIMEOUT,
        })
    }

    /// Reads `EXAM_API_BASE_URL`, `EXAM_API_TOKEN` and `EXAM_API_TIMEOUT_SECS`.
    ///
    /// Returns `Ok(None)` when no base URL is set.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when a variable is present but malformed.
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        let Ok(raw) = env::var("EXAM_API_BASE_URL") else {
            return Ok(None);
        };
        if raw.trim().is_empty() {
            return Ok(None);
        }

        let mut config = Self::new(&raw)?;
        if let Ok(token) = env::var("EXAM_API_TOKEN") {
            config = config.with_token(token);
        }
        if let Ok(raw) = env::var("EXAM_API_TIMEOUT_SECS") {
            let secs = raw
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|secs| *secs > 0)
                .ok_or(ConfigError::InvalidEnv {
                    name: "EXAM_API_TIMEOUT_SECS",
                    raw,
                })?;
            config = config.with_timeout(Duration::from_secs(secs));
        }
        Ok(Some(config))
    }

    /// Blank tokens are ignored.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        let token = token.into();
        self.token = if token.trim().is_empty() {
            None
        } else {
            Some(token)
        };
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    #[must_use]
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Joins `path` onto the base URL, keeping any path prefix the base has.
    #[must_use]
    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}
