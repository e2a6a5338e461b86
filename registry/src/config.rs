use serde::Deserialize;
use thiserror::Error;
use url::Url;

const DEFAULT_CLIENT_ID: &str = "datadelivery-api-client";
const USERNAME_ENV: &str = "REGISTRY_USERNAME";
const PASSWORD_ENV: &str = "REGISTRY_PASSWORD";

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("rate_limit.max_concurrent must be at least 1")]
    ZeroConcurrency,

    #[error("retry.factor must be a finite number >= 1, got {0}")]
    InvalidBackoffFactor(f64),

    #[error("identity.client_id cannot be empty")]
    EmptyClientId,
}

/// Identity provider issuing bearer tokens for the register API.
#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct Identity {
    pub token_url: Url,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

fn default_client_id() -> String {
    DEFAULT_CLIENT_ID.into()
}

impl Identity {
    /// Username and password for the password grant. Values missing from the
    /// config file are taken from the environment.
    pub fn credentials(&self) -> Option<(String, String)> {
        let username = self
            .username
            .clone()
            .or_else(|| std::env::var(USERNAME_ENV).ok())
            .filter(|u| !u.is_empty())?;
        let password = self
            .password
            .clone()
            .or_else(|| std::env::var(PASSWORD_ENV).ok())
            .filter(|p| !p.is_empty())?;
        Some((username, password))
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct Endpoint {
    pub api_url: Url,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

/// Limits applied to every outbound register call.
#[derive(Clone, Copy, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct RateLimit {
    pub max_concurrent: usize,
    pub min_spacing_ms: u64,
}

impl Default for RateLimit {
    fn default() -> Self {
        RateLimit {
            max_concurrent: 1,
            min_spacing_ms: 600,
        }
    }
}

/// Backoff parameters for transient register failures.
#[derive(Clone, Copy, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct Retry {
    /// Retries allowed for 408/409/420/5xx. 429 is always retried.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub factor: f64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
    pub rate_limited_jitter_ms: u64,
}

impl Default for Retry {
    fn default() -> Self {
        Retry {
            max_attempts: 5,
            base_delay_ms: 2000,
            factor: 1.7,
            max_delay_ms: 15000,
            jitter_ms: 400,
            rate_limited_jitter_ms: 300,
        }
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct Config {
    pub identity: Identity,
    pub registry: Endpoint,
    #[serde(default)]
    pub rate_limit: RateLimit,
    #[serde(default)]
    pub retry: Retry,
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.rate_limit.max_concurrent == 0 {
            return Err(ValidationError::ZeroConcurrency);
        }
        if !self.retry.factor.is_finite() || self.retry.factor < 1.0 {
            return Err(ValidationError::InvalidBackoffFactor(self.retry.factor));
        }
        if self.identity.client_id.is_empty() {
            return Err(ValidationError::EmptyClientId);
        }
        Ok(())
    }
}
