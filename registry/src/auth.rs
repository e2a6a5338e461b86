use crate::config::Identity;
use crate::metrics_defs::TOKEN_GRANTS;
use serde::Deserialize;
use shared::counter;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use url::Url;

/// Tokens are treated as expired this long before the provider says so.
const SAFETY_MARGIN: Duration = Duration::from_secs(30);

/// Used when the provider does not report a refresh token lifetime, or
/// reports zero.
const DEFAULT_REFRESH_LIFETIME: Duration = Duration::from_secs(30 * 24 * 3600);

#[derive(thiserror::Error, Debug)]
pub enum AuthError {
    #[error("missing register credentials")]
    MissingCredentials,
    #[error("login failed {status} {body}")]
    Rejected { status: u16, body: String },
    #[error("identity provider request failed: {0}")]
    ReqwestError(#[from] reqwest::Error),
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: u64,
    refresh_expires_in: Option<u64>,
}

#[derive(Clone, Copy, Debug)]
enum Grant {
    Refresh,
    Password,
}

impl Grant {
    fn as_str(&self) -> &'static str {
        match self {
            Grant::Refresh => "refresh_token",
            Grant::Password => "password",
        }
    }
}

struct TokenState {
    access_token: String,
    refresh_token: Option<String>,
    obtained_at: Instant,
    access_lifetime: Duration,
    refresh_lifetime: Duration,
}

impl TokenState {
    fn from_response(response: TokenResponse) -> Self {
        TokenState {
            access_token: response.access_token,
            refresh_token: response.refresh_token.filter(|t| !t.is_empty()),
            obtained_at: Instant::now(),
            access_lifetime: Duration::from_secs(response.expires_in),
            refresh_lifetime: response
                .refresh_expires_in
                .filter(|&secs| secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_REFRESH_LIFETIME),
        }
    }

    fn is_fresh(&self, lifetime: Duration) -> bool {
        self.obtained_at.elapsed() + SAFETY_MARGIN < lifetime
    }

    fn usable_access_token(&self) -> Option<&str> {
        self.is_fresh(self.access_lifetime)
            .then_some(self.access_token.as_str())
    }

    fn usable_refresh_token(&self) -> Option<&str> {
        self.refresh_token
            .as_deref()
            .filter(|_| self.is_fresh(self.refresh_lifetime))
    }
}

/// Bearer token cache for the register API.
///
/// One instance is shared by every lookup. The lock is held across the token
/// request so that concurrent callers wait for a single refresh or login
/// instead of each starting their own.
pub struct CredentialCache {
    client: reqwest::Client,
    token_url: Url,
    client_id: String,
    credentials: Option<(String, String)>,
    state: Mutex<Option<TokenState>>,
}

impl CredentialCache {
    pub fn new(identity: &Identity) -> Self {
        CredentialCache {
            client: reqwest::Client::new(),
            token_url: identity.token_url.clone(),
            client_id: identity.client_id.clone(),
            credentials: identity.credentials(),
            state: Mutex::new(None),
        }
    }

    /// Returns a usable access token, refreshing or logging in as needed.
    pub async fn bearer_token(&self) -> Result<String, AuthError> {
        let mut state = self.state.lock().await;

        if let Some(token) = state.as_ref().and_then(TokenState::usable_access_token) {
            return Ok(token.to_string());
        }

        if let Some(refresh_token) = state
            .as_ref()
            .and_then(TokenState::usable_refresh_token)
            .map(str::to_string)
        {
            let form = [
                ("grant_type", Grant::Refresh.as_str()),
                ("client_id", self.client_id.as_str()),
                ("refresh_token", refresh_token.as_str()),
            ];
            match self.request_token(Grant::Refresh, &form).await {
                Ok(response) => {
                    let token = response.access_token.clone();
                    *state = Some(TokenState::from_response(response));
                    return Ok(token);
                }
                Err(e) => {
                    tracing::warn!("refresh failed - falling back to password: {e}");
                }
            }
        }

        let (username, password) = self
            .credentials
            .as_ref()
            .ok_or(AuthError::MissingCredentials)?;
        let form = [
            ("grant_type", Grant::Password.as_str()),
            ("client_id", self.client_id.as_str()),
            ("username", username.as_str()),
            ("password", password.as_str()),
        ];
        let response = self.request_token(Grant::Password, &form).await?;
        let token = response.access_token.clone();
        *state = Some(TokenState::from_response(response));
        tracing::info!("obtained register access token");
        Ok(token)
    }

    async fn request_token(
        &self,
        grant: Grant,
        form: &[(&str, &str)],
    ) -> Result<TokenResponse, AuthError> {
        let result = self.send_token_request(form).await;
        let outcome = if result.is_ok() { "ok" } else { "error" };
        counter!(TOKEN_GRANTS, "grant" => grant.as_str(), "outcome" => outcome).increment(1);
        result
    }

    async fn send_token_request(&self, form: &[(&str, &str)]) -> Result<TokenResponse, AuthError> {
        let response = self
            .client
            .post(self.token_url.clone())
            .form(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json::<TokenResponse>().await?)
    }

    /// Moves the time the current token was obtained into the past.
    #[cfg(test)]
    pub(crate) async fn age_token(&self, by: Duration) {
        if let Some(state) = self.state.lock().await.as_mut() {
            state.obtained_at = state
                .obtained_at
                .checked_sub(by)
                .expect("instant can be moved back");
        }
    }
}
