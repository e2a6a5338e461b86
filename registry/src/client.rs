use crate::auth::{AuthError, CredentialCache};
use crate::config::Config;
use crate::extract::extract_fields;
use crate::metrics_defs::{REGISTRY_LOOKUP_DURATION, REGISTRY_LOOKUPS, REGISTRY_RETRIES};
use crate::request::{build_request_xml, contains_identifier, normalize_query};
use crate::retry::{RetryPolicy, parse_retry_after};
use crate::types::RegistryRecord;
use async_trait::async_trait;
use http::header::{ACCEPT, CONTENT_TYPE};
use shared::{counter, histogram};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::AcquireError;
use tokio::time::{Instant, sleep};
use url::Url;

/// Longest response body excerpt kept in a lookup error.
const MAX_ERROR_BODY_CHARS: usize = 300;

#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
    #[error("{0}")]
    Auth(#[from] AuthError),
    #[error("register API error {status}: {body}")]
    Lookup { status: u16, body: String },
    #[error("No exact PublicationNumber match for {0}")]
    NoMatch(String),
    #[error("Invalid EP format: {0}")]
    Format(String),
    #[error("register request failed: {0}")]
    ReqwestError(#[from] reqwest::Error),
    #[error("rate limiter closed: {0}")]
    LimiterClosed(#[from] AcquireError),
}

/// Anything that can resolve a patent identifier to its register record.
#[async_trait]
pub trait Registry: Send + Sync {
    async fn lookup(&self, identifier: &str) -> Result<RegistryRecord, RegistryError>;
}

pub struct RegistryClient {
    client: reqwest::Client,
    api_url: Url,
    credentials: Arc<CredentialCache>,
    retry: RetryPolicy,
}

impl RegistryClient {
    pub fn new(
        api_url: Url,
        timeout: Duration,
        credentials: Arc<CredentialCache>,
        retry: RetryPolicy,
    ) -> Result<Self, RegistryError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(RegistryClient {
            client,
            api_url,
            credentials,
            retry,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, RegistryError> {
        RegistryClient::new(
            config.registry.api_url.clone(),
            Duration::from_secs(config.registry.timeout_secs),
            Arc::new(CredentialCache::new(&config.identity)),
            RetryPolicy::new(config.retry),
        )
    }

    /// Sends the search, retrying transient failures, and returns the raw
    /// response body of the first successful attempt.
    async fn search(&self, query: &str) -> Result<String, RegistryError> {
        let mut attempt: u32 = 0;

        loop {
            let token = self.credentials.bearer_token().await?;
            let response = self
                .client
                .post(self.api_url.clone())
                .header(CONTENT_TYPE, "application/xml")
                .header(ACCEPT, "application/xml")
                .bearer_auth(token)
                .body(build_request_xml(query))
                .send()
                .await?;

            let status = response.status();
            if status.is_success() {
                return Ok(response.text().await?);
            }

            let retry_after = parse_retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();

            let Some(delay) = self.retry.delay_for(status, attempt, retry_after) else {
                return Err(RegistryError::Lookup {
                    status: status.as_u16(),
                    body: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
                });
            };

            tracing::warn!(
                status = status.as_u16(),
                attempt,
                backoff_ms = delay.as_millis() as u64,
                "transient register error - retrying"
            );
            counter!(REGISTRY_RETRIES, "status" => status.as_str().to_string()).increment(1);
            sleep(delay).await;
            attempt = attempt.saturating_add(1);
        }
    }
}

#[async_trait]
impl Registry for RegistryClient {
    async fn lookup(&self, identifier: &str) -> Result<RegistryRecord, RegistryError> {
        let started = Instant::now();
        let query = normalize_query(identifier);

        let result = self.search(&query).await.and_then(|xml| {
            if contains_identifier(&xml, &query) {
                Ok(extract_fields(&xml))
            } else {
                Err(RegistryError::NoMatch(query.clone()))
            }
        });

        let outcome = match &result {
            Ok(_) => "ok",
            Err(RegistryError::NoMatch(_)) => "no_match",
            Err(_) => "error",
        };
        counter!(REGISTRY_LOOKUPS, "outcome" => outcome).increment(1);
        histogram!(REGISTRY_LOOKUP_DURATION).record(started.elapsed().as_secs_f64());

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Identity, Retry};
    use crate::testutils::{MockResponse, search_response, spawn_mock_server};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TOKEN_BODY: &str =
        r#"{"access_token":"t-1","refresh_token":"r-1","expires_in":300,"refresh_expires_in":1800}"#;

    fn test_retry() -> Retry {
        Retry {
            base_delay_ms: 100,
            jitter_ms: 50,
            rate_limited_jitter_ms: 10,
            ..Retry::default()
        }
    }

    async fn client_with_responses(
        statuses: Vec<(u16, String)>,
        retry: Retry,
    ) -> (RegistryClient, Arc<AtomicUsize>, Arc<Mutex<Vec<Instant>>>) {
        client_with_retry_after(statuses, retry, "0").await
    }

    /// Mock server answering `/token` and, for `/search`, the statuses in
    /// `statuses` in order (the last one repeats). 429 responses carry
    /// `retry_after`.
    async fn client_with_retry_after(
        statuses: Vec<(u16, String)>,
        retry: Retry,
        retry_after: &'static str,
    ) -> (RegistryClient, Arc<AtomicUsize>, Arc<Mutex<Vec<Instant>>>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let call_times = Arc::new(Mutex::new(Vec::new()));
        let calls_clone = calls.clone();
        let times_clone = call_times.clone();

        let base = spawn_mock_server(move |path, body| {
            if path == "/token" {
                return MockResponse::new(200, TOKEN_BODY);
            }
            assert!(body.contains("<Query><Any>"));
            let n = calls_clone.fetch_add(1, Ordering::SeqCst);
            times_clone.lock().unwrap().push(Instant::now());
            let (status, body) = statuses[n.min(statuses.len() - 1)].clone();
            let response = MockResponse::new(status, body);
            if status == 429 {
                response.with_header("retry-after", retry_after)
            } else {
                response
            }
        })
        .await;

        let identity = Identity {
            token_url: Url::parse(&format!("{base}/token")).unwrap(),
            client_id: "test-client".into(),
            username: Some("user".into()),
            password: Some("pass".into()),
        };
        let client = RegistryClient::new(
            Url::parse(&format!("{base}/search")).unwrap(),
            Duration::from_secs(5),
            Arc::new(CredentialCache::new(&identity)),
            RetryPolicy::new(retry),
        )
        .unwrap();

        (client, calls, call_times)
    }

    fn granted(number: &str) -> String {
        search_response(
            number,
            r#"<pat:StatusEventData><pat:EventDate>2020-01-01</pat:EventDate>
               <pat:StatusEventCode><pat:KeyEventCode>GRANT</pat:KeyEventCode></pat:StatusEventCode>
               </pat:StatusEventData>"#,
        )
    }

    #[tokio::test]
    async fn test_lookup_success() {
        let (client, calls, _) =
            client_with_responses(vec![(200, granted("EP1234567"))], test_retry()).await;

        let record = client.lookup(" ep1234567 ").await.unwrap();
        assert_eq!(record.status_code, "GRANT");
        assert_eq!(record.last_change_date, "2020-01-01");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_lookup_requires_exact_match() {
        let (client, _, _) =
            client_with_responses(vec![(200, granted("EP1234568"))], test_retry()).await;

        let err = client.lookup("EP1234567").await.unwrap_err();
        assert!(matches!(err, RegistryError::NoMatch(ref id) if id == "EP1234567"));
        assert_eq!(err.to_string(), "No exact PublicationNumber match for EP1234567");
    }

    #[tokio::test]
    async fn test_transient_error_retried_after_backoff() {
        let (client, calls, call_times) = client_with_responses(
            vec![(503, "unavailable".into()), (200, granted("EP1234567"))],
            test_retry(),
        )
        .await;

        client.lookup("EP1234567").await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let times = call_times.lock().unwrap();
        let gap = times[1] - times[0];
        assert!(gap >= Duration::from_millis(100), "gap was {gap:?}");
        assert!(gap < Duration::from_millis(100 + 50 + 500), "gap was {gap:?}");
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let retry = Retry {
            max_attempts: 2,
            base_delay_ms: 10,
            jitter_ms: 0,
            ..Retry::default()
        };
        let long_body = "x".repeat(1000);
        let (client, calls, _) = client_with_responses(vec![(502, long_body)], retry).await;

        match client.lookup("EP1234567").await {
            Err(RegistryError::Lookup { status, body }) => {
                assert_eq!(status, 502);
                assert_eq!(body.len(), MAX_ERROR_BODY_CHARS);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_rate_limited_then_success() {
        let (client, calls, _) = client_with_responses(
            vec![
                (429, String::new()),
                (429, String::new()),
                (200, granted("EP1234567")),
            ],
            test_retry(),
        )
        .await;

        client.lookup("EP1234567").await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_oversized_retry_after_uses_default_wait() {
        let (client, calls, call_times) = client_with_retry_after(
            vec![(429, String::new()), (200, granted("EP1234567"))],
            test_retry(),
            "1e300",
        )
        .await;

        let record = tokio::spawn(async move { client.lookup("EP1234567").await })
            .await
            .expect("lookup task completes")
            .unwrap();
        assert_eq!(record.status_code, "GRANT");
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let times = call_times.lock().unwrap();
        assert!(times[1] - times[0] >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_client_error_not_retried() {
        let (client, calls, _) =
            client_with_responses(vec![(400, "bad request".into())], test_retry()).await;

        let err = client.lookup("EP1234567").await.unwrap_err();
        assert_eq!(err.to_string(), "register API error 400: bad request");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
