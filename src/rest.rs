use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};

use crate::common::{Backoff, ClientError, Result};

const DEFAULT_BASE_URL: &str = "https://discord.com/api/v10";
const REQUEST_TIMEOUT_SECS: u64 = 10;
const MAX_REQUEST_ATTEMPTS: u32 = 3;

/// Authenticated HTTP client for the non-realtime API surface. Rate limits
/// (429) are honored by sleeping out the advertised window and retrying;
/// transient server errors retry through backoff; auth failures do not.
pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl RestClient {
    pub fn new(token: impl Into<String>) -> Result<Self> {
        Self::with_base_url(token, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(token: impl Into<String>, base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!(
                env!("CARGO_PKG_NAME"),
                "/",
                env!("CARGO_PKG_VERSION")
            ))
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    pub async fn get(&self, path: &str) -> Result<Value> {
        self.request(Method::GET, path, None).await
    }

    pub async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        self.request(Method::POST, path, Some(body)).await
    }

    pub async fn patch(&self, path: &str, body: &Value) -> Result<Value> {
        self.request(Method::PATCH, path, Some(body)).await
    }

    pub async fn put(&self, path: &str, body: &Value) -> Result<Value> {
        self.request(Method::PUT, path, Some(body)).await
    }

    pub async fn delete(&self, path: &str) -> Result<Value> {
        self.request(Method::DELETE, path, None).await
    }

    async fn request(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value> {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let mut backoff = Backoff::with_max_attempts(MAX_REQUEST_ATTEMPTS);

        loop {
            let mut request = self
                .http
                .request(method.clone(), &url)
                .header("Authorization", format!("Bot {}", self.token));
            if let Some(body) = body {
                request = request.json(body);
            }

            let response = match request.send().await {
                Ok(r) => r,
                Err(e) if backoff.is_exhausted() => return Err(e.into()),
                Err(e) => {
                    let delay = backoff.next();
                    warn!("{method} {url} failed: {e}; retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            let status = response.status();
            match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    return Err(ClientError::Auth(format!("{method} {url}: {status}")));
                }
                StatusCode::TOO_MANY_REQUESTS => {
                    let wait = retry_after(&response);
                    if backoff.is_exhausted() {
                        return Err(ClientError::RateLimited(wait));
                    }
                    backoff.next();
                    debug!("{method} {url} rate limited, waiting {wait:?}");
                    tokio::time::sleep(wait).await;
                    continue;
                }
                s if s.is_server_error() => {
                    if backoff.is_exhausted() {
                        return Err(ClientError::Transport(format!("{method} {url}: {status}")));
                    }
                    let delay = backoff.next();
                    warn!("{method} {url}: {status}; retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                    continue;
                }
                s if !s.is_success() => {
                    let text = response.text().await.unwrap_or_default();
                    return Err(ClientError::Protocol(format!(
                        "{method} {url}: {status}: {text}"
                    )));
                }
                _ => {}
            }

            if status == StatusCode::NO_CONTENT {
                return Ok(Value::Null);
            }
            return Ok(response.json().await?);
        }
    }
}

/// Rate-limit window from the `Retry-After` header (seconds, possibly
/// fractional), defaulting to one second when absent or unparsable.
fn retry_after(response: &reqwest::Response) -> Duration {
    response
        .headers()
        .get("Retry-After")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<f64>().ok())
        .map(Duration::from_secs_f64)
        .unwrap_or(Duration::from_secs(1))
}
