use std::time::Duration;

use reqwest::StatusCode;
use tracing::{debug, info_span, warn, Instrument};

use crate::FeedError;

/// Capped exponential delay between feed retries.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `retry` (zero-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let multiplier = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(multiplier)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub(crate) struct FeedBody {
    pub final_url: String,
    pub bytes: Vec<u8>,
}

/// Upstream overload or outage; anything else in 4xx is the caller's fault.
fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

fn is_transient_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

/// GET client for the feed endpoint with bounded retries.
#[derive(Debug, Clone)]
pub(crate) struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub(crate) fn new(config: HttpClientConfig) -> Result<Self, FeedError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = config.user_agent {
            builder = builder.user_agent(user_agent);
        }
        Ok(Self {
            client: builder.build()?,
            backoff: config.backoff,
        })
    }

    pub(crate) async fn get(&self, url: &str) -> Result<FeedBody, FeedError> {
        let span = info_span!("http_fetch", url);
        self.get_with_retries(url).instrument(span).await
    }

    async fn get_with_retries(&self, url: &str) -> Result<FeedBody, FeedError> {
        let mut retry = 0;
        loop {
            let (transient, err) = match self.client.get(url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let final_url = resp.url().to_string();
                    let status = resp.status();
                    let bytes = resp.bytes().await?.to_vec();
                    debug!(%status, bytes = bytes.len(), "feed response received");
                    return Ok(FeedBody { final_url, bytes });
                }
                Ok(resp) => {
                    let status = resp.status();
                    let err = FeedError::HttpStatus {
                        status: status.as_u16(),
                        url: resp.url().to_string(),
                    };
                    (is_transient_status(status), err)
                }
                Err(err) => (is_transient_error(&err), FeedError::Request(err)),
            };

            if !transient || retry >= self.backoff.max_retries {
                return Err(err);
            }
            let delay = self.backoff.delay_for(retry);
            warn!(error = %err, retry, delay_ms = delay.as_millis() as u64, "transient feed failure, retrying");
            tokio::time::sleep(delay).await;
            retry += 1;
        }
    }
}
