//! Feed client: HTTP transport with retries and the news-list XML decoder.

use async_trait::async_trait;
use sns_core::{Article, FeedConfig};
use thiserror::Error;
use tracing::{debug, info};

mod http;
mod news;

use http::HttpFetcher;

pub use http::{BackoffPolicy, HttpClientConfig};
pub use news::{parse_news_list, NewsItem, NewsList, STATUS_PUBLISHED, STATUS_UNPUBLISHED};

pub const CRATE_NAME: &str = "sns-adapters";

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("feed request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("feed returned HTTP {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("feed document could not be decoded: {0}")]
    Decode(String),
}

/// Source of articles for one ingestion cycle. Implementations persist nothing.
#[async_trait]
pub trait FeedClient: Send + Sync {
    async fn fetch(&self, page_size: u32) -> Result<Vec<Article>, FeedError>;
}

/// Fetches the configured feed URL and decodes the XML envelope.
#[derive(Debug, Clone)]
pub struct HttpFeedClient {
    feed: FeedConfig,
    http: HttpFetcher,
}

impl HttpFeedClient {
    pub fn new(feed: &FeedConfig) -> Result<Self, FeedError> {
        let http = HttpClientConfig {
            timeout: feed.timeout(),
            user_agent: Some(feed.user_agent.clone()),
            backoff: BackoffPolicy {
                max_retries: feed.max_retries,
                ..Default::default()
            },
        };
        Self::with_http_config(feed.clone(), http)
    }

    /// Like [`HttpFeedClient::new`] but with explicit transport settings.
    pub fn with_http_config(feed: FeedConfig, http: HttpClientConfig) -> Result<Self, FeedError> {
        Ok(Self {
            feed,
            http: HttpFetcher::new(http)?,
        })
    }

    pub fn request_url(&self, page_size: u32) -> String {
        self.feed.request_url(page_size)
    }
}

#[async_trait]
impl FeedClient for HttpFeedClient {
    async fn fetch(&self, page_size: u32) -> Result<Vec<Article>, FeedError> {
        let url = self.request_url(page_size);
        let body = self.http.get(&url).await?;
        let list = parse_news_list(&body.bytes)?;
        debug!(
            club = list.club_name.as_deref().unwrap_or_default(),
            url = %body.final_url,
            "feed decoded"
        );
        let articles = list.into_articles();
        info!(items = articles.len(), "feed fetched");
        Ok(articles)
    }
}
