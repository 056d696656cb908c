//! Core domain model for the sports news storage service.

use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod config;

pub use config::{
    AppConfig, AppSection, ConfigError, FeedConfig, LogFormat, LoggerConfig, SchedulerConfig,
    ServerConfig, StoreBackend, StoreConfig,
};

pub const CRATE_NAME: &str = "sns-core";

/// Date-time layout used by the feed for `PublishDate`. Values carry no zone and are read as UTC.
pub const PUBLISH_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Parse a feed publish date into the retention timestamp.
pub fn parse_published(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    NaiveDateTime::parse_from_str(value.trim(), PUBLISH_DATE_FORMAT).map(|naive| naive.and_utc())
}

/// A news article as produced by the feed and written by the ingestion cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Article {
    #[serde(rename = "id")]
    pub business_id: String,
    pub team_id: String,
    pub opta_match_id: Option<String>,
    pub title: String,
    #[serde(rename = "type")]
    pub kind: Vec<String>,
    pub teaser: Option<String>,
    pub content: String,
    pub url: String,
    pub image_url: String,
    pub gallery_urls: Option<Vec<String>>,
    pub video_url: Option<String>,
    /// Raw feed value in [`PUBLISH_DATE_FORMAT`].
    pub published: String,
    pub status: String,
}

/// Read projection of a stored article.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    /// Store-assigned row identifier.
    pub id: Uuid,
    #[serde(rename = "articleId")]
    pub business_id: String,
    pub published_at: DateTime<Utc>,
    /// Last write time; refreshed on every upsert.
    pub created_at: DateTime<Utc>,
    pub data: Article,
}

/// Aggregate outcome of a bulk upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BulkResult {
    /// Business keys that were not stored before the batch.
    pub inserted_count: u64,
    /// Stored business keys that were overwritten in place.
    pub upserted_count: u64,
}

impl BulkResult {
    pub fn total(&self) -> u64 {
        self.inserted_count + self.upserted_count
    }

    pub fn merge(self, other: BulkResult) -> BulkResult {
        BulkResult {
            inserted_count: self.inserted_count + other.inserted_count,
            upserted_count: self.upserted_count + other.upserted_count,
        }
    }
}

/// Rolling time-to-live window measured from an article's publish time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    ttl: Duration,
}

impl RetentionPolicy {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn ttl_secs(&self) -> u64 {
        self.ttl.as_secs()
    }

    /// Oldest `published_at` still visible at `now`.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match chrono::Duration::from_std(self.ttl) {
            Ok(ttl) => now.checked_sub_signed(ttl).unwrap_or(DateTime::<Utc>::MIN_UTC),
            Err(_) => DateTime::<Utc>::MIN_UTC,
        }
    }

    pub fn is_retained(&self, published_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        published_at >= self.cutoff(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn publish_dates_parse_as_utc() {
        let parsed = parse_published("2022-07-04 13:00:00").unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2022, 7, 4, 13, 0, 0).unwrap());
    }

    #[test]
    fn publish_dates_reject_other_layouts() {
        assert!(parse_published("2022-07-04T13:00:00Z").is_err());
        assert!(parse_published("04/07/2022 13:00").is_err());
        assert!(parse_published("").is_err());
    }

    #[test]
    fn retention_cutoff_is_inclusive() {
        let policy = RetentionPolicy::new(Duration::from_secs(3600));
        let now = Utc.with_ymd_and_hms(2022, 7, 4, 13, 0, 0).unwrap();
        let boundary = Utc.with_ymd_and_hms(2022, 7, 4, 12, 0, 0).unwrap();
        assert_eq!(policy.cutoff(now), boundary);
        assert!(policy.is_retained(boundary, now));
        assert!(!policy.is_retained(boundary - chrono::Duration::seconds(1), now));
    }

    #[test]
    fn bulk_results_merge_counts() {
        let merged = BulkResult { inserted_count: 2, upserted_count: 1 }
            .merge(BulkResult { inserted_count: 0, upserted_count: 3 });
        assert_eq!(merged, BulkResult { inserted_count: 2, upserted_count: 4 });
        assert_eq!(merged.total(), 6);
    }

    #[test]
    fn article_serializes_with_feed_field_names() {
        let article = Article {
            business_id: "645168".into(),
            kind: vec!["news".into()],
            published: "2022-07-04 13:00:00".into(),
            ..Default::default()
        };
        let value = serde_json::to_value(&article).unwrap();
        assert_eq!(value["id"], "645168");
        assert_eq!(value["type"][0], "news");
        assert!(value["optaMatchId"].is_null());
        assert_eq!(value["published"], "2022-07-04 13:00:00");
    }
}
