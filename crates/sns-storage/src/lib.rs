//! Article persistence: the store contract, retention policy and read-side queries.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sns_core::{Article, BulkResult, QueryResult, RetentionPolicy};
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, warn, Instrument, Span};

mod memory;
mod postgres;

pub use memory::MemoryArticleStore;
pub use postgres::{PgArticleStore, UPSERT_CHUNK_ROWS};
pub use sqlx::Error as SqlxError;

pub const CRATE_NAME: &str = "sns-storage";

/// One keyed write: insert the article, or overwrite the stored one with the same business id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertOp {
    pub business_id: String,
    pub published_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub article: Article,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(#[source] sqlx::Error),
    #[error("store query failed: {0}")]
    Query(#[source] sqlx::Error),
    #[error("{failed_chunks} of the batch chunks failed after committing {committed:?}: {first}")]
    PartialBatch {
        committed: BulkResult,
        failed_chunks: usize,
        first: Box<StoreError>,
    },
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        match self {
            StoreError::Unavailable(_) => true,
            StoreError::PartialBatch { first, .. } => first.is_unavailable(),
            _ => false,
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Unavailable(err),
            other => StoreError::Query(other),
        }
    }
}

/// Storage seam shared by the ingestion cycle and the request handlers.
#[async_trait]
pub trait ArticleStore: Send + Sync {
    /// Idempotently declare the business-key uniqueness and the expiry index.
    async fn declare_retention(&self, policy: RetentionPolicy) -> Result<(), StoreError>;

    /// Apply the operations as one unordered batch. Callers pass at most one op per business id.
    async fn bulk_upsert(&self, ops: Vec<UpsertOp>) -> Result<BulkResult, StoreError>;

    /// Articles with `published_at >= cutoff`, newest first.
    async fn list_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<QueryResult>, StoreError>;

    async fn find_by_business_id(
        &self,
        business_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<QueryResult>, StoreError>;

    /// Physically remove articles published before `cutoff`; returns the number removed.
    async fn purge_expired(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;

    async fn close(&self) {}
}

/// Establishes the expiry policy once at startup and runs the background sweep.
pub struct RetentionManager {
    store: Arc<dyn ArticleStore>,
    policy: RetentionPolicy,
    sweep_interval: Duration,
}

impl RetentionManager {
    pub fn new(store: Arc<dyn ArticleStore>, policy: RetentionPolicy, sweep_interval: Duration) -> Self {
        Self {
            store,
            policy,
            sweep_interval,
        }
    }

    pub fn policy(&self) -> RetentionPolicy {
        self.policy
    }

    pub async fn declare(&self) -> Result<(), StoreError> {
        self.store.declare_retention(self.policy).await?;
        info!(
            expire_after_seconds = self.policy.ttl_secs(),
            "retention policy declared"
        );
        Ok(())
    }

    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        sweep(self.store.as_ref(), self.policy, now).await
    }

    /// Register the periodic expiry sweep and start its scheduler.
    pub async fn start_sweeper(&self) -> anyhow::Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating retention scheduler")?;
        let store = Arc::clone(&self.store);
        let policy = self.policy;
        let span = Span::current();
        let job = Job::new_repeated_async(self.sweep_interval, move |_uuid, _l| {
            let store = Arc::clone(&store);
            Box::pin(
                async move {
                    if let Err(err) = sweep(store.as_ref(), policy, Utc::now()).await {
                        warn!(error = %err, "retention sweep failed");
                    }
                }
                .instrument(span.clone()),
            )
        })
        .context("creating retention sweep job")?;
        sched.add(job).await.context("adding retention sweep job")?;
        sched.start().await.context("starting retention scheduler")?;
        Ok(sched)
    }
}

async fn sweep(
    store: &dyn ArticleStore,
    policy: RetentionPolicy,
    now: DateTime<Utc>,
) -> Result<u64, StoreError> {
    let cutoff = policy.cutoff(now);
    let removed = store.purge_expired(cutoff).await?;
    if removed > 0 {
        info!(removed, %cutoff, "expired articles removed");
    } else {
        debug!(%cutoff, "no expired articles");
    }
    Ok(removed)
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("article id ({0}) does not exist")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Read-side access restricted to the retention window.
#[derive(Clone)]
pub struct QueryService {
    store: Arc<dyn ArticleStore>,
    policy: RetentionPolicy,
}

impl QueryService {
    pub fn new(store: Arc<dyn ArticleStore>, policy: RetentionPolicy) -> Self {
        Self { store, policy }
    }

    pub async fn list_recent(&self) -> Result<Vec<QueryResult>, QueryError> {
        self.list_recent_at(Utc::now()).await
    }

    pub async fn list_recent_at(&self, now: DateTime<Utc>) -> Result<Vec<QueryResult>, QueryError> {
        Ok(self.store.list_since(self.policy.cutoff(now)).await?)
    }

    pub async fn get_by_business_id(&self, business_id: &str) -> Result<QueryResult, QueryError> {
        self.get_by_business_id_at(business_id, Utc::now()).await
    }

    pub async fn get_by_business_id_at(
        &self,
        business_id: &str,
        now: DateTime<Utc>,
    ) -> Result<QueryResult, QueryError> {
        self.store
            .find_by_business_id(business_id, self.policy.cutoff(now))
            .await?
            .ok_or_else(|| QueryError::NotFound(business_id.to_string()))
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        self.store.ping().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2022, 7, 4, hour, minute, 0).single().unwrap()
    }

    fn op(id: &str, title: &str, published_at: DateTime<Utc>) -> UpsertOp {
        UpsertOp {
            business_id: id.to_string(),
            published_at,
            created_at: at(14, 0),
            article: Article {
                business_id: id.to_string(),
                title: title.to_string(),
                published: published_at.format(sns_core::PUBLISH_DATE_FORMAT).to_string(),
                status: "success".to_string(),
                ..Default::default()
            },
        }
    }

    fn services(ttl_hours: u64) -> (Arc<MemoryArticleStore>, QueryService, RetentionManager) {
        let store = Arc::new(MemoryArticleStore::new());
        let policy = RetentionPolicy::new(Duration::from_secs(ttl_hours * 3600));
        let query = QueryService::new(store.clone(), policy);
        let retention = RetentionManager::new(store.clone(), policy, Duration::from_secs(60));
        (store, query, retention)
    }

    #[tokio::test]
    async fn list_recent_is_newest_first() {
        let (store, query, _) = services(24);
        store
            .bulk_upsert(vec![
                op("2", "earlier", at(11, 0)),
                op("1", "later", at(13, 0)),
                op("3", "middle", at(12, 0)),
            ])
            .await
            .unwrap();

        let ids: Vec<_> = query
            .list_recent_at(at(15, 0))
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.business_id)
            .collect();
        assert_eq!(ids, vec!["1", "3", "2"]);
    }

    #[tokio::test]
    async fn expired_articles_are_invisible_before_the_sweep() {
        let (store, query, _) = services(1);
        store
            .bulk_upsert(vec![op("old", "old", at(10, 0)), op("new", "new", at(12, 30))])
            .await
            .unwrap();

        let now = at(13, 0);
        let ids: Vec<_> = query
            .list_recent_at(now)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.business_id)
            .collect();
        assert_eq!(ids, vec!["new"]);
        assert!(matches!(
            query.get_by_business_id_at("old", now).await,
            Err(QueryError::NotFound(id)) if id == "old"
        ));
        assert_eq!(store.len(), 2, "physical removal is left to the sweep");
    }

    #[tokio::test]
    async fn lookup_returns_exact_match_or_not_found() {
        let (store, query, _) = services(24);
        store
            .bulk_upsert(vec![op("645168", "Support Technician", at(13, 0))])
            .await
            .unwrap();

        let found = query.get_by_business_id_at("645168", at(14, 0)).await.unwrap();
        assert_eq!(found.business_id, "645168");
        assert_eq!(found.data.title, "Support Technician");

        assert!(matches!(
            query.get_by_business_id_at("64516", at(14, 0)).await,
            Err(QueryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn sweep_removes_only_expired_rows() {
        let (store, query, retention) = services(1);
        retention.declare().await.unwrap();
        store
            .bulk_upsert(vec![op("old", "old", at(10, 0)), op("new", "new", at(12, 30))])
            .await
            .unwrap();

        let removed = retention.sweep_once(at(13, 0)).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.len(), 1);
        assert_eq!(query.list_recent_at(at(13, 0)).await.unwrap().len(), 1);
        assert_eq!(retention.sweep_once(at(13, 0)).await.unwrap(), 0);
    }

    #[test]
    fn partial_batch_reports_unavailability_of_first_failure() {
        let err = StoreError::PartialBatch {
            committed: BulkResult::default(),
            failed_chunks: 1,
            first: Box::new(StoreError::Unavailable(sqlx::Error::PoolTimedOut)),
        };
        assert!(err.is_unavailable());
        assert!(!StoreError::Query(sqlx::Error::RowNotFound).is_unavailable());
    }
}
