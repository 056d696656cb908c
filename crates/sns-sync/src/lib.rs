//! Ingestion: fail-closed batch upserts and the periodic fetch cycle.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sns_adapters::{FeedClient, FeedError};
use sns_core::{parse_published, Article, BulkResult};
use sns_storage::{ArticleStore, StoreError, UpsertOp};
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

mod scheduler;

pub use scheduler::{spawn_ingestion_loop, SchedulerHandle};

pub const CRATE_NAME: &str = "sns-sync";

#[derive(Debug, Error)]
pub enum UpsertError {
    #[error("article {business_id} has unparsable publish date {value:?}: {source}")]
    MalformedRecord {
        business_id: String,
        value: String,
        #[source]
        source: chrono::ParseError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Turns a batch of feed articles into keyed store writes.
#[derive(Clone)]
pub struct UpsertEngine {
    store: Arc<dyn ArticleStore>,
}

impl UpsertEngine {
    pub fn new(store: Arc<dyn ArticleStore>) -> Self {
        Self { store }
    }

    pub async fn upsert(&self, batch: &[Article]) -> Result<BulkResult, UpsertError> {
        self.upsert_at(batch, Utc::now()).await
    }

    /// Validates every record before the store sees any of them.
    pub async fn upsert_at(
        &self,
        batch: &[Article],
        now: DateTime<Utc>,
    ) -> Result<BulkResult, UpsertError> {
        let ops = prepare_batch(batch, now)?;
        if ops.is_empty() {
            return Ok(BulkResult::default());
        }
        let submitted = ops.len();
        let result = self.store.bulk_upsert(ops).await?;
        info!(
            submitted,
            inserted = result.inserted_count,
            upserted = result.upserted_count,
            "batch upserted"
        );
        Ok(result)
    }
}

/// One op per business id; a later occurrence replaces an earlier one in place.
pub fn prepare_batch(batch: &[Article], now: DateTime<Utc>) -> Result<Vec<UpsertOp>, UpsertError> {
    let mut ops: Vec<UpsertOp> = Vec::with_capacity(batch.len());
    let mut positions: HashMap<&str, usize> = HashMap::with_capacity(batch.len());

    for article in batch {
        let published_at =
            parse_published(&article.published).map_err(|source| UpsertError::MalformedRecord {
                business_id: article.business_id.clone(),
                value: article.published.clone(),
                source,
            })?;
        let op = UpsertOp {
            business_id: article.business_id.clone(),
            published_at,
            created_at: now,
            article: article.clone(),
        };
        match positions.get(article.business_id.as_str()) {
            Some(&index) => {
                debug!(business_id = %article.business_id, "duplicate key in batch, keeping last");
                ops[index] = op;
            }
            None => {
                positions.insert(article.business_id.as_str(), ops.len());
                ops.push(op);
            }
        }
    }
    Ok(ops)
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("feed fetch failed: {0}")]
    Feed(#[from] FeedError),
    #[error("upsert failed: {0}")]
    Upsert(#[from] UpsertError),
}

#[derive(Debug)]
pub enum CycleOutcome {
    /// The feed returned no items; the store was not called.
    Empty,
    Written(BulkResult),
    Failed(CycleError),
}

#[derive(Debug)]
pub struct CycleReport {
    pub run_id: Uuid,
    pub fetched: usize,
    pub outcome: CycleOutcome,
}

impl CycleReport {
    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, CycleOutcome::Failed(_))
    }

    pub fn into_result(self) -> Result<BulkResult, CycleError> {
        match self.outcome {
            CycleOutcome::Empty => Ok(BulkResult::default()),
            CycleOutcome::Written(result) => Ok(result),
            CycleOutcome::Failed(err) => Err(err),
        }
    }
}

/// One fetch followed by one batch upsert.
pub struct IngestionCycle {
    feed: Arc<dyn FeedClient>,
    engine: UpsertEngine,
    page_size: u32,
}

impl IngestionCycle {
    pub fn new(feed: Arc<dyn FeedClient>, store: Arc<dyn ArticleStore>, page_size: u32) -> Self {
        Self {
            feed,
            engine: UpsertEngine::new(store),
            page_size,
        }
    }

    pub async fn run_once(&self) -> CycleReport {
        let run_id = Uuid::new_v4();
        let span = info_span!("ingest_cycle", %run_id, page_size = self.page_size);
        async move {
            let articles = match self.feed.fetch(self.page_size).await {
                Ok(articles) => articles,
                Err(err) => {
                    warn!(error = %err, "feed fetch failed, skipping cycle");
                    return CycleReport {
                        run_id,
                        fetched: 0,
                        outcome: CycleOutcome::Failed(err.into()),
                    };
                }
            };

            let fetched = articles.len();
            if articles.is_empty() {
                info!("feed returned no articles, nothing to write");
                return CycleReport {
                    run_id,
                    fetched,
                    outcome: CycleOutcome::Empty,
                };
            }

            let outcome = match self.engine.upsert(&articles).await {
                Ok(result) => CycleOutcome::Written(result),
                Err(err) => {
                    error!(error = %err, fetched, "ingestion cycle failed");
                    CycleOutcome::Failed(err.into())
                }
            };
            CycleReport {
                run_id,
                fetched,
                outcome,
            }
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;

    pub fn article(id: &str, title: &str, published: &str) -> Article {
        Article {
            business_id: id.to_string(),
            title: title.to_string(),
            published: published.to_string(),
            url: format!("https://www.brentfordfc.com/news/{id}"),
            status: "published".to_string(),
            ..Default::default()
        }
    }

    /// Replays scripted responses; once exhausted it keeps returning the last one.
    pub struct ScriptedFeed {
        responses: Mutex<VecDeque<Result<Vec<Article>, String>>>,
        last: Mutex<Option<Result<Vec<Article>, String>>>,
        calls: AtomicUsize,
    }

    impl ScriptedFeed {
        pub fn new(responses: Vec<Result<Vec<Article>, String>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                last: Mutex::new(None),
                calls: AtomicUsize::new(0),
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl FeedClient for ScriptedFeed {
        async fn fetch(&self, _page_size: u32) -> Result<Vec<Article>, FeedError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.responses.lock().unwrap().pop_front();
            let response = match next {
                Some(response) => {
                    *self.last.lock().unwrap() = Some(response.clone());
                    response
                }
                None => self.last.lock().unwrap().clone().unwrap_or(Ok(Vec::new())),
            };
            response.map_err(FeedError::Decode)
        }
    }
}
