use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sns_core::{BulkResult, QueryResult, RetentionPolicy};
use uuid::Uuid;

use crate::{ArticleStore, StoreError, UpsertOp};

/// Process-local store with the same upsert and retention semantics as the PostgreSQL backend.
///
/// The lock is only taken inside synchronous sections and never held across an await point.
#[derive(Debug, Default)]
pub struct MemoryArticleStore {
    rows: Mutex<HashMap<String, QueryResult>>,
    retention: Mutex<Option<RetentionPolicy>>,
    bulk_upsert_calls: AtomicUsize,
}

impl MemoryArticleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows().is_empty()
    }

    /// Number of `bulk_upsert` calls received, including empty ones.
    pub fn bulk_upsert_calls(&self) -> usize {
        self.bulk_upsert_calls.load(Ordering::SeqCst)
    }

    pub fn declared_retention(&self) -> Option<RetentionPolicy> {
        *self
            .retention
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn rows(&self) -> MutexGuard<'_, HashMap<String, QueryResult>> {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ArticleStore for MemoryArticleStore {
    async fn declare_retention(&self, policy: RetentionPolicy) -> Result<(), StoreError> {
        *self
            .retention
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(policy);
        Ok(())
    }

    async fn bulk_upsert(&self, ops: Vec<UpsertOp>) -> Result<BulkResult, StoreError> {
        self.bulk_upsert_calls.fetch_add(1, Ordering::SeqCst);
        let mut rows = self.rows();
        let mut result = BulkResult::default();
        for op in ops {
            match rows.get_mut(&op.business_id) {
                Some(existing) => {
                    existing.published_at = op.published_at;
                    existing.created_at = op.created_at;
                    existing.data = op.article;
                    result.upserted_count += 1;
                }
                None => {
                    rows.insert(
                        op.business_id.clone(),
                        QueryResult {
                            id: Uuid::new_v4(),
                            business_id: op.business_id,
                            published_at: op.published_at,
                            created_at: op.created_at,
                            data: op.article,
                        },
                    );
                    result.inserted_count += 1;
                }
            }
        }
        Ok(result)
    }

    async fn list_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<QueryResult>, StoreError> {
        let mut out: Vec<QueryResult> = self
            .rows()
            .values()
            .filter(|row| row.published_at >= cutoff)
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            b.published_at
                .cmp(&a.published_at)
                .then_with(|| a.business_id.cmp(&b.business_id))
        });
        Ok(out)
    }

    async fn find_by_business_id(
        &self,
        business_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<QueryResult>, StoreError> {
        Ok(self
            .rows()
            .get(business_id)
            .filter(|row| row.published_at >= cutoff)
            .cloned())
    }

    async fn purge_expired(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut rows = self.rows();
        let before = rows.len();
        rows.retain(|_, row| row.published_at >= cutoff);
        Ok((before - rows.len()) as u64)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use sns_core::Article;

    fn op(id: &str, title: &str, created_hour: u32) -> UpsertOp {
        UpsertOp {
            business_id: id.to_string(),
            published_at: Utc.with_ymd_and_hms(2022, 7, 4, 13, 0, 0).unwrap(),
            created_at: Utc.with_ymd_and_hms(2022, 7, 5, created_hour, 0, 0).unwrap(),
            article: Article {
                business_id: id.to_string(),
                title: title.to_string(),
                published: "2022-07-04 13:00:00".to_string(),
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn upsert_overwrites_in_place_and_keeps_row_id() {
        let store = MemoryArticleStore::new();
        let first = store.bulk_upsert(vec![op("1", "first", 8)]).await.unwrap();
        assert_eq!(first, BulkResult { inserted_count: 1, upserted_count: 0 });
        let original_id = store.rows().get("1").unwrap().id;

        let second = store.bulk_upsert(vec![op("1", "renamed", 9)]).await.unwrap();
        assert_eq!(second, BulkResult { inserted_count: 0, upserted_count: 1 });

        let row = store.rows().get("1").cloned().unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(row.id, original_id);
        assert_eq!(row.data.title, "renamed");
        assert_eq!(row.created_at.format("%H").to_string(), "09");
        assert_eq!(store.bulk_upsert_calls(), 2);
    }

    #[tokio::test]
    async fn declared_policy_is_recorded() {
        let store = MemoryArticleStore::new();
        assert!(store.declared_retention().is_none());
        let policy = RetentionPolicy::new(std::time::Duration::from_secs(30));
        store.declare_retention(policy).await.unwrap();
        store.declare_retention(policy).await.unwrap();
        assert_eq!(store.declared_retention(), Some(policy));
    }
}
