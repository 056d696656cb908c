use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sns_core::{Article, BulkResult, QueryResult, RetentionPolicy, StoreConfig};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

use crate::{ArticleStore, StoreError, UpsertOp};

/// Rows per INSERT statement; six binds per row keeps each statement under the protocol's bind limit.
pub const UPSERT_CHUNK_ROWS: usize = 1000;

#[derive(Debug, Clone)]
pub struct PgArticleStore {
    pool: PgPool,
    table: String,
}

#[derive(Debug, sqlx::FromRow)]
struct ArticleRow {
    id: Uuid,
    business_id: String,
    published_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    data: Json<Article>,
}

impl From<ArticleRow> for QueryResult {
    fn from(row: ArticleRow) -> Self {
        QueryResult {
            id: row.id,
            business_id: row.business_id,
            published_at: row.published_at,
            created_at: row.created_at,
            data: row.data.0,
        }
    }
}

impl PgArticleStore {
    /// Connect and ping; failure here is fatal for the process.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(config.connect_timeout())
            .connect_with(connect_options(config)?)
            .await
            .map_err(StoreError::Unavailable)?;
        let store = Self::with_pool(pool, &config.collection);
        store.ping().await?;
        Ok(store)
    }

    /// `table` must already be a validated SQL identifier.
    pub fn with_pool(pool: PgPool, table: &str) -> Self {
        Self {
            pool,
            table: table.to_string(),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn select_columns(&self) -> String {
        format!(
            r#"SELECT id, business_id, published_at, created_at, data FROM "{}""#,
            self.table
        )
    }

    fn schema_statements(&self) -> [String; 3] {
        let table = &self.table;
        [
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS "{table}" (
                    id UUID PRIMARY KEY,
                    business_id TEXT NOT NULL,
                    published_at TIMESTAMPTZ NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL,
                    status TEXT NOT NULL,
                    data JSONB NOT NULL
                )
                "#
            ),
            format!(
                r#"CREATE UNIQUE INDEX IF NOT EXISTS "{table}_business_id_key" ON "{table}" (business_id)"#
            ),
            format!(
                r#"CREATE INDEX IF NOT EXISTS "{table}_published_at_idx" ON "{table}" (published_at)"#
            ),
        ]
    }

    async fn upsert_chunk(&self, chunk: &[UpsertOp]) -> Result<BulkResult, StoreError> {
        let mut builder: QueryBuilder<'_, Postgres> = QueryBuilder::new(format!(
            r#"INSERT INTO "{}" (id, business_id, published_at, created_at, status, data) "#,
            self.table
        ));
        builder.push_values(chunk, |mut row, op| {
            row.push_bind(Uuid::new_v4())
                .push_bind(op.business_id.as_str())
                .push_bind(op.published_at)
                .push_bind(op.created_at)
                .push_bind(op.article.status.as_str())
                .push_bind(Json(&op.article));
        });
        builder.push(
            r#"
             ON CONFLICT (business_id) DO UPDATE
                SET published_at = EXCLUDED.published_at,
                    created_at = EXCLUDED.created_at,
                    status = EXCLUDED.status,
                    data = EXCLUDED.data
            RETURNING (xmax = 0) AS inserted
            "#,
        );

        let rows = builder.build().fetch_all(&self.pool).await?;
        let mut result = BulkResult::default();
        for row in rows {
            let inserted: bool = row.try_get("inserted")?;
            if inserted {
                result.inserted_count += 1;
            } else {
                result.upserted_count += 1;
            }
        }
        Ok(result)
    }
}

/// A full URL wins; otherwise the discrete fields are used as-is, so credentials need no escaping.
pub fn connect_options(config: &StoreConfig) -> Result<PgConnectOptions, StoreError> {
    if let Some(url) = &config.url {
        return url.parse().map_err(StoreError::Unavailable);
    }
    Ok(PgConnectOptions::new()
        .host(&config.host)
        .port(config.port)
        .username(&config.username)
        .password(&config.password)
        .database(&config.database))
}

#[async_trait]
impl ArticleStore for PgArticleStore {
    async fn declare_retention(&self, policy: RetentionPolicy) -> Result<(), StoreError> {
        let span = info_span!(
            "declare_retention",
            table = %self.table,
            expire_after_seconds = policy.ttl_secs()
        );
        async {
            for statement in self.schema_statements() {
                sqlx::query(&statement).execute(&self.pool).await?;
            }
            Ok::<(), StoreError>(())
        }
        .instrument(span)
        .await
    }

    async fn bulk_upsert(&self, ops: Vec<UpsertOp>) -> Result<BulkResult, StoreError> {
        let mut committed = BulkResult::default();
        let mut failures = Vec::new();

        // Chunks are independent statements: one failing chunk does not roll back the others.
        for chunk in ops.chunks(UPSERT_CHUNK_ROWS) {
            match self.upsert_chunk(chunk).await {
                Ok(result) => committed = committed.merge(result),
                Err(err) => {
                    warn!(error = %err, rows = chunk.len(), "upsert chunk failed");
                    failures.push(err);
                }
            }
        }

        if failures.is_empty() {
            return Ok(committed);
        }
        let failed_chunks = failures.len();
        let first = failures.swap_remove(0);
        if committed.total() == 0 && failed_chunks == 1 {
            return Err(first);
        }
        Err(StoreError::PartialBatch {
            committed,
            failed_chunks,
            first: Box::new(first),
        })
    }

    async fn list_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<QueryResult>, StoreError> {
        let query = format!(
            "{} WHERE published_at >= $1 ORDER BY published_at DESC, business_id ASC",
            self.select_columns()
        );
        let rows = sqlx::query_as::<_, ArticleRow>(&query)
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn find_by_business_id(
        &self,
        business_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<QueryResult>, StoreError> {
        let query = format!(
            "{} WHERE business_id = $1 AND published_at >= $2",
            self.select_columns()
        );
        let row = sqlx::query_as::<_, ArticleRow>(&query)
            .bind(business_id)
            .bind(cutoff)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    async fn purge_expired(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let query = format!(r#"DELETE FROM "{}" WHERE published_at < $1"#, self.table);
        let done = sqlx::query(&query).bind(cutoff).execute(&self.pool).await?;
        Ok(done.rows_affected())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(StoreError::Unavailable)?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
