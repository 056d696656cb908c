//! Read-only REST API over the retained articles.

use std::future::{Future, IntoFuture};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use sns_core::QueryResult;
use sns_storage::{QueryError, QueryService};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub const CRATE_NAME: &str = "sns-web";

/// Sort order advertised in every list envelope.
pub const SORT_NEWEST_FIRST: &str = "-published";
const CREATED_AT_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

#[derive(Clone)]
pub struct AppState {
    pub query: QueryService,
    pub service: String,
    pub version: String,
}

impl AppState {
    pub fn new(query: QueryService, service: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            query,
            service: service.into(),
            version: version.into(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub created_at: String,
    pub sort: &'static str,
    pub total_items: usize,
}

#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub status: &'static str,
    pub data: T,
    pub metadata: Metadata,
}

impl<T: Serialize> Envelope<T> {
    fn success(data: T, total_items: usize) -> Self {
        Self {
            status: "success",
            data,
            metadata: Metadata {
                created_at: Utc::now().format(CREATED_AT_FORMAT).to_string(),
                sort: SORT_NEWEST_FIRST,
                total_items,
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub message: String,
    pub details: String,
    pub service: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "errBadRequest",
            ApiError::NotFound(_) => "errNotFound",
            ApiError::Internal(_) => "errInternalServerError",
        }
    }

    fn message(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "bad request",
            ApiError::NotFound(_) => "resource not found",
            ApiError::Internal(_) => "internal server error",
        }
    }

    fn details(&self) -> &str {
        match self {
            ApiError::Validation(d) | ApiError::NotFound(d) | ApiError::Internal(d) => d,
        }
    }

    fn into_response_for(self, service: &str) -> Response {
        let body = ErrorBody {
            message: self.message().to_string(),
            details: self.details().to_string(),
            service: service.to_string(),
            kind: self.kind(),
        };
        (self.status(), Json(body)).into_response()
    }
}

impl From<QueryError> for ApiError {
    fn from(err: QueryError) -> Self {
        match err {
            QueryError::NotFound(id) => {
                debug!(article_id = %id, "article not found");
                ApiError::NotFound(format!("article id ({id}) does not exist"))
            }
            QueryError::Store(err) => {
                error!(error = %err, "article query failed");
                ApiError::Internal(err.to_string())
            }
        }
    }
}

/// Pairs an error with the service name for the error envelope.
struct Failure {
    service: String,
    error: ApiError,
}

impl IntoResponse for Failure {
    fn into_response(self) -> Response {
        self.error.into_response_for(&self.service)
    }
}

fn fail(state: &AppState, error: impl Into<ApiError>) -> Failure {
    Failure {
        service: state.service.clone(),
        error: error.into(),
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/v1/articles", get(list_articles_handler))
        .route("/v1/article/{id}", get(get_article_handler))
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .with_state(Arc::new(state))
}

async fn list_articles_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Envelope<Vec<QueryResult>>>, Failure> {
    let articles = state
        .query
        .list_recent()
        .await
        .map_err(|err| fail(&state, err))?;
    let total = articles.len();
    Ok(Json(Envelope::success(articles, total)))
}

async fn get_article_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Envelope<QueryResult>>, Failure> {
    if id.parse::<i32>().is_err() {
        return Err(fail(
            &state,
            ApiError::Validation(format!("article id ({id}) must be a 32-bit integer")),
        ));
    }
    let article = state
        .query
        .get_by_business_id(&id)
        .await
        .map_err(|err| fail(&state, err))?;
    Ok(Json(Envelope::success(article, 1)))
}

async fn health_handler() -> StatusCode {
    StatusCode::OK
}

#[derive(Debug, Serialize)]
struct VersionBody<'a> {
    version: &'a str,
}

async fn version_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(VersionBody {
        version: &state.version,
    })
    .into_response()
}

/// Serve until `shutdown` resolves, then give in-flight requests at most `grace` to finish.
pub async fn serve<F>(
    listener: TcpListener,
    router: Router,
    shutdown: F,
    grace: Duration,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send,
{
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let server = axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = stop_rx.changed().await;
        })
        .into_future();
    tokio::pin!(server);
    tokio::pin!(shutdown);

    tokio::select! {
        res = &mut server => return res.context("http server failed"),
        _ = &mut shutdown => {
            info!(grace_secs = grace.as_secs(), "shutdown requested, draining requests");
            let _ = stop_tx.send(true);
        }
    }

    match tokio::time::timeout(grace, server).await {
        Ok(res) => res.context("http server failed during shutdown"),
        Err(_) => {
            warn!("shutdown grace period elapsed with requests still in flight");
            Ok(())
        }
    }
}
