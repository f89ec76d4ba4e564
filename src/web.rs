//! HTTP surface over the log: records by ordinal, the current count, and a server-sent
//! events stream of count updates.

use crate::store::{LogHandle, ServiceError, Subscription};
use axum::http::{StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router, extract::Path, extract::State};
use futures::stream::{self, Stream, StreamExt};
use log::{debug, error};
use proctree_shared::protocol::{CountUpdate, UPDATE_COUNT_EVENT};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
struct WebState {
    log: LogHandle,
    shutdown: CancellationToken,
}

#[derive(Debug, thiserror::Error)]
pub enum WebError {
    #[error("Log not found")]
    NotFound { index: String },
    #[error("log service unavailable")]
    Unavailable,
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ServiceError> for WebError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Closed | ServiceError::Subscribe(_) => Self::Unavailable,
            other => Self::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        match self {
            Self::NotFound { index } => (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "Log not found", "index": index })),
            )
                .into_response(),
            Self::Unavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": "Service unavailable" })),
            )
                .into_response(),
            Self::Internal(message) => {
                error!("Failed to serve request: {message}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "Internal server error" })),
                )
                    .into_response()
            }
        }
    }
}

pub fn router(log: LogHandle, shutdown: CancellationToken) -> Router {
    Router::new()
        .route("/api/log/{index}", get(get_log))
        .route("/api/count", get(get_count))
        .route("/api/events", get(events))
        .with_state(WebState { log, shutdown })
}

/// Serve until `shutdown` fires. Live event streams are closed at the same time.
pub async fn serve(
    listener: TcpListener,
    log: LogHandle,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let app = router(log, shutdown.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}

async fn get_log(
    State(state): State<WebState>,
    Path(index): Path<String>,
) -> Result<Response, WebError> {
    let payload = match index.parse::<i64>() {
        Ok(ordinal) => state.log.get(ordinal).await?,
        Err(_) => None,
    };

    match payload {
        Some(payload) => {
            Ok(([(header::CONTENT_TYPE, "application/json")], payload).into_response())
        }
        None => Err(WebError::NotFound { index }),
    }
}

async fn get_count(State(state): State<WebState>) -> Result<Json<CountUpdate>, WebError> {
    Ok(Json(CountUpdate::new(state.log.count().await?)))
}

async fn events(
    State(state): State<WebState>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, WebError> {
    let Subscription {
        id,
        initial,
        updates,
    } = state.log.subscribe().await?;
    debug!("A client connected (subscriber {id})");

    let updates = stream::unfold(updates, |mut updates| async move {
        updates.recv().await.map(|update| (update, updates))
    });
    let stream = stream::once(async move { initial })
        .chain(updates)
        .take_until(state.shutdown.cancelled_owned())
        .map(|update| Event::default().event(UPDATE_COUNT_EVENT).json_data(update));

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
