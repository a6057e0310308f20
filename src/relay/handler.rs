//! HTTP 路由处理

use std::convert::Infallible;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderName, StatusCode},
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};

use super::server::AppState;
use crate::error::{Error, ErrorKind};
use crate::protocol::{Frame, HEARTBEAT_COMMENT};
use crate::types::{validate_channel, StatusRecord, StatusUpdate};

/// 路由表
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/channels/:channel/status", post(write_status))
        .route("/channels/:channel/stream", get(stream_channel))
        .route("/status", get(list_statuses))
        .route("/status/:key", get(get_status))
        .route("/health", get(health))
}

/// API 错误
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Unavailable(String),
    Internal(String),
}

/// 错误响应体
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: bool,
    pub code: String,
    pub message: String,
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match err.kind() {
            ErrorKind::Validation | ErrorKind::Decode => ApiError::BadRequest(err.to_string()),
            ErrorKind::Subscription => ApiError::Unavailable(err.to_string()),
            ErrorKind::Store => ApiError::Internal(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ApiError::Unavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "SUBSCRIPTION_ERROR", msg)
            }
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "STORE_ERROR", msg),
        };

        let body = ErrorResponse {
            error: true,
            code: code.to_string(),
            message,
        };

        (status, Json(body)).into_response()
    }
}

/// POST /channels/:channel/status — upsert 并发布
async fn write_status(
    State(state): State<AppState>,
    Path(channel): Path<String>,
    Json(update): Json<StatusUpdate>,
) -> Result<Json<StatusRecord>, ApiError> {
    let record = state.writer.write(&channel, &update).await?;
    Ok(Json(record))
}

/// GET /channels/:channel/stream — SSE 推流
async fn stream_channel(
    State(state): State<AppState>,
    Path(channel): Path<String>,
) -> Result<Response, ApiError> {
    validate_channel(&channel)?;

    let session = state.sessions.open(channel);
    let stream = session
        .into_stream()
        .map(|frame| Ok::<_, Infallible>(frame_to_event(frame)));

    let headers = [
        (header::CACHE_CONTROL, "no-cache, no-transform"),
        (HeaderName::from_static("x-accel-buffering"), "no"),
    ];

    Ok((headers, Sse::new(stream)).into_response())
}

/// 帧 → SSE 事件
fn frame_to_event(frame: Frame) -> Event {
    match frame {
        Frame::Retry(interval) => Event::default().retry(interval),
        Frame::Heartbeat => Event::default().comment(HEARTBEAT_COMMENT),
        named => {
            let event = Event::default();
            let event = match named.event_name() {
                Some(name) => event.event(name),
                None => event,
            };
            event.data(named.data().unwrap_or_default())
        }
    }
}

/// GET /status/:key
async fn get_status(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<StatusRecord>, ApiError> {
    state
        .writer
        .store()
        .get_status(&key)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("status {} not found", key)))
}

#[derive(Debug, Default, Deserialize)]
struct ListParams {
    #[serde(default)]
    include_deleted: bool,
}

/// GET /status
async fn list_statuses(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<StatusRecord>>, ApiError> {
    let records = state
        .writer
        .store()
        .list_statuses(params.include_deleted)
        .await?;
    Ok(Json(records))
}

/// 健康检查响应
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub active_sessions: usize,
    pub channels: usize,
}

/// GET /health
async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_sessions: state.sessions.active_sessions(),
        channels: state.sessions.pool().channel_count().await,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let resp = ApiError::from(Error::Validation("key 不能为空".into())).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = ApiError::from(Error::Store("disk full".into())).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let resp = ApiError::from(Error::Subscription("reset".into())).into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
