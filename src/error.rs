use std::io;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SerieslyError>;

#[derive(Debug, Error)]
pub enum SerieslyError {
    #[error("unparsable timestamp: {0}")]
    BadTimestamp(String),
    #[error("bad pointer: {0}")]
    BadPointer(String),
    #[error("no such reducer: {0}")]
    BadReducer(String),
    #[error("bad range: {0}")]
    BadRange(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("not found")]
    NotFound,
    #[error("error opening store: {0}")]
    StoreOpen(String),
    #[error("error writing store: {0}")]
    StoreWrite(String),
    #[error("error walking store: {0}")]
    StoreWalk(String),
    #[error("compaction failed: {0}")]
    CompactFailed(String),
    #[error("cache transport error: {0}")]
    CacheTransport(String),
    #[error("query timed out")]
    Timeout,
    #[error("closed")]
    Closed,
    #[error("not implemented")]
    NotImplemented,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for SerieslyError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<toml::de::Error> for SerieslyError {
    fn from(err: toml::de::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<toml::ser::Error> for SerieslyError {
    fn from(err: toml::ser::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl SerieslyError {
    fn label(&self) -> &'static str {
        match self {
            Self::BadTimestamp(_) => "bad_timestamp",
            Self::BadPointer(_) => "bad_pointer",
            Self::BadReducer(_) => "bad_reducer",
            Self::BadRange(_) => "bad_range",
            Self::BadRequest(_) => "bad_request",
            Self::NotFound => "not_found",
            Self::StoreOpen(_) => "store_open",
            Self::StoreWrite(_) => "store_write",
            Self::StoreWalk(_) => "store_walk",
            Self::CompactFailed(_) => "compact_failed",
            Self::CacheTransport(_) => "cache_transport",
            Self::Timeout => "timeout",
            Self::Closed => "closed",
            Self::NotImplemented => "not_implemented",
            Self::Io(_) => "io",
            Self::Internal(_) => "internal",
        }
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    reason: String,
}

impl IntoResponse for SerieslyError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::BadTimestamp(_)
            | Self::BadPointer(_)
            | Self::BadReducer(_)
            | Self::BadRange(_)
            | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Timeout => StatusCode::SERVICE_UNAVAILABLE,
            Self::NotImplemented => StatusCode::NOT_IMPLEMENTED,
            Self::StoreOpen(_)
            | Self::StoreWrite(_)
            | Self::StoreWalk(_)
            | Self::CompactFailed(_)
            | Self::CacheTransport(_)
            | Self::Closed
            | Self::Io(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = ErrorBody {
            error: self.label(),
            reason: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
