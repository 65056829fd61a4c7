use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TileError {
    #[error("Upstream error: {0}")]
    Upstream(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image decode error: {0}")]
    Decode(#[from] image::ImageError),

    #[error("Tile not found")]
    NotFound,

    #[error("Invalid tile coordinates")]
    InvalidCoordinates,

    #[error("Upstream returned {0}")]
    UpstreamStatus(u16),

    #[error("Failed to load tile {0}")]
    LoadFailed(String),

    #[error("Upstream did not answer in time")]
    Timeout,

    #[error("Job queue is full")]
    QueueFull,

    #[error("Tile load was cancelled")]
    Cancelled,
}

/// Failure classes a caller may want to react to differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connection failure, timeout or non-2xx answer. Retried on the next request.
    TransientNetwork,
    /// Payload that does not decode. Handled like a cache miss.
    CorruptImage,
    /// Local filesystem trouble. Logged, never surfaced to requesters.
    DiskIo,
    /// The dispatcher refused the job.
    QueueSaturation,
    /// The request itself was unusable or withdrawn.
    Rejected,
}

impl TileError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TileError::Upstream(_)
            | TileError::UpstreamStatus(_)
            | TileError::Timeout
            | TileError::NotFound
            | TileError::LoadFailed(_) => ErrorKind::TransientNetwork,
            TileError::Decode(_) => ErrorKind::CorruptImage,
            TileError::Io(_) => ErrorKind::DiskIo,
            TileError::QueueFull => ErrorKind::QueueSaturation,
            TileError::InvalidCoordinates | TileError::Cancelled => ErrorKind::Rejected,
        }
    }
}

impl IntoResponse for TileError {
    fn into_response(self) -> Response {
        let status = match &self {
            TileError::NotFound => StatusCode::NOT_FOUND,
            TileError::InvalidCoordinates => StatusCode::BAD_REQUEST,
            TileError::UpstreamStatus(code) => {
                StatusCode::from_u16(*code).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            TileError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            TileError::QueueFull | TileError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            TileError::Upstream(_)
            | TileError::Io(_)
            | TileError::Decode(_)
            | TileError::LoadFailed(_) => StatusCode::BAD_GATEWAY,
        };

        tracing::error!(error = %self, "Request failed");
        (status, self.to_string()).into_response()
    }
}

pub type Result<T> = std::result::Result<T, TileError>;
