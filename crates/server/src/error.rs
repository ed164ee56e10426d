//! API error types.

use crate::cleanup::CleanupError;
use crate::fill::FillError;
use crate::locks::LockError;
use crate::proxy::ProxyError;
use crate::resolver::ResolveError;
use crate::upstream::UpstreamError;
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// API error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error code for programmatic handling.
    pub code: String,
    /// Human-readable error message.
    pub message: String,
}

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("payload too large: limit is {limit} bytes")]
    PayloadTooLarge { limit: u64 },

    #[error("registry has no upstreams")]
    NoUpstreams,

    #[error("file not found on any upstream")]
    FileNotFoundOnUpstreams,

    #[error("upstream not available: {0}")]
    UpstreamNotAvailable(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("storage error: {0}")]
    Storage(#[from] vreg_storage::StorageError),

    #[error("metadata error: {0}")]
    Metadata(#[from] vreg_metadata::MetadataError),

    #[error("core error: {0}")]
    Core(#[from] vreg_core::Error),
}

impl ApiError {
    /// Get the error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::BadRequest(_) => "bad_request",
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::Conflict(_) => "conflict",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::NoUpstreams => "no_upstreams",
            Self::FileNotFoundOnUpstreams => "file_not_found_on_upstreams",
            Self::UpstreamNotAvailable(_) => "upstream_not_available",
            Self::Internal(_) => "internal_error",
            Self::Storage(_) => "storage_error",
            Self::Metadata(_) => "metadata_error",
            Self::Core(_) => "core_error",
        }
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::NoUpstreams => StatusCode::NOT_FOUND,
            Self::FileNotFoundOnUpstreams => StatusCode::NOT_FOUND,
            Self::UpstreamNotAvailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Storage(e) => match e {
                vreg_storage::StorageError::NotFound(_) => StatusCode::NOT_FOUND,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Metadata(e) => match e {
                vreg_metadata::MetadataError::NotFound(_) => StatusCode::NOT_FOUND,
                vreg_metadata::MetadataError::AlreadyExists(_) => StatusCode::CONFLICT,
                vreg_metadata::MetadataError::Constraint(_) => StatusCode::CONFLICT,
                vreg_metadata::MetadataError::InvalidStateTransition { .. } => {
                    StatusCode::CONFLICT
                }
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Core(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(code = self.code(), error = %self, "request failed");
        }
        let body = ErrorResponse {
            code: self.code().to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<UpstreamError> for ApiError {
    fn from(e: UpstreamError) -> Self {
        match e {
            UpstreamError::Denied(reason) => {
                Self::BadRequest(format!("upstream url rejected: {reason}"))
            }
            UpstreamError::Config(msg) => Self::Internal(msg),
            other => Self::UpstreamNotAvailable(other.to_string()),
        }
    }
}

impl From<LockError> for ApiError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::Timeout { .. } => Self::UpstreamNotAvailable(e.to_string()),
            LockError::Backend(msg) => Self::Internal(msg),
        }
    }
}

impl From<ResolveError> for ApiError {
    fn from(e: ResolveError) -> Self {
        match e {
            ResolveError::NoUpstreams => Self::NoUpstreams,
            ResolveError::BadRequest(msg) => Self::BadRequest(msg),
            ResolveError::FileNotFoundOnUpstreams => Self::FileNotFoundOnUpstreams,
            ResolveError::Upstream { source, .. } => source.into(),
            ResolveError::Metadata(e) => Self::Metadata(e),
        }
    }
}

impl From<FillError> for ApiError {
    fn from(e: FillError) -> Self {
        match e {
            FillError::Upstream(e) => e.into(),
            FillError::Lock(e) => e.into(),
            FillError::TooLarge { limit } => {
                Self::BadRequest(format!("upstream artifact exceeds {limit} bytes"))
            }
            FillError::DigestMismatch { expected, actual } => Self::UpstreamNotAvailable(format!(
                "upstream returned blob with digest sha256:{actual}, expected sha256:{expected}"
            )),
            FillError::Storage(e) => Self::Storage(e),
            FillError::Metadata(e) => Self::Metadata(e),
        }
    }
}

impl From<ProxyError> for ApiError {
    fn from(e: ProxyError) -> Self {
        match e {
            ProxyError::Resolve(e) => e.into(),
            ProxyError::Fill(e) => e.into(),
            ProxyError::Metadata(e) => Self::Metadata(e),
        }
    }
}

impl From<CleanupError> for ApiError {
    fn from(e: CleanupError) -> Self {
        match e {
            CleanupError::NoPolicy => Self::NotFound("cleanup policy".to_string()),
            CleanupError::PolicyMissing(group) => {
                Self::NotFound(format!("cleanup policy for group {group}"))
            }
            CleanupError::AlreadyRunning(group) => {
                Self::Conflict(format!("cleanup already running for group {group}"))
            }
            CleanupError::NotRunnable(msg) => Self::Conflict(msg),
            CleanupError::Lock(e) => e.into(),
            CleanupError::Metadata(e) => Self::Metadata(e),
        }
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;
