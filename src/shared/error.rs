use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Request-level error taxonomy. Every variant maps to a stable
/// machine-readable `error.kind` so clients never have to parse messages.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("authentication required")]
    Unauthenticated,

    #[error("access denied")]
    AccessDenied,

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    TransportUnavailable(String),

    #[error("internal server error")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::AccessDenied => "access_denied",
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::TransportUnavailable(_) => "transport_unavailable",
            Self::Internal(_) => "internal",
        }
    }

    pub const fn status(&self) -> StatusCode {
        match self {
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::AccessDenied => StatusCode::FORBIDDEN,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::TransportUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // Internal faults are logged with detail but reported generically.
        if let Self::Internal(err) = &self {
            tracing::error!(error = ?err, "internal error");
        }
        let body = json!({
            "error": {
                "kind": self.kind(),
                "message": self.to_string(),
            }
        });
        (self.status(), Json(body)).into_response()
    }
}

impl From<diesel::result::Error> for ApiError {
    fn from(err: diesel::result::Error) -> Self {
        match err {
            diesel::result::Error::NotFound => Self::NotFound("resource not found".to_string()),
            other => Self::Internal(other.into()),
        }
    }
}

impl From<diesel::r2d2::PoolError> for ApiError {
    fn from(err: diesel::r2d2::PoolError) -> Self {
        Self::Internal(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_status_codes() {
        let cases = [
            (ApiError::Unauthenticated, StatusCode::UNAUTHORIZED, "unauthenticated"),
            (ApiError::AccessDenied, StatusCode::FORBIDDEN, "access_denied"),
            (
                ApiError::Validation("title is required".into()),
                StatusCode::BAD_REQUEST,
                "validation",
            ),
            (
                ApiError::NotFound("ticket not found".into()),
                StatusCode::NOT_FOUND,
                "not_found",
            ),
            (
                ApiError::Conflict("ticket number space exhausted".into()),
                StatusCode::CONFLICT,
                "conflict",
            ),
            (
                ApiError::TransportUnavailable("whatsapp relay down".into()),
                StatusCode::SERVICE_UNAVAILABLE,
                "transport_unavailable",
            ),
        ];
        for (err, status, kind) in cases {
            assert_eq!(err.status(), status);
            assert_eq!(err.kind(), kind);
        }
    }

    #[test]
    fn diesel_not_found_maps_to_not_found() {
        let err = ApiError::from(diesel::result::Error::NotFound);
        assert_eq!(err.kind(), "not_found");
    }

    #[test]
    fn internal_message_is_generic() {
        let err = ApiError::Internal(anyhow::anyhow!("connection refused to 10.0.0.3"));
        assert_eq!(err.to_string(), "internal server error");
    }
}
