use std::time::Duration;

use {
    axum::{
        Json,
        http::StatusCode,
        response::{IntoResponse, Response},
    },
    botlink_bots::RepositoryError,
    botlink_protocol::{ErrorShape, error_codes},
};

/// Failures of the relay core, as seen by the caller of a single operation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RelayError {
    #[error("bot '{bot}' failed authorization")]
    Unauthorized { bot: String },
    #[error("bot '{bot}' is not connected")]
    NotConnected { bot: String },
    #[error("bot '{bot}' did not reply within {}ms", .timeout.as_millis())]
    Timeout { bot: String, timeout: Duration },
    #[error("connection to bot '{bot}' was lost before it replied")]
    ConnectionLost { bot: String },
}

impl RelayError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized { .. } => error_codes::UNAUTHORIZED,
            Self::NotConnected { .. } => error_codes::NOT_CONNECTED,
            Self::Timeout { .. } => error_codes::TIMEOUT,
            Self::ConnectionLost { .. } => error_codes::CONNECTION_LOST,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            Self::NotConnected { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::ConnectionLost { .. } => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn to_error_shape(&self) -> ErrorShape {
        ErrorShape::new(self.code(), self.to_string())
    }
}

/// Error body returned by every HTTP handler: `{"error": {code, message}}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub shape: ErrorShape,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            shape: ErrorShape::new(code, message),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, error_codes::INVALID_REQUEST, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.shape })),
        )
            .into_response()
    }
}

impl From<RelayError> for ApiError {
    fn from(e: RelayError) -> Self {
        Self {
            status: e.status(),
            shape: e.to_error_shape(),
        }
    }
}

impl From<RepositoryError> for ApiError {
    fn from(e: RepositoryError) -> Self {
        let (status, code) = match &e {
            RepositoryError::DuplicateIdentity(_) => {
                (StatusCode::CONFLICT, error_codes::DUPLICATE_IDENTITY)
            },
            RepositoryError::NotFound(_) => (StatusCode::NOT_FOUND, error_codes::NOT_FOUND),
            RepositoryError::InvalidName(_) | RepositoryError::EmptySecret => {
                (StatusCode::BAD_REQUEST, error_codes::INVALID_REQUEST)
            },
            RepositoryError::Corrupt { .. } | RepositoryError::Store(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, error_codes::UNAVAILABLE)
            },
        };
        Self::new(status, code, e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_errors_map_to_distinct_statuses() {
        let bot = "echo-bot".to_string();
        let cases = [
            (
                RelayError::NotConnected { bot: bot.clone() },
                StatusCode::SERVICE_UNAVAILABLE,
                "NOT_CONNECTED",
            ),
            (
                RelayError::Timeout {
                    bot: bot.clone(),
                    timeout: Duration::from_millis(100),
                },
                StatusCode::GATEWAY_TIMEOUT,
                "TIMEOUT",
            ),
            (
                RelayError::ConnectionLost { bot: bot.clone() },
                StatusCode::BAD_GATEWAY,
                "CONNECTION_LOST",
            ),
        ];
        for (err, status, code) in cases {
            let api = ApiError::from(err);
            assert_eq!(api.status, status);
            assert_eq!(api.shape.code, code);
        }
    }

    #[test]
    fn timeout_message_names_duration() {
        let err = RelayError::Timeout {
            bot: "echo-bot".into(),
            timeout: Duration::from_millis(100),
        };
        assert_eq!(err.to_string(), "bot 'echo-bot' did not reply within 100ms");
    }

    #[test]
    fn repository_errors_map_to_http() {
        let api = ApiError::from(RepositoryError::DuplicateIdentity("x".into()));
        assert_eq!(api.status, StatusCode::CONFLICT);
        let api = ApiError::from(RepositoryError::NotFound("x".into()));
        assert_eq!(api.status, StatusCode::NOT_FOUND);
    }
}
