use axum::{Json, http::StatusCode, response::IntoResponse};
use thiserror::Error;

use crate::proto::ErrorResponse;
use crate::queue::QueueError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("queue not found: {0}")]
    QueueNotFound(String),
    #[error("consumer not found: {0}")]
    ConsumerNotFound(String),
    #[error("unknown delivery tag: {0}")]
    UnknownDeliveryTag(u64),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::QueueNotFound(_)
            | ApiError::ConsumerNotFound(_)
            | ApiError::UnknownDeliveryTag(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "BAD_REQUEST",
            ApiError::QueueNotFound(_) => "QUEUE_NOT_FOUND",
            ApiError::ConsumerNotFound(_) => "CONSUMER_NOT_FOUND",
            ApiError::UnknownDeliveryTag(_) => "UNKNOWN_DELIVERY_TAG",
            ApiError::Conflict(_) => "CONFLICT",
            ApiError::PayloadTooLarge(_) => "PAYLOAD_TOO_LARGE",
            ApiError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Broker request failed");
        }

        let body = ErrorResponse {
            code: self.code().to_string(),
            message: self.to_string(),
        };

        (status, Json(body)).into_response()
    }
}

impl From<QueueError> for ApiError {
    fn from(value: QueueError) -> Self {
        match value {
            QueueError::QueueNotFound(name) => ApiError::QueueNotFound(name),
            QueueError::ConsumerNotFound(id) => ApiError::ConsumerNotFound(id),
            QueueError::UnknownDeliveryTag(tag) => ApiError::UnknownDeliveryTag(tag),
            e @ (QueueError::InvalidQueueName(_) | QueueError::InvalidPrefetch) => {
                ApiError::BadRequest(e.to_string())
            }
            e @ QueueError::DurabilityMismatch(_) => ApiError::Conflict(e.to_string()),
            e => ApiError::Internal(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_errors_map_to_statuses() {
        let cases = [
            (QueueError::QueueNotFound("q".into()), StatusCode::NOT_FOUND),
            (QueueError::InvalidPrefetch, StatusCode::BAD_REQUEST),
            (QueueError::DurabilityMismatch("q".into()), StatusCode::CONFLICT),
            (QueueError::Corrupt("q".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status_code(), status);
        }
    }
}
