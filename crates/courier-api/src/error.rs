use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

use courier_core::ChatError;

/// HTTP face of [`ChatError`]. The body carries the same `code` the
/// gateway sends, so clients handle both transports alike.
#[derive(Debug)]
pub struct ApiError(pub ChatError);

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self.0 {
            ChatError::InvalidParticipant(_)
            | ChatError::InvalidConversation(_)
            | ChatError::InvalidMessage(_) => StatusCode::BAD_REQUEST,
            ChatError::NotFound(_) => StatusCode::NOT_FOUND,
            ChatError::Forbidden => StatusCode::FORBIDDEN,
            ChatError::Unauthorized => StatusCode::UNAUTHORIZED,
            ChatError::Storage => StatusCode::SERVICE_UNAVAILABLE,
            ChatError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": self.0.to_string(),
            "code": self.0.code(),
            "retryable": self.0.is_retryable(),
        });
        (self.status(), Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses() {
        let cases = [
            (ChatError::InvalidMessage("empty".into()), StatusCode::BAD_REQUEST),
            (ChatError::NotFound("message"), StatusCode::NOT_FOUND),
            (ChatError::Forbidden, StatusCode::FORBIDDEN),
            (ChatError::Unauthorized, StatusCode::UNAUTHORIZED),
            (ChatError::Storage, StatusCode::SERVICE_UNAVAILABLE),
            (ChatError::Timeout, StatusCode::GATEWAY_TIMEOUT),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError(err).into_response().status(), status);
        }
    }
}
