use axum::{Json, http::StatusCode, response::IntoResponse};
use expo_common::FeedbackError;
use serde::Serialize;
use serde_json::Value;
use std::{borrow::Cow, future::Future};
use thiserror::Error;
use tracing::error;

tokio::task_local! {
    static REQUEST_ID: String;
}

fn sanitize_message(message: &str) -> String {
    const MAX_LEN: usize = 240;

    let mut cleaned = message
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect::<String>()
        .split_whitespace()
        .map(|token| {
            if token.contains("://") {
                "[redacted-url]".to_string()
            } else if let Some((base, _)) = token.split_once('?') {
                if base.is_empty() {
                    "[redacted-query]".to_string()
                } else {
                    format!("{base}?[redacted]")
                }
            } else if token.starts_with('/') || token.contains('\\') {
                "[redacted-path]".to_string()
            } else {
                token.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ");

    if cleaned.len() > MAX_LEN {
        let mut cut = MAX_LEN;
        while !cleaned.is_char_boundary(cut) {
            cut -= 1;
        }
        cleaned.truncate(cut);
        cleaned.push('…');
    }

    if cleaned.trim().is_empty() {
        "unexpected error".to_string()
    } else {
        cleaned
    }
}

pub async fn with_request_id<Fut, T>(request_id: Option<String>, fut: Fut) -> T
where
    Fut: Future<Output = T>,
{
    if let Some(request_id) = request_id {
        REQUEST_ID.scope(request_id, fut).await
    } else {
        fut.await
    }
}

pub fn current_request_id() -> Option<String> {
    REQUEST_ID.try_with(|value| value.clone()).ok()
}

#[derive(Debug, Error)]
pub enum ApiError {
    /// A feedback operation failed. `message` is the caller-facing summary.
    #[error("{message}: {source}")]
    Feedback {
        message: &'static str,
        #[source]
        source: FeedbackError,
    },
    /// The request body never reached the service.
    #[error("{message}: {detail}")]
    MalformedBody {
        message: &'static str,
        detail: String,
    },
    #[error("database error: {0}")]
    Database(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("too many requests: {0}")]
    TooManyRequests(String),
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("internal server error: {0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<Value>,
    request_id: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let code = self.code();
        let request_id = current_request_id();

        error!(
            code,
            status = %status,
            request_id = request_id.as_deref().unwrap_or(""),
            error = %self,
            "api_error"
        );

        let body = Json(ErrorResponse {
            code,
            message: self.public_message().into_owned(),
            error: self.detail(),
            request_id,
        });

        (status, body).into_response()
    }
}

impl ApiError {
    pub fn feedback(message: &'static str, source: FeedbackError) -> Self {
        ApiError::Feedback { message, source }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::Feedback {
                source: FeedbackError::Validation(_),
                ..
            } => "validation_error",
            ApiError::Feedback {
                source: FeedbackError::StoreUnavailable(_),
                ..
            } => "store_unavailable",
            ApiError::MalformedBody { .. } | ApiError::BadRequest(_) => "bad_request",
            ApiError::Unauthorized(_) => "unauthorized",
            ApiError::Forbidden(_) => "forbidden",
            ApiError::TooManyRequests(_) => "too_many_requests",
            ApiError::ServiceUnavailable(_) => "service_unavailable",
            ApiError::Database(_) => "database_error",
            ApiError::Internal(_) => "internal_error",
        }
    }

    fn public_message(&self) -> Cow<'static, str> {
        match self {
            ApiError::Feedback { message, .. } | ApiError::MalformedBody { message, .. } => {
                Cow::Borrowed(*message)
            }
            ApiError::BadRequest(msg) => Cow::Owned(sanitize_message(msg)),
            ApiError::Unauthorized(_) => Cow::Borrowed("unauthorized"),
            ApiError::Forbidden(_) => Cow::Borrowed("forbidden"),
            ApiError::TooManyRequests(_) => Cow::Borrowed("too many requests"),
            ApiError::ServiceUnavailable(_) => Cow::Borrowed("service unavailable"),
            ApiError::Database(_) | ApiError::Internal(_) => Cow::Borrowed("internal server error"),
        }
    }

    /// Diagnostic payload for the `error` field of the response body.
    fn detail(&self) -> Option<Value> {
        match self {
            ApiError::Feedback {
                source: FeedbackError::Validation(errors),
                ..
            } => serde_json::to_value(errors).ok(),
            ApiError::Feedback {
                source: FeedbackError::StoreUnavailable(err),
                ..
            } => Some(Value::String(sanitize_message(&err.to_string()))),
            ApiError::MalformedBody { detail, .. } => Some(Value::String(sanitize_message(detail))),
            _ => None,
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Feedback {
                source: FeedbackError::Validation(_),
                ..
            } => StatusCode::BAD_REQUEST,
            ApiError::Feedback {
                source: FeedbackError::StoreUnavailable(_),
                ..
            } => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::MalformedBody { .. } | ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::TooManyRequests(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Database(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use expo_common::{StoreError, validate_submission};
    use http_body_util::BodyExt;
    use serde_json::json;

    use super::*;

    async fn body_json(response: axum::response::Response) -> (StatusCode, Value) {
        let (parts, body) = response.into_parts();
        let bytes = body.collect().await.unwrap().to_bytes();
        (parts.status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn includes_request_id_in_response_body_when_present() {
        let err = ApiError::Internal("boom".into());
        let response = with_request_id(Some("req-123".into()), async { err.into_response() }).await;

        let (status, json) = body_json(response).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json["request_id"], "req-123");
        assert!(json.get("error").is_none());
    }

    #[tokio::test]
    async fn validation_failures_pass_field_errors_through() {
        let errors = validate_submission(&json!({ "fullName": "Jane" })).unwrap_err();
        let err = ApiError::feedback("Error submitting feedback", errors.into());

        let (status, json) = body_json(err.into_response()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], "validation_error");
        assert_eq!(json["message"], "Error submitting feedback");
        assert_eq!(json["error"]["errors"][0]["field"], "email");
    }

    #[tokio::test]
    async fn store_failures_carry_sanitized_diagnostic() {
        let source = FeedbackError::StoreUnavailable(StoreError::Unavailable(
            "cannot reach postgres://user:pass@db:5432/expo".into(),
        ));
        let err = ApiError::feedback("Error fetching feedback", source);

        let (status, json) = body_json(err.into_response()).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json["code"], "store_unavailable");
        let detail = json["error"].as_str().unwrap();
        assert!(detail.contains("[redacted-url]"));
        assert!(!detail.contains("pass@db"));
    }

    #[tokio::test]
    async fn malformed_body_keeps_operation_message() {
        let err = ApiError::MalformedBody {
            message: "Error submitting feedback",
            detail: "Failed to parse the request body as JSON: key must be a string".into(),
        };

        let (status, json) = body_json(err.into_response()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], "bad_request");
        assert_eq!(json["message"], "Error submitting feedback");
        assert!(json["error"].as_str().unwrap().contains("parse the request body"));
    }

    #[test]
    fn sanitize_message_strips_paths_and_caps_length() {
        assert_eq!(
            sanitize_message("failed at /etc/secret\nnow"),
            "failed at [redacted-path] now"
        );
        assert_eq!(sanitize_message("\n\t"), "unexpected error");
        assert!(sanitize_message(&"é".repeat(500)).chars().count() <= 241);
    }
}
