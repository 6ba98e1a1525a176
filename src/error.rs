use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::{Map, Value, json};

use crate::{
    ratelimit::{QuotaError, QuotaTier},
    registry::AuthError,
    upstream::BackendError,
};

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug)]
pub enum GatewayError {
    Auth(AuthError),
    FeatureNotEnabled(&'static str),
    QuotaExceeded(QuotaError),
    QuotaStoreUnavailable(String),
    Validation(String),
    RouteNotFound,
    MethodNotAllowed,
    PayloadTooLarge,
    Backend(BackendError),
    BackendUnavailable { retry_after_secs: u64 },
    ReportNotFound { period: String },
    Internal(String),
}

impl GatewayError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Auth(err) => err.code(),
            Self::FeatureNotEnabled(_) => "feature_not_enabled",
            Self::QuotaExceeded(err) => err.code(),
            Self::QuotaStoreUnavailable(_) => "quota_store_unavailable",
            Self::Validation(_) => "validation_error",
            Self::RouteNotFound => "route_not_found",
            Self::MethodNotAllowed => "method_not_allowed",
            Self::PayloadTooLarge => "payload_too_large",
            Self::Backend(err) => err.code(),
            Self::BackendUnavailable { .. } => "backend_unavailable",
            Self::ReportNotFound { .. } => "report_not_found",
            Self::Internal(_) => "internal_error",
        }
    }

    /// User-facing text. Never includes backend addresses or internal detail.
    pub fn message(&self) -> String {
        match self {
            Self::Auth(AuthError::MissingKey) => {
                "API key required: send 'Authorization: Bearer <key>' or 'x-api-key'".to_string()
            }
            Self::Auth(err) => err.to_string(),
            Self::FeatureNotEnabled(feature) => {
                format!("Your plan does not include the '{feature}' feature")
            }
            Self::QuotaExceeded(err) => {
                let d = err.denial();
                match d.tier {
                    QuotaTier::Global => format!(
                        "Too many requests from this address: {} per {} minutes",
                        d.limit,
                        d.window_seconds / 60
                    ),
                    QuotaTier::ClientHourly | QuotaTier::Anonymous => {
                        format!("Hourly quota of {} requests exceeded", d.limit)
                    }
                    QuotaTier::ClientPerMinute => {
                        format!("Limit of {} analyses per minute exceeded", d.limit)
                    }
                }
            }
            Self::QuotaStoreUnavailable(_) => {
                "Quota service temporarily unavailable".to_string()
            }
            Self::Validation(msg) => msg.clone(),
            Self::RouteNotFound => "No endpoint matches the request".to_string(),
            Self::MethodNotAllowed => "Method not allowed for this endpoint".to_string(),
            Self::PayloadTooLarge => "Request body exceeds configured limit".to_string(),
            Self::Backend(err) => err.user_message().to_string(),
            Self::BackendUnavailable { .. } => {
                "Analysis service temporarily unavailable".to_string()
            }
            Self::ReportNotFound { period } => {
                format!("No usage recorded for {period}")
            }
            Self::Internal(_) => "Internal server error".to_string(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Auth(AuthError::MissingKey | AuthError::UnknownKey) => StatusCode::UNAUTHORIZED,
            Self::Auth(AuthError::Suspended | AuthError::Expired) => StatusCode::FORBIDDEN,
            Self::FeatureNotEnabled(_) => StatusCode::FORBIDDEN,
            Self::QuotaExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::QuotaStoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::RouteNotFound => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Backend(err) => err.status(),
            Self::BackendUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::ReportNotFound { .. } => StatusCode::NOT_FOUND,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::QuotaExceeded(err) => Some(err.denial().retry_after_secs),
            Self::Backend(err) => err.retry_after_secs(),
            Self::BackendUnavailable { retry_after_secs } => Some(*retry_after_secs),
            Self::QuotaStoreUnavailable(_) => Some(5),
            _ => None,
        }
    }

    pub fn into_response_for(self, request_id: &str) -> Response {
        let status = self.status();
        let mut body = Map::new();
        body.insert("error".to_string(), json!(self.code()));
        body.insert("message".to_string(), json!(self.message()));
        body.insert("request_id".to_string(), json!(request_id));
        self.extend_body(&mut body);

        let mut response = (status, Json(Value::Object(body))).into_response();

        if let Some(retry_after) = self.retry_after_secs()
            && let Ok(v) = HeaderValue::from_str(&retry_after.to_string())
        {
            response.headers_mut().insert(header::RETRY_AFTER, v);
        }

        if let Self::QuotaExceeded(err) = &self {
            let d = err.denial();
            let headers = response.headers_mut();
            headers.insert("x-ratelimit-limit", HeaderValue::from(d.limit));
            headers.insert("x-ratelimit-remaining", HeaderValue::from(0u64));
            headers.insert("x-ratelimit-reset", HeaderValue::from(d.reset_at.timestamp()));
        }

        response
    }

    fn extend_body(&self, body: &mut Map<String, Value>) {
        match self {
            Self::QuotaExceeded(err) => {
                let d = err.denial();
                let limit_field = match d.tier {
                    QuotaTier::ClientHourly | QuotaTier::Anonymous => "requests_per_hour",
                    QuotaTier::ClientPerMinute => "requests_per_minute",
                    QuotaTier::Global => "requests_per_window",
                };
                body.insert("tier".to_string(), json!(d.tier.as_str()));
                body.insert("limit".to_string(), json!(d.limit));
                body.insert(limit_field.to_string(), json!(d.limit));
                body.insert("window_seconds".to_string(), json!(d.window_seconds));
                body.insert(
                    "plan".to_string(),
                    json!(d.plan.map(|p| p.as_str()).unwrap_or("anonymous")),
                );
                body.insert("reset_time".to_string(), json!(d.reset_at.to_rfc3339()));
                body.insert("retry_after_seconds".to_string(), json!(d.retry_after_secs));
                if let Some(hint) = &d.upgrade_hint {
                    body.insert("upgrade_hint".to_string(), json!(hint));
                }
            }
            Self::Backend(err) => {
                body.insert("retryable".to_string(), json!(err.is_retryable()));
                if let Some(retry) = err.retry_after_secs() {
                    body.insert("retry_after_seconds".to_string(), json!(retry));
                }
            }
            Self::BackendUnavailable { retry_after_secs } => {
                body.insert("retryable".to_string(), json!(true));
                body.insert("retry_after_seconds".to_string(), json!(retry_after_secs));
            }
            Self::QuotaStoreUnavailable(_) => {
                body.insert("retryable".to_string(), json!(true));
            }
            _ => {}
        }
    }
}

impl From<AuthError> for GatewayError {
    fn from(err: AuthError) -> Self {
        Self::Auth(err)
    }
}

impl From<BackendError> for GatewayError {
    fn from(err: BackendError) -> Self {
        Self::Backend(err)
    }
}

impl From<anyhow::Error> for GatewayError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<redis::RedisError> for GatewayError {
    fn from(err: redis::RedisError) -> Self {
        Self::QuotaStoreUnavailable(err.to_string())
    }
}
