use std::{
    error::Error as _,
    time::Duration,
};

use async_trait::async_trait;
use axum::http::StatusCode;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::config::BackendConfig;

pub type AnalysisPayload = Map<String, Value>;

#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("backend call timed out after {0} ms")]
    Timeout(u64),
    #[error("backend connection refused: {0}")]
    ConnectionRefused(String),
    #[error("backend host could not be resolved: {0}")]
    DnsFailure(String),
    #[error("backend rejected the request with status {0}")]
    ClientError(u16),
    #[error("backend failed with status {0}")]
    ServerError(u16),
    #[error("analysis rejected by backend: {0}")]
    Rejected(String),
    #[error("unexpected backend failure: {0}")]
    Unknown(String),
}

impl BackendError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "backend_timeout",
            Self::ConnectionRefused(_) => "backend_connection_refused",
            Self::DnsFailure(_) => "backend_dns_failure",
            Self::ClientError(_) => "backend_client_error",
            Self::ServerError(_) => "backend_server_error",
            Self::Rejected(_) => "analysis_failed",
            Self::Unknown(_) => "backend_error",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::ConnectionRefused(_) | Self::ServerError(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::Timeout(_) | Self::ServerError(_) => Some(30),
            Self::ConnectionRefused(_) => Some(60),
            _ => None,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::ConnectionRefused(_) | Self::DnsFailure(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Rejected(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::ClientError(_) | Self::ServerError(_) | Self::Unknown(_) => {
                StatusCode::BAD_GATEWAY
            }
        }
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "The analysis took too long to complete. Please retry later",
            Self::ConnectionRefused(_) => "The analysis service is not reachable right now",
            Self::DnsFailure(_) => "The analysis service is misconfigured",
            Self::ClientError(_) => "The analysis service could not accept this document",
            Self::ServerError(_) => "The analysis service failed. Please retry later",
            Self::Rejected(_) => "The document could not be analyzed",
            Self::Unknown(_) => "The analysis service returned an unexpected response",
        }
    }

    /// Circuit breaker only counts failures that say something about backend health.
    pub fn counts_against_backend(&self) -> bool {
        !matches!(self, Self::ClientError(_) | Self::Rejected(_))
    }
}

#[async_trait]
pub trait AnalysisBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn analyze(
        &self,
        payload: &AnalysisPayload,
        request_id: &str,
    ) -> Result<AnalysisPayload, BackendError>;
}

pub struct HttpAnalysisBackend {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpAnalysisBackend {
    pub fn new(cfg: &BackendConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(32)
            .tcp_nodelay(true)
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            url: cfg.url.clone(),
            timeout: Duration::from_millis(cfg.timeout_ms),
        })
    }
}

#[async_trait]
impl AnalysisBackend for HttpAnalysisBackend {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn analyze(
        &self,
        payload: &AnalysisPayload,
        request_id: &str,
    ) -> Result<AnalysisPayload, BackendError> {
        let response = self
            .client
            .post(&self.url)
            .header("x-request-id", request_id)
            .timeout(self.timeout)
            .json(payload)
            .send()
            .await
            .map_err(|err| classify(&err, self.timeout))?;

        let status = response.status();
        if status.is_client_error() {
            return Err(BackendError::ClientError(status.as_u16()));
        }
        if !status.is_success() {
            return Err(BackendError::ServerError(status.as_u16()));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|err| classify(&err, self.timeout))?;
        interpret_body(body)
    }
}

/// Maps a transport failure onto the retry taxonomy.
pub fn classify(err: &reqwest::Error, timeout: Duration) -> BackendError {
    if err.is_timeout() {
        return BackendError::Timeout(timeout.as_millis() as u64);
    }

    if err.is_connect() {
        let chain = error_chain(err);
        let lowered = chain.to_ascii_lowercase();
        if lowered.contains("dns error")
            || lowered.contains("failed to lookup address")
            || lowered.contains("name or service not known")
            || lowered.contains("no such host")
        {
            return BackendError::DnsFailure(chain);
        }
        return BackendError::ConnectionRefused(chain);
    }

    if let Some(status) = err.status() {
        return if status.is_client_error() {
            BackendError::ClientError(status.as_u16())
        } else {
            BackendError::ServerError(status.as_u16())
        };
    }

    if err.is_decode() {
        return BackendError::Unknown("backend returned a non-JSON body".to_string());
    }

    BackendError::Unknown(error_chain(err))
}

fn error_chain(err: &reqwest::Error) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}

/// The backend answers with a JSON object; `{"status": "error"}` marks an
/// application-level failure even under HTTP 200.
pub fn interpret_body(body: Value) -> Result<AnalysisPayload, BackendError> {
    let Value::Object(map) = body else {
        return Err(BackendError::Unknown(
            "backend returned a non-object payload".to_string(),
        ));
    };

    if map.get("status").and_then(Value::as_str) == Some("error") {
        let message = map
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("analysis failed")
            .to_string();
        return Err(BackendError::Rejected(message));
    }

    Ok(map)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn retryability_follows_taxonomy() {
        assert!(BackendError::Timeout(1).is_retryable());
        assert!(BackendError::ConnectionRefused(String::new()).is_retryable());
        assert!(BackendError::ServerError(503).is_retryable());
        assert!(!BackendError::ClientError(400).is_retryable());
        assert!(!BackendError::Rejected(String::new()).is_retryable());
        assert!(!BackendError::DnsFailure(String::new()).is_retryable());
    }

    #[test]
    fn application_error_is_distinct_from_transport() {
        let err = interpret_body(json!({"status": "error", "message": "unreadable pdf"}))
            .unwrap_err();
        assert!(matches!(err, BackendError::Rejected(ref m) if m == "unreadable pdf"));
        assert!(!err.counts_against_backend());
    }

    #[test]
    fn non_object_payload_is_unknown() {
        assert!(matches!(
            interpret_body(json!([1, 2, 3])),
            Err(BackendError::Unknown(_))
        ));
        let ok = interpret_body(json!({"status": "ok", "risk_score": 0.4})).unwrap();
        assert_eq!(ok["risk_score"], 0.4);
    }

    #[tokio::test]
    async fn refused_connection_is_classified() {
        let backend = HttpAnalysisBackend::new(&BackendConfig {
            url: "http://127.0.0.1:9/analyze".to_string(),
            timeout_ms: 2_000,
        })
        .unwrap();

        let err = backend.analyze(&Map::new(), "req-1").await.unwrap_err();
        assert!(
            matches!(err, BackendError::ConnectionRefused(_) | BackendError::Timeout(_)),
            "unexpected classification: {err:?}"
        );
        assert!(err.is_retryable());
    }
}
