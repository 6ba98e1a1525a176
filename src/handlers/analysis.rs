use axum::{
    Json,
    response::{IntoResponse, Response},
};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::{
    context::RequestContext,
    error::{GatewayError, GatewayResult},
    handlers::{Services, authenticated},
    ledger::{AnalysisOutcome, UsageRecord, record_best_effort},
    registry::ClientRecord,
    upstream::{AnalysisPayload, BackendError},
};

const MAX_NAME_CHARS: usize = 200;
const PDF_MAGIC: &[u8] = b"%PDF";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentType {
    Renta,
    Patrimonio,
}

impl DocumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Renta => "renta",
            Self::Patrimonio => "patrimonio",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RiskAssessmentRequest {
    pub client_name: String,
    pub client_id: String,
    pub document_type: DocumentType,
    pub pdf_base64: String,
}

impl RiskAssessmentRequest {
    pub fn parse(body: &[u8]) -> GatewayResult<Self> {
        if body.is_empty() {
            return Err(GatewayError::Validation("request body is required".to_string()));
        }
        serde_json::from_slice(body)
            .map_err(|err| GatewayError::Validation(format!("invalid request body: {err}")))
    }

    /// Checks the fields and returns the decoded document size in bytes.
    pub fn validate(&self, max_pdf_bytes: usize) -> GatewayResult<usize> {
        for (field, value) in [("client_name", &self.client_name), ("client_id", &self.client_id)] {
            let value = value.trim();
            if value.is_empty() {
                return Err(GatewayError::Validation(format!("{field} must not be empty")));
            }
            if value.chars().count() > MAX_NAME_CHARS {
                return Err(GatewayError::Validation(format!(
                    "{field} must be at most {MAX_NAME_CHARS} characters"
                )));
            }
        }

        let encoded = strip_data_url(self.pdf_base64.trim());
        if encoded.is_empty() {
            return Err(GatewayError::Validation("pdf_base64 must not be empty".to_string()));
        }
        // Reject oversized documents before paying for the decode.
        if encoded.len() / 4 * 3 > max_pdf_bytes + 2 {
            return Err(GatewayError::PayloadTooLarge);
        }

        let pdf = STANDARD
            .decode(encoded)
            .map_err(|_| GatewayError::Validation("pdf_base64 is not valid base64".to_string()))?;
        if pdf.len() > max_pdf_bytes {
            return Err(GatewayError::PayloadTooLarge);
        }
        if !pdf.starts_with(PDF_MAGIC) {
            return Err(GatewayError::Validation(
                "pdf_base64 does not contain a PDF document".to_string(),
            ));
        }

        Ok(pdf.len())
    }
}

fn strip_data_url(raw: &str) -> &str {
    match raw.split_once(";base64,") {
        Some((prefix, data)) if prefix.starts_with("data:") => data,
        _ => raw,
    }
}

pub async fn risk_assessment(services: &Services, ctx: &RequestContext) -> GatewayResult<Response> {
    let client = authenticated(ctx)?;
    let request = RiskAssessmentRequest::parse(&ctx.body)?;
    let pdf_bytes = request.validate(services.max_pdf_bytes)?;
    let category = request.document_type.as_str();

    tracing::info!(
        request_id = %ctx.request_id,
        client_id = %client.client_id,
        plan = %client.plan,
        document_type = category,
        pdf_bytes = pdf_bytes,
        "forwarding document for analysis"
    );

    let payload = outbound_payload(&request, ctx, client);
    let started = std::time::Instant::now();
    let result = call_backend(services, &payload, &ctx.request_id).await;
    let processing_time_ms = started.elapsed().as_millis() as u64;

    match result {
        Ok(analysis) => {
            let amount = client.price_per_request;
            let record = UsageRecord::success(
                &client.client_id,
                &ctx.request_id,
                category,
                processing_time_ms,
                amount,
                extract_outcome(&analysis),
            );
            record_best_effort(services.ledger.as_ref(), record).await;

            tracing::info!(
                request_id = %ctx.request_id,
                client_id = %client.client_id,
                processing_time_ms = processing_time_ms,
                billable_amount = amount,
                "analysis completed"
            );

            let mut body = analysis;
            body.insert(
                "api_metadata".to_string(),
                json!({
                    "request_id": ctx.request_id,
                    "client_id": client.client_id,
                    "plan": client.plan,
                    "total_processing_time_ms": ctx.started_at.elapsed().as_millis() as u64,
                    "billable_amount": amount,
                    "currency": services.currency,
                }),
            );
            Ok(Json(Value::Object(body)).into_response())
        }
        Err(err) => {
            let timed_out = matches!(&err, GatewayError::Backend(e) if e.is_timeout());
            let error_kind = match &err {
                GatewayError::BackendUnavailable { .. } => "circuit_open",
                other => other.code(),
            };
            let record = UsageRecord::failure(
                &client.client_id,
                &ctx.request_id,
                category,
                processing_time_ms,
                timed_out,
                error_kind,
            );
            record_best_effort(services.ledger.as_ref(), record).await;

            tracing::warn!(
                request_id = %ctx.request_id,
                client_id = %client.client_id,
                processing_time_ms = processing_time_ms,
                error_kind = error_kind,
                error = ?err,
                "analysis failed"
            );
            Err(err)
        }
    }
}

/// Bounded call through the circuit breaker. On timeout the backend future is
/// dropped, which cancels the in-flight HTTP request.
async fn call_backend(
    services: &Services,
    payload: &AnalysisPayload,
    request_id: &str,
) -> GatewayResult<AnalysisPayload> {
    let permit = services
        .breaker
        .try_acquire()
        .map_err(|retry_after_secs| GatewayError::BackendUnavailable { retry_after_secs })?;

    let call = services.backend.analyze(payload, request_id);
    match tokio::time::timeout(services.backend_timeout, call).await {
        Ok(Ok(analysis)) => {
            permit.success();
            Ok(analysis)
        }
        Ok(Err(err)) => {
            if err.counts_against_backend() {
                permit.failure();
            } else {
                permit.neutral();
            }
            Err(GatewayError::Backend(err))
        }
        Err(_) => {
            permit.failure();
            Err(GatewayError::Backend(BackendError::Timeout(
                services.backend_timeout.as_millis() as u64,
            )))
        }
    }
}

fn outbound_payload(
    request: &RiskAssessmentRequest,
    ctx: &RequestContext,
    client: &ClientRecord,
) -> AnalysisPayload {
    let mut payload = AnalysisPayload::new();
    payload.insert("client_name".to_string(), json!(request.client_name.trim()));
    payload.insert("client_id".to_string(), json!(request.client_id.trim()));
    payload.insert("document_type".to_string(), json!(request.document_type));
    payload.insert(
        "pdf_base64".to_string(),
        json!(strip_data_url(request.pdf_base64.trim())),
    );
    payload.insert(
        "api_metadata".to_string(),
        json!({
            "request_id": ctx.request_id,
            "client_id": client.client_id,
            "plan": client.plan,
            "received_at": Utc::now().to_rfc3339(),
        }),
    );
    payload
}

/// Outcome fields may sit at the top level or under a nested result object.
pub fn extract_outcome(analysis: &AnalysisPayload) -> AnalysisOutcome {
    let risk_label = find_field(analysis, &["risk_label", "risk_level"])
        .and_then(Value::as_str)
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty());

    AnalysisOutcome {
        risk_label,
        risk_score: find_field(analysis, &["risk_score", "score"]).and_then(as_number),
        confidence: find_field(analysis, &["confidence", "confidence_score"]).and_then(as_number),
    }
}

fn find_field<'a>(analysis: &'a AnalysisPayload, keys: &[&str]) -> Option<&'a Value> {
    let nested = ["analysis", "risk_assessment", "result"]
        .into_iter()
        .filter_map(|k| analysis.get(k).and_then(Value::as_object));

    std::iter::once(analysis)
        .chain(nested)
        .find_map(|map| keys.iter().find_map(|k| map.get(*k).filter(|v| !v.is_null())))
}

fn as_number(value: &Value) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
        .filter(|n: &f64| n.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Plan, test_client};

    fn request(pdf: &[u8]) -> RiskAssessmentRequest {
        RiskAssessmentRequest {
            client_name: "Ana".to_string(),
            client_id: "c-1".to_string(),
            document_type: DocumentType::Renta,
            pdf_base64: STANDARD.encode(pdf),
        }
    }

    #[test]
    fn accepts_small_pdf() {
        assert_eq!(request(b"%PDF-1.7 tiny").validate(1024).unwrap(), 13);
    }

    #[test]
    fn rejects_non_pdf_and_oversized_documents() {
        assert!(matches!(
            request(b"PK\x03\x04zip").validate(1024),
            Err(GatewayError::Validation(_))
        ));
        assert!(matches!(
            request(&[b'%'; 4096]).validate(1024),
            Err(GatewayError::PayloadTooLarge)
        ));

        let mut bad = request(b"%PDF");
        bad.pdf_base64 = "not base64!!".to_string();
        assert!(matches!(bad.validate(1024), Err(GatewayError::Validation(_))));
    }

    #[test]
    fn rejects_blank_names_and_unknown_document_types() {
        let mut blank = request(b"%PDF");
        blank.client_name = "   ".to_string();
        assert!(matches!(blank.validate(1024), Err(GatewayError::Validation(_))));

        let body = br#"{"client_name":"a","client_id":"b","document_type":"nomina","pdf_base64":"JVBERg=="}"#;
        assert!(matches!(
            RiskAssessmentRequest::parse(body),
            Err(GatewayError::Validation(_))
        ));
    }

    #[test]
    fn data_url_prefix_is_tolerated() {
        let mut req = request(b"%PDF-1.4");
        req.pdf_base64 = format!("data:application/pdf;base64,{}", req.pdf_base64);
        assert!(req.validate(1024).is_ok());
    }

    #[test]
    fn forwarded_document_has_data_url_prefix_removed() {
        let mut req = request(b"%PDF-1.4");
        let bare = req.pdf_base64.clone();
        req.pdf_base64 = format!("  data:application/pdf;base64,{bare}\n");

        let ctx = RequestContext::new(
            "req-1".to_string(),
            http::Method::POST,
            http::Uri::from_static("/v1/risk-assessment"),
            http::HeaderMap::new(),
            bytes::Bytes::new(),
            None,
        );
        let client = test_client("sk_test_key_0001", "acme", Plan::Basic);

        let payload = outbound_payload(&req, &ctx, &client);
        assert_eq!(payload["pdf_base64"], json!(bare));
        assert_eq!(payload["api_metadata"]["request_id"], "req-1");
    }

    #[test]
    fn outcome_is_read_from_nested_result() {
        let analysis = json!({
            "status": "ok",
            "analysis": {"risk_level": "HIGH", "risk_score": "0.82", "confidence": 0.9}
        });
        let Value::Object(map) = analysis else { unreachable!() };

        let outcome = extract_outcome(&map);
        assert_eq!(outcome.risk_label.as_deref(), Some("high"));
        assert_eq!(outcome.risk_score, Some(0.82));
        assert_eq!(outcome.confidence, Some(0.9));
        assert_eq!(extract_outcome(&AnalysisPayload::new()), AnalysisOutcome::default());
    }
}
