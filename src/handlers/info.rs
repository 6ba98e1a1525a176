use axum::{Json, response::{IntoResponse, Response}};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;

use crate::{
    config::PerMinuteLimits,
    context::RequestContext,
    error::GatewayResult,
    handlers::{Services, authenticated},
    registry::Plan,
};

#[derive(Debug, Clone, Serialize)]
pub struct PlanInfo {
    pub plan: Plan,
    pub requests_per_hour: u64,
    pub analyses_per_minute: u64,
    pub price_per_request: f64,
    pub currency: String,
}

pub fn plan_catalogue(per_minute: &PerMinuteLimits, currency: &str) -> Vec<PlanInfo> {
    Plan::ALL
        .iter()
        .map(|plan| PlanInfo {
            plan: *plan,
            requests_per_hour: plan.default_hourly_quota(),
            analyses_per_minute: per_minute.for_plan(*plan),
            price_per_request: plan.default_price_per_request(),
            currency: currency.to_string(),
        })
        .collect()
}

pub fn service_info() -> Response {
    Json(json!({
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "authentication": "Authorization: Bearer <key> or x-api-key: <key>",
        "endpoints": {
            "health": "GET /health",
            "plans": "GET /v1/plans",
            "validate_key": "GET /v1/validate-key",
            "risk_assessment": "POST /v1/risk-assessment",
            "billing_stats": "GET /v1/billing/stats?days=N",
            "billing_report": "GET /v1/billing/report/{year}/{month}",
        },
    }))
    .into_response()
}

pub fn health(services: &Services) -> Response {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
        "quota_store": services.limiter.backend_name(),
        "ledger": services.ledger.name(),
        "analysis_backend": services.backend.name(),
        "registered_clients": services.registry.snapshot().len(),
    }))
    .into_response()
}

pub fn plans(services: &Services) -> Response {
    Json(json!({
        "plans": plan_catalogue(&services.per_minute, &services.currency),
    }))
    .into_response()
}

pub fn validate_key(services: &Services, ctx: &RequestContext) -> GatewayResult<Response> {
    let client = authenticated(ctx)?;

    let quota = ctx.quota.as_ref().map(|q| {
        json!({
            "limit": q.limit,
            "remaining": q.remaining,
            "reset_time": q.reset_at.to_rfc3339(),
        })
    });

    Ok(Json(json!({
        "valid": true,
        "client_id": client.client_id,
        "display_name": client.display_name,
        "plan": client.plan,
        "requests_per_hour": client.hourly_quota,
        "analyses_per_minute": services.per_minute.for_plan(client.plan),
        "price_per_request": client.price_per_request,
        "currency": services.currency,
        "payment_model": client.payment_model,
        "features": client.features,
        "expires_at": client.expires_at.map(|t| t.to_rfc3339()),
        "quota": quota,
    }))
    .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalogue_lists_every_plan_in_order() {
        let plans = plan_catalogue(&PerMinuteLimits::default(), "EUR");
        let names: Vec<_> = plans.iter().map(|p| p.plan.as_str()).collect();
        assert_eq!(names, ["sandbox", "basic", "premium", "enterprise"]);
        assert_eq!(plans[0].requests_per_hour, 50);
        assert_eq!(plans[0].analyses_per_minute, 2);
        assert_eq!(plans[3].price_per_request, 0.25);
    }
}
