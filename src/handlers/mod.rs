pub mod analysis;
pub mod billing;
pub mod info;

use std::{sync::Arc, time::Duration};

use axum::response::Response;

use crate::{
    circuit_breaker::CircuitBreaker,
    config::PerMinuteLimits,
    context::RequestContext,
    error::{GatewayError, GatewayResult},
    ledger::UsageLedger,
    ratelimit::QuotaLimiter,
    registry::{AuthError, ClientRecord, RegistryHandle},
    report::ReportAggregator,
    router::Endpoint,
    upstream::AnalysisBackend,
};

/// Everything the endpoint handlers need, shared across requests.
pub struct Services {
    pub registry: RegistryHandle,
    pub limiter: QuotaLimiter,
    pub ledger: Arc<dyn UsageLedger>,
    pub reports: ReportAggregator,
    pub backend: Arc<dyn AnalysisBackend>,
    pub breaker: CircuitBreaker,
    pub backend_timeout: Duration,
    pub max_pdf_bytes: usize,
    pub per_minute: PerMinuteLimits,
    pub currency: String,
}

pub async fn dispatch(services: &Services, ctx: &RequestContext) -> GatewayResult<Response> {
    let endpoint = ctx.endpoint.ok_or(GatewayError::RouteNotFound)?;

    match endpoint {
        Endpoint::ServiceInfo => Ok(info::service_info()),
        Endpoint::Health => Ok(info::health(services)),
        Endpoint::Plans => Ok(info::plans(services)),
        Endpoint::ValidateKey => info::validate_key(services, ctx),
        Endpoint::RiskAssessment => analysis::risk_assessment(services, ctx).await,
        Endpoint::BillingStats => billing::stats(services, ctx).await,
        Endpoint::BillingReport { year, month } => {
            billing::report(services, ctx, year, month).await
        }
    }
}

fn authenticated(ctx: &RequestContext) -> GatewayResult<&ClientRecord> {
    ctx.client
        .as_ref()
        .ok_or(GatewayError::Auth(AuthError::MissingKey))
}
