use async_trait::async_trait;
use axum::{
    body::Body,
    http::{HeaderName, HeaderValue},
    response::Response,
};

use crate::{
    context::RequestContext,
    error::{GatewayError, GatewayResult},
    middleware::GatewayMiddleware,
    ratelimit::{QuotaLimiter, QuotaRequest},
};

pub struct RateLimitMiddleware {
    limiter: QuotaLimiter,
    global_exempt_paths: Vec<String>,
    fail_open_on_error: bool,
}

impl RateLimitMiddleware {
    pub fn new(
        limiter: QuotaLimiter,
        global_exempt_paths: Vec<String>,
        fail_open_on_error: bool,
    ) -> Self {
        Self {
            limiter,
            global_exempt_paths: global_exempt_paths
                .into_iter()
                .map(|p| p.trim_end_matches('/').to_string())
                .collect(),
            fail_open_on_error,
        }
    }

    fn is_global_exempt(&self, path: &str) -> bool {
        let path = path.trim_end_matches('/');
        self.global_exempt_paths.iter().any(|p| p == path)
    }
}

#[async_trait]
impl GatewayMiddleware for RateLimitMiddleware {
    fn name(&self) -> &'static str {
        "rate-limit"
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> GatewayResult<()> {
        let Some(endpoint) = ctx.endpoint else {
            return Err(GatewayError::RouteNotFound);
        };
        if !endpoint.is_metered() {
            return Ok(());
        }

        let request = QuotaRequest {
            client_ip: ctx.client_ip,
            client: ctx.client.as_ref(),
            apply_global: !self.is_global_exempt(ctx.uri.path()),
            apply_per_minute: endpoint.applies_per_minute(),
        };

        match self.limiter.enforce(request).await {
            Ok(decision) => {
                ctx.quota = Some(decision);
                Ok(())
            }
            Err(GatewayError::QuotaExceeded(err)) => {
                let denial = err.denial();
                tracing::warn!(
                    request_id = %ctx.request_id,
                    client_id = ctx.client_id().unwrap_or("anonymous"),
                    client_ip = ?ctx.client_ip,
                    tier = %denial.tier,
                    limit = denial.limit,
                    retry_after_secs = denial.retry_after_secs,
                    "quota exceeded"
                );
                Err(GatewayError::QuotaExceeded(err))
            }
            Err(err) => {
                let detail = match &err {
                    GatewayError::QuotaStoreUnavailable(detail) => detail.as_str(),
                    other => other.code(),
                };
                if self.fail_open_on_error {
                    tracing::warn!(
                        request_id = %ctx.request_id,
                        store = self.limiter.backend_name(),
                        error = %detail,
                        "quota store failed; allowing request because fail-open is enabled"
                    );
                    Ok(())
                } else {
                    tracing::error!(
                        request_id = %ctx.request_id,
                        store = self.limiter.backend_name(),
                        error = %detail,
                        "quota store failed; rejecting request"
                    );
                    Err(err)
                }
            }
        }
    }

    async fn on_response(
        &self,
        ctx: &RequestContext,
        response: &mut Response<Body>,
    ) -> GatewayResult<()> {
        let Some(decision) = &ctx.quota else {
            return Ok(());
        };
        // Denials already carry their own tier-specific headers.
        if response.headers().contains_key("x-ratelimit-limit") {
            return Ok(());
        }

        let headers = response.headers_mut();
        headers.insert(
            HeaderName::from_static("x-ratelimit-limit"),
            HeaderValue::from(decision.limit),
        );
        headers.insert(
            HeaderName::from_static("x-ratelimit-remaining"),
            HeaderValue::from(decision.remaining),
        );
        headers.insert(
            HeaderName::from_static("x-ratelimit-reset"),
            HeaderValue::from(decision.reset_at.timestamp()),
        );
        Ok(())
    }
}
