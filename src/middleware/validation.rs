use async_trait::async_trait;

use crate::{
    config::ValidationConfig,
    context::RequestContext,
    error::{GatewayError, GatewayResult},
    middleware::GatewayMiddleware,
    router,
};

pub struct RequestValidationMiddleware {
    cfg: ValidationConfig,
}

impl RequestValidationMiddleware {
    pub fn new(cfg: ValidationConfig) -> Self {
        Self { cfg }
    }
}

#[async_trait]
impl GatewayMiddleware for RequestValidationMiddleware {
    fn name(&self) -> &'static str {
        "request-validation"
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> GatewayResult<()> {
        if ctx.headers.len() > self.cfg.max_headers {
            return Err(GatewayError::Validation(format!(
                "Too many headers: {} > {}",
                ctx.headers.len(),
                self.cfg.max_headers
            )));
        }

        let method = ctx.method.as_str().to_ascii_uppercase();
        if !self.cfg.allowed_methods.iter().any(|m| m == &method) {
            return Err(GatewayError::MethodNotAllowed);
        }

        if let Some(content_length) = ctx
            .headers
            .get("content-length")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok())
            && content_length != ctx.body.len()
        {
            return Err(GatewayError::Validation(
                "content-length does not match payload size".to_string(),
            ));
        }

        if ctx.body.len() > self.cfg.max_body_bytes {
            return Err(GatewayError::PayloadTooLarge);
        }

        let endpoint = router::resolve(&ctx.method, ctx.uri.path())?;

        if !ctx.body.is_empty() {
            let is_json = ctx
                .headers
                .get(http::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v.trim_start().starts_with("application/json"));
            if !is_json {
                return Err(GatewayError::Validation(
                    "Content-Type must be application/json".to_string(),
                ));
            }
        }

        ctx.endpoint = Some(endpoint);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use http::{HeaderMap, HeaderValue, Method, Uri};

    use super::*;
    use crate::{config::GatewayConfig, router::Endpoint};

    fn middleware() -> RequestValidationMiddleware {
        RequestValidationMiddleware::new(GatewayConfig::default().validation)
    }

    fn ctx(method: Method, path: &'static str, headers: HeaderMap, body: &'static str) -> RequestContext {
        RequestContext::new(
            "req".to_string(),
            method,
            Uri::from_static(path),
            headers,
            Bytes::from_static(body.as_bytes()),
            None,
        )
    }

    #[tokio::test]
    async fn resolves_endpoint_for_valid_request() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        let mut ctx = ctx(Method::POST, "/v1/risk-assessment", headers, "{}");

        assert!(matches!(
            middleware().on_request(&mut ctx).await,
            Ok(())
        ));
        assert_eq!(ctx.endpoint, Some(Endpoint::RiskAssessment));
    }

    #[tokio::test]
    async fn rejects_disallowed_method_and_bad_length() {
        let mut ctx1 = ctx(Method::DELETE, "/health", HeaderMap::new(), "");
        assert!(matches!(
            middleware().on_request(&mut ctx1).await,
            Err(GatewayError::MethodNotAllowed)
        ));

        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers.insert("content-length", HeaderValue::from_static("99"));
        let mut ctx2 = ctx(Method::POST, "/v1/risk-assessment", headers, "{}");
        assert!(matches!(
            middleware().on_request(&mut ctx2).await,
            Err(GatewayError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn body_requires_json_content_type() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/plain"));
        let mut ctx = ctx(Method::POST, "/v1/risk-assessment", headers, "{}");
        assert!(matches!(
            middleware().on_request(&mut ctx).await,
            Err(GatewayError::Validation(_))
        ));
    }
}
