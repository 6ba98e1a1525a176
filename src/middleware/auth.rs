use async_trait::async_trait;

use crate::{
    context::RequestContext,
    error::{GatewayError, GatewayResult},
    middleware::GatewayMiddleware,
    registry::KeyValidator,
};

/// Resolves the presented API key to a client and checks plan entitlements.
/// Public endpoints pass through untouched.
pub struct ApiKeyAuthMiddleware {
    validator: KeyValidator,
}

impl ApiKeyAuthMiddleware {
    pub fn new(validator: KeyValidator) -> Self {
        Self { validator }
    }
}

#[async_trait]
impl GatewayMiddleware for ApiKeyAuthMiddleware {
    fn name(&self) -> &'static str {
        "api-key-auth"
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> GatewayResult<()> {
        let Some(endpoint) = ctx.endpoint else {
            return Err(GatewayError::RouteNotFound);
        };
        if !endpoint.requires_auth() {
            return Ok(());
        }

        let client = self.validator.validate(ctx.api_key(), ctx.client_ip)?;

        if let Some(feature) = endpoint.required_feature()
            && !client.has_feature(feature)
        {
            tracing::warn!(
                target: "audit",
                event = "feature_denied",
                request_id = %ctx.request_id,
                client_id = %client.client_id,
                feature = feature,
                "client plan lacks feature"
            );
            return Err(GatewayError::FeatureNotEnabled(feature));
        }

        ctx.client = Some(client);
        Ok(())
    }
}
