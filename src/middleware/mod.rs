pub mod auth;
pub mod logging;
pub mod rate_limit;
pub mod validation;

use async_trait::async_trait;
use axum::{
    body::Body,
    response::Response,
};

use crate::{
    context::RequestContext,
    error::GatewayResult,
};

/// One stage of the request pipeline: logging, validation and endpoint
/// resolution, authentication, then quota enforcement.
///
/// An `Err` from `on_request` stops the pipeline and becomes the error
/// response. `on_response` hooks run in reverse order for every stage that
/// saw the request, including the one that rejected it.
#[async_trait]
pub trait GatewayMiddleware: Send + Sync {
    fn name(&self) -> &'static str;

    async fn on_request(&self, ctx: &mut RequestContext) -> GatewayResult<()>;

    async fn on_response(
        &self,
        _ctx: &RequestContext,
        _response: &mut Response<Body>,
    ) -> GatewayResult<()> {
        Ok(())
    }
}
