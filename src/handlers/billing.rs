use axum::{
    Json,
    extract::Query,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde::Deserialize;

use crate::{
    context::RequestContext,
    error::{GatewayError, GatewayResult},
    handlers::{Services, authenticated},
    ledger::Period,
    report::ReportError,
};

pub const DEFAULT_LOOKBACK_DAYS: u32 = 30;
pub const MAX_LOOKBACK_DAYS: u32 = 365;

#[derive(Debug, Default, Deserialize)]
struct StatsQuery {
    days: Option<String>,
}

fn lookback_days(ctx: &RequestContext) -> GatewayResult<u32> {
    let query = Query::<StatsQuery>::try_from_uri(&ctx.uri)
        .map(|Query(q)| q)
        .map_err(|_| GatewayError::Validation("invalid query string".to_string()))?;

    let Some(raw) = query.days else {
        return Ok(DEFAULT_LOOKBACK_DAYS);
    };
    raw.trim()
        .parse::<u32>()
        .ok()
        .filter(|d| (1..=MAX_LOOKBACK_DAYS).contains(d))
        .ok_or_else(|| {
            GatewayError::Validation(format!("days must be between 1 and {MAX_LOOKBACK_DAYS}"))
        })
}

pub async fn stats(services: &Services, ctx: &RequestContext) -> GatewayResult<Response> {
    let client = authenticated(ctx)?;
    let days = lookback_days(ctx)?;

    let stats = services
        .reports
        .usage_stats(&client.client_id, days, Utc::now())
        .await
        .map_err(|err| report_error(err, ctx))?;

    Ok(Json(stats).into_response())
}

pub async fn report(
    services: &Services,
    ctx: &RequestContext,
    year: i32,
    month: u32,
) -> GatewayResult<Response> {
    let client = authenticated(ctx)?;
    let period = Period::new(year, month)
        .ok_or_else(|| GatewayError::Validation("invalid report period".to_string()))?;

    let report = services
        .reports
        .monthly_report(&client.client_id, period)
        .await
        .map_err(|err| report_error(err, ctx))?;

    Ok(Json(report).into_response())
}

fn report_error(err: ReportError, ctx: &RequestContext) -> GatewayError {
    match err {
        ReportError::NotFound { client_id, period } => {
            tracing::debug!(
                request_id = %ctx.request_id,
                client_id = %client_id,
                period = %period,
                "no usage partition for requested period"
            );
            GatewayError::ReportNotFound {
                period: period.to_string(),
            }
        }
        ReportError::Ledger(err) => {
            tracing::error!(
                request_id = %ctx.request_id,
                error = %err,
                "failed to read usage ledger"
            );
            GatewayError::Internal(err.to_string())
        }
    }
}
