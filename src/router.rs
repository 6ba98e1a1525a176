use http::Method;

use crate::{
    error::{GatewayError, GatewayResult},
    registry::{FEATURE_BILLING, FEATURE_RISK_ASSESSMENT},
};

pub const REPORT_YEARS: std::ops::RangeInclusive<i32> = 2020..=2030;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    ServiceInfo,
    Health,
    Plans,
    ValidateKey,
    RiskAssessment,
    BillingStats,
    BillingReport { year: i32, month: u32 },
}

impl Endpoint {
    /// Route template, used as a low-cardinality log field.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ServiceInfo => "/",
            Self::Health => "/health",
            Self::Plans => "/v1/plans",
            Self::ValidateKey => "/v1/validate-key",
            Self::RiskAssessment => "/v1/risk-assessment",
            Self::BillingStats => "/v1/billing/stats",
            Self::BillingReport { .. } => "/v1/billing/report/{year}/{month}",
        }
    }

    pub fn requires_auth(&self) -> bool {
        matches!(
            self,
            Self::ValidateKey | Self::RiskAssessment | Self::BillingStats | Self::BillingReport { .. }
        )
    }

    /// Liveness and catalogue endpoints never touch quota counters.
    pub fn is_metered(&self) -> bool {
        !matches!(self, Self::Health | Self::Plans)
    }

    pub fn applies_per_minute(&self) -> bool {
        matches!(self, Self::RiskAssessment)
    }

    pub fn required_feature(&self) -> Option<&'static str> {
        match self {
            Self::RiskAssessment => Some(FEATURE_RISK_ASSESSMENT),
            Self::BillingStats | Self::BillingReport { .. } => Some(FEATURE_BILLING),
            _ => None,
        }
    }
}

pub fn resolve(method: &Method, path: &str) -> GatewayResult<Endpoint> {
    let trimmed = path.trim_end_matches('/');
    let segments: Vec<&str> = trimmed.split('/').filter(|s| !s.is_empty()).collect();

    let (endpoint, expected) = match segments.as_slice() {
        [] => (Endpoint::ServiceInfo, Method::GET),
        ["health"] => (Endpoint::Health, Method::GET),
        ["v1", "plans"] => (Endpoint::Plans, Method::GET),
        ["v1", "validate-key"] => (Endpoint::ValidateKey, Method::GET),
        ["v1", "risk-assessment"] => (Endpoint::RiskAssessment, Method::POST),
        ["v1", "billing", "stats"] => (Endpoint::BillingStats, Method::GET),
        ["v1", "billing", "report", year, month] => {
            (parse_report_period(year, month)?, Method::GET)
        }
        _ => return Err(GatewayError::RouteNotFound),
    };

    if *method != expected {
        return Err(GatewayError::MethodNotAllowed);
    }
    Ok(endpoint)
}

fn parse_report_period(year: &str, month: &str) -> GatewayResult<Endpoint> {
    let year = year
        .parse::<i32>()
        .ok()
        .filter(|y| REPORT_YEARS.contains(y))
        .ok_or_else(|| {
            GatewayError::Validation("year must be between 2020 and 2030".to_string())
        })?;
    let month = month
        .parse::<u32>()
        .ok()
        .filter(|m| (1..=12).contains(m))
        .ok_or_else(|| GatewayError::Validation("month must be between 1 and 12".to_string()))?;
    Ok(Endpoint::BillingReport { year, month })
}
