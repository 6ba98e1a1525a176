pub mod file;
pub mod memory;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Calendar month (UTC) that scopes one ledger partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Period {
    pub year: i32,
    pub month: u32,
}

impl Period {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, 1).map(|_| Self { year, month })
    }

    pub fn of(ts: DateTime<Utc>) -> Self {
        Self {
            year: ts.year(),
            month: ts.month(),
        }
    }

    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    /// Every period touched by `[from, to]`, oldest first.
    pub fn span(from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<Period> {
        let last = Self::of(to);
        let mut current = Self::of(from);
        let mut out = Vec::new();
        while current <= last {
            out.push(current);
            current = current.next();
        }
        out
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageStatus {
    Success,
    Error,
    Timeout,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnalysisOutcome {
    pub risk_label: Option<String>,
    pub risk_score: Option<f64>,
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub timestamp: DateTime<Utc>,
    pub client_id: String,
    pub request_id: String,
    pub category: String,
    pub processing_time_ms: u64,
    pub billable_amount: f64,
    pub status: UsageStatus,
    #[serde(default)]
    pub risk_label: Option<String>,
    #[serde(default)]
    pub risk_score: Option<f64>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
}

impl UsageRecord {
    pub fn success(
        client_id: &str,
        request_id: &str,
        category: &str,
        processing_time_ms: u64,
        billable_amount: f64,
        outcome: AnalysisOutcome,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            client_id: client_id.to_string(),
            request_id: request_id.to_string(),
            category: category.to_string(),
            processing_time_ms,
            billable_amount: billable_amount.max(0.0),
            status: UsageStatus::Success,
            risk_label: outcome.risk_label,
            risk_score: outcome.risk_score,
            confidence: outcome.confidence,
            error_kind: None,
        }
    }

    /// Failed work is never billed.
    pub fn failure(
        client_id: &str,
        request_id: &str,
        category: &str,
        processing_time_ms: u64,
        timed_out: bool,
        error_kind: &str,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            client_id: client_id.to_string(),
            request_id: request_id.to_string(),
            category: category.to_string(),
            processing_time_ms,
            billable_amount: 0.0,
            status: if timed_out {
                UsageStatus::Timeout
            } else {
                UsageStatus::Error
            },
            risk_label: None,
            risk_score: None,
            confidence: None,
            error_kind: Some(error_kind.to_string()),
        }
    }

    #[cfg(test)]
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn period(&self) -> Period {
        Period::of(self.timestamp)
    }

    fn validate(&self, client_id: &str) -> Result<(), LedgerError> {
        if self.client_id != client_id {
            return Err(LedgerError::InvalidRecord(format!(
                "record for {} appended to ledger of {client_id}",
                self.client_id
            )));
        }
        if !(self.billable_amount >= 0.0) {
            return Err(LedgerError::InvalidRecord(
                "billable amount must be >= 0".to_string(),
            ));
        }
        if self.billable_amount > 0.0 && self.status != UsageStatus::Success {
            return Err(LedgerError::InvalidRecord(
                "only successful requests can be billed".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("usage persistence failed: {0}")]
    Persistence(String),
    #[error("invalid usage record: {0}")]
    InvalidRecord(String),
}

impl From<std::io::Error> for LedgerError {
    fn from(err: std::io::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}

/// Append-only usage store partitioned by (client, calendar month).
/// Duplicate request ids are kept as written.
#[async_trait]
pub trait UsageLedger: Send + Sync {
    fn name(&self) -> &'static str;

    async fn append(&self, client_id: &str, record: UsageRecord) -> Result<(), LedgerError>;

    /// `Ok(None)` means the partition was never created.
    async fn read_partition(
        &self,
        client_id: &str,
        period: Period,
    ) -> Result<Option<Vec<UsageRecord>>, LedgerError>;
}

/// Records usage without failing the caller: completed work is served even
/// when accounting cannot be persisted.
pub async fn record_best_effort(ledger: &dyn UsageLedger, record: UsageRecord) -> bool {
    let client_id = record.client_id.clone();
    let request_id = record.request_id.clone();
    let status = record.status;

    match ledger.append(&client_id, record).await {
        Ok(()) => {
            tracing::debug!(
                request_id = %request_id,
                client_id = %client_id,
                status = ?status,
                "usage recorded"
            );
            true
        }
        Err(err) => {
            tracing::error!(
                request_id = %request_id,
                client_id = %client_id,
                ledger = ledger.name(),
                error = %err,
                "failed to record usage; response is served unbilled"
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn period_span_crosses_year_boundary() {
        let from = Utc.with_ymd_and_hms(2024, 11, 20, 0, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2025, 2, 3, 0, 0, 0).unwrap();
        let labels: Vec<String> = Period::span(from, to).iter().map(ToString::to_string).collect();
        assert_eq!(labels, vec!["2024-11", "2024-12", "2025-01", "2025-02"]);
    }

    #[test]
    fn rejects_invalid_months() {
        assert!(Period::new(2025, 0).is_none());
        assert!(Period::new(2025, 13).is_none());
        assert_eq!(Period::new(2025, 5).unwrap().to_string(), "2025-05");
    }

    #[test]
    fn failures_are_never_billable() {
        let record = UsageRecord::failure("c", "r", "renta", 10, true, "timeout");
        assert_eq!(record.status, UsageStatus::Timeout);
        assert_eq!(record.billable_amount, 0.0);
        assert!(record.validate("c").is_ok());

        let mut forged = record.clone();
        forged.billable_amount = 1.0;
        assert!(matches!(forged.validate("c"), Err(LedgerError::InvalidRecord(_))));
        assert!(matches!(record.validate("other"), Err(LedgerError::InvalidRecord(_))));
    }

    #[tokio::test]
    async fn best_effort_recording_swallows_failures() {
        struct BrokenLedger;

        #[async_trait]
        impl UsageLedger for BrokenLedger {
            fn name(&self) -> &'static str {
                "broken"
            }

            async fn append(&self, _: &str, _: UsageRecord) -> Result<(), LedgerError> {
                Err(LedgerError::Persistence("disk full".to_string()))
            }

            async fn read_partition(
                &self,
                _: &str,
                _: Period,
            ) -> Result<Option<Vec<UsageRecord>>, LedgerError> {
                Ok(None)
            }
        }

        let record = UsageRecord::success("c", "r", "renta", 5, 0.5, AnalysisOutcome::default());
        assert!(!record_best_effort(&BrokenLedger, record).await);
    }
}
