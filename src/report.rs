use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::ledger::{LedgerError, Period, UsageLedger, UsageRecord, UsageStatus};

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("no usage recorded for {client_id} in {period}")]
    NotFound { client_id: String, period: Period },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub timed_out_requests: u64,
    pub success_rate: Option<f64>,
    pub total_amount: f64,
    pub currency: String,
    pub avg_processing_time_ms: Option<f64>,
    pub duplicate_request_ids: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GroupTotals {
    pub requests: u64,
    pub successful: u64,
    pub amount: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DayTotals {
    pub date: NaiveDate,
    #[serde(flatten)]
    pub totals: GroupTotals,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Breakdown {
    pub by_category: BTreeMap<String, GroupTotals>,
    pub by_day: Vec<DayTotals>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LabelShare {
    pub count: u64,
    pub percentage: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskDistribution {
    pub low: LabelShare,
    pub medium: LabelShare,
    pub high: LabelShare,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskSummary {
    pub average_score: Option<f64>,
    pub average_confidence: Option<f64>,
    pub labelled_requests: u64,
    pub distribution: RiskDistribution,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsWindow {
    pub days: u32,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageStats {
    pub client_id: String,
    pub window: StatsWindow,
    pub summary: Summary,
    pub breakdown: Breakdown,
    pub risk: RiskSummary,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportPeriod {
    pub year: i32,
    pub month: u32,
    pub label: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonthlyReport {
    pub client_id: String,
    pub period: ReportPeriod,
    pub summary: Summary,
    pub breakdown: Breakdown,
    pub risk: RiskSummary,
    pub generated_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ReportAggregator {
    ledger: Arc<dyn UsageLedger>,
    currency: String,
}

impl ReportAggregator {
    pub fn new(ledger: Arc<dyn UsageLedger>, currency: String) -> Self {
        Self { ledger, currency }
    }

    pub async fn usage_stats(
        &self,
        client_id: &str,
        lookback_days: u32,
        now: DateTime<Utc>,
    ) -> Result<UsageStats, ReportError> {
        let from = now - Duration::days(i64::from(lookback_days));
        let mut records = Vec::new();
        for period in Period::span(from, now) {
            if let Some(partition) = self.ledger.read_partition(client_id, period).await? {
                records.extend(
                    partition
                        .into_iter()
                        .filter(|r| r.timestamp >= from && r.timestamp <= now),
                );
            }
        }

        Ok(UsageStats {
            client_id: client_id.to_string(),
            window: StatsWindow {
                days: lookback_days,
                from,
                to: now,
            },
            summary: summarize(&records, &self.currency),
            breakdown: breakdown(&records),
            risk: risk_summary(&records),
            generated_at: Utc::now(),
        })
    }

    pub async fn monthly_report(
        &self,
        client_id: &str,
        period: Period,
    ) -> Result<MonthlyReport, ReportError> {
        let records = self
            .ledger
            .read_partition(client_id, period)
            .await?
            .ok_or_else(|| ReportError::NotFound {
                client_id: client_id.to_string(),
                period,
            })?;

        Ok(MonthlyReport {
            client_id: client_id.to_string(),
            period: ReportPeriod {
                year: period.year,
                month: period.month,
                label: period.to_string(),
            },
            summary: summarize(&records, &self.currency),
            breakdown: breakdown(&records),
            risk: risk_summary(&records),
            generated_at: Utc::now(),
        })
    }
}

pub fn summarize(records: &[UsageRecord], currency: &str) -> Summary {
    let mut successful = 0u64;
    let mut failed = 0u64;
    let mut timed_out = 0u64;
    let mut amount = 0.0;
    let mut latency_total = 0u128;
    let mut seen = HashSet::with_capacity(records.len());
    let mut duplicates = 0u64;

    for record in records {
        match record.status {
            UsageStatus::Success => {
                successful += 1;
                amount += record.billable_amount;
                latency_total += u128::from(record.processing_time_ms);
            }
            UsageStatus::Error => failed += 1,
            UsageStatus::Timeout => timed_out += 1,
        }
        if !seen.insert(record.request_id.as_str()) {
            duplicates += 1;
        }
    }

    let total = records.len() as u64;
    Summary {
        total_requests: total,
        successful_requests: successful,
        failed_requests: failed,
        timed_out_requests: timed_out,
        success_rate: ratio(successful, total).map(|r| round(r * 100.0, 2)),
        total_amount: round(amount, 4),
        currency: currency.to_string(),
        avg_processing_time_ms: (successful > 0)
            .then(|| round(latency_total as f64 / successful as f64, 2)),
        duplicate_request_ids: duplicates,
    }
}

pub fn breakdown(records: &[UsageRecord]) -> Breakdown {
    let mut by_category: BTreeMap<String, GroupTotals> = BTreeMap::new();
    let mut by_day: BTreeMap<NaiveDate, GroupTotals> = BTreeMap::new();

    for record in records {
        add_to(by_category.entry(record.category.clone()).or_default(), record);
        add_to(by_day.entry(record.timestamp.date_naive()).or_default(), record);
    }

    for totals in by_category.values_mut().chain(by_day.values_mut()) {
        totals.amount = round(totals.amount, 4);
    }

    Breakdown {
        by_category,
        by_day: by_day
            .into_iter()
            .map(|(date, totals)| DayTotals { date, totals })
            .collect(),
    }
}

pub fn risk_summary(records: &[UsageRecord]) -> RiskSummary {
    let scores: Vec<f64> = records
        .iter()
        .filter_map(|r| r.risk_score)
        .filter(|s| s.is_finite())
        .collect();
    let confidences: Vec<f64> = records
        .iter()
        .filter_map(|r| r.confidence)
        .filter(|c| c.is_finite())
        .collect();

    let (mut low, mut medium, mut high) = (0u64, 0u64, 0u64);
    for label in records.iter().filter_map(|r| r.risk_label.as_deref()) {
        match label.trim().to_ascii_lowercase().as_str() {
            "low" => low += 1,
            "medium" => medium += 1,
            "high" => high += 1,
            _ => {}
        }
    }
    let labelled = low + medium + high;
    let share = |count: u64| LabelShare {
        count,
        percentage: ratio(count, labelled).map(|r| round(r * 100.0, 2)),
    };

    RiskSummary {
        average_score: mean(&scores).map(|m| round(m, 4)),
        average_confidence: mean(&confidences).map(|m| round(m, 4)),
        labelled_requests: labelled,
        distribution: RiskDistribution {
            low: share(low),
            medium: share(medium),
            high: share(high),
        },
    }
}

fn add_to(totals: &mut GroupTotals, record: &UsageRecord) {
    totals.requests += 1;
    if record.status == UsageStatus::Success {
        totals.successful += 1;
        totals.amount += record.billable_amount;
    }
}

fn ratio(part: u64, whole: u64) -> Option<f64> {
    (whole > 0).then(|| part as f64 / whole as f64)
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

fn round(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::ledger::{AnalysisOutcome, memory::MemoryLedger};

    fn ts(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 5, day, hour, 0, 0).unwrap()
    }

    fn ok(request_id: &str, category: &str, at: DateTime<Utc>, label: Option<&str>, score: Option<f64>) -> UsageRecord {
        UsageRecord::success(
            "acme",
            request_id,
            category,
            200,
            0.35,
            AnalysisOutcome {
                risk_label: label.map(ToString::to_string),
                risk_score: score,
                confidence: None,
            },
        )
        .at(at)
    }

    async fn seeded() -> (Arc<MemoryLedger>, ReportAggregator) {
        let ledger = Arc::new(MemoryLedger::new());
        let records = vec![
            ok("r1", "renta", ts(12, 10), Some("low"), Some(0.2)),
            ok("r2", "patrimonio", ts(3, 9), Some("HIGH"), Some(0.8)),
            ok("r3", "renta", ts(12, 11), None, None),
            UsageRecord::failure("acme", "r4", "renta", 60_000, true, "timeout").at(ts(7, 8)),
            UsageRecord::failure("acme", "r5", "patrimonio", 15, false, "server_error").at(ts(12, 1)),
        ];
        for record in records {
            ledger.append("acme", record).await.unwrap();
        }
        let aggregator = ReportAggregator::new(ledger.clone(), "EUR".to_string());
        (ledger, aggregator)
    }

    #[tokio::test]
    async fn monthly_totals_add_up() {
        let (_, aggregator) = seeded().await;
        let report = aggregator
            .monthly_report("acme", Period::new(2025, 5).unwrap())
            .await
            .unwrap();

        let s = &report.summary;
        assert_eq!(s.total_requests, 5);
        assert_eq!(s.successful_requests, 3);
        assert_eq!(s.failed_requests, 1);
        assert_eq!(s.timed_out_requests, 1);
        assert_eq!(s.total_amount, 1.05);
        assert_eq!(s.success_rate, Some(60.0));
        assert_eq!(s.avg_processing_time_ms, Some(200.0));
        assert_eq!(s.duplicate_request_ids, 0);
        assert_eq!(report.period.label, "2025-05");
    }

    #[tokio::test]
    async fn breakdowns_are_grouped_and_sorted() {
        let (_, aggregator) = seeded().await;
        let report = aggregator
            .monthly_report("acme", Period::new(2025, 5).unwrap())
            .await
            .unwrap();

        let renta = &report.breakdown.by_category["renta"];
        assert_eq!(renta.requests, 3);
        assert_eq!(renta.successful, 2);
        assert_eq!(renta.amount, 0.7);

        let days: Vec<String> = report
            .breakdown
            .by_day
            .iter()
            .map(|d| d.date.to_string())
            .collect();
        assert_eq!(days, vec!["2025-05-03", "2025-05-07", "2025-05-12"]);
        assert_eq!(report.breakdown.by_day[2].totals.requests, 3);
    }

    #[tokio::test]
    async fn risk_summary_ignores_nulls() {
        let (_, aggregator) = seeded().await;
        let report = aggregator
            .monthly_report("acme", Period::new(2025, 5).unwrap())
            .await
            .unwrap();

        assert_eq!(report.risk.average_score, Some(0.5));
        assert_eq!(report.risk.average_confidence, None);
        assert_eq!(report.risk.labelled_requests, 2);
        assert_eq!(report.risk.distribution.low.percentage, Some(50.0));
        assert_eq!(report.risk.distribution.medium.count, 0);
        assert_eq!(report.risk.distribution.medium.percentage, Some(0.0));
    }

    #[test]
    fn empty_set_has_null_means() {
        let summary = summarize(&[], "EUR");
        assert_eq!(summary.success_rate, None);
        assert_eq!(summary.avg_processing_time_ms, None);
        let risk = risk_summary(&[]);
        assert_eq!(risk.average_score, None);
        assert_eq!(risk.distribution.high.percentage, None);
    }

    #[tokio::test]
    async fn report_is_idempotent() {
        let (_, aggregator) = seeded().await;
        let period = Period::new(2025, 5).unwrap();
        let first = aggregator.monthly_report("acme", period).await.unwrap();
        let second = aggregator.monthly_report("acme", period).await.unwrap();

        assert_eq!(
            serde_json::to_string(&first.summary).unwrap(),
            serde_json::to_string(&second.summary).unwrap()
        );
        assert_eq!(
            serde_json::to_string(&first.breakdown).unwrap(),
            serde_json::to_string(&second.breakdown).unwrap()
        );
        assert_eq!(first.risk, second.risk);
    }

    #[tokio::test]
    async fn empty_month_is_not_found() {
        let (_, aggregator) = seeded().await;
        let err = aggregator
            .monthly_report("acme", Period::new(2025, 4).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, ReportError::NotFound { .. }));

        let err = aggregator
            .monthly_report("newcomer", Period::new(2025, 5).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, ReportError::NotFound { .. }));
    }

    #[tokio::test]
    async fn stats_respect_lookback_window() {
        let (ledger, aggregator) = seeded().await;
        ledger
            .append("acme", ok("r6", "renta", Utc.with_ymd_and_hms(2025, 4, 30, 12, 0, 0).unwrap(), None, None))
            .await
            .unwrap();

        let now = ts(12, 12);
        let week = aggregator.usage_stats("acme", 7, now).await.unwrap();
        assert_eq!(week.summary.total_requests, 4);

        let long = aggregator.usage_stats("acme", 30, now).await.unwrap();
        assert_eq!(long.summary.total_requests, 6);
        assert_eq!(long.breakdown.by_day.first().unwrap().date.to_string(), "2025-04-30");
    }

    #[test]
    fn duplicate_request_ids_are_counted_not_removed() {
        let records = vec![
            ok("dup", "renta", ts(1, 1), None, None),
            ok("dup", "renta", ts(1, 2), None, None),
        ];
        let summary = summarize(&records, "EUR");
        assert_eq!(summary.total_requests, 2);
        assert_eq!(summary.duplicate_request_ids, 1);
        assert_eq!(summary.total_amount, 0.7);
    }
}
