use std::{convert::Infallible, fmt::Display, str::FromStr};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Case status label as shown on the timeline page.
///
/// The four statuses the aggregator cares about get their own variant; any
/// other label is carried verbatim so nothing observed on the page is lost.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Status {
    AnalystReview,
    Certified,
    Denied,
    Withdrawn,
    Other(String),
}

impl Status {
    pub fn as_str(&self) -> &str {
        match self {
            Status::AnalystReview => "ANALYST REVIEW",
            Status::Certified => "CERTIFIED",
            Status::Denied => "DENIED",
            Status::Withdrawn => "WITHDRAWN",
            Status::Other(label) => label,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Status::AnalystReview)
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Status::Certified | Status::Denied | Status::Withdrawn)
    }
}

impl FromStr for Status {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.split_whitespace().collect::<Vec<_>>().join(" ");
        Ok(match normalized.to_uppercase().as_str() {
            "ANALYST REVIEW" => Status::AnalystReview,
            "CERTIFIED" => Status::Certified,
            "DENIED" => Status::Denied,
            "WITHDRAWN" => Status::Withdrawn,
            _ => Status::Other(normalized),
        })
    }
}

impl From<String> for Status {
    fn from(s: String) -> Self {
        match Status::from_str(&s) {
            Ok(status) => status,
            Err(never) => match never {},
        }
    }
}

impl From<Status> for String {
    fn from(status: Status) -> Self {
        status.as_str().to_string()
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One status counter inside a month bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCount {
    pub status: Status,
    pub count: u64,
    #[serde(default)]
    pub daily_change: i64,
}

impl StatusCount {
    /// Validating conversion from a loosely typed JSON object. Entries
    /// without a `status` string or a non-negative `count` are rejected.
    pub fn from_value(value: &Value) -> Option<Self> {
        let status = value.get("status").and_then(Value::as_str);
        let count = value.get("count").and_then(Value::as_u64);

        match (status, count) {
            (Some(status), Some(count)) => Some(StatusCount {
                status: Status::from(status.to_string()),
                count,
                daily_change: value
                    .get("dailyChange")
                    .and_then(Value::as_i64)
                    .unwrap_or(0),
            }),
            _ => {
                log::warn!("Rejecting status without 'status' or 'count': {}", value);
                None
            }
        }
    }
}

/// A submission-month bucket as published on the page, e.g. `"Mar 2025"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthBucket {
    pub month: String,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub statuses: Vec<StatusCount>,
}

impl MonthBucket {
    /// Validating conversion from a loosely typed JSON object. A bucket
    /// needs a `month` label; its invalid statuses are dropped one by one.
    pub fn from_value(value: &Value) -> Option<Self> {
        let Some(month) = value.get("month").and_then(Value::as_str) else {
            log::warn!("Rejecting month bucket without 'month': {}", value);
            return None;
        };

        let statuses = value
            .get("statuses")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(StatusCount::from_value).collect())
            .unwrap_or_default();

        Some(MonthBucket {
            month: month.to_string(),
            active: value.get("active").and_then(Value::as_bool).unwrap_or(false),
            statuses,
        })
    }

    /// Splits `"Mar 2025"` into `("Mar", 2025)`.
    pub fn month_and_year(&self) -> Option<(String, i32)> {
        let mut parts = self.month.split_whitespace();
        let (name, year, rest) = (parts.next()?, parts.next()?, parts.next());
        if rest.is_some() {
            return None;
        }
        Some((name.to_string(), year.parse().ok()?))
    }

    /// Flattens the bucket into one record per status. Buckets whose label is
    /// not `<month> <year>` produce nothing.
    pub fn records(&self) -> Vec<MonthlyStatusRecord> {
        let Some((month_name, year)) = self.month_and_year() else {
            log::warn!("Invalid month format: {:?}", self.month);
            return Vec::new();
        };

        self.statuses
            .iter()
            .map(|s| MonthlyStatusRecord {
                month_name: month_name.clone(),
                year,
                status: s.status.clone(),
                count: s.count,
                daily_change: s.daily_change,
                is_active: self.active,
            })
            .collect()
    }
}

impl Display for MonthBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.month)?;
        if self.active {
            write!(f, " (active)")?;
        }
        for s in &self.statuses {
            write!(f, "\n    {:<16} {:>8} ({:+})", s.status, s.count, s.daily_change)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthlyStatusRecord {
    pub month_name: String,
    pub year: i32,
    pub status: Status,
    pub count: u64,
    pub daily_change: i64,
    pub is_active: bool,
}

/// A raw day entry from the daily series: the page's label and the summed
/// sub-counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyEntry {
    #[serde(rename = "date")]
    pub label: String,
    pub total: u64,
}

impl DailyEntry {
    pub fn from_value(value: &Value) -> Option<Self> {
        let label = value.get("date").and_then(Value::as_str);
        let total = value.get("total").and_then(Value::as_u64);

        match (label, total) {
            (Some(label), Some(total)) if !label.trim().is_empty() => Some(DailyEntry {
                label: label.to_string(),
                total,
            }),
            _ => {
                log::warn!("Rejecting day without 'date' or 'total': {}", value);
                None
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailySeries {
    pub default_index: Option<u64>,
    pub days: Vec<DailyEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyProgressRecord {
    pub date: NaiveDate,
    pub day_of_week: String,
    pub total: u64,
}

impl Display for DailyProgressRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({:<9}) {:>6}", self.date, self.day_of_week, self.total)
    }
}

/// Processing-time percentiles in days, as scraped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Percentiles {
    pub p30: u32,
    pub p50: u32,
    pub p80: u32,
}

impl Percentiles {
    pub fn is_monotonic(&self) -> bool {
        self.p30 <= self.p50 && self.p50 <= self.p80
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingTimePercentiles {
    pub as_of_date: NaiveDate,
    pub p30: u32,
    pub p50: u32,
    pub p80: u32,
}

impl ProcessingTimePercentiles {
    pub fn new(as_of_date: NaiveDate, p: Percentiles) -> Self {
        Self {
            as_of_date,
            p30: p.p30,
            p50: p.p50,
            p80: p.p80,
        }
    }
}

impl Display for ProcessingTimePercentiles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "30% ≤ {} days, 50% ≤ {} days, 80% ≤ {} days",
            self.p30, self.p50, self.p80
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryStats {
    pub record_date: NaiveDate,
    pub total_applications: u64,
    pub pending_applications: u64,
    pub pending_percentage: f64,
    pub changes_today: i64,
    pub completed_today: u64,
}

impl Display for SummaryStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Summary for {}:", self.record_date)?;
        writeln!(f, "  Total applications:   {}", self.total_applications)?;
        writeln!(
            f,
            "  Pending applications: {} ({}%)",
            self.pending_applications, self.pending_percentage
        )?;
        writeln!(f, "  Changes today:        {}", self.changes_today)?;
        writeln!(f, "  Completed today:      {}", self.completed_today)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Locator,
    Months,
    Daily,
    Percentiles,
}

impl Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Locator => write!(f, "locator"),
            Stage::Months => write!(f, "months"),
            Stage::Daily => write!(f, "daily"),
            Stage::Percentiles => write!(f, "percentiles"),
        }
    }
}

/// Raw text captured when structured parsing fails. Debug aid only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub stage: Stage,
    pub snippet: String,
}

/// Everything one extraction run recovered from a page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub today_date: Option<String>,
    pub as_of: Option<NaiveDate>,
    pub months: Option<Vec<MonthBucket>>,
    pub daily: Option<DailySeries>,
    pub percentiles: Option<Percentiles>,
    pub summary: Option<SummaryStats>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<Diagnostic>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_daily_chunk: Option<String>,
}

impl ExtractionResult {
    pub fn is_empty(&self) -> bool {
        self.months.is_none() && self.daily.is_none() && self.percentiles.is_none()
    }

    pub fn monthly_records(&self) -> Vec<MonthlyStatusRecord> {
        self.months
            .iter()
            .flatten()
            .flat_map(MonthBucket::records)
            .collect()
    }
}

/// Where a snapshot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    Scrape,
    Document,
    HistoricalImport,
}

impl DataSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataSource::Scrape => "scrape",
            DataSource::Document => "document",
            DataSource::HistoricalImport => "historical_import",
        }
    }
}

/// Normalized, persistence-ready records for one as-of date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub as_of: NaiveDate,
    pub source: DataSource,
    pub daily: Vec<DailyProgressRecord>,
    pub monthly: Vec<MonthlyStatusRecord>,
    pub summary: Option<SummaryStats>,
    pub processing_times: Option<ProcessingTimePercentiles>,
}

impl Display for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "┌─ Snapshot {} ({})", self.as_of, self.source.as_str())?;
        writeln!(f, "│  Daily progress records: {}", self.daily.len())?;
        for day in &self.daily {
            writeln!(f, "│    {}", day)?;
        }
        writeln!(f, "│  Monthly status records: {}", self.monthly.len())?;
        if let Some(times) = &self.processing_times {
            writeln!(f, "│  Processing times: {}", times)?;
        }
        match &self.summary {
            Some(summary) => write!(f, "└─ {}", summary),
            None => writeln!(f, "└─ No summary"),
        }
    }
}
