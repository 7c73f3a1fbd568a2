//! Import of historical case decisions from a spreadsheet export.
//!
//! The sheet needs `CASE_STATUS`, `RECEIVED_DATE` and `DECISION_DATE`
//! columns. Each case with both dates and a processing time in
//! `[0, MAX_PROCESSING_DAYS)` is kept; the rest are dropped. The kept cases
//! are rolled up into daily decision counts, monthly status counts, a
//! summary and 30/50/80 processing-time percentiles.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::{Path, PathBuf};

use calamine::{Data, Reader, open_workbook_auto};
use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime};

use crate::dates;
use crate::types::{
    DailyProgressRecord, DataSource, MonthlyStatusRecord, Percentiles, ProcessingTimePercentiles,
    Snapshot, Status, SummaryStats,
};

pub const STATUS_COLUMN: &str = "CASE_STATUS";
pub const RECEIVED_COLUMN: &str = "RECEIVED_DATE";
pub const DECISION_COLUMN: &str = "DECISION_DATE";

/// Processing times at or above this many days are treated as data errors.
pub const MAX_PROCESSING_DAYS: i64 = 1500;

#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("Failed to read workbook {path}: {source}")]
    Workbook {
        path: PathBuf,
        #[source]
        source: calamine::Error,
    },
    #[error("Workbook {0} has no worksheets")]
    NoWorksheet(PathBuf),
    #[error("Required column '{0}' not found")]
    MissingColumn(&'static str),
    #[error("No valid cases left after cleaning")]
    NoCases,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaseRecord {
    pub status: Status,
    pub received: NaiveDate,
    pub decided: NaiveDate,
}

impl CaseRecord {
    pub fn processing_days(&self) -> i64 {
        (self.decided - self.received).num_days()
    }
}

/// Reads the first worksheet of `path` (xlsx, xls, xlsb or ods).
pub fn read_workbook(path: &Path) -> Result<Vec<CaseRecord>, ImportError> {
    let workbook_error = |source| ImportError::Workbook {
        path: path.to_path_buf(),
        source,
    };

    let mut workbook = open_workbook_auto(path).map_err(workbook_error)?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| ImportError::NoWorksheet(path.to_path_buf()))?
        .map_err(workbook_error)?;

    log::info!(
        "Loaded {} with {} row(s)",
        path.display(),
        range.height().saturating_sub(1)
    );
    parse_rows(range.rows())
}

/// Parses a header row followed by case rows.
pub fn parse_rows<'a, I>(rows: I) -> Result<Vec<CaseRecord>, ImportError>
where
    I: IntoIterator<Item = &'a [Data]>,
{
    let mut rows = rows.into_iter();
    let header: Vec<String> = rows
        .next()
        .map(|cells| cells.iter().map(|c| c.to_string().trim().to_uppercase()).collect())
        .unwrap_or_default();

    let column = |name: &'static str| {
        header
            .iter()
            .position(|h| h == name)
            .ok_or(ImportError::MissingColumn(name))
    };
    let status_col = column(STATUS_COLUMN)?;
    let received_col = column(RECEIVED_COLUMN)?;
    let decision_col = column(DECISION_COLUMN)?;

    let (mut missing_dates, mut out_of_range) = (0usize, 0usize);
    let mut cases = Vec::new();

    for row in rows {
        let received = row.get(received_col).and_then(cell_date);
        let decided = row.get(decision_col).and_then(cell_date);
        let (Some(received), Some(decided)) = (received, decided) else {
            missing_dates += 1;
            continue;
        };

        let case = CaseRecord {
            status: row
                .get(status_col)
                .map_or_else(|| Status::Other(String::new()), cell_status),
            received,
            decided,
        };
        if !(0..MAX_PROCESSING_DAYS).contains(&case.processing_days()) {
            out_of_range += 1;
            continue;
        }
        cases.push(case);
    }

    if missing_dates > 0 {
        log::debug!("Dropped {} row(s) with missing or invalid dates", missing_dates);
    }
    if out_of_range > 0 {
        log::debug!(
            "Dropped {} row(s) with processing times outside [0, {})",
            out_of_range,
            MAX_PROCESSING_DAYS
        );
    }
    log::info!("After cleaning: {} valid case(s)", cases.len());
    Ok(cases)
}

fn cell_status(cell: &Data) -> Status {
    Status::from(cell.to_string().trim().to_uppercase())
}

fn cell_date(cell: &Data) -> Option<NaiveDate> {
    match cell {
        Data::DateTime(dt) => dt.as_datetime().map(|d| d.date()),
        Data::Float(serial) => excel_serial_date(*serial),
        Data::Int(serial) => excel_serial_date(*serial as f64),
        Data::String(text) | Data::DateTimeIso(text) => parse_date_text(text),
        _ => None,
    }
}

/// Day serials count from 1899-12-30 in the 1900 date system.
fn excel_serial_date(serial: f64) -> Option<NaiveDate> {
    if !serial.is_finite() || serial < 1.0 {
        return None;
    }
    NaiveDate::from_ymd_opt(1899, 12, 30)?.checked_add_signed(Duration::days(serial.floor() as i64))
}

fn parse_date_text(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f").map(|d| d.date()))
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f").map(|d| d.date()))
        .or_else(|_| NaiveDate::parse_from_str(text, "%m/%d/%Y"))
        .ok()
}

/// Everything derived from one set of historical cases.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoricalImport {
    pub cases: usize,
    pub daily: Vec<DailyProgressRecord>,
    pub monthly: Vec<MonthlyStatusRecord>,
    pub percentiles: Percentiles,
    pub summary: SummaryStats,
}

impl HistoricalImport {
    pub fn from_cases(cases: &[CaseRecord]) -> Result<Self, ImportError> {
        let latest = cases
            .iter()
            .map(|c| c.decided)
            .max()
            .ok_or(ImportError::NoCases)?;

        let mut per_day: BTreeMap<NaiveDate, u64> = BTreeMap::new();
        for case in cases {
            *per_day.entry(case.decided).or_default() += 1;
        }
        let daily = per_day
            .into_iter()
            .map(|(date, total)| DailyProgressRecord {
                date,
                day_of_week: dates::day_of_week(date),
                total,
            })
            .collect();

        let mut per_month: BTreeMap<(i32, u32, String), u64> = BTreeMap::new();
        for case in cases {
            let key = (
                case.decided.year(),
                case.decided.month(),
                case.status.as_str().to_string(),
            );
            *per_month.entry(key).or_default() += 1;
        }
        // full month names keep these rows apart from the page's submission months
        let monthly = per_month
            .into_iter()
            .filter_map(|((year, month, status), count)| {
                let first = NaiveDate::from_ymd_opt(year, month, 1)?;
                Some(MonthlyStatusRecord {
                    month_name: first.format("%B").to_string(),
                    year,
                    status: Status::from(status),
                    count,
                    daily_change: 0,
                    is_active: false,
                })
            })
            .collect();

        let mut days: Vec<i64> = cases.iter().map(CaseRecord::processing_days).collect();
        days.sort_unstable();
        let percentiles = Percentiles {
            p30: percentile(&days, 30.0),
            p50: percentile(&days, 50.0),
            p80: percentile(&days, 80.0),
        };
        log::info!(
            "Calculated processing time percentiles: 30% {} / 50% {} / 80% {} days",
            percentiles.p30,
            percentiles.p50,
            percentiles.p80
        );

        let summary = SummaryStats {
            record_date: latest,
            total_applications: cases.len() as u64,
            pending_applications: 0,
            pending_percentage: 0.0,
            changes_today: 0,
            completed_today: cases.iter().filter(|c| c.decided == latest).count() as u64,
        };

        Ok(Self {
            cases: cases.len(),
            daily,
            monthly,
            percentiles,
            summary,
        })
    }

    /// Decided cases per status, in first-seen order.
    pub fn status_totals(&self) -> Vec<(Status, u64)> {
        let mut totals: Vec<(Status, u64)> = Vec::new();
        for record in &self.monthly {
            match totals.iter_mut().find(|(s, _)| *s == record.status) {
                Some((_, count)) => *count += record.count,
                None => totals.push((record.status.clone(), record.count)),
            }
        }
        totals
    }

    /// The percentiles are recorded against `reference_date`, the day of
    /// the import.
    pub fn to_snapshot(&self, reference_date: NaiveDate) -> Snapshot {
        Snapshot {
            as_of: reference_date,
            source: DataSource::HistoricalImport,
            daily: self.daily.clone(),
            monthly: self.monthly.clone(),
            summary: Some(self.summary.clone()),
            processing_times: Some(ProcessingTimePercentiles::new(
                reference_date,
                self.percentiles,
            )),
        }
    }
}

/// Percentile with linear interpolation between closest ranks, truncated
/// to whole days. `sorted` must be ascending and non-empty.
fn percentile(sorted: &[i64], p: f64) -> u32 {
    let rank = p / 100.0 * (sorted.len() - 1) as f64;
    let (lo, hi) = (rank.floor() as usize, rank.ceil() as usize);
    let value = sorted[lo] as f64 + (sorted[hi] - sorted[lo]) as f64 * (rank - lo as f64);
    value as u32
}

const PREVIEW_ROWS: usize = 5;

impl Display for HistoricalImport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Historical import of {} case(s)", self.cases)?;

        writeln!(f, "Daily progress records: {}", self.daily.len())?;
        for day in self.daily.iter().take(PREVIEW_ROWS) {
            writeln!(f, "  {}", day)?;
        }
        if self.daily.len() > PREVIEW_ROWS {
            writeln!(f, "  ... and {} more", self.daily.len() - PREVIEW_ROWS)?;
        }

        writeln!(f, "Monthly status records: {}", self.monthly.len())?;
        for record in self.monthly.iter().take(PREVIEW_ROWS) {
            writeln!(
                f,
                "  {} {} {:<16} {:>6}",
                record.month_name, record.year, record.status, record.count
            )?;
        }
        if self.monthly.len() > PREVIEW_ROWS {
            writeln!(f, "  ... and {} more", self.monthly.len() - PREVIEW_ROWS)?;
        }

        writeln!(
            f,
            "Processing times: 30% ≤ {} days, 50% ≤ {} days, 80% ≤ {} days",
            self.percentiles.p30, self.percentiles.p50, self.percentiles.p80
        )?;
        if let (Some(first), Some(last)) = (self.daily.first(), self.daily.last()) {
            writeln!(f, "Data covers {} to {}", first.date, last.date)?;
        }

        writeln!(f, "Status totals:")?;
        for (status, count) in self.status_totals() {
            writeln!(f, "  {:<16} {:>6}", status, count)?;
        }
        write!(f, "{}", self.summary)
    }
}
