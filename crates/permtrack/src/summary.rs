use chrono::NaiveDate;

use crate::types::{MonthlyStatusRecord, SummaryStats};

/// Derives headline numbers from the flattened monthly status records.
pub fn summarize(records: &[MonthlyStatusRecord], record_date: NaiveDate) -> SummaryStats {
    let total_applications = records.iter().fold(0u64, |acc, r| acc.saturating_add(r.count));
    let pending_applications = records
        .iter()
        .filter(|r| r.status.is_pending())
        .fold(0u64, |acc, r| acc.saturating_add(r.count));
    let changes_today = records
        .iter()
        .fold(0i64, |acc, r| acc.saturating_add(r.daily_change));
    let completed_today = records
        .iter()
        .filter(|r| r.status.is_completed() && r.daily_change > 0)
        .fold(0u64, |acc, r| acc.saturating_add(r.daily_change as u64));

    SummaryStats {
        record_date,
        total_applications,
        pending_applications,
        pending_percentage: percentage(pending_applications, total_applications),
        changes_today,
        completed_today,
    }
}

/// `part / whole * 100` rounded to two decimals; 0 when `whole` is 0.
pub fn percentage(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    (part as f64 / whole as f64 * 100.0 * 100.0).round() / 100.0
}
