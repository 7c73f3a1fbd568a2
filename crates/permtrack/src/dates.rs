//! Day-label parsing and "today" resolution.
//!
//! Labels on the page look like `Mar/08/25`, optionally followed by
//! ` (today)` and/or a weekday name: `Mar/09/25 (today) Sun`.

use chrono::NaiveDate;

use crate::extract::ParseError;
use crate::types::{DailyProgressRecord, DailySeries};

const TODAY_MARKER: &str = "(today)";

const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayLabel {
    pub date: NaiveDate,
    pub is_today: bool,
    pub day_name: Option<String>,
}

/// Month number for a three-letter abbreviation. Unknown abbreviations map
/// to January.
pub fn month_number(abbr: &str) -> u32 {
    match MONTHS.iter().position(|m| m.eq_ignore_ascii_case(abbr)) {
        Some(i) => i as u32 + 1,
        None => {
            log::warn!("Unknown month abbreviation {:?}, defaulting to January", abbr);
            1
        }
    }
}

pub fn parse_day_label(label: &str) -> Result<DayLabel, ParseError> {
    let is_today = label.contains(TODAY_MARKER);
    let stripped = label.replace(TODAY_MARKER, " ");
    let mut tokens = stripped.split_whitespace();

    let date_part = tokens
        .next()
        .ok_or_else(|| ParseError::DateParseError(label.to_string()))?;
    let day_name = tokens.next().map(str::to_string);

    let parts: Vec<&str> = date_part.split('/').collect();
    let [month, day, year] = parts.as_slice() else {
        return Err(ParseError::DateParseError(label.to_string()));
    };

    if year.len() != 2 {
        return Err(ParseError::DateParseError(label.to_string()));
    }
    let day: u32 = day
        .parse()
        .map_err(|_| ParseError::DateParseError(label.to_string()))?;
    let year: i32 = format!("20{}", year)
        .parse()
        .map_err(|_| ParseError::DateParseError(label.to_string()))?;

    let date = NaiveDate::from_ymd_opt(year, month_number(month), day)
        .ok_or_else(|| ParseError::DateParseError(label.to_string()))?;

    if let Some(name) = &day_name
        && !weekday_matches(date, name)
    {
        log::warn!(
            "Label {:?} names {} but {} is a {}",
            label,
            name,
            date,
            day_of_week(date)
        );
    }

    Ok(DayLabel {
        date,
        is_today,
        day_name,
    })
}

fn weekday_matches(date: NaiveDate, name: &str) -> bool {
    let full = day_of_week(date);
    name.len() >= 3
        && full
            .to_lowercase()
            .starts_with(&name.to_lowercase())
}

/// `2025-03-08` → `Mar/08/25`.
pub fn format_day_label(date: NaiveDate) -> String {
    date.format("%b/%d/%y").to_string()
}

/// Full English weekday name.
pub fn day_of_week(date: NaiveDate) -> String {
    date.format("%A").to_string()
}

/// Parses the page's own `todayDate` (`YYYY-MM-DD`).
pub fn parse_today_date(raw: &str) -> Option<NaiveDate> {
    match NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d") {
        Ok(date) => Some(date),
        Err(e) => {
            log::warn!("Could not parse todayDate {:?}: {}", raw, e);
            None
        }
    }
}

/// Parses every label in the series, skipping (with a warning) the ones that
/// do not parse.
pub fn parse_labels(series: &DailySeries) -> Vec<(DayLabel, u64)> {
    series
        .days
        .iter()
        .filter_map(|entry| match parse_day_label(&entry.label) {
            Ok(label) => Some((label, entry.total)),
            Err(e) => {
                log::warn!("Skipping daily entry: {}", e);
                None
            }
        })
        .collect()
}

/// Converts parsed labels into records. A date seen twice keeps the later
/// entry's total.
pub fn normalize_daily(labels: &[(DayLabel, u64)]) -> Vec<DailyProgressRecord> {
    let mut records: Vec<DailyProgressRecord> = Vec::with_capacity(labels.len());
    for (label, total) in labels {
        if let Some(existing) = records.iter_mut().find(|r| r.date == label.date) {
            log::warn!("Duplicate daily entry for {}", label.date);
            existing.total = *total;
            continue;
        }
        records.push(DailyProgressRecord {
            date: label.date,
            day_of_week: day_of_week(label.date),
            total: *total,
        });
    }
    records
}

/// Resolves the as-of date.
///
/// Precedence: an explicit `(today)` label, then the page's `todayDate`,
/// then the latest calendar date among the labels, then `run_date`. Every
/// available source is compared against the chosen one and disagreements
/// are logged.
pub fn resolve_as_of(
    labels: &[DayLabel],
    today_date: Option<NaiveDate>,
    run_date: NaiveDate,
) -> NaiveDate {
    let marked = labels.iter().find(|l| l.is_today).map(|l| l.date);
    let latest = labels.iter().map(|l| l.date).max();

    let resolved = marked.or(today_date).or(latest).unwrap_or(run_date);

    let sources = [
        ("(today) marker", marked),
        ("todayDate", today_date),
        ("latest label", latest),
    ];
    for (name, candidate) in sources {
        if let Some(date) = candidate
            && date != resolved
        {
            log::warn!(
                "As-of date {} disagrees with {} ({})",
                resolved,
                name,
                date
            );
        }
    }
    if (resolved - run_date).num_days().abs() > 7 {
        log::warn!(
            "As-of date {} is far from the run date {}",
            resolved,
            run_date
        );
    }

    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DailyEntry;
    use proptest::prelude::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_parse_label_with_weekday() {
        let label = parse_day_label("Mar/08/25 Sat").unwrap();
        assert_eq!(label.date, date(2025, 3, 8));
        assert!(!label.is_today);
        assert_eq!(label.day_name.as_deref(), Some("Sat"));
        assert_eq!(day_of_week(label.date), "Saturday");
    }

    #[test]
    fn test_parse_label_with_today_marker() {
        let label = parse_day_label("Mar/09/25 (today) Sun").unwrap();
        assert_eq!(label.date, date(2025, 3, 9));
        assert!(label.is_today);
        assert_eq!(label.day_name.as_deref(), Some("Sun"));

        let bare = parse_day_label("Mar/09/25(today)").unwrap();
        assert!(bare.is_today);
        assert_eq!(bare.day_name, None);
    }

    #[test]
    fn test_unknown_month_defaults_to_january() {
        let label = parse_day_label("Foo/08/25").unwrap();
        assert_eq!(label.date, date(2025, 1, 8));
    }

    #[test]
    fn test_malformed_labels() {
        assert!(parse_day_label("").is_err());
        assert!(parse_day_label("Mar/08").is_err());
        assert!(parse_day_label("Mar/xx/25").is_err());
        assert!(parse_day_label("Feb/30/25").is_err());
        assert!(parse_day_label("Mar/08/2025").is_err());
    }

    #[test]
    fn test_normalize_daily_dedupes() {
        let series = DailySeries {
            default_index: Some(1),
            days: vec![
                DailyEntry {
                    label: "Mar/08/25 Sat".to_string(),
                    total: 10,
                },
                DailyEntry {
                    label: "garbage".to_string(),
                    total: 99,
                },
                DailyEntry {
                    label: "Mar/08/25".to_string(),
                    total: 12,
                },
            ],
        };

        let records = normalize_daily(&parse_labels(&series));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].total, 12);
        assert_eq!(records[0].day_of_week, "Saturday");
    }

    #[test]
    fn test_resolve_as_of_precedence() {
        let run = date(2025, 3, 20);
        let labels = vec![
            parse_day_label("Mar/07/25").unwrap(),
            parse_day_label("Mar/09/25").unwrap(),
            parse_day_label("Mar/08/25 (today)").unwrap(),
        ];

        assert_eq!(resolve_as_of(&labels, Some(date(2025, 3, 9)), run), date(2025, 3, 8));
        assert_eq!(resolve_as_of(&labels[..2], Some(date(2025, 3, 10)), run), date(2025, 3, 10));
        // latest date, not last position
        let reversed = vec![labels[1].clone(), labels[0].clone()];
        assert_eq!(resolve_as_of(&reversed, None, run), date(2025, 3, 9));
        assert_eq!(resolve_as_of(&[], None, run), run);
    }

    #[test]
    fn test_parse_today_date() {
        assert_eq!(parse_today_date("2025-03-09"), Some(date(2025, 3, 9)));
        assert_eq!(parse_today_date("03/09/2025"), None);
    }

    proptest! {
        #[test]
        fn label_round_trip(days in 0i64..3650) {
            let d = date(2020, 1, 1) + chrono::Duration::days(days);
            let label = format!("{} {}", format_day_label(d), &day_of_week(d)[..3]);
            let parsed = parse_day_label(&label).unwrap();
            prop_assert_eq!(parsed.date, d);
            prop_assert_eq!(format_day_label(parsed.date), label[..9].to_string());
        }
    }
}
