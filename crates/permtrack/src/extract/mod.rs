//! The extraction engine: locate the payload fragment, run the independent
//! recoverers over it and resolve the as-of date.

pub mod daily;
pub mod locator;
pub mod months;
pub mod percentiles;
pub mod span;

use chrono::{Duration, Local, NaiveDate};
use regex::Regex;

use crate::config::ExtractorConfig;
use crate::dates::{self, DayLabel};
use crate::summary::summarize;
use crate::types::{
    DataSource, Diagnostic, ExtractionResult, ProcessingTimePercentiles, Snapshot, Stage,
};
use daily::DailyAnchors;
use percentiles::PercentileMatcher;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("Failed to parse date: {0}")]
    DateParseError(String),
    #[error("Invalid extraction pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}

/// Days before the run date searched when capturing a raw daily chunk.
const RAW_CHUNK_DAYS: i64 = 14;
const RAW_CHUNK_BEFORE: usize = 200;
const RAW_CHUNK_AFTER: usize = 2000;

#[derive(Debug, Clone)]
pub struct Extractor {
    config: ExtractorConfig,
    anchors: DailyAnchors,
    percentiles: PercentileMatcher,
    today: Regex,
}

impl Extractor {
    pub fn new(config: ExtractorConfig) -> Result<Self, ParseError> {
        let anchors = DailyAnchors::new(&config.daily_tag)?;
        let percentiles = PercentileMatcher::new(config.percentile_window)?;
        let today = Regex::new(&format!(
            r#"{}\\*":\s*\\*"([^"\\]+)"#,
            regex::escape(&config.today_key)
        ))?;

        Ok(Self {
            config,
            anchors,
            percentiles,
            today,
        })
    }

    pub fn config(&self) -> &ExtractorConfig {
        &self.config
    }

    pub fn extract(&self, html: &str) -> ExtractionResult {
        self.extract_on(html, Local::now().date_naive())
    }

    /// Runs every recoverer against the page. `run_date` is only used when
    /// the page carries no usable notion of "today".
    pub fn extract_on(&self, html: &str, run_date: NaiveDate) -> ExtractionResult {
        let config = &self.config;
        let mut diagnostics = Vec::new();

        let Some(fragment) = locator::locate(html, &config.dataset_marker) else {
            log::info!(
                "No payload fragment carries '{}', returning an empty result",
                config.dataset_marker
            );
            if config.debug && !html.is_empty() {
                diagnostics.push(Diagnostic {
                    stage: Stage::Locator,
                    snippet: span::snippet(html, config.snippet_limit),
                });
            }
            return ExtractionResult {
                diagnostics,
                ..Default::default()
            };
        };

        let months = months::recover(&fragment, config, &mut diagnostics);
        let daily = daily::recover(&fragment, &self.anchors, config, &mut diagnostics);
        let percentiles =
            percentiles::extract(&fragment, &self.percentiles, config, &mut diagnostics);

        let today_date = self
            .today
            .captures(&fragment)
            .map(|caps| caps[1].to_string());
        if let Some(today) = &today_date {
            log::debug!("Found todayDate: {}", today);
        }

        let labels: Vec<DayLabel> = daily
            .as_ref()
            .map(dates::parse_labels)
            .unwrap_or_default()
            .into_iter()
            .map(|(label, _)| label)
            .collect();
        let as_of = dates::resolve_as_of(
            &labels,
            today_date.as_deref().and_then(dates::parse_today_date),
            run_date,
        );

        let mut result = ExtractionResult {
            today_date,
            as_of: Some(as_of),
            months,
            daily,
            percentiles,
            summary: None,
            diagnostics,
            raw_daily_chunk: None,
        };
        let records = result.monthly_records();
        if records.is_empty() {
            log::warn!("No monthly status records recovered, skipping summary");
        } else {
            result.summary = Some(summarize(&records, as_of));
        }

        log::info!(
            "Extracted {} month(s), {} day(s), percentiles {}",
            result.months.as_ref().map_or(0, Vec::len),
            result.daily.as_ref().map_or(0, |d| d.days.len()),
            if result.percentiles.is_some() {
                "found"
            } else {
                "missing"
            }
        );
        result
    }

    /// Window of raw markup around the most recent day label found in
    /// `html`, looking back from `run_date`.
    pub fn raw_daily_chunk(&self, html: &str, run_date: NaiveDate) -> Option<String> {
        for back in 0..RAW_CHUNK_DAYS {
            let label = dates::format_day_label(run_date - Duration::days(back));
            if let Some(pos) = html.find(&label) {
                log::info!("Found date marker {} at position {}", label, pos);
                let start = floor_boundary(html, pos.saturating_sub(RAW_CHUNK_BEFORE));
                let end = floor_boundary(html, (pos + RAW_CHUNK_AFTER).min(html.len()));
                return Some(html[start..end].to_string());
            }
        }
        log::warn!("No recent day label found in the page");
        None
    }
}

fn floor_boundary(text: &str, mut index: usize) -> usize {
    while !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

impl ExtractionResult {
    /// Normalizes the result into persistence-ready records. Returns `None`
    /// when nothing was recovered.
    pub fn to_snapshot(&self) -> Option<Snapshot> {
        if self.is_empty() {
            return None;
        }
        let as_of = self.as_of?;

        let daily = self
            .daily
            .as_ref()
            .map(|series| dates::normalize_daily(&dates::parse_labels(series)))
            .unwrap_or_default();

        Some(Snapshot {
            as_of,
            source: DataSource::Scrape,
            daily,
            monthly: self.monthly_records(),
            summary: self.summary.clone(),
            processing_times: self
                .percentiles
                .map(|p| ProcessingTimePercentiles::new(as_of, p)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Status;

    const FIXTURE: &str = include_str!("../../fixtures/perm_timeline.html");

    fn extractor() -> Extractor {
        Extractor::new(ExtractorConfig::default()).expect("default config compiles")
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn page(payload: &str) -> String {
        format!(r#"<html><body><script>self.__next_f.push([1,"{payload}"])</script></body></html>"#)
    }

    #[test]
    fn test_extract_fixture_page() {
        let result = extractor().extract_on(FIXTURE, date(2025, 3, 20));

        assert_eq!(result.today_date.as_deref(), Some("2025-03-09"));
        assert_eq!(result.as_of, Some(date(2025, 3, 9)));

        let months = result.months.as_ref().expect("Should have months");
        assert_eq!(months.len(), 2);
        assert_eq!(months[1].statuses.len(), 4);

        let daily = result.daily.as_ref().expect("Should have daily series");
        assert_eq!(daily.default_index, Some(8));
        assert_eq!(daily.days.len(), 8);
        assert_eq!(daily.days[1].total, 315);
        assert_eq!(daily.days[7].label, "Mar/09/25 (today) Sun");

        let p = result.percentiles.expect("Should have percentiles");
        assert_eq!((p.p30, p.p50, p.p80), (42, 64, 90));

        let summary = result.summary.as_ref().expect("Should have summary");
        assert_eq!(summary.record_date, date(2025, 3, 9));
        assert_eq!(summary.total_applications, 11509);
        assert_eq!(summary.pending_applications, 11050);
        assert_eq!(summary.pending_percentage, 96.01);
        assert_eq!(summary.changes_today, 308);
        assert_eq!(summary.completed_today, 43);
        assert!(result.diagnostics.is_empty());
    }

    #[test]
    fn test_fixture_snapshot() {
        let result = extractor().extract_on(FIXTURE, date(2025, 3, 20));
        let snapshot = result.to_snapshot().expect("Should normalize");

        assert_eq!(snapshot.as_of, date(2025, 3, 9));
        assert_eq!(snapshot.source, DataSource::Scrape);
        assert_eq!(snapshot.daily.len(), 8);
        assert_eq!(snapshot.daily[6].date, date(2025, 3, 8));
        assert_eq!(snapshot.daily[6].day_of_week, "Saturday");
        assert_eq!(snapshot.monthly.len(), 6);
        assert!(
            snapshot
                .monthly
                .iter()
                .any(|r| r.month_name == "Feb" && r.status == Status::Withdrawn)
        );
        assert_eq!(
            snapshot.processing_times.map(|t| t.as_of_date),
            Some(date(2025, 3, 9))
        );
    }

    #[test]
    fn test_single_bucket_summary() {
        let html = page(
            r#"{\"submissionMonths\":[{\"month\":\"Mar 2025\",\"active\":true,\"statuses\":[{\"status\":\"CERTIFIED\",\"count\":100,\"dailyChange\":5},{\"status\":\"ANALYST REVIEW\",\"count\":50,\"dailyChange\":0}]}]}"#,
        );

        let result = extractor().extract_on(&html, date(2025, 3, 9));
        let summary = result.summary.expect("Should have summary");
        assert_eq!(summary.total_applications, 150);
        assert_eq!(summary.pending_applications, 50);
        assert_eq!(summary.pending_percentage, 33.33);
        assert_eq!(summary.completed_today, 5);
        // no labels and no todayDate: falls back to the run date
        assert_eq!(result.as_of, Some(date(2025, 3, 9)));
        assert!(result.daily.is_none());
        assert!(result.percentiles.is_none());
    }

    #[test]
    fn test_empty_months_produce_no_summary() {
        let html = page(r#"{\"submissionMonths\":[],\"todayDate\":\"2025-03-09\"}"#);
        let result = extractor().extract_on(&html, date(2025, 3, 20));

        assert!(result.months.is_none());
        assert!(result.summary.is_none());
        assert_eq!(result.as_of, Some(date(2025, 3, 9)));
        assert!(result.to_snapshot().is_none());

        // buckets survive but every status is rejected
        let html = page(
            r#"{\"submissionMonths\":[{\"month\":\"Mar 2025\",\"active\":true,\"statuses\":[{\"status\":\"DENIED\"}]}]}"#,
        );
        let result = extractor().extract_on(&html, date(2025, 3, 9));
        assert_eq!(result.months.as_ref().map(Vec::len), Some(1));
        assert!(result.summary.is_none());
    }

    #[test]
    fn test_missing_marker_is_empty_result() {
        let html = page("nothing to see");
        let result = extractor().extract_on(&html, date(2025, 3, 9));

        assert!(result.is_empty());
        assert!(result.as_of.is_none());
        assert!(result.summary.is_none());
        assert!(result.to_snapshot().is_none());
    }

    #[test]
    fn test_unbalanced_months_do_not_stop_other_recoverers() {
        let payload = format!(
            r#"{{\"submissionMonths\":[{{\"month\":\"Mar 2025\"{}[\"$\",\"$L18\",null,{{\"data\":[0,{{\"0\":\"Mar/08/25\\nSat\",\"1\":9}}]}}] \"30%\":\"≤ \"42\"\"50%\":\"≤ \"64\"\"80%\":\"≤ \"90\""#,
            "x".repeat(300)
        );
        let config = ExtractorConfig {
            months_lookahead: 100,
            ..ExtractorConfig::default()
        };
        let extractor = Extractor::new(config).expect("config compiles");

        let result = extractor.extract_on(&page(&payload), date(2025, 3, 20));
        assert!(result.months.is_none());
        assert!(result.summary.is_none());
        assert_eq!(result.daily.as_ref().map(|d| d.days.len()), Some(1));
        assert_eq!(result.as_of, Some(date(2025, 3, 8)));
        assert_eq!(result.percentiles.map(|p| p.p80), Some(90));
    }

    #[test]
    fn test_locator_diagnostic_in_debug() {
        let extractor =
            Extractor::new(ExtractorConfig::default().with_debug(true)).expect("config compiles");
        let result = extractor.extract_on("<html></html>", date(2025, 3, 9));
        assert_eq!(result.diagnostics.len(), 1);
        assert_eq!(result.diagnostics[0].stage, Stage::Locator);
    }

    #[test]
    fn test_raw_daily_chunk() {
        let chunk = extractor()
            .raw_daily_chunk(FIXTURE, date(2025, 3, 10))
            .expect("Should find a recent label");
        assert!(chunk.contains("Mar/09/25"));
        assert!(chunk.len() <= RAW_CHUNK_BEFORE + RAW_CHUNK_AFTER);

        assert!(
            extractor()
                .raw_daily_chunk(FIXTURE, date(2025, 6, 1))
                .is_none()
        );
    }
}
