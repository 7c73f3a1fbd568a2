//! Recovery of the recent daily submission series.
//!
//! The series lives in a flight element addressed by an internal tag
//! (`$L18` by default), shaped like
//! `["$","$L18",null,{"data":[2935,{"0":"Feb/24/25\nMon","1":120,"2":31},…]}]`
//! once unescaped. The leading integer is the default panel index; every
//! following object is one day whose numeric keys are per-status counters.

use std::sync::LazyLock;

use regex::Regex;

use super::span::{balanced_array, snippet, unescape};
use crate::config::ExtractorConfig;
use crate::types::{DailyEntry, DailySeries, Diagnostic, Stage};

static RE_DATA_ARRAY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^\[\s*(\d+)\s*,(.*)\]$").expect("invalid regex: data array")
});
static RE_DAY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?s)\{"0":"([^"]+)"(.*?)\}"#).expect("invalid regex: day"));
static RE_DAY_OBJECT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\{"0":"([A-Za-z]{3}/\d{1,2}/\d{2}[^"]*)"((?:,\s*"\d+":\s*\d+)*)\s*\}"#)
        .expect("invalid regex: day object")
});
static RE_COUNTER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""(\d+)":\s*(\d+)"#).expect("invalid regex: counter"));
static RE_NEWLINE_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\\+n").expect("invalid regex: newline escape"));

/// Ordered anchor patterns locating the opening `[` of the data array.
#[derive(Debug, Clone)]
pub struct DailyAnchors {
    tag: String,
    patterns: Vec<Regex>,
}

impl DailyAnchors {
    pub fn new(tag: &str) -> Result<Self, regex::Error> {
        let t = regex::escape(tag);
        let patterns = [
            // fully escaped: [\"$\",\"$L18\",null,{\"data\":[
            format!(r#"\[\\"\$\\",\\"{t}\\",null,\{{\\"data\\":\["#),
            // unescaped: ["$","$L18",null,{"data":[
            format!(r#"\["\$","{t}",null,\{{"data":\["#),
            // loose: anything that ends with $L18",null,{"data":[
            format!(r#"{t}\\*",\s*null,\s*\{{\\*"data\\*":\s*\["#),
        ]
        .iter()
        .map(|p| Regex::new(p))
        .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            tag: tag.to_string(),
            patterns,
        })
    }

    /// Byte offset of the data array's `[`, trying each anchor in order and
    /// finally a structural search for the tag followed by `data` and `[`.
    pub fn find(&self, fragment: &str) -> Option<usize> {
        for (i, pattern) in self.patterns.iter().enumerate() {
            if let Some(m) = pattern.find(fragment) {
                log::debug!("Found daily data with anchor {}", i);
                return Some(m.end() - 1);
            }
        }

        let tag_pos = fragment.find(&self.tag)?;
        let data_pos = tag_pos + fragment[tag_pos..].find("data")?;
        let open = data_pos + fragment[data_pos..].find('[')?;
        log::debug!("Found potential daily data array start at position {}", open);
        Some(open)
    }
}

/// Recovers the daily series from `fragment`.
pub fn recover(
    fragment: &str,
    anchors: &DailyAnchors,
    config: &ExtractorConfig,
    diagnostics: &mut Vec<Diagnostic>,
) -> Option<DailySeries> {
    let structured = match anchors.find(fragment) {
        Some(open) => match balanced_array(fragment, open, config.daily_lookahead) {
            Some(span) => {
                let normalized = unescape(&unescape(span));
                let series = parse_data_array(&normalized);
                if series.is_none() {
                    log::warn!(
                        "Daily data array did not decompose: {}",
                        snippet(&normalized, 120)
                    );
                    if config.debug {
                        diagnostics.push(Diagnostic {
                            stage: Stage::Daily,
                            snippet: snippet(&normalized, config.snippet_limit),
                        });
                    }
                }
                series
            }
            None => {
                log::warn!("Could not find balanced end of daily data array");
                None
            }
        },
        None => {
            log::warn!("Could not find daily progress data anchor");
            None
        }
    };

    let series = structured.or_else(|| {
        log::info!("Falling back to raw scan for daily progress objects");
        scan_day_objects(fragment)
    })?;

    log::debug!("Recovered {} day(s) of daily progress", series.days.len());
    Some(series)
}

fn parse_data_array(normalized: &str) -> Option<DailySeries> {
    let caps = RE_DATA_ARRAY.captures(normalized.trim())?;
    let default_index = caps[1].parse().ok();

    let days: Vec<DailyEntry> = RE_DAY
        .captures_iter(&caps[2])
        .filter_map(|day| day_entry(&day[1], &day[2]))
        .collect();

    (!days.is_empty()).then_some(DailySeries {
        default_index,
        days,
    })
}

fn scan_day_objects(fragment: &str) -> Option<DailySeries> {
    let normalized = unescape(&unescape(fragment));

    let days: Vec<DailyEntry> = RE_DAY_OBJECT
        .captures_iter(&normalized)
        .filter_map(|day| day_entry(&day[1], &day[2]))
        .collect();

    (!days.is_empty()).then_some(DailySeries {
        default_index: None,
        days,
    })
}

fn day_entry(raw_label: &str, counters: &str) -> Option<DailyEntry> {
    let label = clean_label(raw_label);
    if label.is_empty() {
        log::warn!("Dropping day entry with empty label");
        return None;
    }

    let total = RE_COUNTER
        .captures_iter(counters)
        .filter_map(|c| c[2].parse::<u64>().ok())
        .fold(0u64, u64::saturating_add);

    Some(DailyEntry { label, total })
}

/// `"Feb/24/25\nMon"` → `"Feb/24/25 Mon"`.
fn clean_label(raw: &str) -> String {
    RE_NEWLINE_ESCAPE
        .replace_all(raw, " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
