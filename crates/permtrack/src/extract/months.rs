//! Recovery of the monthly status array (`submissionMonths`).

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use super::span::{array_after_key, snippet, unescape};
use crate::config::ExtractorConfig;
use crate::types::{Diagnostic, MonthBucket, Stage, Status, StatusCount};

static RE_MONTH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)"month":"([^"]+)","active":(true|false),"statuses":\[(.*?)\]"#)
        .expect("invalid regex: month bucket")
});
static RE_STATUS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""status":"([^"]+)","count":(\d+)(?:,"dailyChange":(-?\d+))?"#)
        .expect("invalid regex: status count")
});

type Strategy = fn(&str) -> Option<Vec<MonthBucket>>;

const STRATEGIES: &[(&str, Strategy)] = &[("json", parse_json), ("regex", parse_regex)];

/// Recovers the month buckets stored under `config.months_key`.
pub fn recover(
    fragment: &str,
    config: &ExtractorConfig,
    diagnostics: &mut Vec<Diagnostic>,
) -> Option<Vec<MonthBucket>> {
    let Some(span) = array_after_key(fragment, &config.months_key, config.months_lookahead) else {
        log::warn!(
            "Could not find a balanced '{}' array within {} bytes",
            config.months_key,
            config.months_lookahead
        );
        return None;
    };
    log::debug!("Extracted {} array ({} bytes)", config.months_key, span.len());

    let cleaned = unescape(span);

    for (name, strategy) in STRATEGIES {
        if let Some(buckets) = strategy(&cleaned) {
            log::debug!("Recovered {} month(s) via {}", buckets.len(), name);
            return Some(buckets);
        }
        log::debug!("Month strategy '{}' yielded nothing", name);
    }

    log::warn!(
        "Failed to parse months array: {}",
        snippet(&cleaned, 120)
    );
    if config.debug {
        diagnostics.push(Diagnostic {
            stage: Stage::Months,
            snippet: snippet(&cleaned, config.snippet_limit),
        });
    }
    None
}

fn parse_json(cleaned: &str) -> Option<Vec<MonthBucket>> {
    let values: Vec<Value> = match serde_json::from_str(cleaned) {
        Ok(values) => values,
        Err(e) => {
            log::debug!("JSON parsing error: {}", e);
            return None;
        }
    };

    let buckets: Vec<MonthBucket> = values.iter().filter_map(MonthBucket::from_value).collect();
    (!buckets.is_empty()).then_some(buckets)
}

fn parse_regex(cleaned: &str) -> Option<Vec<MonthBucket>> {
    let buckets: Vec<MonthBucket> = RE_MONTH
        .captures_iter(cleaned)
        .map(|caps| {
            let statuses = RE_STATUS
                .captures_iter(&caps[3])
                .filter_map(|s| {
                    Some(StatusCount {
                        status: Status::from(s[1].to_string()),
                        count: s[2].parse().ok()?,
                        daily_change: s
                            .get(3)
                            .and_then(|m| m.as_str().parse().ok())
                            .unwrap_or(0),
                    })
                })
                .collect();

            MonthBucket {
                month: caps[1].to_string(),
                active: &caps[2] == "true",
                statuses,
            }
        })
        .collect();

    (!buckets.is_empty()).then_some(buckets)
}
