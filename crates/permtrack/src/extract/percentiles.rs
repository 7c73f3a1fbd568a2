use regex::Regex;

use super::span::snippet;
use crate::config::ExtractorConfig;
use crate::types::{Diagnostic, Percentiles, Stage};

/// Positional matcher for the `30% / 50% / 80%` processing-time table.
///
/// Quotes around labels and values may carry any number of escaping
/// backslashes, so the same pattern works on raw and unescaped text.
#[derive(Debug, Clone)]
pub struct PercentileMatcher {
    pattern: Regex,
}

impl PercentileMatcher {
    pub fn new(window: usize) -> Result<Self, regex::Error> {
        let cell = |label: &str| format!(r#"\\*"{label}%\\*".{{0,{window}}}?\\*"≤ \D{{0,12}}?(\d+)"#);
        let pattern = format!(
            "(?s){}.{{0,{window}}}?{}.{{0,{window}}}?{}",
            cell("30"),
            cell("50"),
            cell("80")
        );

        Ok(Self {
            pattern: Regex::new(&pattern)?,
        })
    }

    pub fn find(&self, text: &str) -> Option<Percentiles> {
        let caps = self.pattern.captures(text)?;
        Some(Percentiles {
            p30: caps[1].parse().ok()?,
            p50: caps[2].parse().ok()?,
            p80: caps[3].parse().ok()?,
        })
    }
}

pub fn extract(
    fragment: &str,
    matcher: &PercentileMatcher,
    config: &ExtractorConfig,
    diagnostics: &mut Vec<Diagnostic>,
) -> Option<Percentiles> {
    let Some(percentiles) = matcher.find(fragment) else {
        log::info!("No processing-time percentiles found");
        if config.debug
            && let Some(pos) = fragment.find("30%")
        {
            diagnostics.push(Diagnostic {
                stage: Stage::Percentiles,
                snippet: snippet(&fragment[pos..], config.snippet_limit),
            });
        }
        return None;
    };

    if !percentiles.is_monotonic() {
        log::warn!(
            "Processing-time percentiles are not monotonic: 30%={} 50%={} 80%={}",
            percentiles.p30,
            percentiles.p50,
            percentiles.p80
        );
    }
    log::debug!("Extracted processing times: {:?}", percentiles);
    Some(percentiles)
}
