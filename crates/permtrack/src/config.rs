/// Markers, keys and scan limits used by the extraction engine.
///
/// The defaults match the page layout observed on the timeline site. All of
/// them are plain data so a layout drift can be handled by constructing a
/// different config instead of patching the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractorConfig {
    /// Substring that identifies the payload fragment carrying the dataset.
    pub dataset_marker: String,
    /// Key introducing the monthly status array.
    pub months_key: String,
    /// Key holding the page's own notion of today (`YYYY-MM-DD`).
    pub today_key: String,
    /// Internal reference tag addressing the daily series element.
    pub daily_tag: String,
    /// Bytes scanned after the opening `[` of the monthly array.
    pub months_lookahead: usize,
    /// Bytes scanned after the opening `[` of the daily array.
    pub daily_lookahead: usize,
    /// Maximum characters between a percentile label and its value.
    pub percentile_window: usize,
    /// Upper bound on captured diagnostic snippets.
    pub snippet_limit: usize,
    /// Capture raw-text diagnostics when structured parsing fails.
    pub debug: bool,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            dataset_marker: "submissionMonths".to_string(),
            months_key: "submissionMonths".to_string(),
            today_key: "todayDate".to_string(),
            daily_tag: "$L18".to_string(),
            months_lookahead: 50_000,
            daily_lookahead: 20_000,
            percentile_window: 200,
            snippet_limit: 500,
            debug: false,
        }
    }
}

impl ExtractorConfig {
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}
