use std::sync::LazyLock;

use regex::Regex;
use scraper::{Html, Selector};

static RE_PUSH_WRAPPER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)^\s*self\.__next_f\.push\(\[1,\s*"(.*)"\]\)\s*;?\s*$"#)
        .expect("invalid regex: push wrapper")
});

/// Collects the string payload of every inline `self.__next_f.push([1,"…"])`
/// script, in document order.
pub fn fragments(html: &str) -> Vec<String> {
    let document = Html::parse_document(html);
    let script_selector = Selector::parse("script").unwrap();

    document
        .select(&script_selector)
        .filter(|e| e.value().attr("src").is_none())
        .filter_map(|e| {
            let body = e.text().collect::<String>();
            RE_PUSH_WRAPPER
                .captures(&body)
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().to_string())
        })
        .collect()
}

/// Returns the first fragment containing `marker`.
pub fn locate(html: &str, marker: &str) -> Option<String> {
    let fragments = fragments(html);
    log::debug!("Found {} script fragments", fragments.len());

    let found = fragments
        .into_iter()
        .enumerate()
        .find(|(_, fragment)| fragment.contains(marker));

    match found {
        Some((i, fragment)) => {
            log::debug!("Found '{}' in fragment {}", marker, i);
            Some(fragment)
        }
        None => {
            log::warn!("No fragment contains '{}'", marker);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fragments_in_document_order() {
        let html = r#"
            <html><head>
            <script src="/_next/static/chunks/main.js"></script>
            <script>self.__next_f.push([1,"first"])</script>
            <script>console.log("unrelated")</script>
            <script>self.__next_f.push([1, "second \"quoted\""])</script>
            </head></html>
        "#;

        let fragments = fragments(html);
        assert_eq!(fragments, vec!["first", r#"second \"quoted\""#]);
    }

    #[test]
    fn test_locate_first_match_wins() {
        let html = r#"
            <script>self.__next_f.push([1,"nothing here"])</script>
            <script>self.__next_f.push([1,"A submissionMonths"])</script>
            <script>self.__next_f.push([1,"B submissionMonths"])</script>
        "#;

        let fragment = locate(html, "submissionMonths").expect("Should locate fragment");
        assert!(fragment.starts_with('A'));
    }

    #[test]
    fn test_locate_missing_marker() {
        let html = r#"<script>self.__next_f.push([1,"no data"])</script>"#;
        assert!(locate(html, "submissionMonths").is_none());
        assert!(locate("", "submissionMonths").is_none());
    }

    #[test]
    fn test_fragment_spanning_lines() {
        let html = "<script>self.__next_f.push([1,\"line one\nline two\"])</script>";
        assert_eq!(fragments(html), vec!["line one\nline two"]);
    }
}
