//! Bracket-balanced span scanning and one-level unescaping shared by the
//! array recoverers.

/// Returns the array starting at byte offset `open`, scanning at most
/// `lookahead` bytes for the matching `]`.
///
/// Brackets are counted blindly, including those inside string literals.
/// If nesting does not return to zero inside the window the scan reports
/// nothing rather than a truncated span.
pub fn balanced_array(text: &str, open: usize, lookahead: usize) -> Option<&str> {
    let bytes = text.as_bytes();
    if bytes.get(open) != Some(&b'[') {
        return None;
    }

    let limit = open.saturating_add(lookahead).min(bytes.len());
    let mut depth = 1usize;

    for (i, &b) in bytes.iter().enumerate().take(limit).skip(open + 1) {
        match b {
            b'[' => depth += 1,
            b']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[open..=i]);
                }
            }
            _ => {}
        }
    }

    None
}

/// Locates `key` and returns the balanced array that follows its first `[`.
pub fn array_after_key<'a>(text: &'a str, key: &str, lookahead: usize) -> Option<&'a str> {
    let key_pos = text.find(key)?;
    let open = key_pos + text[key_pos..].find('[')?;
    balanced_array(text, open, lookahead)
}

/// Collapses one level of string escaping: `\"` becomes `"` and `\\`
/// becomes `\`.
pub fn unescape(text: &str) -> String {
    text.replace("\\\"", "\"").replace("\\\\", "\\")
}

/// Bounded copy of `text` for logs and diagnostics.
pub fn snippet(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let mut out: String = text.chars().take(limit).collect();
    out.push_str("...");
    out
}
