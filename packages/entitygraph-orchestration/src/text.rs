//! Text preparation helpers

use once_cell::sync::Lazy;
use regex::Regex;

static BLOCK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<(script|style)\b[^>]*>.*?</(script|style)\s*>").expect("static regex is valid")
});
static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]*>").expect("static regex is valid"));
static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("static regex is valid"));

/// Drop script/style blocks and tags, then decode the common entities
pub fn strip_markup(html: &str) -> String {
    let without_blocks = BLOCK_RE.replace_all(html, " ");
    let without_tags = TAG_RE.replace_all(&without_blocks, " ");
    decode_entities(&without_tags)
}

fn decode_entities(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#039;", "'")
        .replace("&amp;", "&")
}

/// Collapse whitespace runs into single spaces and trim
pub fn normalize_whitespace(s: &str) -> String {
    WHITESPACE_RE.replace_all(s, " ").trim().to_string()
}

/// Keep at most `max_chars` characters, on a char boundary
pub fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((offset, _)) => &s[..offset],
        None => s,
    }
}

/// Plain text handed to the extractor: title and body, markup removed,
/// whitespace normalized, capped at `max_chars`.
pub fn prepare_content(title: &str, raw_body: &str, max_chars: usize) -> String {
    let body = normalize_whitespace(&strip_markup(raw_body));
    let title = normalize_whitespace(&strip_markup(title));
    let combined = if title.is_empty() {
        body
    } else if body.is_empty() {
        title
    } else {
        format!("{}\n\n{}", title, body)
    };
    truncate_chars(&combined, max_chars).trim_end().to_string()
}
