//! Slug and grouping-key normalisation.
//!
//! `slugify` produces the stored identity of entities and aliases.
//! `grouping_key` is coarser: it is only used to cluster raw extraction
//! candidates before a canonical spelling is chosen.

use once_cell::sync::Lazy;
use regex::Regex;

static NON_ALNUM_RUN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^\p{L}\p{N}]+").expect("static regex is valid"));

/// Trailing legal-form tokens that do not distinguish organisations.
const LEGAL_SUFFIXES: &[&str] = &[
    "inc", "incorporated", "corp", "corporation", "co", "ltd", "limited", "llc", "plc", "gmbh",
    "ag", "sa",
];

/// Lower-case `name` and collapse every run of non-alphanumeric characters
/// into a single `-`, trimming leading and trailing separators.
///
/// ```
/// use entitygraph_storage::domain::slug::slugify;
///
/// assert_eq!(slugify("  Open AI, Inc. "), "open-ai-inc");
/// assert_eq!(slugify("---"), "");
/// ```
pub fn slugify(name: &str) -> String {
    let lowered = name.trim().to_lowercase();
    NON_ALNUM_RUN
        .replace_all(&lowered, "-")
        .trim_matches('-')
        .to_string()
}

/// Grouping key: slugified, legal-form suffix removed, alphanumerics only.
///
/// "Apple", "apple inc" and "APPLE" all map to `apple`.
pub fn grouping_key(name: &str) -> String {
    let slug = slugify(name);
    let mut tokens: Vec<&str> = slug.split('-').filter(|t| !t.is_empty()).collect();
    while tokens.len() > 1 {
        match tokens.last() {
            Some(last) if LEGAL_SUFFIXES.contains(last) => {
                tokens.pop();
            }
            _ => break,
        }
    }
    tokens
        .concat()
        .chars()
        .filter(|c| c.is_alphanumeric())
        .collect()
}
