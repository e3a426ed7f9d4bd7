//! AMQP-style topic pattern matching.
//!
//! Routing keys are dot-separated words. Binding patterns may use `*` for
//! exactly one word and `#` for zero or more words. The in-memory transport
//! routes with this matcher; real brokers implement the same rules
//! server-side.

/// Whether `routing_key` matches the binding `pattern`.
///
/// Examples:
/// - `"#"` matches every key, including the empty key
/// - `"node.*"` matches `"node.added"` but not `"node"` or `"node.a.b"`
/// - `"node.#"` matches `"node"`, `"node.added"`, and `"node.a.b"`
/// - a pattern without wildcards matches only the identical key
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    if pattern == "#" {
        return true;
    }
    match_words(&words(pattern), &words(routing_key))
}

/// Dot-separated words; the empty string is zero words, not one empty word.
fn words(s: &str) -> Vec<&str> {
    if s.is_empty() {
        Vec::new()
    } else {
        s.split('.').collect()
    }
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && match_words(rest, &key[1..]),
        Some((&word, rest)) => key.first() == Some(&word) && match_words(rest, &key[1..]),
    }
}
