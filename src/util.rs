/// Truncate `s` to at most `max_chars` characters, appending `...` when cut.
///
/// Counts `char`s rather than bytes so multi-byte text (CJK, emoji) is never
/// split mid-codepoint.
pub fn truncate_with_ellipsis(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

/// Parse a boolean-ish environment value (`1`, `true`, `yes`, `on`).
pub fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
