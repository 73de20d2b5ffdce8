/// Safely returns a prefix of the string with at most `max_chars` characters.
/// This respects UTF-8 character boundaries.
pub fn prefix_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Truncates a string to at most `max_chars` characters, appending `marker`
/// if anything was cut.
pub fn truncate_chars(s: &str, max_chars: usize, marker: &str) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        format!("{}{}", prefix_chars(s, max_chars), marker)
    }
}
