//! Char-boundary-safe text truncation helpers shared by the logging and
//! guardrail code paths that only ever see a prefix of user-supplied text.

/// Borrow at most the first `n` characters of `s`, without ever slicing
/// inside a multi-byte UTF-8 sequence.
pub(crate) fn truncate_str(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

/// Owned truncation to the first `n` characters, appending `...` when the
/// input was longer.
pub(crate) fn truncate_with_ellipsis(s: &str, n: usize) -> String {
    match s.char_indices().nth(n) {
        Some((i, _)) => format!("{}...", &s[..i]),
        None => s.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_str_respects_char_boundaries() {
        let s = "a".repeat(49) + "ééééé";
        let out = truncate_str(&s, 50);
        assert!(s.is_char_boundary(out.len()));
        assert_eq!(out.chars().count(), 50);
    }

    #[test]
    fn truncate_str_shorter_than_n_is_unchanged() {
        assert_eq!(truncate_str("hi", 50), "hi");
    }

    #[test]
    fn truncate_with_ellipsis_appends_on_overflow() {
        let s = "x".repeat(60);
        let out = truncate_with_ellipsis(&s, 50);
        assert_eq!(out.chars().count(), 53);
        assert!(out.ends_with("..."));
    }

    #[test]
    fn truncate_with_ellipsis_passes_through_short_text() {
        assert_eq!(truncate_with_ellipsis("hi", 50), "hi");
    }
}
