//! Text processing utilities.

/// Approximate characters per token, used for budgets and token estimates.
pub const CHARS_PER_TOKEN: usize = 4;

/// Trim surrounding whitespace and drop NUL and other non-whitespace control
/// characters.
pub fn normalize_text(text: &str) -> String {
    text.trim()
        .chars()
        .filter(|c| !c.is_control() || c.is_whitespace())
        .collect()
}

/// Character budget that corresponds to `max_tokens`.
pub fn char_budget(max_tokens: usize) -> usize {
    max_tokens.saturating_mul(CHARS_PER_TOKEN)
}

/// Cut `text` to at most `max_chars` characters, on a char boundary.
/// Returns whether anything was removed.
pub fn truncate_chars(text: &mut String, max_chars: usize) -> bool {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => {
            text.truncate(byte_idx);
            true
        }
        None => false,
    }
}

/// Rough token count for texts the backend cannot tokenize for us.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// First `max_chars` characters, with an ellipsis when shortened.
pub fn preview(text: &str, max_chars: usize) -> String {
    let head: String = text.chars().take(max_chars).collect();
    if text.chars().nth(max_chars).is_some() {
        format!("{head}...")
    } else {
        head
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_text() {
        assert_eq!(normalize_text("  hello\u{0}world \n"), "helloworld");
        assert_eq!(normalize_text("line one\nline two"), "line one\nline two");
        assert_eq!(normalize_text(" \t\n "), "");
    }

    #[test]
    fn test_truncate_chars_respects_char_boundaries() {
        let mut s = "héllo wörld".to_string();
        assert!(truncate_chars(&mut s, 4));
        assert_eq!(s, "héll");

        let mut s = "short".to_string();
        assert!(!truncate_chars(&mut s, 5));
        assert_eq!(s, "short");
    }

    #[test]
    fn test_truncation_is_deterministic() {
        let original = "abc".repeat(100);
        let mut a = original.clone();
        let mut b = original;
        truncate_chars(&mut a, char_budget(10));
        truncate_chars(&mut b, char_budget(10));
        assert_eq!(a, b);
        assert_eq!(a.chars().count(), 40);
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn test_preview() {
        assert_eq!(preview("abcdef", 3), "abc...");
        assert_eq!(preview("abc", 3), "abc");
    }
}
