/// Truncate a string to at most `max_bytes` bytes at a character boundary.
pub fn truncate_to_char_boundary(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Strip a markdown code fence some models wrap JSON in.
pub fn strip_code_blocks(response: &str) -> &str {
    let trimmed = response.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_multibyte_chars() {
        let text = "Acme ☕ Corp";
        let truncated = truncate_to_char_boundary(text, 6);
        assert_eq!(truncated, "Acme ");
        assert_eq!(truncate_to_char_boundary("short", 100), "short");
    }

    #[test]
    fn code_fences_are_removed() {
        assert_eq!(strip_code_blocks("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_blocks("```\n[]\n```"), "[]");
        assert_eq!(strip_code_blocks("  {}  "), "{}");
    }
}
