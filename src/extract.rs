//! Normalization of a raw multi-line answer into one bounded comment string.

use strip_ansi_escapes::strip_str;

/// Markdown bullet/numbering/checkmark prefixes stripped from the head of
/// the chosen line.
const BULLET_PREFIXES: &[&str] = &["- ", "* ", "1. ", "・", "✔ ", "✓ ", "» "];

/// Role labels the model sometimes prepends despite instructions.
const ROLE_PREFIXES: &[&str] = &["assistant:", "model:", "output:"];

/// Reduce a raw answer to a single display string: first non-blank line,
/// with code fences, list prefixes, role labels, and one layer of wrapping
/// quotes removed, truncated to `max_chars` characters (zero or negative
/// disables truncation).
///
/// Returns an empty string when nothing is extractable; callers substitute
/// a fallback comment in that case, never an empty one.
pub fn extract_comment(raw: &str, max_chars: i64) -> String {
    let cleaned = strip_str(raw);

    for line in cleaned.lines() {
        let normalized = line.trim();
        if normalized.is_empty() {
            continue;
        }
        let mut text = normalized.to_string();

        if text.starts_with("```") && text.ends_with("```") {
            text = text.trim_matches('`').trim().to_string();
        }

        for prefix in BULLET_PREFIXES {
            if let Some(rest) = text.strip_prefix(prefix) {
                text = rest.trim_start().to_string();
                break;
            }
        }

        for prefix in ROLE_PREFIXES {
            let matches = text
                .get(..prefix.len())
                .is_some_and(|head| head.eq_ignore_ascii_case(prefix));
            if matches {
                text = text[prefix.len()..].trim_start().to_string();
                break;
            }
        }

        text = strip_wrapping_quotes(&text);
        return truncate_chars(&text, max_chars);
    }

    // No usable line; fall back to the whole cleaned text.
    truncate_chars(cleaned.trim(), max_chars)
}

fn strip_wrapping_quotes(text: &str) -> String {
    for quote in ['"', '\''] {
        if text.chars().count() >= 2 && text.starts_with(quote) && text.ends_with(quote) {
            let inner = &text[quote.len_utf8()..text.len() - quote.len_utf8()];
            return inner.trim().to_string();
        }
    }
    text.to_string()
}

fn truncate_chars(text: &str, max_chars: i64) -> String {
    if max_chars <= 0 {
        return text.to_string();
    }
    let max = max_chars as usize;
    if text.chars().count() > max {
        text.chars().take(max).collect()
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_wrapping_quotes() {
        assert_eq!(extract_comment("\"Nice shot!\"", 50), "Nice shot!");
        assert_eq!(extract_comment("'いいね'", 50), "いいね");
    }

    #[test]
    fn takes_first_non_blank_line() {
        assert_eq!(extract_comment("\n\nすごい！\nsecond line", 50), "すごい！");
    }

    #[test]
    fn strips_code_fence_wrap() {
        assert_eq!(extract_comment("```naisu```", 50), "naisu");
    }

    #[test]
    fn strips_bullet_prefixes() {
        assert_eq!(extract_comment("- a comment", 50), "a comment");
        assert_eq!(extract_comment("・コメント", 50), "コメント");
        assert_eq!(extract_comment("✔ done", 50), "done");
    }

    #[test]
    fn strips_role_prefixes_case_insensitive() {
        assert_eq!(extract_comment("Assistant: hello", 50), "hello");
        assert_eq!(extract_comment("OUTPUT: hi", 50), "hi");
    }

    #[test]
    fn truncates_to_max_chars() {
        let raw = "あ".repeat(200);
        let comment = extract_comment(&raw, 120);
        assert_eq!(comment.chars().count(), 120);
    }

    #[test]
    fn zero_max_disables_truncation() {
        let raw = "x".repeat(300);
        assert_eq!(extract_comment(&raw, 0).len(), 300);
    }

    #[test]
    fn empty_answer_yields_empty_string() {
        assert_eq!(extract_comment("", 50), "");
        assert_eq!(extract_comment("  \n \n", 50), "");
    }

    #[test]
    fn removes_ansi_sequences() {
        assert_eq!(extract_comment("\x1b[1mナイス\x1b[0m", 50), "ナイス");
    }

    #[test]
    fn combined_prefix_and_quotes() {
        assert_eq!(extract_comment("- \"quoted\"", 50), "quoted");
    }
}
