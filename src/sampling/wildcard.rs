/// A backtracking implementation of glob matching.
///
/// The pattern language supports `*` as a multi-character wildcard (including
/// the empty string) and `?` as a single-character wildcard. Matching is over
/// characters, not bytes, so a multi-byte character counts as one `?`.
/// An empty pattern matches only the empty text.
pub fn wildcard_match(pattern: &str, text: &str, case_insensitive: bool) -> bool {
    if case_insensitive {
        return match_chars(
            &pattern.to_lowercase().chars().collect::<Vec<_>>(),
            &text.to_lowercase().chars().collect::<Vec<_>>(),
        );
    }
    match_chars(
        &pattern.chars().collect::<Vec<_>>(),
        &text.chars().collect::<Vec<_>>(),
    )
}

fn match_chars(pattern: &[char], text: &[char]) -> bool {
    let mut px = 0;
    let mut tx = 0;
    // restart points for the most recent `*`
    let mut next_px = 0;
    let mut next_tx = 0;

    while px < pattern.len() || tx < text.len() {
        if px < pattern.len() {
            match pattern[px] {
                '?' => {
                    if tx < text.len() {
                        px += 1;
                        tx += 1;
                        continue;
                    }
                }
                '*' => {
                    next_px = px;
                    next_tx = tx + 1;
                    px += 1;
                    continue;
                }
                c => {
                    if tx < text.len() && text[tx] == c {
                        px += 1;
                        tx += 1;
                        continue;
                    }
                }
            }
        }
        // mismatch: backtrack to the last `*` and let it absorb one more char
        if 0 < next_tx && next_tx <= text.len() {
            px = next_px;
            tx = next_tx;
            continue;
        }
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_and_empty() {
        assert!(wildcard_match("hello", "hello", false));
        assert!(!wildcard_match("hello", "hell", false));
        assert!(wildcard_match("", "", false));
        assert!(!wildcard_match("", "a", false));
        assert!(wildcard_match("*", "", false));
        assert!(wildcard_match("*", "anything at all", false));
    }

    #[test]
    fn single_character_wildcard() {
        assert!(wildcard_match("h?llo", "hello", false));
        assert!(wildcard_match("h?llo", "hallo", false));
        assert!(!wildcard_match("h?llo", "hllo", false));
        // one `?` consumes exactly one multi-byte character
        assert!(wildcard_match("?", "é", false));
        assert!(wildcard_match("日?語", "日本語", false));
    }

    #[test]
    fn multi_character_wildcard_backtracks() {
        assert!(wildcard_match("a*b*c*d*e*", "axbxcxdxexxx", false));
        assert!(wildcard_match("*mid*", "the middle part", false));
        assert!(wildcard_match("/api/*/items", "/api/v2/items", false));
        assert!(!wildcard_match("a*b*c", "acb", false));
    }

    #[test]
    fn case_sensitivity_is_a_flag() {
        assert!(!wildcard_match("Hello*", "hello world", false));
        assert!(wildcard_match("Hello*", "hello world", true));
        assert!(wildcard_match("GET", "get", true));
    }
}
