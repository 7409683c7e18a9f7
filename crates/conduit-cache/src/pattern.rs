//! Glob-style key-pattern matching used by
//! [`CacheEngine::invalidate_pattern`](crate::CacheEngine::invalidate_pattern).
//!
//! The only wildcard is `*`, matching any run of characters (including
//! none); everything else is matched literally. Patterns are always
//! anchored to the full key.

use regex::Regex;

/// Compile a `*`-glob pattern into an anchored [`Regex`].
pub(crate) fn compile(pattern: &str) -> Regex {
    let mut anchored = String::from("^");
    for segment in pattern.split('*') {
        anchored.push_str(&regex::escape(segment));
        anchored.push_str(".*");
    }
    // Each `split` yields one more fragment than there are wildcards, and we
    // appended a trailing `.*` after every fragment including the last one;
    // trim it back off so a pattern with no trailing `*` doesn't match keys
    // with extra suffix characters.
    if !pattern.ends_with('*') {
        anchored.truncate(anchored.len() - 2);
    }
    anchored.push('$');
    Regex::new(&anchored).expect("glob-derived pattern is always valid regex")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_pattern_matches_only_itself() {
        let re = compile("user:42");
        assert!(re.is_match("user:42"));
        assert!(!re.is_match("user:420"));
        assert!(!re.is_match("user:4"));
    }

    #[test]
    fn trailing_wildcard_matches_prefix() {
        let re = compile("user:*");
        assert!(re.is_match("user:42"));
        assert!(re.is_match("user:"));
        assert!(!re.is_match("order:42"));
    }

    #[test]
    fn wildcard_in_the_middle_matches_any_infix() {
        let re = compile("user:*:profile");
        assert!(re.is_match("user:42:profile"));
        assert!(re.is_match("user::profile"));
        assert!(!re.is_match("user:42:settings"));
    }

    #[test]
    fn bare_wildcard_matches_everything() {
        let re = compile("*");
        assert!(re.is_match(""));
        assert!(re.is_match("anything:at:all"));
    }

    #[test]
    fn regex_metacharacters_in_the_pattern_are_literal() {
        let re = compile("user.42");
        assert!(re.is_match("user.42"));
        assert!(!re.is_match("userA42"));
    }
}
