use regex::Regex;

/// Characters that make a pattern a regular expression rather than a
/// literal tool name.
const REGEX_METACHARS: &[char] = &[
    '.', '*', '+', '?', '^', '$', '{', '}', '[', ']', '|', '(', ')', '\\',
];

// ─── Matcher ──────────────────────────────────────────────────────────────

/// Tool-name matcher for hook entries and permission rules.
///
/// An empty pattern matches every tool. A pattern without regex
/// metacharacters is a literal equality check; otherwise it is compiled as
/// a regex, downgrading to literal equality if compilation fails.
#[derive(Debug, Clone)]
pub struct Matcher {
    pattern: String,
    regex: Option<Regex>,
    is_exact: bool,
}

impl Matcher {
    pub fn new(pattern: impl Into<String>) -> Self {
        let pattern = pattern.into();
        if pattern.is_empty() {
            return Matcher {
                pattern,
                regex: None,
                is_exact: false,
            };
        }

        let has_metachars = pattern.contains(REGEX_METACHARS);
        if !has_metachars {
            return Matcher {
                pattern,
                regex: None,
                is_exact: true,
            };
        }

        match Regex::new(&pattern) {
            Ok(regex) => Matcher {
                pattern,
                regex: Some(regex),
                is_exact: false,
            },
            Err(_) => Matcher {
                pattern,
                regex: None,
                is_exact: true,
            },
        }
    }

    pub fn matches(&self, tool_name: &str) -> bool {
        if self.pattern.is_empty() {
            return true;
        }
        if self.is_exact {
            return self.pattern == tool_name;
        }
        match &self.regex {
            Some(regex) => regex.is_match(tool_name),
            None => false,
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn is_exact(&self) -> bool {
        self.is_exact
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_pattern_matches_everything() {
        let m = Matcher::new("");
        assert!(m.matches("Bash"));
        assert!(m.matches("Read"));
        assert!(m.matches(""));
    }

    #[test]
    fn literal_pattern_is_exact_equality() {
        let m = Matcher::new("Bash");
        assert!(m.is_exact());
        assert!(m.matches("Bash"));
        assert!(!m.matches("BashScript"));
        assert!(!m.matches("Read"));
    }

    #[test]
    fn metachar_pattern_is_a_regex() {
        let m = Matcher::new("Bash.*");
        assert!(!m.is_exact());
        assert!(m.matches("Bash"));
        assert!(m.matches("BashScript"));
        assert!(!m.matches("Read"));
    }

    #[test]
    fn alternation_works() {
        let m = Matcher::new("Edit|Write");
        assert!(m.matches("Edit"));
        assert!(m.matches("Write"));
        assert!(!m.matches("Read"));
    }

    #[test]
    fn invalid_regex_downgrades_to_literal() {
        let m = Matcher::new("[unclosed");
        assert!(m.is_exact());
        assert!(m.matches("[unclosed"));
        assert!(!m.matches("unclosed"));
    }

    #[test]
    fn pattern_accessor() {
        assert_eq!(Matcher::new("Bash").pattern(), "Bash");
    }
}
