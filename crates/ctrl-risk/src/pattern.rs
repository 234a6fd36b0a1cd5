// pattern.rs - Shell-style wildcards for server/tool/env matching.

use glob::Pattern;

/// A compiled `*` / `?` wildcard such as `*delete*` or `prod-?`.
#[derive(Debug, Clone)]
pub struct Wildcard {
    source: String,
    pattern: Pattern,
}

impl Wildcard {
    pub fn new(source: &str) -> Result<Self, glob::PatternError> {
        Ok(Self {
            source: source.to_string(),
            pattern: Pattern::new(source)?,
        })
    }

    /// The catch-all `*`.
    pub fn any() -> Self {
        Self {
            source: "*".to_string(),
            pattern: Pattern::new("*").unwrap_or_default(),
        }
    }

    pub fn matches(&self, value: &str) -> bool {
        self.is_catch_all() || self.pattern.matches(value)
    }

    pub fn is_catch_all(&self) -> bool {
        self.source == "*"
    }

    /// True when every value this wildcard's sibling `other` matches is
    /// also matched here. Only the cases decidable by inspection are
    /// recognised: a catch-all, or identical text.
    pub fn covers(&self, other: &Wildcard) -> bool {
        self.is_catch_all() || self.source == other.source
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

/// Match without keeping the compiled pattern around. An invalid pattern
/// never matches.
pub fn wildcard_matches(pattern: &str, value: &str) -> bool {
    match Pattern::new(pattern) {
        Ok(p) => p.matches(value),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_and_question_mark() {
        let w = Wildcard::new("*delete*").unwrap();
        assert!(w.matches("delete_table"));
        assert!(w.matches("soft_delete"));
        assert!(!w.matches("select"));

        let w = Wildcard::new("prod-?").unwrap();
        assert!(w.matches("prod-1"));
        assert!(!w.matches("prod-12"));
    }

    #[test]
    fn catch_all_matches_empty_and_slashes() {
        let any = Wildcard::any();
        assert!(any.matches(""));
        assert!(any.matches("a/b/c"));
        assert!(any.is_catch_all());
    }

    #[test]
    fn invalid_patterns_fail_closed() {
        assert!(Wildcard::new("[unclosed").is_err());
        assert!(!wildcard_matches("[unclosed", "[unclosed"));
    }

    #[test]
    fn coverage_is_conservative() {
        let star = Wildcard::any();
        let db = Wildcard::new("db").unwrap();
        let dbx = Wildcard::new("db*").unwrap();
        assert!(star.covers(&db));
        assert!(db.covers(&Wildcard::new("db").unwrap()));
        assert!(!dbx.covers(&db));
        assert!(!db.covers(&star));
    }
}
