use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use tracing::warn;

/// One compiled gitignore line.
#[derive(Debug, Clone)]
struct Rule {
    negated: bool,
    dir_only: bool,
}

/// A compiled gitignore-style rule set.
///
/// Accepts newline-separated rules with the usual semantics: leading `!`
/// negates, trailing `/` matches directories only, a slash anywhere else
/// anchors the pattern to the rule-set root, `**` crosses path segments and
/// `*` does not. The last matching rule wins, so later negations override
/// earlier ignores. An empty rule set matches nothing.
#[derive(Debug, Clone)]
pub struct PathRules {
    set: GlobSet,
    rules: Vec<Rule>,
    lines: Vec<String>,
}

impl Default for PathRules {
    fn default() -> Self {
        PathRules::new("")
    }
}

impl PathRules {
    pub fn new(text: &str) -> PathRules {
        PathRules::from_lines(text.lines())
    }

    pub fn from_lines<'a>(lines: impl IntoIterator<Item = &'a str>) -> PathRules {
        let mut builder = GlobSetBuilder::new();
        let mut rules = Vec::new();
        let mut kept = Vec::new();
        for line in lines {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (negated, body) = match line.strip_prefix('!') {
                Some(rest) => (true, rest),
                None => (false, line),
            };
            let (dir_only, body) = match body.strip_suffix('/') {
                Some(rest) => (true, rest),
                None => (false, body),
            };
            // A slash anywhere anchors the pattern to the rule-set root;
            // otherwise it matches at any depth below it.
            let anchored = body.starts_with('/') || body.contains('/');
            let body = body.strip_prefix('/').unwrap_or(body);
            let glob = if anchored { body.to_string() } else { format!("**/{body}") };
            match GlobBuilder::new(&glob).literal_separator(true).build() {
                Ok(g) => {
                    builder.add(g);
                    rules.push(Rule { negated, dir_only });
                    kept.push(line.to_string());
                }
                Err(e) => warn!(rule = line, error = %e, "skipping unparseable ignore rule"),
            }
        }
        let set = builder
            .build()
            .unwrap_or_else(|_| GlobSetBuilder::new().build().expect("empty glob set"));
        PathRules { set, rules, lines: kept }
    }

    /// Whether `relative_path` is ignored by this rule set. The path must be
    /// relative to wherever the rules were defined (the directory holding the
    /// `.gitignore`, or the mount root for configured rules).
    pub fn matches(&self, relative_path: &str, is_dir: bool) -> bool {
        let relative_path = relative_path.strip_prefix('/').unwrap_or(relative_path);
        if relative_path.is_empty() || self.rules.is_empty() {
            return false;
        }
        if self.matches_one(relative_path, is_dir) {
            return true;
        }
        // An entry inside a matched directory is ignored too; a matched
        // parent cannot be negated away from below.
        relative_path
            .match_indices('/')
            .any(|(i, _)| self.matches_one(&relative_path[..i], true))
    }

    fn matches_one(&self, path: &str, is_dir: bool) -> bool {
        let mut verdict = false;
        // matches() yields rule indices in definition order, so the last
        // applicable hit decides.
        for idx in self.set.matches(path) {
            let rule = &self.rules[idx];
            if rule.dir_only && !is_dir {
                continue;
            }
            verdict = !rule.negated;
        }
        verdict
    }

    pub fn has_any_rules(&self) -> bool {
        !self.rules.is_empty()
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_set_matches_nothing() {
        let rules = PathRules::new("");
        assert!(!rules.matches("foo.txt", false));
        assert!(!rules.matches("a/b/c", true));
    }

    #[test]
    fn extension_pattern_matches_at_any_depth() {
        let rules = PathRules::new("*.txt");
        assert!(rules.matches("foo.txt", false));
        assert!(rules.matches("a/b/foo.txt", false));
        assert!(!rules.matches("foo.rs", false));
    }

    #[test]
    fn bare_name_matches_at_any_depth() {
        let rules = PathRules::new("build");
        assert!(rules.matches("build", true));
        assert!(rules.matches("child/build", true));
        assert!(rules.matches("build", false));
    }

    #[test]
    fn trailing_slash_is_directory_only() {
        let rules = PathRules::new("foo/");
        assert!(rules.matches("foo", true));
        assert!(!rules.matches("foo", false));
    }

    #[test]
    fn interior_slash_anchors_to_root() {
        let rules = PathRules::new("build/classes");
        assert!(rules.matches("build/classes", true));
        assert!(!rules.matches("child/build/classes", true));
    }

    #[test]
    fn leading_slash_anchors_to_root() {
        let rules = PathRules::new("/foo.txt");
        assert!(rules.matches("foo.txt", false));
        assert!(!rules.matches("a/foo.txt", false));
    }

    #[test]
    fn double_star_crosses_segments() {
        let rules = PathRules::new("**/build/classes");
        assert!(rules.matches("build/classes", true));
        assert!(rules.matches("child/build/classes", true));
        assert!(rules.matches("a/b/build/classes", true));
    }

    #[test]
    fn single_star_does_not_cross_slash() {
        let rules = PathRules::new("foo/*.txt");
        assert!(rules.matches("foo/a.txt", false));
        assert!(!rules.matches("foo/a/b.txt", false));
    }

    #[test]
    fn entries_under_a_matched_directory_are_ignored() {
        let rules = PathRules::new("dir1/*");
        assert!(rules.matches("dir1/foo.txt", false));
        // dir1/sub matches as a directory, so everything below it is out
        assert!(rules.matches("dir1/sub/foo.txt", false));

        let rules = PathRules::new("child/");
        assert!(rules.matches("child/foo.txt", false));
        assert!(!rules.matches("child", false));
    }

    #[test]
    fn last_matching_rule_wins() {
        let rules = PathRules::new("*.txt\n!keep.txt");
        assert!(rules.matches("foo.txt", false));
        assert!(!rules.matches("keep.txt", false));
        assert!(!rules.matches("a/keep.txt", false));

        // the other way around, the ignore wins again
        let rules = PathRules::new("!keep.txt\n*.txt");
        assert!(rules.matches("keep.txt", false));
    }

    #[test]
    fn comments_and_blanks_are_skipped() {
        let rules = PathRules::new("# a comment\n\n*.log");
        assert!(rules.matches("x.log", false));
        assert!(!rules.matches("# a comment", false));
    }

    #[test]
    fn leading_slash_on_query_is_tolerated() {
        // node paths relative to an ancestor keep a leading slash once the
        // ancestor prefix is stripped
        let rules = PathRules::new("dir1/*");
        assert!(rules.matches("/dir1/foo.txt", false));
    }
}
