use std::path::Path;

use glob::{MatchOptions, Pattern};

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

#[derive(Debug, Clone)]
struct Rule {
    pattern: Pattern,
    negated: bool,
    dir_only: bool,
    anchored: bool,
}

impl Rule {
    fn parse(line: &str) -> Option<Self> {
        let mut text = line.trim_end();
        if text.is_empty() || text.starts_with('#') {
            return None;
        }
        let mut negated = false;
        if let Some(rest) = text.strip_prefix('!') {
            negated = true;
            text = rest;
        } else if let Some(rest) = text.strip_prefix('\\') {
            text = rest;
        }
        let dir_only = text.ends_with('/');
        let text = text.trim_end_matches('/');
        let anchored = text.contains('/');
        let text = text.trim_start_matches('/');
        if text.is_empty() {
            return None;
        }
        match Pattern::new(text) {
            Ok(pattern) => Some(Self {
                pattern,
                negated,
                dir_only,
                anchored,
            }),
            Err(err) => {
                tracing::warn!(rule = line, error = %err, "skipping invalid ignore rule");
                None
            }
        }
    }
}

/// Gitignore-style filter over drive-relative paths (`/Docs/a.txt`).
#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    rules: Vec<Rule>,
}

impl PathFilter {
    pub fn new<I, S>(rules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut filter = Self::default();
        filter.add_rules(rules);
        filter
    }

    /// Reads one rule per line. A missing file yields an empty filter.
    pub async fn load(path: &Path) -> std::io::Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => Ok(Self::new(content.lines())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(err),
        }
    }

    pub fn add_rules<I, S>(&mut self, rules: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.rules
            .extend(rules.into_iter().filter_map(|line| Rule::parse(line.as_ref())));
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// A trailing `/` on `path` marks it as a directory regardless of
    /// `is_dir`. Anything below an ignored directory is ignored too.
    pub fn should_ignore(&self, path: &str, is_dir: bool) -> bool {
        if self.rules.is_empty() {
            return false;
        }
        let is_dir = is_dir || path.ends_with('/');
        let parts: Vec<&str> = path.split('/').filter(|part| !part.is_empty()).collect();
        if parts.is_empty() {
            return false;
        }
        for depth in 1..parts.len() {
            if self.matches(&parts[..depth], true) {
                return true;
            }
        }
        self.matches(&parts, is_dir)
    }

    fn matches(&self, parts: &[&str], is_dir: bool) -> bool {
        let full = parts.join("/");
        let name = parts.last().copied().unwrap_or_default();
        let mut ignored = false;
        for rule in &self.rules {
            if rule.dir_only && !is_dir {
                continue;
            }
            let target = if rule.anchored { full.as_str() } else { name };
            if rule.pattern.matches_with(target, MATCH_OPTIONS) {
                ignored = !rule.negated;
            }
        }
        ignored
    }
}
