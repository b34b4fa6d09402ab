//! Allowlist matching over `host/image` paths.
//!
//! Patterns are `/`-separated: a `*` segment matches exactly one segment,
//! a trailing `**` matches any remainder. A target matches when any
//! pattern in the list matches it.

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Exact(String),
    Any,
    Tail,
}

#[derive(Debug, Clone, Default)]
pub struct HostMatcher {
    patterns: Vec<Vec<Segment>>,
}

impl HostMatcher {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Self {
        let patterns = patterns
            .iter()
            .map(|p| {
                p.as_ref()
                    .split('/')
                    .filter(|s| !s.is_empty())
                    .map(|s| match s {
                        "*" => Segment::Any,
                        "**" => Segment::Tail,
                        other => Segment::Exact(other.to_string()),
                    })
                    .collect()
            })
            .collect();
        Self { patterns }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn matches(&self, target: &str) -> bool {
        let parts: Vec<&str> = target.split('/').filter(|s| !s.is_empty()).collect();
        self.patterns.iter().any(|p| Self::match_one(p, &parts))
    }

    fn match_one(pattern: &[Segment], parts: &[&str]) -> bool {
        let mut i = 0;
        for segment in pattern {
            match segment {
                Segment::Tail => return true,
                Segment::Any => {
                    if i >= parts.len() {
                        return false;
                    }
                    i += 1;
                }
                Segment::Exact(want) => {
                    if parts.get(i) != Some(&want.as_str()) {
                        return false;
                    }
                    i += 1;
                }
            }
        }
        i == parts.len()
    }
}
