//! Path pattern module
//!
//! Parses `/users/:id` style patterns into segments at registration time
//! and matches request paths against them.

/// One `/`-delimited piece of a pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Must equal the path segment exactly
    Literal(String),
    /// `:name` — matches any single non-empty segment and binds it
    Param(String),
}

/// A parsed route pattern
#[derive(Debug, Clone)]
pub struct Pattern {
    raw: String,
    segments: Vec<Segment>,
}

impl Pattern {
    /// Parse a pattern string. `:` prefixes a named parameter segment;
    /// everything else is a literal. No wildcards, no regex.
    pub fn parse(pattern: &str) -> Self {
        let segments = split_segments(pattern)
            .map(|seg| {
                seg.strip_prefix(':').map_or_else(
                    || Segment::Literal(seg.to_string()),
                    |name| Segment::Param(name.to_string()),
                )
            })
            .collect();

        Self {
            raw: pattern.to_string(),
            segments,
        }
    }

    /// The pattern as registered
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Match a request path against this pattern.
    ///
    /// Segment counts must be equal; parameter segments bind any single
    /// non-empty segment (percent-decoded); literals compare exactly.
    /// Returns the bound parameters on match.
    pub fn matches(&self, path: &str) -> Option<Vec<(String, String)>> {
        let path_segments: Vec<&str> = split_segments(path).collect();
        if path_segments.len() != self.segments.len() {
            return None;
        }

        let mut params = Vec::new();
        for (expected, actual) in self.segments.iter().zip(&path_segments) {
            match expected {
                Segment::Literal(lit) => {
                    if lit != actual {
                        return None;
                    }
                }
                Segment::Param(name) => {
                    if actual.is_empty() {
                        return None;
                    }
                    let value = urlencoding::decode(actual)
                        .map_or_else(|_| (*actual).to_string(), |v| v.into_owned());
                    params.push((name.clone(), value));
                }
            }
        }
        Some(params)
    }
}

/// Split a path or pattern into its `/`-delimited segments.
/// `/` itself yields no segments, so `/` only matches `/`.
fn split_segments(path: &str) -> impl Iterator<Item = &str> {
    path.strip_prefix('/')
        .unwrap_or(path)
        .split('/')
        .filter(|s| !(s.is_empty() && path.len() <= 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_mixed_segments() {
        let pattern = Pattern::parse("/users/:id/books/:bookId");
        assert_eq!(
            pattern.segments,
            vec![
                Segment::Literal("users".to_string()),
                Segment::Param("id".to_string()),
                Segment::Literal("books".to_string()),
                Segment::Param("bookId".to_string()),
            ]
        );
    }

    #[test]
    fn match_binds_params() {
        let pattern = Pattern::parse("/users/:id");
        let params = pattern.matches("/users/42").expect("should match");
        assert_eq!(params, vec![("id".to_string(), "42".to_string())]);
    }

    #[test]
    fn segment_count_must_be_equal() {
        let pattern = Pattern::parse("/users/:id");
        assert!(pattern.matches("/users/42/extra").is_none());
        assert!(pattern.matches("/users").is_none());
    }

    #[test]
    fn param_rejects_empty_segment() {
        let pattern = Pattern::parse("/users/:id");
        assert!(pattern.matches("/users//").is_none());
    }

    #[test]
    fn root_matches_only_root() {
        let pattern = Pattern::parse("/");
        assert!(pattern.matches("/").is_some());
        assert!(pattern.matches("/users").is_none());
    }

    #[test]
    fn param_values_are_percent_decoded() {
        let pattern = Pattern::parse("/users/:id");
        let params = pattern.matches("/users/a%20b").expect("should match");
        assert_eq!(params[0].1, "a b");
    }
}
