//! Paths into a tree, written `["key"][0]['other']`

use std::fmt;

use leafseal_core::{SealError, SealResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreePath {
    segments: Vec<PathSegment>,
}

impl TreePath {
    pub fn new(segments: Vec<PathSegment>) -> Self {
        Self { segments }
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Parse bracket syntax: quoted (single or double) keys and bare indices.
    pub fn parse(raw: &str) -> SealResult<Self> {
        let invalid = |why: &str| SealError::config(format!("invalid path {raw:?}: {why}"));
        let mut segments = Vec::new();
        let mut chars = raw.trim().chars().peekable();

        while let Some(c) = chars.next() {
            if c != '[' {
                return Err(invalid("expected '['"));
            }
            match chars.peek().copied() {
                Some(quote @ ('"' | '\'')) => {
                    chars.next();
                    let mut key = String::new();
                    loop {
                        match chars.next() {
                            Some('\\') => match chars.next() {
                                Some(escaped) => key.push(escaped),
                                None => return Err(invalid("dangling escape")),
                            },
                            Some(c) if c == quote => break,
                            Some(c) => key.push(c),
                            None => return Err(invalid("unterminated key")),
                        }
                    }
                    segments.push(PathSegment::Key(key));
                }
                Some(d) if d.is_ascii_digit() => {
                    let mut digits = String::new();
                    while let Some(d) = chars.peek().copied().filter(char::is_ascii_digit) {
                        digits.push(d);
                        chars.next();
                    }
                    let index = digits.parse().map_err(|_| invalid("index out of range"))?;
                    segments.push(PathSegment::Index(index));
                }
                _ => return Err(invalid("expected a quoted key or an index")),
            }
            if chars.next() != Some(']') {
                return Err(invalid("expected ']'"));
            }
        }
        Ok(Self { segments })
    }
}

impl fmt::Display for TreePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.segments {
            match segment {
                PathSegment::Key(k) => write!(f, "[{k:?}]")?,
                PathSegment::Index(i) => write!(f, "[{i}]")?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mixed() {
        let path = TreePath::parse(r#"["a"][0]['b c']"#).unwrap();
        assert_eq!(
            path.segments(),
            &[
                PathSegment::Key("a".into()),
                PathSegment::Index(0),
                PathSegment::Key("b c".into()),
            ]
        );
        assert_eq!(path.to_string(), r#"["a"][0]["b c"]"#);
    }

    #[test]
    fn test_parse_escaped_quote() {
        let path = TreePath::parse(r#"["say \"hi\""]"#).unwrap();
        assert_eq!(path.segments(), &[PathSegment::Key(r#"say "hi""#.into())]);
    }

    #[test]
    fn test_parse_empty() {
        assert!(TreePath::parse("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_errors() {
        for raw in ["a", "[a]", r#"["a""#, r#"["a"]["b"#, "[12", "[]"] {
            assert!(
                matches!(TreePath::parse(raw), Err(SealError::Config(_))),
                "{raw} should not parse"
            );
        }
    }
}
