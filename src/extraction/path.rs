//! Field Paths
//!
//! The kubectl-style JSONPath subset accepted by `valueJSONPath` and
//! `additionalLabelsFromFields`:
//!
//! - `{.status.replicas}` - braces and `$` root are optional
//! - `status.replicas` - dotted field access, leading dot optional
//! - `spec.containers[0].image` - array index
//! - `metadata.labels['app.kubernetes.io/name']` - quoted key
//! - `metadata.labels.app\.kubernetes\.io/name` - escaped dots

use crate::error::{Error, Result};
use serde_json::Value;

/// One step of a field path
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSegment {
    Field(String),
    Index(usize),
}

/// Parsed field path
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldPath {
    raw: String,
    segments: Vec<PathSegment>,
}

type Chars<'a> = std::iter::Peekable<std::str::Chars<'a>>;

impl FieldPath {
    /// Parse a path expression
    pub fn parse(expr: &str) -> Result<Self> {
        let raw = expr.trim();

        let mut body = raw;
        if let Some(inner) = body.strip_prefix('{') {
            body = inner
                .strip_suffix('}')
                .ok_or_else(|| invalid(raw, "unbalanced braces"))?
                .trim();
        }
        if let Some(rest) = body.strip_prefix('$') {
            body = rest;
        }

        let mut chars = body.chars().peekable();
        let mut segments = Vec::new();
        let mut need_separator = false;

        while let Some(&c) = chars.peek() {
            match c {
                '[' => {
                    chars.next();
                    segments.push(parse_bracket(&mut chars, raw)?);
                    need_separator = true;
                }
                '.' => {
                    chars.next();
                    segments.push(PathSegment::Field(parse_field(&mut chars, raw)?));
                    need_separator = true;
                }
                _ if !need_separator => {
                    segments.push(PathSegment::Field(parse_field(&mut chars, raw)?));
                    need_separator = true;
                }
                other => {
                    return Err(invalid(raw, &format!("unexpected character {:?}", other)));
                }
            }
        }

        if segments.is_empty() {
            return Err(invalid(raw, "empty path"));
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    /// Walk the path, `None` as soon as a step is missing
    pub fn lookup<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        self.segments
            .iter()
            .try_fold(root, |value, segment| match segment {
                PathSegment::Field(name) => value.as_object()?.get(name),
                PathSegment::Index(idx) => value.as_array()?.get(*idx),
            })
    }
}

impl std::fmt::Display for FieldPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.raw)
    }
}

fn invalid(path: &str, reason: &str) -> Error {
    Error::InvalidPath {
        path: path.to_string(),
        reason: reason.to_string(),
    }
}

/// Field name up to the next unescaped `.` or `[`
fn parse_field(chars: &mut Chars<'_>, raw: &str) -> Result<String> {
    let mut field = String::new();
    while let Some(&c) = chars.peek() {
        match c {
            '.' | '[' => break,
            ']' => return Err(invalid(raw, "unexpected ']'")),
            '\\' => {
                chars.next();
                let escaped = chars
                    .next()
                    .ok_or_else(|| invalid(raw, "dangling escape"))?;
                field.push(escaped);
            }
            _ => {
                field.push(c);
                chars.next();
            }
        }
    }
    if field.is_empty() {
        return Err(invalid(raw, "empty field name"));
    }
    Ok(field)
}

/// Bracket content after `[`: an index or a quoted key, consumes the `]`
fn parse_bracket(chars: &mut Chars<'_>, raw: &str) -> Result<PathSegment> {
    let segment = match chars.peek() {
        Some(&quote) if quote == '\'' || quote == '"' => {
            chars.next();
            let mut key = String::new();
            loop {
                match chars.next() {
                    Some('\\') => {
                        let escaped = chars
                            .next()
                            .ok_or_else(|| invalid(raw, "dangling escape"))?;
                        key.push(escaped);
                    }
                    Some(c) if c == quote => break,
                    Some(c) => key.push(c),
                    None => return Err(invalid(raw, "unterminated quoted key")),
                }
            }
            PathSegment::Field(key)
        }
        Some('*') => return Err(invalid(raw, "wildcards are not supported")),
        _ => {
            let mut digits = String::new();
            while let Some(&c) = chars.peek() {
                if c == ']' {
                    break;
                }
                digits.push(c);
                chars.next();
            }
            let idx = digits
                .trim()
                .parse::<usize>()
                .map_err(|_| invalid(raw, &format!("invalid index {:?}", digits)))?;
            PathSegment::Index(idx)
        }
    };

    match chars.next() {
        Some(']') => Ok(segment),
        _ => Err(invalid(raw, "missing ']'")),
    }
}
