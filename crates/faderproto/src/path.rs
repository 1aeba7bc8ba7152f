//! Dotted parameter paths and subscription patterns.
//!
//! `ch.0.mix.lvl` is a path. A pattern may replace whole segments with
//! `*` (exactly one segment) or `**` (zero or more segments):
//!
//! ```text
//! ch.*.mix.lvl    matches ch.0.mix.lvl, ch.12.mix.lvl
//! ch.0.**         matches ch.0, ch.0.mix.lvl, ch.0.eq.1.gain
//! ```

use std::fmt;

/// Path segment separator
pub const SEPARATOR: char = '.';

/// Errors for malformed patterns
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatternError {
    #[error("Pattern is empty")]
    Empty,
    #[error("Empty segment at position {position} in {pattern:?}")]
    EmptySegment { pattern: String, position: usize },
    #[error("Partial wildcard {segment:?} in {pattern:?} (wildcards must span a whole segment)")]
    PartialWildcard { pattern: String, segment: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    /// `*`
    One,
    /// `**`
    AnyDepth,
}

/// A parsed subscription pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl PathPattern {
    pub fn parse(pattern: &str) -> Result<Self, PatternError> {
        if pattern.is_empty() {
            return Err(PatternError::Empty);
        }

        let mut segments = Vec::new();
        for (position, part) in pattern.split(SEPARATOR).enumerate() {
            let segment = match part {
                "" => {
                    return Err(PatternError::EmptySegment {
                        pattern: pattern.to_string(),
                        position,
                    })
                }
                "*" => Segment::One,
                "**" => Segment::AnyDepth,
                p if p.contains('*') => {
                    return Err(PatternError::PartialWildcard {
                        pattern: pattern.to_string(),
                        segment: p.to_string(),
                    })
                }
                p => Segment::Literal(p.to_string()),
            };
            segments.push(segment);
        }

        Ok(Self {
            raw: pattern.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// True when the pattern contains no wildcards.
    pub fn is_exact(&self) -> bool {
        self.segments
            .iter()
            .all(|s| matches!(s, Segment::Literal(_)))
    }

    pub fn matches(&self, path: &str) -> bool {
        if path.is_empty() {
            return false;
        }
        let parts: Vec<&str> = path.split(SEPARATOR).collect();
        match_segments(&self.segments, &parts)
    }
}

/// Walks the path once, tracking every pattern position still in play.
fn match_segments(pattern: &[Segment], path: &[&str]) -> bool {
    let mut reachable = vec![false; pattern.len() + 1];
    reachable[0] = true;
    skip_empty_any_depth(pattern, &mut reachable);

    for part in path {
        let mut next = vec![false; pattern.len() + 1];
        for (i, segment) in pattern.iter().enumerate() {
            if !reachable[i] {
                continue;
            }
            match segment {
                Segment::AnyDepth => next[i] = true,
                Segment::One => next[i + 1] = true,
                Segment::Literal(lit) => {
                    if lit.as_str() == *part {
                        next[i + 1] = true;
                    }
                }
            }
        }
        skip_empty_any_depth(pattern, &mut next);
        if !next.contains(&true) {
            return false;
        }
        reachable = next;
    }

    reachable[pattern.len()]
}

/// `**` may match no segments at all.
fn skip_empty_any_depth(pattern: &[Segment], reachable: &mut [bool]) {
    for (i, segment) in pattern.iter().enumerate() {
        if reachable[i] && *segment == Segment::AnyDepth {
            reachable[i + 1] = true;
        }
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
