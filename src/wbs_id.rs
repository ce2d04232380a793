//! WBS identifiers
//!
//! A WBS id is a dot-separated list of positive integers ("1", "1.2", "1.2.1")
//! that encodes a task's position among its siblings and ancestors. Ids coming
//! from model output are not trusted: anything that does not parse is treated as
//! "no WBS id" by the helpers in this module instead of failing the caller.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::models::FlatTask;

/// Errors produced when parsing a WBS id
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WbsIdError {
    #[error("empty WBS id")]
    Empty,

    #[error("invalid segment '{segment}' in WBS id '{id}'")]
    InvalidSegment { id: String, segment: String },
}

/// A parsed WBS id
///
/// Ordering is numeric per segment, and a prefix sorts before any of its
/// extensions ("1" < "1.1" < "1.2" < "1.10" < "2").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WbsId {
    segments: Vec<u32>,
}

impl WbsId {
    /// Builds an id from already validated segments
    pub fn from_segments(segments: Vec<u32>) -> Result<Self, WbsIdError> {
        if segments.is_empty() {
            return Err(WbsIdError::Empty);
        }
        if let Some(zero) = segments.iter().position(|s| *s == 0) {
            return Err(WbsIdError::InvalidSegment {
                id: join(&segments),
                segment: segments[zero].to_string(),
            });
        }
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[u32] {
        &self.segments
    }

    /// Number of dot separators; roots have depth 0
    pub fn depth(&self) -> usize {
        self.segments.len() - 1
    }

    /// The id with its last segment removed, or `None` for a root
    pub fn parent(&self) -> Option<WbsId> {
        if self.segments.len() == 1 {
            None
        } else {
            Some(Self {
                segments: self.segments[..self.segments.len() - 1].to_vec(),
            })
        }
    }

    /// The 1-based position of this id among its siblings
    pub fn sibling_position(&self) -> u32 {
        self.segments[self.segments.len() - 1]
    }

    /// Builds the id of the child at the given 1-based position
    pub fn child(&self, position: u32) -> WbsId {
        let mut segments = self.segments.clone();
        segments.push(position);
        Self { segments }
    }
}

impl FromStr for WbsId {
    type Err = WbsIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(WbsIdError::Empty);
        }

        let segments = trimmed
            .split('.')
            .map(|segment| {
                if segment.is_empty() || !segment.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(WbsIdError::InvalidSegment {
                        id: trimmed.to_string(),
                        segment: segment.to_string(),
                    });
                }
                segment
                    .parse::<u32>()
                    .map_err(|_| WbsIdError::InvalidSegment {
                        id: trimmed.to_string(),
                        segment: segment.to_string(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Self::from_segments(segments)
    }
}

impl fmt::Display for WbsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&join(&self.segments))
    }
}

fn join(segments: &[u32]) -> String {
    segments
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(".")
}

/// Returns `id` with its last dot-segment removed, or `None` if `id` is a root
pub fn parent_of(id: &str) -> Option<&str> {
    id.rfind('.').map(|idx| &id[..idx])
}

/// Counts the dot separators in `id`
pub fn depth(id: &str) -> usize {
    id.matches('.').count()
}

/// Builds a child id from a parent id and a 1-based sibling position
pub fn render(parent: Option<&str>, sibling_position: usize) -> String {
    match parent {
        Some(parent) if !parent.is_empty() => format!("{}.{}", parent, sibling_position),
        _ => sibling_position.to_string(),
    }
}

/// Parses `id`, treating anything malformed as absent
pub fn parse_lenient(id: &str) -> Option<WbsId> {
    id.parse().ok()
}

/// Numeric comparison of two raw ids.
///
/// Malformed ids never fail the comparison: they sort after every valid id,
/// and among themselves by their raw text so the order stays deterministic.
pub fn compare(a: &str, b: &str) -> Ordering {
    compare_optional(Some(a), Some(b))
}

/// Same as [`compare`] but for optional ids; a missing id behaves like a
/// malformed one and sorts last.
pub fn compare_optional(a: Option<&str>, b: Option<&str>) -> Ordering {
    let parsed_a = a.and_then(parse_lenient);
    let parsed_b = b.and_then(parse_lenient);

    match (parsed_a, parsed_b) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.unwrap_or("").cmp(b.unwrap_or("")),
    }
}

/// Stable sort of a model's flat output by WBS id; tasks without a usable id
/// keep their relative order at the end.
pub fn sort_by_wbs_id(tasks: &mut [FlatTask]) {
    tasks.sort_by(|a, b| {
        let a_id = a.wbs_id.as_deref().filter(|id| parse_lenient(id).is_some());
        let b_id = b.wbs_id.as_deref().filter(|id| parse_lenient(id).is_some());
        match (a_id, b_id) {
            (None, None) => Ordering::Equal,
            _ => compare_optional(a_id, b_id),
        }
    });
}
