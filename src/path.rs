//! Path strings
//!
//! A path string is a root-to-node chain of node ids joined by
//! [`SEPARATOR`]. A bare id is a path of exactly one segment.

use crate::error::{QueryError, Result};

/// Separator between the segments of a path string
pub const SEPARATOR: char = '#';

/// Reject ids that cannot be embedded in a path string
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() || id.contains(SEPARATOR) {
        return Err(QueryError::InvalidNodeId(id.to_string()));
    }
    Ok(())
}

/// Number of node ids in a path string
pub fn segment_count(path: &str) -> usize {
    if path.is_empty() {
        return 0;
    }
    path.matches(SEPARATOR).count() + 1
}

/// True if the string holds more than one id
pub fn is_multi(path: &str) -> bool {
    path.contains(SEPARATOR)
}

pub fn first_segment(path: &str) -> &str {
    match path.find(SEPARATOR) {
        Some(pos) => &path[..pos],
        None => path,
    }
}

pub fn last_segment(path: &str) -> &str {
    match path.rfind(SEPARATOR) {
        Some(pos) => &path[pos + 1..],
        None => path,
    }
}

/// Everything above the last segment (empty for a bare id)
pub fn parent_path(path: &str) -> &str {
    match path.rfind(SEPARATOR) {
        Some(pos) => &path[..pos],
        None => "",
    }
}

pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split(SEPARATOR).filter(|s| !s.is_empty())
}

/// Concatenate two path strings (`head` above `tail`)
pub fn join(head: &str, tail: &str) -> String {
    if head.is_empty() {
        return tail.to_string();
    }
    if tail.is_empty() {
        return head.to_string();
    }
    let mut out = String::with_capacity(head.len() + tail.len() + 1);
    out.push_str(head);
    out.push(SEPARATOR);
    out.push_str(tail);
    out
}

/// Join a sequence of ids into a path string
pub fn join_all<I, S>(ids: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = String::new();
    for id in ids {
        if !out.is_empty() {
            out.push(SEPARATOR);
        }
        out.push_str(id.as_ref());
    }
    out
}
