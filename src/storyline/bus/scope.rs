// SPDX-License-Identifier: MIT

//! Scope names and path addressing
//!
//! Paths are dot separated keys with bracket indices for sequences:
//! `order.items[0].price`. A leading `req.`, `sta.` or `var.` qualifier
//! overrides whatever default scope the caller supplied.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// The three data partitions of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeKind {
    /// Run input, read-mostly
    Req,
    /// Accumulated results, write-once per path
    Sta,
    /// Working data, one logical copy per branch
    Var,
}

impl ScopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScopeKind::Req => "req",
            ScopeKind::Sta => "sta",
            ScopeKind::Var => "var",
        }
    }
}

impl fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScopeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "req" => Ok(ScopeKind::Req),
            "sta" => Ok(ScopeKind::Sta),
            "var" => Ok(ScopeKind::Var),
            other => Err(format!("Unknown scope: {}", other)),
        }
    }
}

/// One step of a path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

/// A parsed path, optionally scope-qualified
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopePath {
    pub scope: Option<ScopeKind>,
    pub segments: Vec<Segment>,
}

impl ScopePath {
    /// Parse a path. Returns `None` for malformed input such as `a..b`,
    /// `a[x]` or an unterminated bracket.
    pub fn parse(path: &str) -> Option<Self> {
        let path = path.trim();
        if path.is_empty() {
            return None;
        }

        let mut segments = Vec::new();
        for part in path.split('.') {
            let (key, mut rest) = match part.find('[') {
                Some(pos) => (&part[..pos], &part[pos..]),
                None => (part, ""),
            };
            if key.is_empty() && rest.is_empty() {
                return None;
            }
            if !key.is_empty() {
                segments.push(Segment::Key(key.to_string()));
            }
            while !rest.is_empty() {
                let close = rest.find(']')?;
                let index = rest.get(1..close)?.trim().parse::<usize>().ok()?;
                segments.push(Segment::Index(index));
                rest = &rest[close + 1..];
                if !rest.is_empty() && !rest.starts_with('[') {
                    return None;
                }
            }
        }

        let scope = match segments.first() {
            Some(Segment::Key(first)) => first.parse::<ScopeKind>().ok(),
            _ => None,
        };
        if scope.is_some() {
            segments.remove(0);
        }

        Some(Self { scope, segments })
    }

    /// Scope this path resolves against, given the caller's default
    pub fn resolve(&self, default: ScopeKind) -> ScopeKind {
        self.scope.unwrap_or(default)
    }
}

/// Walk `segments` from `root`
pub fn get_in<'a>(root: &'a Value, segments: &[Segment]) -> Option<&'a Value> {
    segments.iter().try_fold(root, |current, segment| match segment {
        Segment::Key(key) => current.as_object()?.get(key),
        Segment::Index(index) => current.as_array()?.get(*index),
    })
}

/// Null padding a write may add past the end of a sequence
const MAX_INDEX_PADDING: usize = 1024;

/// Write `value` at `segments`, materializing missing containers.
///
/// Returns false without touching `root` when an existing value along the
/// way has the wrong shape (e.g. indexing into a string) or an index lies
/// more than `MAX_INDEX_PADDING` past the end of its sequence.
pub fn set_in(root: &mut Value, segments: &[Segment], value: Value) -> bool {
    if !writable(root, segments) {
        return false;
    }

    let mut current = root;
    for segment in segments {
        current = match slot(current, segment) {
            Some(next) => next,
            None => return false,
        };
    }
    *current = value;
    true
}

fn writable(root: &Value, segments: &[Segment]) -> bool {
    let mut current = Some(root);
    for segment in segments {
        let existing = current.filter(|v| !v.is_null());
        current = match (existing, segment) {
            (None, Segment::Index(index)) if *index > MAX_INDEX_PADDING => return false,
            (None, _) => None,
            (Some(Value::Object(map)), Segment::Key(key)) => map.get(key),
            (Some(Value::Array(items)), Segment::Index(index)) => {
                if index.saturating_sub(items.len()) > MAX_INDEX_PADDING {
                    return false;
                }
                items.get(*index)
            }
            _ => return false,
        };
    }
    true
}

fn slot<'a>(current: &'a mut Value, segment: &Segment) -> Option<&'a mut Value> {
    if current.is_null() {
        *current = match segment {
            Segment::Key(_) => Value::Object(Map::new()),
            Segment::Index(_) => Value::Array(Vec::new()),
        };
    }
    match (current, segment) {
        (Value::Object(map), Segment::Key(key)) => {
            Some(map.entry(key.clone()).or_insert(Value::Null))
        }
        (Value::Array(items), Segment::Index(index)) => {
            if index.saturating_sub(items.len()) > MAX_INDEX_PADDING {
                return None;
            }
            if items.len() <= *index {
                items.resize(index.checked_add(1)?, Value::Null);
            }
            items.get_mut(*index)
        }
        _ => None,
    }
}
