// src/diff.rs

//! Diffs and job result payloads
//!
//! Job results are stored as self-describing JSON carrying a `version` field
//! so that readers can reject payloads they do not understand.

use crate::error::{Error, Result};
use crate::pool::PoolEntry;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Current result payload version
pub const RESULT_VERSION: u32 = 1;

/// How one item differs between the two sides
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffKind {
    Unchanged,
    Added,
    Modified,
    Removed,
}

/// One line of a diff
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffEntry {
    pub name: String,
    pub kind: DiffKind,
    /// Release on the left (source) side
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left: Option<i64>,
    /// Release on the right (destination) side
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right: Option<i64>,
}

/// Ordered list of changes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diff {
    pub entries: Vec<DiffEntry>,
}

impl Diff {
    pub fn push(&mut self, name: impl Into<String>, kind: DiffKind, left: Option<i64>, right: Option<i64>) {
        self.entries.push(DiffEntry {
            name: name.into(),
            kind,
            left,
            right,
        });
    }

    /// Compare two name -> release maps, `left` being the source side
    pub fn between(left: &BTreeMap<String, i64>, right: &BTreeMap<String, i64>) -> Self {
        let mut diff = Diff::default();
        for (name, l) in left {
            match right.get(name) {
                None => diff.push(name, DiffKind::Added, Some(*l), None),
                Some(r) if r == l => diff.push(name, DiffKind::Unchanged, Some(*l), Some(*r)),
                Some(r) => diff.push(name, DiffKind::Modified, Some(*l), Some(*r)),
            }
        }
        for (name, r) in right {
            if !left.contains_key(name) {
                diff.push(name, DiffKind::Removed, None, Some(*r));
            }
        }
        diff.entries.sort_by(|a, b| a.name.cmp(&b.name));
        diff
    }

    /// Tip releases keyed by package name
    pub fn releases<'a, I>(tips: I) -> BTreeMap<String, i64>
    where
        I: IntoIterator<Item = &'a PoolEntry>,
    {
        tips.into_iter()
            .map(|e| (e.archive.name.clone(), e.archive.release))
            .collect()
    }

    pub fn count(&self, kind: DiffKind) -> usize {
        self.entries.iter().filter(|e| e.kind == kind).count()
    }

    /// True when nothing was added, modified or removed
    pub fn is_clean(&self) -> bool {
        self.entries.iter().all(|e| e.kind == DiffKind::Unchanged)
    }
}

/// The typed body of a result payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResultBody {
    Diff { diff: Diff },
    Deltas { linked: Vec<String>, failed: Vec<String> },
    Index { packages: usize, deltas: usize },
    Jobs { ids: Vec<i64> },
}

/// Versioned result payload stored on a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub version: u32,
    #[serde(flatten)]
    pub body: ResultBody,
}

impl JobResult {
    pub fn new(body: ResultBody) -> Self {
        Self {
            version: RESULT_VERSION,
            body,
        }
    }

    pub fn diff(diff: Diff) -> Self {
        Self::new(ResultBody::Diff { diff })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_slice(bytes)?;
        let version = value.get("version").and_then(|v| v.as_u64());
        if version != Some(RESULT_VERSION as u64) {
            return Err(Error::ParseError(format!(
                "unsupported job result version {:?}",
                version
            )));
        }
        Ok(serde_json::from_value(value)?)
    }

    pub fn as_diff(&self) -> Option<&Diff> {
        match &self.body {
            ResultBody::Diff { diff } => Some(diff),
            _ => None,
        }
    }
}
