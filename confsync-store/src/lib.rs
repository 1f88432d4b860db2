//! Per-resource in-memory key/value store.
//!
//! A [`Store`] holds the snapshot of backend values for one template resource
//! during one processing cycle. It is purged and fully repopulated at the
//! start of every cycle — never incrementally patched — so a key deleted
//! upstream cannot survive into the next cycle. Keys are `/`-separated paths.
//!
//! Backed by a `BTreeMap`, so every multi-result operation returns entries in
//! key order without sorting at the call site.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// KVPair and errors
// ---------------------------------------------------------------------------

/// A single key/value entry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KVPair {
    pub key: String,
    pub value: String,
}

/// Errors from store lookups.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Exact lookup on an absent key with no default supplied.
    #[error("key not found: {key}")]
    NotFound { key: String },
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// In-memory snapshot of key/value pairs for one resource.
#[derive(Debug, Default, Clone)]
pub struct Store {
    entries: BTreeMap<String, String>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove every entry. Called at the start of each fetch cycle.
    pub fn purge(&mut self) {
        self.entries.clear();
    }

    /// Insert or overwrite a key. Within one cycle, last write wins.
    /// Callers guarantee the key begins with `/`.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Number of entries currently held.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Exact lookup.
    pub fn get(&self, key: &str) -> Result<KVPair, StoreError> {
        self.entries
            .get(key)
            .map(|v| KVPair {
                key: key.to_string(),
                value: v.clone(),
            })
            .ok_or_else(|| StoreError::NotFound {
                key: key.to_string(),
            })
    }

    /// Value-only lookup; `default` is returned when the key is absent.
    pub fn get_value(&self, key: &str, default: Option<&str>) -> Result<String, StoreError> {
        match self.entries.get(key) {
            Some(v) => Ok(v.clone()),
            None => match default {
                Some(d) => Ok(d.to_string()),
                None => Err(StoreError::NotFound {
                    key: key.to_string(),
                }),
            },
        }
    }

    /// All entries whose key matches `pattern`, in key order.
    ///
    /// `*` matches within a single path segment and never crosses `/`.
    /// An empty match is not an error.
    pub fn get_all(&self, pattern: &str) -> Vec<KVPair> {
        self.entries
            .iter()
            .filter(|(k, _)| pattern_match(pattern, k))
            .map(|(k, v)| KVPair {
                key: k.clone(),
                value: v.clone(),
            })
            .collect()
    }

    /// Matching values only, in key order.
    pub fn get_all_values(&self, pattern: &str) -> Vec<String> {
        self.get_all(pattern).into_iter().map(|kv| kv.value).collect()
    }

    /// Names of the direct children under `dir`, sorted and deduplicated.
    pub fn list(&self, dir: &str) -> Vec<String> {
        self.children(dir, false)
    }

    /// Names of the direct child *directories* under `dir`.
    pub fn list_dir(&self, dir: &str) -> Vec<String> {
        self.children(dir, true)
    }

    fn children(&self, dir: &str, dirs_only: bool) -> Vec<String> {
        let prefix = if dir.ends_with('/') {
            dir.to_string()
        } else {
            format!("{dir}/")
        };

        let mut out = BTreeSet::new();
        for key in self.entries.keys() {
            let Some(rest) = key.strip_prefix(&prefix) else {
                continue;
            };
            let mut segments = rest.split('/').filter(|s| !s.is_empty());
            let Some(first) = segments.next() else {
                continue;
            };
            let has_children = segments.next().is_some();
            if !dirs_only || has_children {
                out.insert(first.to_string());
            }
        }
        out.into_iter().collect()
    }
}

// ---------------------------------------------------------------------------
// Pattern matching
// ---------------------------------------------------------------------------

/// Glob match over `/`-separated paths: the pattern and key must have the
/// same number of segments, and within a segment `*` matches any run of
/// characters while `?` matches exactly one.
pub fn pattern_match(pattern: &str, key: &str) -> bool {
    let pat_segments: Vec<&str> = pattern.split('/').collect();
    let key_segments: Vec<&str> = key.split('/').collect();
    if pat_segments.len() != key_segments.len() {
        return false;
    }
    pat_segments
        .iter()
        .zip(key_segments.iter())
        .all(|(p, k)| segment_match(p, k))
}

fn segment_match(pattern: &str, segment: &str) -> bool {
    let pat: Vec<char> = pattern.chars().collect();
    let seg: Vec<char> = segment.chars().collect();
    match_from(&pat, &seg)
}

fn match_from(pat: &[char], seg: &[char]) -> bool {
    match pat.split_first() {
        None => seg.is_empty(),
        Some(('*', rest)) => (0..=seg.len()).any(|i| match_from(rest, &seg[i..])),
        Some(('?', rest)) => !seg.is_empty() && match_from(rest, &seg[1..]),
        Some((c, rest)) => seg.first() == Some(c) && match_from(rest, &seg[1..]),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
