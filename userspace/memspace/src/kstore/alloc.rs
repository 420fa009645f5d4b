// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Range table of named blobs inside the reserved heap.

use std::collections::{BTreeMap, HashMap};

use crate::error::KstoreError;

/// Byte range holding one named blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatedRange {
    /// Owning key.
    pub key: String,
    /// First byte.
    pub start: usize,
    /// Length in bytes.
    pub len: usize,
}

impl AllocatedRange {
    /// One past the last byte.
    pub fn end(&self) -> usize {
        self.start + self.len
    }
}

/// Non-overlapping ranges ordered by start, with a rolling scan cursor.
#[derive(Debug, Clone, Default)]
pub struct RangeTable {
    by_start: BTreeMap<usize, AllocatedRange>,
    by_key: HashMap<String, usize>,
    cursor: usize,
}

impl RangeTable {
    /// Empty table with the cursor at 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `range`; the cursor stays where it is.
    pub fn insert(&mut self, range: AllocatedRange) -> Result<(), KstoreError> {
        if range.len == 0 {
            return Err(KstoreError::CorruptIndex(format!("empty range for `{}`", range.key)));
        }
        if self.by_key.contains_key(&range.key) {
            return Err(KstoreError::CorruptIndex(format!("duplicate range for `{}`", range.key)));
        }
        if let Some(other) = self.overlapping(range.start, range.end()) {
            return Err(KstoreError::CorruptIndex(format!(
                "range {}..{} of `{}` overlaps `{}`",
                range.start,
                range.end(),
                range.key,
                other.key
            )));
        }
        self.by_key.insert(range.key.clone(), range.start);
        self.by_start.insert(range.start, range);
        Ok(())
    }

    /// Records a freshly placed `range` and moves the cursor to its end.
    pub fn claim(&mut self, range: AllocatedRange) -> Result<(), KstoreError> {
        let end = range.end();
        self.insert(range)?;
        self.cursor = end;
        Ok(())
    }

    /// Puts the cursor at the end of the highest range, or 0 when empty.
    pub fn settle_cursor(&mut self) {
        self.cursor = self.by_start.values().next_back().map_or(0, AllocatedRange::end);
    }

    /// Where the next forward scan starts.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Forgets the range of `key`.
    pub fn remove(&mut self, key: &str) -> Option<AllocatedRange> {
        let start = self.by_key.remove(key)?;
        self.by_start.remove(&start)
    }

    /// Range of `key`.
    pub fn get(&self, key: &str) -> Option<&AllocatedRange> {
        self.by_key.get(key).and_then(|start| self.by_start.get(start))
    }

    /// Drops every range for which `keep` is `false`; returns the dropped ranges.
    pub fn retain(&mut self, mut keep: impl FnMut(&AllocatedRange) -> bool) -> Vec<AllocatedRange> {
        let doomed: Vec<String> =
            self.by_start.values().filter(|range| !keep(range)).map(|range| range.key.clone()).collect();
        doomed.iter().filter_map(|key| self.remove(key)).collect()
    }

    /// Start of a free window of exactly `len` bytes.
    ///
    /// Scans forward from the cursor first, then once more from address 0.
    pub fn find_window(&self, len: usize, capacity: usize) -> Option<usize> {
        if len == 0 || len > capacity {
            return None;
        }
        self.scan_from(self.cursor, len, capacity).or_else(|| self.scan_from(0, len, capacity))
    }

    fn scan_from(&self, from: usize, len: usize, capacity: usize) -> Option<usize> {
        let mut pos = from;
        for range in self.by_start.values() {
            if range.end() <= pos {
                continue;
            }
            if range.start >= pos + len {
                break;
            }
            pos = pos.max(range.end());
        }
        (pos.checked_add(len)? <= capacity).then_some(pos)
    }

    fn overlapping(&self, start: usize, end: usize) -> Option<&AllocatedRange> {
        self.by_start.range(..end).next_back().map(|(_, r)| r).filter(|r| r.end() > start)
    }

    /// Bytes not covered by any range.
    pub fn available(&self, capacity: usize) -> usize {
        capacity.saturating_sub(self.used())
    }

    /// Bytes covered by ranges.
    pub fn used(&self) -> usize {
        self.by_start.values().map(|r| r.len).sum()
    }

    /// Ranges ordered by start.
    pub fn iter(&self) -> impl Iterator<Item = &AllocatedRange> {
        self.by_start.values()
    }

    /// Keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.by_key.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of ranges.
    pub fn len(&self) -> usize {
        self.by_start.len()
    }

    /// Whether no range is recorded.
    pub fn is_empty(&self) -> bool {
        self.by_start.is_empty()
    }
}
