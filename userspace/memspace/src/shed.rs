// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-process sidecar index: string entries plus a code area.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use parking_lot::Mutex;

use crate::Pid;

/// Identifier of an index inside one process memory space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct IndexId(pub u64);

impl fmt::Display for IndexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shed#{}", self.0)
    }
}

/// Status report of a [`Shed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShedStatus {
    /// Index identifier.
    pub id: IndexId,
    /// Byte budget for entries; 0 means unchecked.
    pub size: usize,
    /// Bytes held in the code area.
    pub code_size: usize,
    /// Bytes held by entries (keys plus values).
    pub index_size: usize,
    /// Owner marker, `pid:<pid>`.
    pub owner_tag: String,
}

#[derive(Default)]
struct ShedInner {
    entries: BTreeMap<String, String>,
    code: Vec<u8>,
}

impl ShedInner {
    fn index_size(&self) -> usize {
        self.entries.iter().map(|(k, v)| k.len() + v.len()).sum()
    }
}

/// Key/value side index stored out-of-band from a heap.
pub struct Shed {
    pid: Pid,
    id: IndexId,
    size: usize,
    inner: Mutex<ShedInner>,
}

impl Shed {
    /// Creates an empty index; `size == 0` disables the byte budget.
    pub fn new(pid: Pid, id: IndexId, size: usize) -> Self {
        Self { pid, id, size, inner: Mutex::new(ShedInner::default()) }
    }

    /// Owning process.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Index identifier.
    pub fn id(&self) -> IndexId {
        self.id
    }

    /// Inserts or replaces an entry. Returns `false` if the byte budget would be exceeded.
    pub fn set_entry(&self, key: &str, value: &str) -> bool {
        self.set_entries(&[(key, value)])
    }

    /// Inserts or replaces all `entries`, or none of them if the byte budget would be exceeded.
    pub fn set_entries(&self, entries: &[(&str, &str)]) -> bool {
        let mut inner = self.inner.lock();
        if !self.within_budget(&inner, entries) {
            return false;
        }
        for (key, value) in entries {
            inner.entries.insert((*key).to_string(), (*value).to_string());
        }
        true
    }

    /// Whether [`Shed::set_entries`] would currently accept `entries`.
    pub fn fits(&self, entries: &[(&str, &str)]) -> bool {
        self.within_budget(&self.inner.lock(), entries)
    }

    fn within_budget(&self, inner: &ShedInner, entries: &[(&str, &str)]) -> bool {
        if self.size == 0 {
            return true;
        }
        let mut next = inner.index_size();
        let mut seen = BTreeSet::new();
        for (key, value) in entries.iter().rev() {
            // Later duplicates win, as they would on insert.
            if !seen.insert(*key) {
                continue;
            }
            let replaced = inner.entries.get(*key).map_or(0, |old| key.len() + old.len());
            next = next - replaced + key.len() + value.len();
        }
        next <= self.size
    }

    /// Looks up an entry.
    pub fn get_entry(&self, key: &str) -> Option<String> {
        self.inner.lock().entries.get(key).cloned()
    }

    /// Removes an entry, returning its previous value.
    pub fn remove_entry(&self, key: &str) -> Option<String> {
        self.inner.lock().entries.remove(key)
    }

    /// Copy of all entries, ordered by key.
    pub fn entries(&self) -> Vec<(String, String)> {
        self.inner.lock().entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    /// Drops every entry.
    pub fn clear_index(&self) {
        self.inner.lock().entries.clear();
    }

    /// Replaces the code area.
    pub fn load_code(&self, code: &[u8]) {
        let mut inner = self.inner.lock();
        inner.code.clear();
        inner.code.extend_from_slice(code);
    }

    /// Empties the code area.
    pub fn clear_code(&self) {
        self.inner.lock().code.clear();
    }

    /// Size report.
    pub fn status(&self) -> ShedStatus {
        let inner = self.inner.lock();
        ShedStatus {
            id: self.id,
            size: self.size,
            code_size: inner.code.len(),
            index_size: inner.index_size(),
            owner_tag: format!("pid:{}", self.pid),
        }
    }
}

impl fmt::Debug for Shed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shed").field("pid", &self.pid).field("id", &self.id).field("size", &self.size).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_roundtrip() {
        let shed = Shed::new(3, IndexId(1), 0);
        assert!(shed.set_entry("foo_ADDR", "0"));
        assert!(shed.set_entry("foo_SIZE", "18"));
        assert_eq!(shed.get_entry("foo_ADDR").as_deref(), Some("0"));
        assert_eq!(shed.remove_entry("foo_ADDR").as_deref(), Some("0"));
        assert_eq!(shed.get_entry("foo_ADDR"), None);
        assert_eq!(shed.entries().len(), 1);
    }

    #[test]
    fn budget_is_enforced_except_when_zero() {
        let shed = Shed::new(3, IndexId(1), 8);
        assert!(shed.set_entry("ab", "cd"));
        assert!(shed.set_entry("ef", "gh"));
        assert!(!shed.set_entry("ij", "k"));
        // Replacing an entry only charges the difference.
        assert!(shed.set_entry("ab", "c"));

        let unchecked = Shed::new(3, IndexId(2), 0);
        assert!(unchecked.set_entry("key", &"x".repeat(4096)));
    }

    #[test]
    fn paired_entries_are_all_or_nothing() {
        let shed = Shed::new(3, IndexId(1), 20);
        assert!(shed.set_entries(&[("k_ADDR", "0"), ("k_SIZE", "12")]));
        assert!(shed.fits(&[("k_ADDR", "4"), ("k_SIZE", "9")]));
        assert!(!shed.fits(&[("k_ADDR", "0"), ("k_SIZE", "120000000000")]));
        assert!(!shed.set_entries(&[("k_ADDR", "1"), ("k_SIZE", "120000000000")]));
        assert_eq!(shed.get_entry("k_ADDR").as_deref(), Some("0"));
        assert_eq!(shed.get_entry("k_SIZE").as_deref(), Some("12"));
    }

    #[test]
    fn status_reports_sizes_and_owner() {
        let shed = Shed::new(42, IndexId(5), 0);
        shed.set_entry("k", "vv");
        shed.load_code(b"\x01\x02\x03");
        let status = shed.status();
        assert_eq!(status.id, IndexId(5));
        assert_eq!(status.code_size, 3);
        assert_eq!(status.index_size, 3);
        assert_eq!(status.owner_tag, "pid:42");

        shed.clear_code();
        shed.clear_index();
        let status = shed.status();
        assert_eq!(status.code_size, 0);
        assert_eq!(status.index_size, 0);
    }
}
