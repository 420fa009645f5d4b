// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Read-only usage reports.

use std::fmt::Write as _;

use serde::Serialize;

use crate::heap::StoreId;
use crate::radix;
use crate::shed::IndexId;
use crate::Pid;

/// One heap in a report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreReport {
    /// Heap id.
    pub id: StoreId,
    /// Capacity in bytes.
    pub size: usize,
    /// Reserved bytes.
    pub used: usize,
    /// Unreserved bytes.
    pub free: usize,
    /// Whether compaction skips this heap.
    pub pinned: bool,
}

/// One index in a report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexReport {
    /// Index id.
    pub id: IndexId,
    /// Byte budget; 0 means unchecked.
    pub size: usize,
    /// Code area bytes.
    pub code_size: usize,
    /// Entry bytes.
    pub index_size: usize,
}

/// One process memory space in a report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessReport {
    /// Process id.
    pub pid: Pid,
    /// Registered program name or the generated placeholder.
    pub name: String,
    /// Heaps ordered by id.
    pub stores: Vec<StoreReport>,
    /// Indexes ordered by id.
    pub indexes: Vec<IndexReport>,
}

/// Sums across all reported processes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Totals {
    /// Number of processes.
    pub processes: usize,
    /// Number of heaps.
    pub stores: usize,
    /// Number of indexes.
    pub indexes: usize,
    /// Total heap capacity.
    pub size: usize,
    /// Total reserved bytes.
    pub used: usize,
    /// Total unreserved bytes.
    pub free: usize,
}

/// Registry report produced by [`crate::MemorySpaceRegistry::snapshot`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    /// Per-process details ordered by pid.
    pub processes: Vec<ProcessReport>,
    /// Aggregates.
    pub totals: Totals,
}

impl Snapshot {
    pub(crate) fn from_processes(processes: Vec<ProcessReport>) -> Self {
        let mut totals = Totals { processes: processes.len(), ..Totals::default() };
        for process in &processes {
            totals.stores += process.stores.len();
            totals.indexes += process.indexes.len();
            for store in &process.stores {
                totals.size += store.size;
                totals.used += store.used;
                totals.free += store.free;
            }
        }
        Self { processes, totals }
    }

    /// Renders a text report with sizes in `radix`.
    pub fn render(&self, radix: u32) -> String {
        let num = |value: usize| format!("{}{}", radix::prefix(radix), radix::to_radix(value as u64, radix));
        let mut out = String::new();
        for process in &self.processes {
            let _ = writeln!(out, "pid {} ({})", process.pid, process.name);
            for store in &process.stores {
                let _ = writeln!(
                    out,
                    "  {} size={} used={} free={}{}",
                    store.id,
                    num(store.size),
                    num(store.used),
                    num(store.free),
                    if store.pinned { " pinned" } else { "" }
                );
            }
            for index in &process.indexes {
                let _ = writeln!(
                    out,
                    "  {} size={} code={} index={}",
                    index.id,
                    num(index.size),
                    num(index.code_size),
                    num(index.index_size)
                );
            }
        }
        let t = &self.totals;
        let _ = writeln!(
            out,
            "total: {} processes, {} heaps, {} indexes, size={} used={} free={}",
            t.processes,
            t.stores,
            t.indexes,
            num(t.size),
            num(t.used),
            num(t.free)
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Snapshot {
        Snapshot::from_processes(vec![ProcessReport {
            pid: 3,
            name: "shell".into(),
            stores: vec![
                StoreReport { id: StoreId(1), size: 256, used: 16, free: 240, pinned: false },
                StoreReport { id: StoreId(2), size: 256, used: 0, free: 256, pinned: true },
            ],
            indexes: vec![IndexReport { id: IndexId(1), size: 0, code_size: 4, index_size: 10 }],
        }])
    }

    #[test]
    fn totals_sum_all_stores() {
        let snapshot = sample();
        assert_eq!(snapshot.totals.processes, 1);
        assert_eq!(snapshot.totals.stores, 2);
        assert_eq!(snapshot.totals.indexes, 1);
        assert_eq!(snapshot.totals.size, 512);
        assert_eq!(snapshot.totals.used, 16);
        assert_eq!(snapshot.totals.free, 496);
    }

    #[test]
    fn render_uses_requested_radix() {
        let text = sample().render(16);
        assert!(text.contains("pid 3 (shell)"));
        assert!(text.contains("heap#1 size=0x100 used=0x10 free=0xf0"));
        assert!(text.contains("heap#2 size=0x100 used=0x0 free=0x100 pinned"));
        assert!(text.contains("shed#1 size=0x0 code=0x4 index=0xa"));

        let decimal = sample().render(10);
        assert!(decimal.contains("size=512 used=16 free=496"));
    }
}
