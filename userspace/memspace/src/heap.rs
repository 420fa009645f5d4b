// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Fixed-capacity byte heap owned by one process
//! OWNERS: @runtime
//! STATUS: Functional (host-first)
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests below
//!
//! INVARIANTS:
//! - Reservation blocks never overlap and never extend past capacity
//! - `used_size` is the sum of reservation lengths, independent of cell contents
//! - Compaction preserves block order and block lengths

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::error::HeapError;
use crate::Pid;

/// Identifier of a heap inside one process memory space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct StoreId(pub u64);

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "heap#{}", self.0)
    }
}

/// Reservation marker inside a heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    /// First byte covered by the block.
    pub base: usize,
    /// Number of bytes covered.
    pub length: usize,
}

impl Block {
    /// One past the last covered byte.
    pub fn end(&self) -> usize {
        self.base + self.length
    }
}

/// Point-in-time usage of a heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    /// Heap identifier.
    pub id: StoreId,
    /// Total bytes.
    pub capacity: usize,
    /// Reserved bytes.
    pub used: usize,
    /// Unreserved bytes.
    pub free: usize,
}

/// One block moved by compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    /// Base before compaction.
    pub old_base: usize,
    /// Base after compaction.
    pub new_base: usize,
    /// Block length.
    pub length: usize,
}

/// Outcome of a single compaction pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionReport {
    /// Reserved bytes before the pass.
    pub used_before: usize,
    /// Reserved bytes after the pass; always equal to `used_before`.
    pub used_after: usize,
    /// High-water mark before the pass.
    pub extent_before: usize,
    /// High-water mark after the pass.
    pub extent_after: usize,
    /// Gap bytes folded back into the contiguous free tail, measured as
    /// `extent_before - extent_after`. Reserved bytes never change, so
    /// `used_before - used_after` would always be 0.
    pub reclaimed: usize,
    /// Blocks whose base changed.
    pub remap: Vec<Relocation>,
}

struct HeapInner {
    cells: Vec<u8>,
    blocks: BTreeMap<usize, usize>,
    released: bool,
}

impl HeapInner {
    fn used(&self) -> usize {
        self.blocks.values().sum()
    }

    fn extent(&self) -> usize {
        self.blocks.iter().next_back().map(|(base, len)| base + len).unwrap_or(0)
    }

    fn check_range(&self, base: usize, len: usize) -> Result<usize, HeapError> {
        let capacity = self.cells.len();
        match base.checked_add(len) {
            Some(end) if end <= capacity => Ok(end),
            _ => Err(HeapError::OutOfRange { base, end: base.saturating_add(len), capacity }),
        }
    }

    fn overlaps(&self, base: usize, end: usize) -> bool {
        // The only candidates are the last block starting before `end`.
        self.blocks
            .range(..end)
            .next_back()
            .is_some_and(|(b, len)| b + len > base)
    }

    fn validate(&self) -> Result<(), HeapError> {
        let capacity = self.cells.len();
        let mut floor = 0usize;
        for (&base, &len) in &self.blocks {
            if base < floor {
                return Err(HeapError::CorruptBlocks(format!("block at {base} overlaps predecessor ending at {floor}")));
            }
            floor = base
                .checked_add(len)
                .filter(|end| *end <= capacity)
                .ok_or_else(|| HeapError::CorruptBlocks(format!("block at {base} (+{len}) exceeds capacity {capacity}")))?;
        }
        Ok(())
    }
}

/// Byte-addressable heap with reservation bookkeeping.
pub struct Heap {
    pid: Pid,
    id: StoreId,
    pinned: AtomicBool,
    inner: Mutex<HeapInner>,
}

impl Heap {
    /// Creates a zeroed heap of `capacity` bytes.
    pub fn new(pid: Pid, capacity: usize, id: StoreId) -> Self {
        Self {
            pid,
            id,
            pinned: AtomicBool::new(false),
            inner: Mutex::new(HeapInner { cells: vec![0u8; capacity], blocks: BTreeMap::new(), released: false }),
        }
    }

    /// Owning process.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Heap identifier.
    pub fn id(&self) -> StoreId {
        self.id
    }

    /// Total bytes; zero once the heap has been released.
    pub fn capacity(&self) -> usize {
        let inner = self.inner.lock();
        if inner.released {
            0
        } else {
            inner.cells.len()
        }
    }

    /// Reserved bytes.
    pub fn used_size(&self) -> usize {
        self.inner.lock().used()
    }

    /// End of the highest reservation.
    pub fn extent(&self) -> usize {
        self.inner.lock().extent()
    }

    /// Capacity/used/free snapshot.
    pub fn stats(&self) -> HeapStats {
        let inner = self.inner.lock();
        let capacity = if inner.released { 0 } else { inner.cells.len() };
        let used = inner.used();
        HeapStats { id: self.id, capacity, used, free: capacity.saturating_sub(used) }
    }

    /// Writes one byte. Returns `false` when out of range or released.
    pub fn write(&self, addr: usize, value: u8) -> bool {
        let mut inner = self.inner.lock();
        if inner.released {
            return false;
        }
        match inner.cells.get_mut(addr) {
            Some(cell) => {
                *cell = value;
                true
            }
            None => false,
        }
    }

    /// Reads one byte.
    pub fn read(&self, addr: usize) -> Option<u8> {
        let inner = self.inner.lock();
        if inner.released {
            return None;
        }
        inner.cells.get(addr).copied()
    }

    /// Copies `data` into the heap starting at `base`.
    pub fn write_range(&self, base: usize, data: &[u8]) -> Result<(), HeapError> {
        let mut inner = self.inner.lock();
        if inner.released {
            return Err(HeapError::Released);
        }
        let end = inner.check_range(base, data.len())?;
        inner.cells[base..end].copy_from_slice(data);
        Ok(())
    }

    /// Copies `len` bytes starting at `base` out of the heap.
    pub fn read_range(&self, base: usize, len: usize) -> Result<Vec<u8>, HeapError> {
        let inner = self.inner.lock();
        if inner.released {
            return Err(HeapError::Released);
        }
        let end = inner.check_range(base, len)?;
        Ok(inner.cells[base..end].to_vec())
    }

    /// Zeroes `len` bytes starting at `base`.
    pub fn zero_range(&self, base: usize, len: usize) -> Result<(), HeapError> {
        let mut inner = self.inner.lock();
        if inner.released {
            return Err(HeapError::Released);
        }
        let end = inner.check_range(base, len)?;
        inner.cells[base..end].fill(0);
        Ok(())
    }

    /// Marks `[base, base + len)` as in use.
    pub fn reserve(&self, base: usize, len: usize) -> Result<(), HeapError> {
        let mut inner = self.inner.lock();
        if inner.released {
            return Err(HeapError::Released);
        }
        let end = inner.check_range(base, len)?;
        if len == 0 || inner.overlaps(base, end) {
            return Err(HeapError::Overlap(base));
        }
        inner.blocks.insert(base, len);
        Ok(())
    }

    /// Drops the reservation starting at `base`; returns its length.
    pub fn release(&self, base: usize) -> Result<usize, HeapError> {
        self.inner.lock().blocks.remove(&base).ok_or(HeapError::UnknownBlock(base))
    }

    /// Read-only copy of the reservation list, ordered by base.
    pub fn blocks(&self) -> Vec<Block> {
        self.inner
            .lock()
            .blocks
            .iter()
            .map(|(&base, &length)| Block { base, length })
            .collect()
    }

    /// Wipes all cells and reservations and retires the heap.
    pub fn free_all(&self) {
        let mut inner = self.inner.lock();
        inner.cells.fill(0);
        inner.blocks.clear();
        inner.released = true;
    }

    /// Whether `free_all` has retired this heap.
    pub fn is_released(&self) -> bool {
        self.inner.lock().released
    }

    /// Flags the heap as indexed by absolute address elsewhere; compaction skips it.
    pub fn pin(&self) {
        self.pinned.store(true, Ordering::Release);
    }

    /// See [`Heap::pin`].
    pub fn is_pinned(&self) -> bool {
        self.pinned.load(Ordering::Acquire)
    }

    /// Share of the occupied span that is gap, in percent.
    pub fn fragmentation_percent(&self) -> f64 {
        let inner = self.inner.lock();
        let extent = inner.extent();
        if extent == 0 {
            return 0.0;
        }
        extent.saturating_sub(inner.used()) as f64 * 100.0 / extent as f64
    }

    /// Repacks reservations toward address 0, preserving their order.
    pub fn compact(&self) -> Result<CompactionReport, HeapError> {
        let mut inner = self.inner.lock();
        if inner.released {
            return Err(HeapError::Released);
        }
        inner.validate()?;

        let used_before = inner.used();
        let extent_before = inner.extent();
        let blocks: Vec<(usize, usize)> = inner.blocks.iter().map(|(b, l)| (*b, *l)).collect();

        let mut packed = BTreeMap::new();
        let mut remap = Vec::new();
        let mut cursor = 0usize;
        for (base, length) in blocks {
            if base != cursor {
                // cursor <= base, so a forward memmove never clobbers unread data.
                inner.cells.copy_within(base..base + length, cursor);
                remap.push(Relocation { old_base: base, new_base: cursor, length });
            }
            packed.insert(cursor, length);
            cursor += length;
        }
        inner.cells[cursor..extent_before].fill(0);
        inner.blocks = packed;

        let used_after = inner.used();
        let extent_after = inner.extent();
        Ok(CompactionReport {
            used_before,
            used_after,
            extent_before,
            extent_after,
            reclaimed: extent_before - extent_after,
            remap,
        })
    }

    /// Inserts a block without overlap checks so tests can build corrupt heaps.
    #[cfg(test)]
    pub(crate) fn inject_block(&self, base: usize, len: usize) {
        self.inner.lock().blocks.insert(base, len);
    }
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.stats();
        f.debug_struct("Heap")
            .field("pid", &self.pid)
            .field("id", &self.id)
            .field("capacity", &stats.capacity)
            .field("used", &stats.used)
            .field("pinned", &self.is_pinned())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap(capacity: usize) -> Heap {
        Heap::new(7, capacity, StoreId(1))
    }

    #[test]
    fn cell_read_write_bounds() {
        let heap = heap(16);
        assert!(heap.write(0, 0xAB));
        assert!(heap.write(15, 0xCD));
        assert!(!heap.write(16, 0xEF));
        assert_eq!(heap.read(0), Some(0xAB));
        assert_eq!(heap.read(15), Some(0xCD));
        assert_eq!(heap.read(16), None);
    }

    #[test]
    fn reserve_rejects_overlap_and_overflow() {
        let heap = heap(64);
        heap.reserve(8, 8).unwrap();
        assert_eq!(heap.reserve(12, 4), Err(HeapError::Overlap(12)));
        assert_eq!(heap.reserve(0, 9), Err(HeapError::Overlap(0)));
        assert!(heap.reserve(0, 8).is_ok());
        assert!(heap.reserve(16, 48).is_ok());
        assert!(matches!(heap.reserve(60, 8), Err(HeapError::OutOfRange { .. })));
        assert_eq!(heap.used_size(), 64);
        assert_eq!(heap.stats().free, 0);
    }

    #[test]
    fn release_returns_length() {
        let heap = heap(32);
        heap.reserve(4, 10).unwrap();
        assert_eq!(heap.release(4), Ok(10));
        assert_eq!(heap.release(4), Err(HeapError::UnknownBlock(4)));
        assert_eq!(heap.used_size(), 0);
    }

    #[test]
    fn compaction_preserves_order_and_contents() {
        let heap = heap(64);
        heap.reserve(4, 4).unwrap();
        heap.write_range(4, b"aaaa").unwrap();
        heap.reserve(20, 3).unwrap();
        heap.write_range(20, b"bbb").unwrap();
        heap.reserve(40, 5).unwrap();
        heap.write_range(40, b"ccccc").unwrap();

        let report = heap.compact().unwrap();
        assert_eq!(report.used_before, 12);
        assert_eq!(report.used_after, report.used_before);
        assert_eq!(report.extent_before, 45);
        assert_eq!(report.extent_after, 12);
        assert_eq!(report.reclaimed, report.extent_before - report.extent_after);
        assert_eq!(report.remap.len(), 3);

        assert_eq!(
            heap.blocks(),
            vec![Block { base: 0, length: 4 }, Block { base: 4, length: 3 }, Block { base: 7, length: 5 }]
        );
        assert_eq!(heap.read_range(0, 12).unwrap(), b"aaaabbbccccc");
        assert!(heap.read_range(12, 33).unwrap().iter().all(|b| *b == 0));
    }

    #[test]
    fn compaction_of_packed_heap_is_noop() {
        let heap = heap(16);
        heap.reserve(0, 8).unwrap();
        let report = heap.compact().unwrap();
        assert_eq!(report.reclaimed, 0);
        assert!(report.remap.is_empty());
    }

    #[test]
    fn compaction_rejects_corrupt_blocks() {
        let heap = heap(16);
        heap.reserve(0, 8).unwrap();
        heap.inject_block(4, 8);
        assert!(matches!(heap.compact(), Err(HeapError::CorruptBlocks(_))));
    }

    #[test]
    fn free_all_retires_heap() {
        let heap = heap(16);
        heap.reserve(0, 4).unwrap();
        heap.free_all();
        assert!(heap.is_released());
        assert_eq!(heap.capacity(), 0);
        assert_eq!(heap.used_size(), 0);
        assert!(!heap.write(0, 1));
        assert_eq!(heap.reserve(0, 1), Err(HeapError::Released));
    }

    #[test]
    fn fragmentation_tracks_gaps() {
        let heap = heap(100);
        assert_eq!(heap.fragmentation_percent(), 0.0);
        heap.reserve(0, 25).unwrap();
        heap.reserve(75, 25).unwrap();
        assert!((heap.fragmentation_percent() - 50.0).abs() < f64::EPSILON);
    }
}
