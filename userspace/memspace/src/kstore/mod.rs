// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel persistence store on top of a reserved process memory space
//! OWNERS: @runtime
//! STATUS: Functional (host-first)
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests below + tests/kstore.rs
//!
//! Named values are framed records (see [`codec`]) written into the reserved
//! pid's heap. The sidecar index maps `<key>_ADDR` / `<key>_SIZE` to the byte
//! range; a key without both entries is absent.
//!
//! INVARIANTS:
//! - Allocated ranges never overlap and each one is backed by a heap reservation
//! - The reserved heap is pinned, so compaction never invalidates stored addresses
//! - A failed save never disturbs other keys, and leaves an overwritten key's
//!   previous value readable
//!
//! Public operations return sentinels (`false` / `None`) and log; the `try_*`
//! variants surface [`KstoreError`].

mod alloc;
pub mod codec;

pub use alloc::{AllocatedRange, RangeTable};

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::config::KernelStoreConfig;
use crate::error::{HeapError, KstoreError};
use crate::heap::Heap;
use crate::registry::{AllocRequest, MemorySpaceRegistry, REGISTRY_STATE_KEY};
use crate::shed::Shed;

const ADDR_SUFFIX: &str = "_ADDR";
const SIZE_SUFFIX: &str = "_SIZE";

fn addr_key(key: &str) -> String {
    format!("{key}{ADDR_SUFFIX}")
}

fn size_key(key: &str) -> String {
    format!("{key}{SIZE_SUFFIX}")
}

/// Occupancy of the reserved heap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Usage {
    /// Capacity in bytes.
    pub size: usize,
    /// Bytes held by saved values.
    pub used: usize,
    /// Remaining bytes.
    pub free: usize,
    /// `used / size` in percent.
    pub percent: f64,
}

#[derive(Clone)]
struct Backing {
    heap: Arc<Heap>,
    index: Arc<Shed>,
}

#[derive(Clone)]
struct Provisioned {
    backing: Backing,
    ranges: RangeTable,
}

type Provisioning = Shared<BoxFuture<'static, Result<Provisioned, KstoreError>>>;

enum Bootstrap {
    NotStarted,
    InProgress(Provisioning),
    Ready(Backing),
}

struct Inner {
    bootstrap: Bootstrap,
    ranges: RangeTable,
}

/// Named-value persistence backed by the reserved kernel memory space.
pub struct KernelStore {
    registry: Arc<MemorySpaceRegistry>,
    config: KernelStoreConfig,
    inner: Mutex<Inner>,
}

impl KernelStore {
    /// Creates a store; the reserved heap is provisioned lazily on first use.
    pub fn new(registry: Arc<MemorySpaceRegistry>, config: KernelStoreConfig) -> Self {
        Self { registry, config, inner: Mutex::new(Inner { bootstrap: Bootstrap::NotStarted, ranges: RangeTable::new() }) }
    }

    /// Whether the reserved pair is provisioned and live.
    pub fn is_ready(&self) -> bool {
        matches!(&self.inner.lock().bootstrap, Bootstrap::Ready(backing) if !backing.heap.is_released())
    }

    async fn ensure_ready(&self, key: &str) -> Result<Backing, KstoreError> {
        let pending = {
            let mut inner = self.inner.lock();
            let in_progress = match &inner.bootstrap {
                Bootstrap::Ready(backing) if !backing.heap.is_released() => return Ok(backing.clone()),
                Bootstrap::Ready(_) => {
                    warn!("kstore: reserved heap was released; re-provisioning");
                    None
                }
                Bootstrap::InProgress(pending) => Some(pending.clone()),
                Bootstrap::NotStarted => None,
            };
            match in_progress {
                Some(_) if key == REGISTRY_STATE_KEY => {
                    return Err(KstoreError::BootstrapUnavailable(
                        "registry state requested while the kernel store is provisioning".into(),
                    ));
                }
                Some(pending) => pending,
                None => {
                    let pending = provision(Arc::clone(&self.registry), self.config.clone()).boxed().shared();
                    inner.bootstrap = Bootstrap::InProgress(pending.clone());
                    inner.ranges = RangeTable::new();
                    pending
                }
            }
        };

        let outcome = pending.await;
        let mut inner = self.inner.lock();
        match outcome {
            Ok(provisioned) => {
                match &inner.bootstrap {
                    Bootstrap::Ready(backing) => return Ok(backing.clone()),
                    Bootstrap::InProgress(_) | Bootstrap::NotStarted => {}
                }
                inner.ranges = provisioned.ranges;
                inner.bootstrap = Bootstrap::Ready(provisioned.backing.clone());
                Ok(provisioned.backing)
            }
            Err(err) => {
                if matches!(inner.bootstrap, Bootstrap::InProgress(_)) {
                    inner.bootstrap = Bootstrap::NotStarted;
                }
                Err(err)
            }
        }
    }

    /// Saves `value` under `key`, reusing the key's range when the new record fits.
    pub async fn try_save_value(&self, key: &str, value: Value) -> Result<(), KstoreError> {
        let record = codec::encode(&value)?;
        let backing = self.ensure_ready(key).await?;
        let mut inner = self.inner.lock();
        let ranges = &mut inner.ranges;
        let heap = &backing.heap;
        let capacity = heap.capacity();

        let old = ranges.get(key).cloned();
        let reused = old.as_ref().filter(|old| record.len() <= old.len).map(|old| old.start);
        let start = match reused {
            Some(start) => start,
            None => {
                ranges.remove(key);
                let found = ranges.find_window(record.len(), capacity).or_else(|| {
                    let dropped = cleanup(ranges, &backing);
                    if dropped > 0 {
                        info!("kstore: cleanup dropped {dropped} stale ranges");
                    }
                    ranges.find_window(record.len(), capacity)
                });
                match found {
                    Some(start) => start,
                    None => {
                        restore_range(ranges, old.as_ref())?;
                        return Err(KstoreError::AllocationExhausted {
                            requested: record.len(),
                            available: ranges.available(capacity),
                        });
                    }
                }
            }
        };

        // Nothing on the heap is touched until the index can take the new pair.
        let (addr_entry, size_entry) = (addr_key(key), size_key(key));
        let (addr, size) = (start.to_string(), record.len().to_string());
        let entries = [(addr_entry.as_str(), addr.as_str()), (size_entry.as_str(), size.as_str())];
        let index = &backing.index;
        if !index.fits(&entries) {
            if reused.is_none() {
                restore_range(ranges, old.as_ref())?;
            }
            return Err(KstoreError::IndexFull(format!("no room for the entries of `{key}`")));
        }

        if let Some(old) = &old {
            ranges.remove(key);
            release_block(heap, old.start);
        }
        let span = old.as_ref().map_or(0, |old| old.len).max(record.len());
        heap.zero_range(start, span.min(capacity - start))?;
        heap.write_range(start, &record)?;
        heap.reserve(start, record.len())?;
        let range = AllocatedRange { key: key.to_string(), start, len: record.len() };
        if reused.is_some() {
            ranges.insert(range)?;
        } else {
            ranges.claim(range)?;
        }

        if !index.set_entries(&entries) {
            index.remove_entry(&addr_entry);
            index.remove_entry(&size_entry);
            ranges.remove(key);
            release_block(heap, start);
            return Err(KstoreError::IndexFull(format!("index changed while saving `{key}`")));
        }
        debug!("kstore: saved `{key}` at {start} ({} bytes)", record.len());
        Ok(())
    }

    /// Serializes `value` and saves it under `key`.
    pub async fn try_save<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), KstoreError> {
        let value = serde_json::to_value(value).map_err(|err| KstoreError::Serialization(err.to_string()))?;
        self.try_save_value(key, value).await
    }

    /// Reads the value saved under `key`.
    pub async fn try_load_value(&self, key: &str) -> Result<Value, KstoreError> {
        let backing = self.ensure_ready(key).await?;
        let range = indexed_range(&backing.index, key, backing.heap.capacity())?;
        let bytes = backing.heap.read_range(range.start, range.len)?;
        codec::decode(&bytes)
    }

    /// Reads and deserializes the value saved under `key`.
    pub async fn try_load<T: DeserializeOwned>(&self, key: &str) -> Result<T, KstoreError> {
        let value = self.try_load_value(key).await?;
        serde_json::from_value(value).map_err(|err| KstoreError::Serialization(err.to_string()))
    }

    /// Removes `key`; returns whether anything was recorded for it. Cells are not zeroed.
    pub async fn try_delete(&self, key: &str) -> Result<bool, KstoreError> {
        let backing = self.ensure_ready(key).await?;
        let mut inner = self.inner.lock();
        let had_addr = backing.index.remove_entry(&addr_key(key)).is_some();
        let had_size = backing.index.remove_entry(&size_key(key)).is_some();
        let range = inner.ranges.remove(key);
        if let Some(range) = &range {
            release_block(&backing.heap, range.start);
        }
        Ok(had_addr || had_size || range.is_some())
    }

    /// Whether the index holds both entries for `key`.
    pub async fn try_has(&self, key: &str) -> Result<bool, KstoreError> {
        let backing = self.ensure_ready(key).await?;
        let index = &backing.index;
        Ok(index.get_entry(&addr_key(key)).is_some() && index.get_entry(&size_key(key)).is_some())
    }

    /// Occupancy of the reserved heap.
    pub async fn try_usage(&self) -> Result<Usage, KstoreError> {
        let backing = self.ensure_ready("").await?;
        let stats = backing.heap.stats();
        let percent = if stats.capacity == 0 { 0.0 } else { stats.used as f64 * 100.0 / stats.capacity as f64 };
        Ok(Usage { size: stats.capacity, used: stats.used, free: stats.free, percent })
    }

    /// Saved keys, sorted.
    pub async fn try_keys(&self) -> Result<Vec<String>, KstoreError> {
        self.ensure_ready("").await?;
        Ok(self.inner.lock().ranges.keys())
    }

    /// Sentinel form of [`KernelStore::try_save`].
    pub async fn save<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> bool {
        report_save(key, self.try_save(key, value).await)
    }

    /// Sentinel form of [`KernelStore::try_save_value`].
    pub async fn save_value(&self, key: &str, value: Value) -> bool {
        report_save(key, self.try_save_value(key, value).await)
    }

    /// Sentinel form of [`KernelStore::try_load`].
    pub async fn load<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        report_load(key, self.try_load(key).await)
    }

    /// Sentinel form of [`KernelStore::try_load_value`].
    pub async fn load_value(&self, key: &str) -> Option<Value> {
        report_load(key, self.try_load_value(key).await)
    }

    /// Sentinel form of [`KernelStore::try_delete`].
    pub async fn delete(&self, key: &str) -> bool {
        match self.try_delete(key).await {
            Ok(existed) => existed,
            Err(err) => {
                warn!("kstore: delete of `{key}` failed: {err}");
                false
            }
        }
    }

    /// Sentinel form of [`KernelStore::try_has`].
    pub async fn has(&self, key: &str) -> bool {
        self.try_has(key).await.unwrap_or_else(|err| {
            warn!("kstore: lookup of `{key}` failed: {err}");
            false
        })
    }

    /// Sentinel form of [`KernelStore::try_usage`]; zeros when unavailable.
    pub async fn usage(&self) -> Usage {
        self.try_usage().await.unwrap_or_else(|err| {
            warn!("kstore: usage unavailable: {err}");
            Usage::default()
        })
    }

    /// Sentinel form of [`KernelStore::try_keys`].
    pub async fn keys(&self) -> Vec<String> {
        self.try_keys().await.unwrap_or_else(|err| {
            warn!("kstore: key listing unavailable: {err}");
            Vec::new()
        })
    }
}

fn report_save(key: &str, result: Result<(), KstoreError>) -> bool {
    match result {
        Ok(()) => true,
        Err(err @ (KstoreError::AllocationExhausted { .. } | KstoreError::IndexFull(_))) => {
            warn!("kstore: save of `{key}` failed: {err}");
            false
        }
        Err(err) => {
            error!("kstore: save of `{key}` failed: {err}");
            false
        }
    }
}

fn report_load<T>(key: &str, result: Result<T, KstoreError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(KstoreError::NotFound) => {
            debug!("kstore: `{key}` not found");
            None
        }
        Err(err) => {
            warn!("kstore: load of `{key}` failed: {err}");
            None
        }
    }
}

/// Puts back the range a failed save took out of the table.
fn restore_range(ranges: &mut RangeTable, old: Option<&AllocatedRange>) -> Result<(), KstoreError> {
    match old {
        Some(old) => ranges.insert(old.clone()),
        None => Ok(()),
    }
}

fn release_block(heap: &Heap, start: usize) {
    match heap.release(start) {
        Ok(_) => {}
        Err(HeapError::UnknownBlock(_)) => debug!("kstore: no reservation at {start} to release"),
        Err(err) => warn!("kstore: releasing reservation at {start} failed: {err}"),
    }
}

/// Range recorded in the index for `key`.
fn indexed_range(index: &Shed, key: &str, capacity: usize) -> Result<AllocatedRange, KstoreError> {
    let addr = index.get_entry(&addr_key(key)).ok_or(KstoreError::NotFound)?;
    let size = index.get_entry(&size_key(key)).ok_or(KstoreError::NotFound)?;
    let start: usize = addr
        .trim()
        .parse()
        .map_err(|_| KstoreError::CorruptIndex(format!("unparsable address `{addr}` for `{key}`")))?;
    let len: usize = size
        .trim()
        .parse()
        .map_err(|_| KstoreError::CorruptIndex(format!("unparsable size `{size}` for `{key}`")))?;
    match start.checked_add(len) {
        Some(end) if len > 0 && end <= capacity => Ok(AllocatedRange { key: key.to_string(), start, len }),
        _ => Err(KstoreError::CorruptIndex(format!("range {start}+{len} of `{key}` outside capacity {capacity}"))),
    }
}

/// Drops ranges whose index entries no longer describe them; returns how many.
fn cleanup(ranges: &mut RangeTable, backing: &Backing) -> usize {
    let capacity = backing.heap.capacity();
    let dropped = ranges.retain(|range| {
        indexed_range(&backing.index, &range.key, capacity).is_ok_and(|indexed| indexed == *range)
    });
    for range in &dropped {
        debug!("kstore: dropping stale range of `{}`", range.key);
        release_block(&backing.heap, range.start);
    }
    dropped.len()
}

async fn provision(registry: Arc<MemorySpaceRegistry>, config: KernelStoreConfig) -> Result<Provisioned, KstoreError> {
    let request = AllocRequest {
        store_size: Some(config.store_size),
        index_size: Some(config.index_size),
        store_id: Some(config.store_id),
        index_id: Some(config.index_id),
    };
    let allocation = registry.allocate(config.pid, request);
    let (Some(heap), Some(index)) = (allocation.store, allocation.index) else {
        return Err(KstoreError::BootstrapUnavailable(format!(
            "reserved pair {}/{} missing for pid {}",
            config.store_id, config.index_id, config.pid
        )));
    };
    if heap.capacity() == 0 {
        return Err(KstoreError::BootstrapUnavailable(format!("{} of pid {} is released", heap.id(), config.pid)));
    }
    heap.pin();
    registry.register_name(config.pid, "kernel");

    let ranges = recover(&heap, &index);
    info!("kstore: ready on pid {} {} ({} bytes, {} keys)", config.pid, heap.id(), heap.capacity(), ranges.len());
    Ok(Provisioned { backing: Backing { heap, index }, ranges })
}

/// Rebuilds the range table from the index and reconciles heap reservations.
fn recover(heap: &Heap, index: &Shed) -> RangeTable {
    let capacity = heap.capacity();
    let mut table = RangeTable::new();
    let keys: BTreeSet<String> = index
        .entries()
        .into_iter()
        .filter_map(|(entry, _)| {
            entry.strip_suffix(ADDR_SUFFIX).or_else(|| entry.strip_suffix(SIZE_SUFFIX)).map(str::to_string)
        })
        .collect();
    for key in keys {
        let recovered = indexed_range(index, &key, capacity).and_then(|range| table.insert(range));
        if let Err(err) = recovered {
            warn!("kstore: dropping index entries of `{key}`: {err}");
            index.remove_entry(&addr_key(&key));
            index.remove_entry(&size_key(&key));
        }
    }

    let blocks = heap.blocks();
    for block in &blocks {
        let owned = table.iter().any(|range| range.start == block.base && range.len == block.length);
        if !owned {
            release_block(heap, block.base);
        }
    }
    for range in table.iter() {
        if !blocks.iter().any(|block| block.base == range.start && block.length == range.len) {
            if let Err(err) = heap.reserve(range.start, range.len) {
                warn!("kstore: cannot reserve recovered range of `{}`: {err}", range.key);
            }
        }
    }
    table.settle_cursor();
    table
}
