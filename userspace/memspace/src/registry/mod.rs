// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Registry of per-process memory spaces (heaps + sidecar indexes)
//! OWNERS: @runtime
//! STATUS: Functional (host-first)
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests below + tests/registry.rs
//!
//! INVARIANTS:
//! - Heap/index ids are unique per pid and never reused, even after `free`
//! - Every heap/index in a space carries the space's pid
//! - Only scalar bookkeeping (id counters, names) is persisted; live heaps and
//!   indexes are re-provisioned by their owners on every run

mod gc;
mod leak;
mod snapshot;

pub use gc::{CollectionEntry, CollectionOutcome, SweepReport};
pub use leak::{LeakDetector, LeakReport, UsageSample, LEAK_MIN_RISE, LEAK_SAMPLE_COUNT, LEAK_USAGE_FLOOR};
pub use snapshot::{IndexReport, ProcessReport, Snapshot, StoreReport, Totals};

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::backend::{AlwaysRunning, InMemoryBackend, ProcessOracle, StateBackend};
use crate::config::GcConfig;
use crate::heap::{Heap, StoreId};
use crate::shed::{IndexId, Shed};
use crate::Pid;

/// Key under which the registry persists its bookkeeping.
pub const REGISTRY_STATE_KEY: &str = "memspace.registry";

/// Heaps and indexes owned by one process.
#[derive(Debug)]
pub struct ProcessMemorySpace {
    pid: Pid,
    stores: BTreeMap<StoreId, Arc<Heap>>,
    indexes: BTreeMap<IndexId, Arc<Shed>>,
}

impl ProcessMemorySpace {
    fn new(pid: Pid) -> Self {
        Self { pid, stores: BTreeMap::new(), indexes: BTreeMap::new() }
    }

    /// Owning process.
    pub fn pid(&self) -> Pid {
        self.pid
    }
}

/// Next ids to hand out for one pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct IdCounters {
    next_store_id: u64,
    next_index_id: u64,
}

impl Default for IdCounters {
    fn default() -> Self {
        Self { next_store_id: 1, next_index_id: 1 }
    }
}

impl IdCounters {
    fn take_store(&mut self) -> StoreId {
        let id = StoreId(self.next_store_id);
        self.next_store_id += 1;
        id
    }

    fn take_index(&mut self) -> IndexId {
        let id = IndexId(self.next_index_id);
        self.next_index_id += 1;
        id
    }

    fn claim_store(&mut self, id: StoreId) {
        self.next_store_id = self.next_store_id.max(id.0 + 1);
    }

    fn claim_index(&mut self, id: IndexId) {
        self.next_index_id = self.next_index_id.max(id.0 + 1);
    }

    fn merge(&mut self, other: IdCounters) {
        self.next_store_id = self.next_store_id.max(other.next_store_id);
        self.next_index_id = self.next_index_id.max(other.next_index_id);
    }
}

/// Persisted scalar bookkeeping.
#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryState {
    counters: BTreeMap<Pid, IdCounters>,
    names: BTreeMap<Pid, String>,
}

/// Parameters of [`MemorySpaceRegistry::allocate`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocRequest {
    /// Heap capacity; `None` skips heap creation.
    pub store_size: Option<usize>,
    /// Index budget; `None` skips index creation, `Some(0)` means unchecked.
    pub index_size: Option<usize>,
    /// Explicit heap id; an existing heap with this id is reused as is.
    pub store_id: Option<StoreId>,
    /// Explicit index id; an existing index with this id is reused as is.
    pub index_id: Option<IndexId>,
}

impl AllocRequest {
    /// Builds a request from raw sizes: `store_size <= 0` and `index_size < 0`
    /// mean "skip", `index_size == 0` means an index without a size check.
    pub fn new(store_size: i64, index_size: i64) -> Self {
        Self {
            store_size: usize::try_from(store_size).ok().filter(|s| *s > 0),
            index_size: usize::try_from(index_size).ok(),
            store_id: None,
            index_id: None,
        }
    }

    /// Requests a specific heap id.
    pub fn with_store_id(mut self, id: StoreId) -> Self {
        self.store_id = Some(id);
        self
    }

    /// Requests a specific index id.
    pub fn with_index_id(mut self, id: IndexId) -> Self {
        self.index_id = Some(id);
        self
    }
}

/// Result of [`MemorySpaceRegistry::allocate`].
#[derive(Debug, Clone)]
pub struct Allocation {
    /// Id of the returned heap.
    pub store_id: Option<StoreId>,
    /// Id of the returned index.
    pub index_id: Option<IndexId>,
    /// Live heap, shared with the registry.
    pub store: Option<Arc<Heap>>,
    /// Live index, shared with the registry.
    pub index: Option<Arc<Shed>>,
}

#[derive(Default)]
struct Tables {
    spaces: BTreeMap<Pid, ProcessMemorySpace>,
    counters: BTreeMap<Pid, IdCounters>,
    names: BTreeMap<Pid, String>,
}

/// Owns every process memory space plus GC state.
pub struct MemorySpaceRegistry {
    kernel_pid: Pid,
    tables: Mutex<Tables>,
    gc: Mutex<GcConfig>,
    leaks: Mutex<LeakDetector>,
    suspected: Mutex<Vec<LeakReport>>,
    timers: Mutex<Option<gc::GcTimers>>,
    oracle: Arc<dyn ProcessOracle>,
    backend: RwLock<Arc<dyn StateBackend>>,
}

impl Default for MemorySpaceRegistry {
    fn default() -> Self {
        Self::new(GcConfig::default())
    }
}

impl MemorySpaceRegistry {
    /// Creates a registry with a transient backend and no liveness oracle.
    pub fn new(gc: GcConfig) -> Self {
        let leaks = LeakDetector::new(gc.leak_window());
        Self {
            kernel_pid: 0,
            tables: Mutex::new(Tables::default()),
            gc: Mutex::new(gc),
            leaks: Mutex::new(leaks),
            suspected: Mutex::new(Vec::new()),
            timers: Mutex::new(None),
            oracle: Arc::new(AlwaysRunning),
            backend: RwLock::new(Arc::new(InMemoryBackend::new())),
        }
    }

    /// Uses `oracle` to detect exited processes during sweeps.
    pub fn with_oracle(mut self, oracle: Arc<dyn ProcessOracle>) -> Self {
        self.oracle = oracle;
        self
    }

    /// Persists bookkeeping through `backend` instead of the transient table.
    pub fn with_backend(self, backend: Arc<dyn StateBackend>) -> Self {
        *self.backend.write() = backend;
        self
    }

    /// Declares the reserved kernel pid; sweeps never reclaim it.
    pub fn with_kernel_pid(mut self, pid: Pid) -> Self {
        self.kernel_pid = pid;
        self
    }

    /// Swaps the persistence backend after construction.
    pub fn bind_backend(&self, backend: Arc<dyn StateBackend>) {
        *self.backend.write() = backend;
    }

    /// Reserved kernel pid.
    pub fn kernel_pid(&self) -> Pid {
        self.kernel_pid
    }

    /// Provisions (or re-resolves) a heap/index pair for `pid`.
    pub fn allocate(&self, pid: Pid, request: AllocRequest) -> Allocation {
        let mut tables = self.tables.lock();
        let Tables { spaces, counters, .. } = &mut *tables;
        let counter = counters.entry(pid).or_default();
        let space = spaces.entry(pid).or_insert_with(|| {
            debug!("memspace: created memory space for pid {pid}");
            ProcessMemorySpace::new(pid)
        });

        let existing_store = request.store_id.and_then(|id| space.stores.get(&id).map(|heap| (id, Arc::clone(heap))));
        let store = existing_store.or_else(|| {
            let size = request.store_size?;
            let id = match request.store_id {
                Some(id) => {
                    counter.claim_store(id);
                    id
                }
                None => counter.take_store(),
            };
            let heap = Arc::new(Heap::new(pid, size, id));
            space.stores.insert(id, Arc::clone(&heap));
            debug!("memspace: pid {pid} {id} allocated ({size} bytes)");
            Some((id, heap))
        });

        let existing_index = request.index_id.and_then(|id| space.indexes.get(&id).map(|shed| (id, Arc::clone(shed))));
        let index = existing_index.or_else(|| {
            let size = request.index_size?;
            let id = match request.index_id {
                Some(id) => {
                    counter.claim_index(id);
                    id
                }
                None => counter.take_index(),
            };
            let shed = Arc::new(Shed::new(pid, id, size));
            space.indexes.insert(id, Arc::clone(&shed));
            debug!("memspace: pid {pid} {id} allocated");
            Some((id, shed))
        });

        let (store_id, store) = store.unzip();
        let (index_id, index) = index.unzip();
        Allocation { store_id, index_id, store, index }
    }

    /// Releases every heap and index of `pid`. Returns `false` for unknown pids.
    pub fn free(&self, pid: Pid) -> bool {
        let space = self.tables.lock().spaces.remove(&pid);
        let Some(space) = space else {
            debug!("memspace: free ignored for unknown pid {pid}");
            return false;
        };
        for heap in space.stores.values() {
            heap.free_all();
        }
        for shed in space.indexes.values() {
            shed.clear_code();
            shed.clear_index();
        }
        self.leaks.lock().forget(pid);
        info!(
            "memspace: released pid {pid} ({} heaps, {} indexes)",
            space.stores.len(),
            space.indexes.len()
        );
        true
    }

    /// Report for one pid, or for every tracked pid when `pid` is `None`.
    pub fn snapshot(&self, pid: Option<Pid>) -> Snapshot {
        let tables = self.tables.lock();
        let processes = tables
            .spaces
            .values()
            .filter(|space| match pid {
                Some(pid) => pid == space.pid,
                None => true,
            })
            .map(|space| ProcessReport {
                pid: space.pid,
                name: tables.names.get(&space.pid).cloned().unwrap_or_else(|| placeholder_name(space.pid)),
                stores: space
                    .stores
                    .values()
                    .map(|heap| {
                        let stats = heap.stats();
                        StoreReport {
                            id: stats.id,
                            size: stats.capacity,
                            used: stats.used,
                            free: stats.free,
                            pinned: heap.is_pinned(),
                        }
                    })
                    .collect(),
                indexes: space
                    .indexes
                    .values()
                    .map(|shed| {
                        let status = shed.status();
                        IndexReport {
                            id: status.id,
                            size: status.size,
                            code_size: status.code_size,
                            index_size: status.index_size,
                        }
                    })
                    .collect(),
            })
            .collect();
        Snapshot::from_processes(processes)
    }

    /// Associates a display name with `pid`.
    pub fn register_name(&self, pid: Pid, name: impl Into<String>) {
        self.tables.lock().names.insert(pid, name.into());
    }

    /// Display name of `pid`, or `program-<pid>` when none was registered.
    pub fn name(&self, pid: Pid) -> String {
        self.tables.lock().names.get(&pid).cloned().unwrap_or_else(|| placeholder_name(pid))
    }

    /// Pids with a memory space, ascending.
    pub fn pids(&self) -> Vec<Pid> {
        self.tables.lock().spaces.keys().copied().collect()
    }

    /// Heaps of `pid`, ordered by id.
    pub fn stores(&self, pid: Pid) -> Vec<Arc<Heap>> {
        self.tables
            .lock()
            .spaces
            .get(&pid)
            .map(|space| space.stores.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Indexes of `pid`, ordered by id.
    pub fn indexes(&self, pid: Pid) -> Vec<Arc<Shed>> {
        self.tables
            .lock()
            .spaces
            .get(&pid)
            .map(|space| space.indexes.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Used share of all heaps of `pid`, in percent.
    pub fn usage_percent(&self, pid: Pid) -> Option<f64> {
        let (capacity, used) = self
            .stores(pid)
            .iter()
            .map(|heap| heap.stats())
            .fold((0usize, 0usize), |(c, u), s| (c + s.capacity, u + s.used));
        (capacity > 0).then(|| used as f64 * 100.0 / capacity as f64)
    }

    /// Writes counters and names through the bound backend.
    pub async fn persist(&self) -> bool {
        let state = {
            let tables = self.tables.lock();
            RegistryState { counters: tables.counters.clone(), names: tables.names.clone() }
        };
        let value = match serde_json::to_value(&state) {
            Ok(value) => value,
            Err(err) => {
                warn!("memspace: cannot encode registry bookkeeping: {err}");
                return false;
            }
        };
        let backend = Arc::clone(&*self.backend.read());
        let saved = backend.save(REGISTRY_STATE_KEY, value).await;
        if !saved {
            warn!("memspace: registry bookkeeping not persisted; continuing with transient table");
        }
        saved
    }

    /// Merges previously persisted counters and names. Live names win.
    pub async fn restore(&self) -> bool {
        let backend = Arc::clone(&*self.backend.read());
        let Some(value) = backend.load(REGISTRY_STATE_KEY).await else {
            debug!("memspace: no persisted registry bookkeeping");
            return false;
        };
        let state: RegistryState = match serde_json::from_value(value) {
            Ok(state) => state,
            Err(err) => {
                warn!("memspace: discarding unreadable registry bookkeeping: {err}");
                return false;
            }
        };
        let mut tables = self.tables.lock();
        for (pid, counters) in state.counters {
            tables.counters.entry(pid).or_default().merge(counters);
        }
        for (pid, name) in state.names {
            tables.names.entry(pid).or_insert(name);
        }
        info!("memspace: restored bookkeeping for {} pids", tables.counters.len());
        true
    }
}

fn placeholder_name(pid: Pid) -> String {
    format!("program-{pid}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_allocation_uses_first_ids() {
        let registry = MemorySpaceRegistry::default();
        let alloc = registry.allocate(42, AllocRequest::new(1024, 0));
        assert_eq!(alloc.store_id, Some(StoreId(1)));
        assert_eq!(alloc.index_id, Some(IndexId(1)));
        let store = alloc.store.expect("store");
        assert_eq!(store.capacity(), 1024);
        assert_eq!(store.pid(), 42);
        assert_eq!(alloc.index.expect("index").pid(), 42);
    }

    #[test]
    fn explicit_ids_return_same_live_objects() {
        let registry = MemorySpaceRegistry::default();
        let first = registry.allocate(42, AllocRequest::new(1024, 0));
        let request = AllocRequest::new(1024, 0)
            .with_store_id(first.store_id.unwrap())
            .with_index_id(first.index_id.unwrap());
        let second = registry.allocate(42, request);
        assert!(Arc::ptr_eq(first.store.as_ref().unwrap(), second.store.as_ref().unwrap()));
        assert!(Arc::ptr_eq(first.index.as_ref().unwrap(), second.index.as_ref().unwrap()));
        // Reuse never resizes.
        let third = registry.allocate(42, AllocRequest::new(4096, 0).with_store_id(StoreId(1)));
        assert_eq!(third.store.unwrap().capacity(), 1024);
    }

    #[test]
    fn sentinel_sizes_skip_creation() {
        let registry = MemorySpaceRegistry::default();
        let alloc = registry.allocate(5, AllocRequest::new(0, -1));
        assert!(alloc.store.is_none());
        assert!(alloc.index.is_none());
        // The space record exists even though nothing was created.
        assert_eq!(registry.pids(), vec![5]);

        let alloc = registry.allocate(5, AllocRequest::new(-10, 64));
        assert!(alloc.store.is_none());
        assert_eq!(alloc.index.unwrap().status().size, 64);
    }

    #[test]
    fn ids_are_never_reused_after_free() {
        let registry = MemorySpaceRegistry::default();
        registry.allocate(8, AllocRequest::new(16, 0));
        registry.allocate(8, AllocRequest::new(16, 0));
        assert!(registry.free(8));
        let alloc = registry.allocate(8, AllocRequest::new(16, 0));
        assert_eq!(alloc.store_id, Some(StoreId(3)));
        assert_eq!(alloc.index_id, Some(IndexId(3)));
    }

    #[test]
    fn explicit_id_advances_counter() {
        let registry = MemorySpaceRegistry::default();
        registry.allocate(8, AllocRequest::new(16, 0).with_store_id(StoreId(10)));
        let auto = registry.allocate(8, AllocRequest::new(16, -1));
        assert_eq!(auto.store_id, Some(StoreId(11)));
    }

    #[test]
    fn free_releases_everything() {
        let registry = MemorySpaceRegistry::default();
        let alloc = registry.allocate(9, AllocRequest::new(32, 0));
        let heap = alloc.store.unwrap();
        let shed = alloc.index.unwrap();
        heap.reserve(0, 8).unwrap();
        shed.set_entry("k", "v");
        shed.load_code(b"code");

        assert!(registry.free(9));
        assert!(heap.is_released());
        assert!(shed.entries().is_empty());
        assert_eq!(shed.status().code_size, 0);
        assert!(registry.pids().is_empty());
        assert!(!registry.free(9));
    }

    #[test]
    fn names_default_to_placeholder() {
        let registry = MemorySpaceRegistry::default();
        assert_eq!(registry.name(12), "program-12");
        registry.register_name(12, "editor");
        assert_eq!(registry.name(12), "editor");
    }

    #[test]
    fn snapshot_filters_by_pid() {
        let registry = MemorySpaceRegistry::default();
        registry.allocate(1, AllocRequest::new(100, 0));
        registry.allocate(2, AllocRequest::new(200, 0));
        registry.register_name(2, "viewer");

        let all = registry.snapshot(None);
        assert_eq!(all.totals.processes, 2);
        assert_eq!(all.totals.size, 300);

        let one = registry.snapshot(Some(2));
        assert_eq!(one.processes.len(), 1);
        assert_eq!(one.processes[0].name, "viewer");
        assert_eq!(one.processes[0].stores[0].size, 200);

        assert!(registry.snapshot(Some(99)).processes.is_empty());
    }

    #[test]
    fn usage_percent_aggregates_heaps() {
        let registry = MemorySpaceRegistry::default();
        let a = registry.allocate(3, AllocRequest::new(100, -1)).store.unwrap();
        let b = registry.allocate(3, AllocRequest::new(100, -1)).store.unwrap();
        a.reserve(0, 50).unwrap();
        b.reserve(0, 10).unwrap();
        assert_eq!(registry.usage_percent(3), Some(30.0));
        assert_eq!(registry.usage_percent(4), None);
    }

    #[tokio::test]
    async fn bookkeeping_survives_through_backend() {
        let backend: Arc<dyn StateBackend> = Arc::new(InMemoryBackend::new());
        let registry = MemorySpaceRegistry::default().with_backend(Arc::clone(&backend));
        registry.allocate(7, AllocRequest::new(16, 0));
        registry.allocate(7, AllocRequest::new(16, 0));
        registry.register_name(7, "clock");
        assert!(registry.persist().await);

        let restarted = MemorySpaceRegistry::default().with_backend(backend);
        assert!(restarted.restore().await);
        assert_eq!(restarted.name(7), "clock");
        // Live objects are not persisted; ids continue after the persisted counters.
        assert!(restarted.stores(7).is_empty());
        let alloc = restarted.allocate(7, AllocRequest::new(16, 0));
        assert_eq!(alloc.store_id, Some(StoreId(3)));
    }

    #[tokio::test]
    async fn restore_without_state_is_noop() {
        let registry = MemorySpaceRegistry::default();
        assert!(!registry.restore().await);
    }
}
