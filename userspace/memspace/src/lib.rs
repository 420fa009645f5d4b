// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-process memory spaces with background GC and kernel state persistence
//! OWNERS: @runtime
//! STATUS: Functional (host-first)
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests per module + tests/
//!
//! PUBLIC API:
//!   - Heap / Shed: per-process byte heap and sidecar index
//!   - MemorySpaceRegistry: allocate/free/snapshot, GC timers, leak detection
//!   - KernelStore: named values persisted into the reserved kernel heap
//!   - Subsystem: one registry plus its kernel store, wired at startup
//!
//! DEPENDENCIES:
//!   - crc32fast: record checksums in the kernel store
//!   - tokio: GC timers
//!   - futures: shared bootstrap future, boxed backend futures
//!
//! The registry persists its own bookkeeping through the kernel store, while
//! the kernel store allocates its heap from the registry. The registry only
//! holds a weak handle to the store, so neither keeps the other alive.

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

pub mod backend;
pub mod config;
pub mod error;
pub mod heap;
pub mod kstore;
pub mod radix;
pub mod registry;
pub mod shed;

use std::sync::{Arc, Weak};

use futures::future::{BoxFuture, FutureExt};
use log::info;
use serde_json::Value;

pub use backend::{AlwaysRunning, InMemoryBackend, ProcessOracle, ProcessTable, StateBackend};
pub use config::{GcConfig, GcConfigPatch, KernelStoreConfig, MemspaceConfig};
pub use error::{ConfigError, HeapError, KstoreError, RegistryError};
pub use heap::{Block, CompactionReport, Heap, HeapStats, Relocation, StoreId};
pub use kstore::{KernelStore, Usage};
pub use registry::{AllocRequest, Allocation, MemorySpaceRegistry, Snapshot, REGISTRY_STATE_KEY};
pub use shed::{IndexId, Shed, ShedStatus};

/// Process identifier.
pub type Pid = u32;

/// Registry backend that forwards to a kernel store without owning it.
struct WeakBackend(Weak<KernelStore>);

impl StateBackend for WeakBackend {
    fn save<'a>(&'a self, key: &'a str, value: Value) -> BoxFuture<'a, bool> {
        async move {
            match self.0.upgrade() {
                Some(kernel) => kernel.save_value(key, value).await,
                None => false,
            }
        }
        .boxed()
    }

    fn load<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Option<Value>> {
        async move {
            match self.0.upgrade() {
                Some(kernel) => kernel.load_value(key).await,
                None => None,
            }
        }
        .boxed()
    }
}

/// One registry and its kernel store.
pub struct Subsystem {
    registry: Arc<MemorySpaceRegistry>,
    kernel: Arc<KernelStore>,
}

impl Subsystem {
    /// Builds the registry and kernel store, binds them and restores persisted bookkeeping.
    pub async fn boot(config: MemspaceConfig, oracle: Arc<dyn ProcessOracle>) -> Self {
        let registry = Arc::new(
            MemorySpaceRegistry::new(config.gc.clone())
                .with_oracle(oracle)
                .with_kernel_pid(config.kernel.pid),
        );
        let kernel = Arc::new(KernelStore::new(Arc::clone(&registry), config.kernel.clone()));
        registry.bind_backend(Arc::new(WeakBackend(Arc::downgrade(&kernel))));
        let restored = registry.restore().await;
        info!("memspace: subsystem booted (bookkeeping restored: {restored})");
        Self { registry, kernel }
    }

    /// Process memory-space registry.
    pub fn registry(&self) -> &Arc<MemorySpaceRegistry> {
        &self.registry
    }

    /// Kernel persistence store.
    pub fn kernel(&self) -> &Arc<KernelStore> {
        &self.kernel
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn boot_provisions_kernel_pid() {
        let subsystem = Subsystem::boot(MemspaceConfig::default(), Arc::new(AlwaysRunning)).await;
        assert!(subsystem.kernel().is_ready());
        assert_eq!(subsystem.registry().name(0), "kernel");
        assert_eq!(subsystem.registry().pids(), vec![0]);
    }

    #[tokio::test]
    async fn registry_bookkeeping_lands_in_kernel_store() {
        let subsystem = Subsystem::boot(MemspaceConfig::default(), Arc::new(AlwaysRunning)).await;
        let registry = subsystem.registry();
        registry.allocate(5, AllocRequest::new(128, 0));
        registry.register_name(5, "shell");
        assert!(registry.persist().await);
        assert!(subsystem.kernel().has(REGISTRY_STATE_KEY).await);

        let stored = subsystem.kernel().load_value(REGISTRY_STATE_KEY).await.expect("state");
        assert_eq!(stored["names"]["5"], "shell");
    }

    #[tokio::test]
    async fn dropped_kernel_store_degrades_to_noop_backend() {
        let backend = WeakBackend(Weak::new());
        assert!(!backend.save("k", Value::Null).await);
        assert!(backend.load("k").await.is_none());
    }
}
