// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Error types shared by the heap, registry and kernel store.

use thiserror::Error;

/// Failures reported by a [`crate::Heap`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HeapError {
    /// Requested range does not fit inside the heap.
    #[error("range {base}..{end} exceeds capacity {capacity}")]
    OutOfRange {
        /// First byte of the rejected range.
        base: usize,
        /// One past the last byte of the rejected range.
        end: usize,
        /// Capacity of the heap at the time of the request.
        capacity: usize,
    },
    /// Reservation collides with an existing block.
    #[error("reservation at {0} overlaps an existing block")]
    Overlap(usize),
    /// No reservation starts at the given base.
    #[error("no reservation at {0}")]
    UnknownBlock(usize),
    /// Reservation list failed validation; compaction refuses to run.
    #[error("reservation list is inconsistent: {0}")]
    CorruptBlocks(String),
    /// Heap was released by `free_all` and no longer accepts writes.
    #[error("heap has been released")]
    Released,
}

/// Failures reported by the memory-space registry.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// Pid has no memory space.
    #[error("no memory space for pid {0}")]
    UnknownProcess(u32),
    /// Pid has a memory space but no heap with this id.
    #[error("pid {pid} has no {id}")]
    UnknownStore {
        /// Owning process.
        pid: u32,
        /// Requested heap.
        id: crate::StoreId,
    },
    /// Heap is indexed by absolute address elsewhere and must not move.
    #[error("{0} is pinned")]
    Pinned(crate::StoreId),
    /// Heap level failure while compacting or inspecting a store.
    #[error("heap error: {0}")]
    Heap(#[from] HeapError),
}

/// Failures reported by the kernel persistence store.
///
/// Every variant is converted into a sentinel result plus a log line at the
/// public `save`/`load`/`delete`/`has` boundary.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KstoreError {
    /// Reserved store/index pair could not be provisioned.
    #[error("kernel store unavailable: {0}")]
    BootstrapUnavailable(String),
    /// No free window large enough even after cleanup.
    #[error("allocation exhausted: requested {requested} bytes, {available} available")]
    AllocationExhausted {
        /// Bytes needed for the framed record.
        requested: usize,
        /// Bytes not covered by any allocated range.
        available: usize,
    },
    /// Index byte budget cannot hold the address/size pair of a key.
    #[error("index full: {0}")]
    IndexFull(String),
    /// Address or size entries are unparsable or out of range.
    #[error("corrupt index: {0}")]
    CorruptIndex(String),
    /// Value could not round-trip through the record format.
    #[error("serialization failure: {0}")]
    Serialization(String),
    /// Key has no address/size pair.
    #[error("key not found")]
    NotFound,
    /// Heap rejected a reservation or write.
    #[error("heap error: {0}")]
    Heap(#[from] HeapError),
}

/// Failures while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// TOML did not match the expected schema.
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),
    /// Values parsed but violate a constraint.
    #[error("invalid config: {0}")]
    Invalid(String),
}
