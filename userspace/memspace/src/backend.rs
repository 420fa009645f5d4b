// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Injectable collaborators of the registry: persistence backend and
//! process-liveness oracle, each with a host default.

use std::collections::{BTreeSet, HashMap};

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde_json::Value;

use crate::Pid;

/// Named-value persistence used for the registry's own bookkeeping.
pub trait StateBackend: Send + Sync {
    /// Stores `value` under `key`; `false` on failure.
    fn save<'a>(&'a self, key: &'a str, value: Value) -> BoxFuture<'a, bool>;

    /// Loads the value stored under `key`.
    fn load<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Option<Value>>;
}

/// Transient backend; contents do not survive the process.
#[derive(Default)]
pub struct InMemoryBackend {
    values: Mutex<HashMap<String, Value>>,
}

impl InMemoryBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateBackend for InMemoryBackend {
    fn save<'a>(&'a self, key: &'a str, value: Value) -> BoxFuture<'a, bool> {
        self.values.lock().insert(key.to_string(), value);
        futures::future::ready(true).boxed()
    }

    fn load<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Option<Value>> {
        let value = self.values.lock().get(key).cloned();
        futures::future::ready(value).boxed()
    }
}

/// Answers whether a process is still running.
pub trait ProcessOracle: Send + Sync {
    /// `false` lets the GC sweep reclaim the process memory space.
    fn is_running(&self, pid: Pid) -> bool;
}

/// Oracle used when no process table is wired in; disables reclamation on exit.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysRunning;

impl ProcessOracle for AlwaysRunning {
    fn is_running(&self, _pid: Pid) -> bool {
        true
    }
}

/// Host process table: a set of live pids maintained by the caller.
#[derive(Default)]
pub struct ProcessTable {
    live: Mutex<BTreeSet<Pid>>,
}

impl ProcessTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `pid` as running.
    pub fn spawn(&self, pid: Pid) {
        self.live.lock().insert(pid);
    }

    /// Marks `pid` as exited.
    pub fn exit(&self, pid: Pid) {
        self.live.lock().remove(&pid);
    }
}

impl ProcessOracle for ProcessTable {
    fn is_running(&self, pid: Pid) -> bool {
        self.live.lock().contains(&pid)
    }
}
