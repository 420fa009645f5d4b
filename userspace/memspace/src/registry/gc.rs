// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Background sweep, compaction and leak detection.
//!
//! Timers run as tokio tasks holding a `Weak` handle; they end on their own
//! once the registry is dropped. A failure on one store never aborts a sweep.

use std::sync::{Arc, Weak};
use std::time::Instant;

use log::{debug, error, info, warn};
use tokio::task::JoinHandle;

use super::{LeakReport, MemorySpaceRegistry};
use crate::config::{GcConfig, GcConfigPatch};
use crate::error::{ConfigError, HeapError, RegistryError};
use crate::heap::{CompactionReport, Heap, HeapStats, StoreId};
use crate::Pid;

/// Running timer tasks; aborted on drop.
pub(super) struct GcTimers {
    sweep: JoinHandle<()>,
    leaks: JoinHandle<()>,
}

impl Drop for GcTimers {
    fn drop(&mut self) {
        self.sweep.abort();
        self.leaks.abort();
    }
}

/// What one sweep did.
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Pids whose spaces were freed because the process exited.
    pub reclaimed: Vec<Pid>,
    /// Compacted stores with the bytes folded back into the free tail.
    pub compacted: Vec<(Pid, StoreId, usize)>,
    /// Stores whose compaction failed.
    pub failures: Vec<(Pid, StoreId, HeapError)>,
    /// Stores above `max_usage_percent`.
    pub high_usage: Vec<(Pid, StoreId)>,
    /// Low-free stores left alone (pinned or not fragmented enough).
    pub skipped: Vec<(Pid, StoreId)>,
}

/// Result of on-demand compaction for one store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionOutcome {
    /// Compaction ran.
    Compacted(CompactionReport),
    /// Store is pinned and was not touched.
    SkippedPinned,
    /// Compaction refused to run.
    Failed(HeapError),
}

/// Before/after figures of one store in [`MemorySpaceRegistry::collect_garbage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionEntry {
    /// Owning process.
    pub pid: Pid,
    /// Heap id.
    pub store: StoreId,
    /// Stats before the pass.
    pub before: HeapStats,
    /// Stats after the pass.
    pub after: HeapStats,
    /// What happened.
    pub outcome: CollectionOutcome,
}

fn percent(part: usize, whole: usize) -> f64 {
    part as f64 * 100.0 / whole as f64
}

impl MemorySpaceRegistry {
    /// Starts (or restarts) the sweep and leak timers on the current tokio runtime.
    ///
    /// Returns `false` when called outside a runtime.
    pub fn start(self: &Arc<Self>) -> bool {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("memspace: gc not started; no tokio runtime");
                return false;
            }
        };
        let config = self.gc_config();
        let weak = Arc::downgrade(self);
        let origin = tokio::time::Instant::now();

        let sweep = handle.spawn(sweep_loop(weak.clone(), origin, config.interval()));
        let leaks = handle.spawn(leak_loop(weak, origin, config.leak_interval()));
        let previous = self.timers.lock().replace(GcTimers { sweep, leaks });
        drop(previous);
        info!(
            "memspace: gc started (sweep every {}s, leak check every {}s)",
            config.interval_secs, config.leak_interval_secs
        );
        true
    }

    /// Cancels both timers. Returns `false` if they were not running.
    pub fn stop(&self) -> bool {
        let stopped = self.timers.lock().take().is_some();
        if stopped {
            info!("memspace: gc stopped");
        }
        stopped
    }

    /// Whether the timers are running.
    pub fn is_running(&self) -> bool {
        self.timers.lock().is_some()
    }

    /// Copy of the live GC configuration.
    pub fn gc_config(&self) -> GcConfig {
        self.gc.lock().clone()
    }

    /// Merges `patch` into the live configuration.
    ///
    /// Timers are restarted when a period changed while they were running.
    pub fn configure_gc(self: &Arc<Self>, patch: &GcConfigPatch) -> Result<GcConfig, ConfigError> {
        let (updated, periods_changed) = {
            let mut live = self.gc.lock();
            let mut next = live.clone();
            let changed = next.apply(patch);
            next.validate()?;
            *live = next.clone();
            (next, changed)
        };
        self.leaks.lock().set_window(updated.leak_window());
        if periods_changed && self.is_running() {
            self.start();
        }
        debug!("memspace: gc config updated: {updated:?}");
        Ok(updated)
    }

    /// One sweep pass over every tracked pid.
    pub fn sweep(&self) -> SweepReport {
        let config = self.gc_config();
        let mut report = SweepReport::default();
        for pid in self.pids() {
            if pid != self.kernel_pid && !self.oracle.is_running(pid) {
                if self.free(pid) {
                    info!("memspace: reclaimed space of exited pid {pid}");
                    report.reclaimed.push(pid);
                }
                continue;
            }
            for heap in self.stores(pid) {
                self.sweep_store(pid, &heap, &config, &mut report);
            }
        }
        report
    }

    fn sweep_store(&self, pid: Pid, heap: &Heap, config: &GcConfig, report: &mut SweepReport) {
        let stats = heap.stats();
        if stats.capacity == 0 {
            return;
        }
        let used = percent(stats.used, stats.capacity);
        if used > config.max_usage_percent {
            warn!("memspace: pid {pid} {} at {used:.1}% usage", stats.id);
            report.high_usage.push((pid, stats.id));
        }
        if !config.compaction_enabled || percent(stats.free, stats.capacity) >= config.min_free_percent {
            return;
        }
        if heap.is_pinned() || heap.fragmentation_percent() < config.fragmentation_threshold {
            debug!("memspace: pid {pid} {} low on space but not compactable", stats.id);
            report.skipped.push((pid, stats.id));
            return;
        }
        match heap.compact() {
            Ok(done) => {
                debug!("memspace: pid {pid} {} compacted, {} bytes reclaimed", stats.id, done.reclaimed);
                report.compacted.push((pid, stats.id, done.reclaimed));
            }
            Err(err) => {
                error!("memspace: compaction of pid {pid} {} failed: {err}", stats.id);
                report.failures.push((pid, stats.id, err));
            }
        }
    }

    /// Synchronous compaction of every store of `pid`, or of every pid.
    pub fn collect_garbage(&self, pid: Option<Pid>) -> Vec<CollectionEntry> {
        let pids = match pid {
            Some(pid) => vec![pid],
            None => self.pids(),
        };
        let mut entries = Vec::new();
        for pid in pids {
            for heap in self.stores(pid) {
                if heap.is_released() {
                    continue;
                }
                let before = heap.stats();
                let outcome = if heap.is_pinned() {
                    CollectionOutcome::SkippedPinned
                } else {
                    match heap.compact() {
                        Ok(report) => CollectionOutcome::Compacted(report),
                        Err(err) => {
                            error!("memspace: compaction of pid {pid} {} failed: {err}", before.id);
                            CollectionOutcome::Failed(err)
                        }
                    }
                };
                entries.push(CollectionEntry { pid, store: before.id, before, after: heap.stats(), outcome });
            }
        }
        entries
    }

    /// Compacts one heap, refusing pinned ones.
    pub fn compact_store(&self, pid: Pid, id: StoreId) -> Result<CompactionReport, RegistryError> {
        let heap = {
            let tables = self.tables.lock();
            let space = tables.spaces.get(&pid).ok_or(RegistryError::UnknownProcess(pid))?;
            space.stores.get(&id).cloned().ok_or(RegistryError::UnknownStore { pid, id })?
        };
        if heap.is_pinned() {
            return Err(RegistryError::Pinned(id));
        }
        Ok(heap.compact()?)
    }

    fn current_usage(&self) -> (Vec<Pid>, Vec<(Pid, f64)>) {
        let pids = self.pids();
        let usage = pids.iter().filter_map(|pid| self.usage_percent(*pid).map(|u| (*pid, u))).collect();
        (pids, usage)
    }

    /// Records one usage sample per pid without evaluating the heuristic.
    ///
    /// Sweep ticks call this so the trailing window fills faster than the
    /// leak period alone would fill it.
    pub fn sample_usage(&self, now: Instant) {
        let (pids, usage) = self.current_usage();
        let mut leaks = self.leaks.lock();
        leaks.retain(|pid| pids.contains(&pid));
        for (pid, percent) in usage {
            leaks.sample(pid, percent, now);
        }
    }

    /// Records one usage sample per pid and returns the suspected leaks.
    pub fn detect_leaks(&self, now: Instant) -> Vec<LeakReport> {
        let (pids, usage) = self.current_usage();
        let mut leaks = self.leaks.lock();
        leaks.retain(|pid| pids.contains(&pid));
        let reports: Vec<LeakReport> =
            usage.into_iter().filter_map(|(pid, percent)| leaks.record(pid, percent, now)).collect();
        drop(leaks);

        for report in &reports {
            warn!(
                "memspace: possible leak in pid {} ({}): usage {:?} rose {:.1} points",
                report.pid,
                self.name(report.pid),
                report.samples,
                report.rise
            );
        }
        self.suspected.lock().clone_from(&reports);
        reports
    }

    /// Leaks flagged by the most recent [`MemorySpaceRegistry::detect_leaks`] pass.
    pub fn suspected_leaks(&self) -> Vec<LeakReport> {
        self.suspected.lock().clone()
    }
}

async fn sweep_loop(registry: Weak<MemorySpaceRegistry>, origin: tokio::time::Instant, period: std::time::Duration) {
    let mut ticker = tokio::time::interval_at(origin + period, period);
    loop {
        let tick = ticker.tick().await;
        let Some(registry) = registry.upgrade() else {
            break;
        };
        registry.sample_usage(tick.into_std());
        let report = registry.sweep();
        if !report.failures.is_empty() {
            warn!("memspace: sweep finished with {} failed stores", report.failures.len());
        }
        registry.persist().await;
    }
}

async fn leak_loop(registry: Weak<MemorySpaceRegistry>, origin: tokio::time::Instant, period: std::time::Duration) {
    let mut ticker = tokio::time::interval_at(origin + period, period);
    loop {
        let tick = ticker.tick().await;
        let Some(registry) = registry.upgrade() else {
            break;
        };
        registry.detect_leaks(tick.into_std());
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::backend::ProcessTable;
    use crate::registry::AllocRequest;

    fn registry_with(config: GcConfig) -> MemorySpaceRegistry {
        MemorySpaceRegistry::new(config)
    }

    #[test]
    fn sweep_reclaims_exited_processes_only() {
        let table = Arc::new(ProcessTable::new());
        table.spawn(1);
        let registry = registry_with(GcConfig::default()).with_oracle(table.clone());
        registry.allocate(1, AllocRequest::new(64, 0));
        registry.allocate(2, AllocRequest::new(64, 0));

        let report = registry.sweep();
        assert_eq!(report.reclaimed, vec![2]);
        assert_eq!(registry.pids(), vec![1]);
    }

    #[test]
    fn sweep_never_reclaims_kernel_pid() {
        let table = Arc::new(ProcessTable::new());
        let registry = registry_with(GcConfig::default()).with_oracle(table).with_kernel_pid(0);
        registry.allocate(0, AllocRequest::new(64, 0));
        let report = registry.sweep();
        assert!(report.reclaimed.is_empty());
        assert_eq!(registry.pids(), vec![0]);
    }

    #[test]
    fn failing_store_does_not_abort_sweep() {
        let config = GcConfig { fragmentation_threshold: 0.0, ..GcConfig::default() };
        let registry = registry_with(config);

        let broken = registry.allocate(1, AllocRequest::new(16, -1)).store.unwrap();
        broken.reserve(0, 8).unwrap();
        broken.inject_block(4, 8);

        let healthy = registry.allocate(2, AllocRequest::new(100, -1)).store.unwrap();
        healthy.reserve(0, 46).unwrap();
        healthy.reserve(54, 46).unwrap();

        let report = registry.sweep();
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, 1);
        assert!(matches!(report.failures[0].2, HeapError::CorruptBlocks(_)));
        assert_eq!(report.compacted, vec![(2, StoreId(1), 8)]);
        assert_eq!(healthy.blocks().last().map(|b| b.end()), Some(92));
    }

    #[test]
    fn sweep_skips_pinned_and_unfragmented_stores() {
        let registry = registry_with(GcConfig::default());
        let pinned = registry.allocate(1, AllocRequest::new(100, -1)).store.unwrap();
        pinned.reserve(0, 45).unwrap();
        pinned.reserve(50, 48).unwrap();
        pinned.pin();

        // Packed store with little free space: nothing to gain.
        let packed = registry.allocate(2, AllocRequest::new(100, -1)).store.unwrap();
        packed.reserve(0, 95).unwrap();

        let report = registry.sweep();
        assert!(report.compacted.is_empty());
        assert_eq!(report.skipped, vec![(1, StoreId(1)), (2, StoreId(1))]);
        assert_eq!(report.high_usage, vec![(1, StoreId(1)), (2, StoreId(1))]);
        assert_eq!(pinned.blocks()[1].base, 50);
    }

    #[test]
    fn disabled_compaction_leaves_stores_alone() {
        let config = GcConfig { compaction_enabled: false, fragmentation_threshold: 0.0, ..GcConfig::default() };
        let registry = registry_with(config);
        let heap = registry.allocate(1, AllocRequest::new(100, -1)).store.unwrap();
        heap.reserve(0, 46).unwrap();
        heap.reserve(54, 46).unwrap();
        assert!(registry.sweep().compacted.is_empty());
        assert_eq!(heap.blocks()[1].base, 54);
    }

    #[test]
    fn collect_garbage_reports_each_store() {
        let registry = registry_with(GcConfig::default());
        let a = registry.allocate(5, AllocRequest::new(64, -1)).store.unwrap();
        a.reserve(10, 4).unwrap();
        let b = registry.allocate(5, AllocRequest::new(64, -1)).store.unwrap();
        b.pin();

        let entries = registry.collect_garbage(Some(5));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].before.used, entries[0].after.used);
        match &entries[0].outcome {
            CollectionOutcome::Compacted(report) => assert_eq!(report.reclaimed, 10),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(entries[1].outcome, CollectionOutcome::SkippedPinned);
        assert!(registry.collect_garbage(Some(77)).is_empty());
    }

    #[test]
    fn compact_store_reports_lookup_failures() {
        let registry = registry_with(GcConfig::default());
        assert_eq!(registry.compact_store(1, StoreId(1)), Err(RegistryError::UnknownProcess(1)));
        let heap = registry.allocate(1, AllocRequest::new(32, -1)).store.unwrap();
        assert_eq!(
            registry.compact_store(1, StoreId(9)),
            Err(RegistryError::UnknownStore { pid: 1, id: StoreId(9) })
        );
        heap.pin();
        assert_eq!(registry.compact_store(1, StoreId(1)), Err(RegistryError::Pinned(StoreId(1))));
    }

    #[test]
    fn leak_detection_flags_rising_usage() {
        let registry = registry_with(GcConfig::default());
        let heap = registry.allocate(3, AllocRequest::new(100, -1)).store.unwrap();
        let start = Instant::now();

        heap.reserve(0, 60).unwrap();
        assert!(registry.detect_leaks(start).is_empty());
        heap.reserve(60, 15).unwrap();
        assert!(registry.detect_leaks(start + Duration::from_secs(60)).is_empty());
        heap.reserve(75, 17).unwrap();
        let leaks = registry.detect_leaks(start + Duration::from_secs(120));
        assert_eq!(leaks.len(), 1);
        assert_eq!(leaks[0].pid, 3);
        assert_eq!(leaks[0].samples, vec![60.0, 75.0, 92.0]);
    }

    #[test]
    fn configure_gc_validates_and_merges() {
        let registry = Arc::new(registry_with(GcConfig::default()));
        let patch = GcConfigPatch { min_free_percent: Some(20.0), ..GcConfigPatch::default() };
        let updated = registry.configure_gc(&patch).unwrap();
        assert_eq!(updated.min_free_percent, 20.0);
        assert_eq!(updated.interval_secs, 60);

        let bad = GcConfigPatch { max_usage_percent: Some(150.0), ..GcConfigPatch::default() };
        assert!(registry.configure_gc(&bad).is_err());
        assert_eq!(registry.gc_config().max_usage_percent, 90.0);
    }

    #[test]
    fn start_requires_runtime() {
        let registry = Arc::new(registry_with(GcConfig::default()));
        assert!(!registry.start());
        assert!(!registry.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn timers_sweep_periodically_until_stopped() {
        let table = Arc::new(ProcessTable::new());
        let config = GcConfig { interval_secs: 10, ..GcConfig::default() };
        let registry = Arc::new(registry_with(config).with_oracle(table.clone()));
        table.spawn(4);
        registry.allocate(4, AllocRequest::new(32, 0));

        assert!(registry.start());
        assert!(registry.is_running());
        table.exit(4);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(registry.pids(), vec![4]);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(registry.pids().is_empty());

        assert!(registry.stop());
        assert!(!registry.stop());
        registry.allocate(4, AllocRequest::new(32, 0));
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(registry.pids(), vec![4]);
    }

    #[tokio::test(start_paused = true)]
    async fn default_cadence_flags_rising_usage() {
        let registry = Arc::new(registry_with(GcConfig::default()));
        let heap = registry.allocate(8, AllocRequest::new(100, -1)).store.unwrap();
        heap.reserve(0, 60).unwrap();
        assert!(registry.start());

        // Sweeps sample at 60s steps; the only leak pass runs at 300s.
        // Growth lands between ticks: 60, 60, 70, 85, 92 percent.
        tokio::time::sleep(Duration::from_secs(150)).await;
        heap.reserve(60, 10).unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        heap.reserve(70, 15).unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        heap.reserve(85, 7).unwrap();
        assert!(registry.suspected_leaks().is_empty());

        tokio::time::sleep(Duration::from_secs(40)).await;
        let leaks = registry.suspected_leaks();
        assert_eq!(leaks.len(), 1);
        assert_eq!(leaks[0].pid, 8);
        assert_eq!(leaks[0].samples, vec![70.0, 85.0, 92.0]);
        assert!(registry.stop());
    }

    #[tokio::test(start_paused = true)]
    async fn changing_period_restarts_timers() {
        let table = Arc::new(ProcessTable::new());
        let registry = Arc::new(registry_with(GcConfig::default()).with_oracle(table));
        assert!(registry.start());
        registry.allocate(6, AllocRequest::new(32, 0));

        let patch = GcConfigPatch { interval_secs: Some(2), ..GcConfigPatch::default() };
        registry.configure_gc(&patch).unwrap();
        assert!(registry.is_running());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(registry.pids().is_empty());
    }
}
