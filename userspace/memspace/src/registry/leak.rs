// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Trailing-window usage history and the leak heuristic.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use crate::Pid;

/// Samples considered by the heuristic.
pub const LEAK_SAMPLE_COUNT: usize = 3;
/// Latest sample must exceed this usage (percent).
pub const LEAK_USAGE_FLOOR: f64 = 80.0;
/// Rise across the considered samples must exceed this (percentage points).
pub const LEAK_MIN_RISE: f64 = 10.0;

/// One usage reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UsageSample {
    /// When the reading was taken.
    pub at: Instant,
    /// Used share of the process' stores, in percent.
    pub percent: f64,
}

/// Suspected leak for one process.
#[derive(Debug, Clone, PartialEq)]
pub struct LeakReport {
    /// Affected process.
    pub pid: Pid,
    /// Usage readings that triggered the report, oldest first.
    pub samples: Vec<f64>,
    /// Latest minus oldest of `samples`.
    pub rise: f64,
}

/// Per-pid usage history bounded by a time window.
#[derive(Debug)]
pub struct LeakDetector {
    window: Duration,
    history: BTreeMap<Pid, VecDeque<UsageSample>>,
}

impl LeakDetector {
    /// Creates a detector retaining samples for `window`.
    pub fn new(window: Duration) -> Self {
        Self { window, history: BTreeMap::new() }
    }

    /// Changes the retention window; applies from the next sample on.
    pub fn set_window(&mut self, window: Duration) {
        self.window = window;
    }

    /// Records a reading without evaluating it.
    ///
    /// A second reading taken at the same instant replaces the first.
    pub fn sample(&mut self, pid: Pid, percent: f64, now: Instant) {
        let window = self.window;
        let samples = self.history.entry(pid).or_default();
        match samples.back_mut() {
            Some(last) if last.at == now => last.percent = percent,
            _ => samples.push_back(UsageSample { at: now, percent }),
        }
        while samples.front().is_some_and(|s| now.saturating_duration_since(s.at) > window) {
            samples.pop_front();
        }
    }

    /// Records a reading and evaluates the heuristic for `pid`.
    pub fn record(&mut self, pid: Pid, percent: f64, now: Instant) -> Option<LeakReport> {
        self.sample(pid, percent, now);
        self.history.get(&pid).and_then(|samples| evaluate(pid, samples))
    }

    /// Usage readings currently retained for `pid`, oldest first.
    pub fn history(&self, pid: Pid) -> Vec<f64> {
        self.history.get(&pid).map(|s| s.iter().map(|u| u.percent).collect()).unwrap_or_default()
    }

    /// Drops the history of `pid`.
    pub fn forget(&mut self, pid: Pid) {
        self.history.remove(&pid);
    }

    /// Keeps only histories for which `keep` returns `true`.
    pub fn retain(&mut self, mut keep: impl FnMut(Pid) -> bool) {
        self.history.retain(|pid, _| keep(*pid));
    }
}

fn evaluate(pid: Pid, samples: &VecDeque<UsageSample>) -> Option<LeakReport> {
    if samples.len() < LEAK_SAMPLE_COUNT {
        return None;
    }
    let recent: Vec<f64> = samples.iter().skip(samples.len() - LEAK_SAMPLE_COUNT).map(|s| s.percent).collect();
    let first = recent[0];
    let last = recent[LEAK_SAMPLE_COUNT - 1];
    let rise = last - first;
    (last > LEAK_USAGE_FLOOR && rise > LEAK_MIN_RISE).then_some(LeakReport { pid, samples: recent, rise })
}
