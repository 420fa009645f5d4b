// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: memspaced service - hosts the memory-space registry, its GC timers
//! and the kernel persistence store
//! OWNERS: @runtime
//! STATUS: Experimental
//! API_STABILITY: Unstable
//! TEST_COVERAGE: tests/daemon.rs

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use log::{info, warn};
use memspace::{AlwaysRunning, ConfigError, MemspaceConfig, Subsystem};
use thiserror::Error;

/// Result alias surfaced by the service loop.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors surfaced by the service loop.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Configuration could not be loaded.
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    /// Snapshot radix outside 2..=36.
    #[error("radix {0} outside 2..=36")]
    InvalidRadix(u32),
}

/// Ready notifier invoked once the subsystem is booted.
pub struct ReadyNotifier(Box<dyn FnOnce() + Send>);

impl ReadyNotifier {
    /// Creates a notifier from the provided closure.
    pub fn new<F>(func: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self(Box::new(func))
    }

    /// Signals readiness to the caller.
    pub fn notify(self) {
        (self.0)();
    }
}

/// Command line of `memspaced`.
#[derive(Debug, Clone, Parser)]
#[command(name = "memspaced", about = "Per-process memory spaces with background GC", version)]
pub struct Args {
    /// TOML configuration file; built-in defaults when omitted
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Print a usage snapshot after boot and on shutdown
    #[arg(long)]
    pub snapshot: bool,

    /// Radix of sizes in snapshots
    #[arg(long, default_value_t = 16)]
    pub radix: u32,

    /// Run one sweep and leak pass, print the snapshot and exit
    #[arg(long)]
    pub once: bool,
}

/// Loads `path`, or the defaults when no path is given.
pub fn load_config(path: Option<&Path>) -> ServerResult<MemspaceConfig> {
    match path {
        Some(path) => {
            let config = MemspaceConfig::load(path)?;
            info!("memspaced: loaded config from {}", path.display());
            Ok(config)
        }
        None => Ok(MemspaceConfig::default()),
    }
}

/// One sweep plus leak pass; returns the rendered snapshot.
pub async fn run_once(subsystem: &Subsystem, radix: u32) -> String {
    let registry = subsystem.registry();
    let sweep = registry.sweep();
    let leaks = registry.detect_leaks(Instant::now());
    registry.persist().await;
    info!(
        "memspaced: sweep reclaimed {} pids, compacted {} stores ({} failed), {} leak suspects",
        sweep.reclaimed.len(),
        sweep.compacted.len(),
        sweep.failures.len(),
        leaks.len()
    );
    registry.snapshot(None).render(radix)
}

/// Boots the subsystem and serves until interrupted (or after one pass with `--once`).
pub async fn service_main_loop(args: Args, notifier: ReadyNotifier) -> ServerResult<()> {
    if !(2..=36).contains(&args.radix) {
        return Err(ServerError::InvalidRadix(args.radix));
    }
    let config = load_config(args.config.as_deref())?;
    let subsystem = Subsystem::boot(config, Arc::new(AlwaysRunning)).await;
    notifier.notify();

    if args.once {
        print!("{}", run_once(&subsystem, args.radix).await);
        return Ok(());
    }

    let registry = subsystem.registry();
    registry.start();
    if args.snapshot {
        print!("{}", registry.snapshot(None).render(args.radix));
    }
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("memspaced: cannot wait for shutdown signal: {err}");
    }
    registry.stop();
    registry.persist().await;
    if args.snapshot {
        print!("{}", registry.snapshot(None).render(args.radix));
    }
    info!("memspaced: shut down");
    Ok(())
}
