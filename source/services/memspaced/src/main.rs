// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
#![forbid(unsafe_code)]

//! CONTEXT: memspaced daemon entrypoint
//! OWNERS: @runtime
//! STATUS: Experimental
//! API_STABILITY: Unstable
//! TEST_COVERAGE: No tests (bring-up only)

use std::process::ExitCode;

use clap::Parser;

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let args = memspaced::Args::parse();
    let notifier = memspaced::ReadyNotifier::new(|| log::info!("memspaced: ready"));
    match memspaced::service_main_loop(args, notifier).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("memspaced: {err}");
            ExitCode::FAILURE
        }
    }
}
