//
// Copyright (c) The NetForeman Contributors
//
// SPDX-License-Identifier: MIT
//

//! Bridges the engine's synchronous control flow to the async APIs that
//! `rtnetlink` and `tokio::process` require.

use std::future::Future;

/// Runs `fut` to completion on a throwaway current-thread runtime.
///
/// Never called reentrantly: the dispatcher runs one module, one check
/// and one action at a time, so no two of these runtimes are ever alive
/// at once.
pub fn block_on<F: Future>(fut: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to start tokio runtime")
        .block_on(fut)
}
