// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tracing subscriber setup for hosts that embed the engine.

use std::sync::Once;

static INIT: Once = Once::new();

/// Initialize the global tracing subscriber.
///
/// Writes to stderr, respects `RUST_LOG` (default: `info`). Safe to call
/// more than once; only the first call installs a subscriber, so embedding
/// hosts and test binaries can both call it unconditionally.
pub fn init_subscriber() {
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .with_target(true)
            .try_init();
    });
}
