// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Engine configuration.

use std::env;
use std::time::Duration;

/// Runtime configuration shared by the runner, workers, and the controller.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Whether content-hash caching is consulted when a process starts
    /// (default: false)
    pub caching_enabled: bool,
    /// Deadline for control RPCs (pause/play/kill/status) in milliseconds
    /// (default: 5_000)
    pub rpc_timeout_ms: u64,
    /// Interval between scheduler-job polls in milliseconds (default: 1_000)
    pub poll_interval_ms: u64,
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// # Optional Environment Variables
    /// - `PROVENA_CACHING_ENABLED` - Consult the cache on start (default: false)
    /// - `PROVENA_RPC_TIMEOUT_MS` - Control RPC deadline (default: 5000)
    /// - `PROVENA_POLL_INTERVAL_MS` - Scheduler poll interval (default: 1000)
    pub fn from_env() -> Self {
        let caching_enabled = env::var("PROVENA_CACHING_ENABLED")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let rpc_timeout_ms = env::var("PROVENA_RPC_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(5_000);

        let poll_interval_ms = env::var("PROVENA_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1_000);

        Self {
            caching_enabled,
            rpc_timeout_ms,
            poll_interval_ms,
        }
    }

    /// Enable or disable cache lookups.
    pub fn with_caching(mut self, enabled: bool) -> Self {
        self.caching_enabled = enabled;
        self
    }

    /// Set the control RPC deadline.
    pub fn with_rpc_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.rpc_timeout_ms = timeout_ms;
        self
    }

    /// Set the scheduler poll interval.
    pub fn with_poll_interval_ms(mut self, interval_ms: u64) -> Self {
        self.poll_interval_ms = interval_ms;
        self
    }

    /// Control RPC deadline as a [`Duration`].
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// Scheduler poll interval as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            caching_enabled: false,
            rpc_timeout_ms: 5_000,
            poll_interval_ms: 1_000,
        }
    }
}
