// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Structured exit codes for finished processes.

use serde::{Deserialize, Serialize};

/// Status reserved for outputs that failed output-port validation.
pub const ERROR_INVALID_OUTPUT: i32 = 10;
/// Status reserved for missing required outputs.
pub const ERROR_MISSING_OUTPUT: i32 = 11;

/// The structured result a process finishes with.
///
/// A zero status means success; any non-zero status means the process
/// completed its logic but reports failure. This is distinct from
/// `EXCEPTED`, which records an unhandled error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitCode {
    /// Numeric status; 0 is success.
    pub status: i32,
    /// Human-readable message, recorded on the node when present.
    pub message: Option<String>,
    /// When true, the finished node is never served as a cache source.
    pub invalidates_cache: bool,
}

impl ExitCode {
    /// The canonical success code.
    pub const OK: Self = Self {
        status: 0,
        message: None,
        invalidates_cache: false,
    };

    /// A failure code with the given status and message.
    pub fn failure(status: i32, message: impl Into<String>) -> Self {
        Self {
            status,
            message: Some(message.into()),
            invalidates_cache: false,
        }
    }

    /// Mark this code as poisoning the cache.
    pub fn invalidating(mut self) -> Self {
        self.invalidates_cache = true;
        self
    }

    /// Exit code for outputs that failed validation against the output ports.
    pub fn invalid_output(detail: impl Into<String>) -> Self {
        Self::failure(
            ERROR_INVALID_OUTPUT,
            format!("process returned invalid output: {}", detail.into()),
        )
        .invalidating()
    }

    /// Exit code for required outputs that were never attached.
    pub fn missing_output(detail: impl Into<String>) -> Self {
        Self::failure(
            ERROR_MISSING_OUTPUT,
            format!("process did not register a required output: {}", detail.into()),
        )
        .invalidating()
    }

    /// Whether this code reports success.
    pub fn is_success(&self) -> bool {
        self.status == 0
    }
}

impl Default for ExitCode {
    fn default() -> Self {
        Self::OK
    }
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.message {
            Some(message) => write!(f, "[{}] {}", self.status, message),
            None => write!(f, "[{}]", self.status),
        }
    }
}
