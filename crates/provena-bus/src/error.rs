// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for provena-bus.

use crate::messages::Pk;

/// Result type using BusError
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum BusError {
    /// No worker currently holds an RPC subscription for the process.
    #[error("No active subscriber for process '{pk}'")]
    NoSubscriber {
        /// The process without a subscriber.
        pk: Pk,
    },

    /// The process already has an active RPC subscriber.
    #[error("Process '{pk}' already has an active subscriber")]
    DuplicateSubscriber {
        /// The process with the existing subscriber.
        pk: Pk,
    },

    /// An RPC did not receive a reply within the caller's deadline.
    #[error("RPC to process '{pk}' timed out after {timeout_ms}ms")]
    Timeout {
        /// The target process.
        pk: Pk,
        /// The deadline that elapsed, in milliseconds.
        timeout_ms: u64,
    },

    /// The counterpart hung up before replying, or the bus is shut down.
    #[error("Bus channel closed")]
    Closed,
}

impl BusError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NoSubscriber { .. } => "NO_SUBSCRIBER",
            Self::DuplicateSubscriber { .. } => "DUPLICATE_SUBSCRIBER",
            Self::Timeout { .. } => "RPC_TIMEOUT",
            Self::Closed => "BUS_CLOSED",
        }
    }
}
