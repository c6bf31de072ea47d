// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the process engine.
//!
//! Propagation policy (in short): validation and invalid-operation errors
//! surface synchronously at the call site; step-body failures are absorbed
//! into the `EXCEPTED` terminal state and only re-raised to synchronous
//! `run()` callers.

use provena_bus::BusError;
use provena_store::{Pk, StoreError};

/// Result type using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Engine errors.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum EngineError {
    /// Input or output port validation failed.
    ///
    /// Always detected before a state transition completes; recoverable by
    /// fixing the inputs and instantiating a new process.
    #[error("Validation error for port '{port}': {message}")]
    Validation {
        /// The offending port path.
        port: String,
        /// What went wrong.
        message: String,
    },

    /// A verb that is structurally forbidden for this process kind/state.
    #[error("Invalid operation: {message}")]
    InvalidOperation {
        /// What was attempted and why it is forbidden.
        message: String,
    },

    /// An unhandled failure during a step; the process is `EXCEPTED`.
    #[error("Process '{pk}' excepted: {message}")]
    Excepted {
        /// The excepted process.
        pk: Pk,
        /// The recorded failure text.
        message: String,
    },

    /// The process was killed before reaching a result.
    #[error("Process '{pk}' was killed{}", message.as_deref().map(|m| format!(": {m}")).unwrap_or_default())]
    Killed {
        /// The killed process.
        pk: Pk,
        /// The recorded kill reason.
        message: Option<String>,
    },

    /// A process could not be reconstructed from its checkpoint.
    ///
    /// Fatal for that process (it is forced to `EXCEPTED`) but never fatal
    /// for the worker.
    #[error("Process '{pk}' could not be reconstructed: {message}")]
    Reconstruction {
        /// The process that failed to load.
        pk: Pk,
        /// Why reconstruction failed.
        message: String,
    },

    /// Something that was expected to exist does not.
    #[error("No {what} for process '{pk}'")]
    NotExistent {
        /// The process in question.
        pk: Pk,
        /// What is missing ("checkpoint", "node", ...).
        what: &'static str,
    },

    /// A stored checkpoint was written by an incompatible engine version.
    #[error("Incompatible checkpoint version {found} for process '{pk}' (expected {expected})")]
    IncompatibleCheckpoint {
        /// The process whose checkpoint was rejected.
        pk: Pk,
        /// The version found in the checkpoint.
        found: u32,
        /// The version this engine writes.
        expected: u32,
    },

    /// No worker currently owns the process, so control verbs cannot be routed.
    #[error("Process '{pk}' is not active on any worker")]
    NotActive {
        /// The unowned process.
        pk: Pk,
    },

    /// Entity store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Message bus failure.
    #[error(transparent)]
    Bus(#[from] BusError),
}

impl EngineError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::InvalidOperation { .. } => "INVALID_OPERATION",
            Self::Excepted { .. } => "PROCESS_EXCEPTED",
            Self::Killed { .. } => "PROCESS_KILLED",
            Self::Reconstruction { .. } => "RECONSTRUCTION_FAILED",
            Self::NotExistent { .. } => "NOT_EXISTENT",
            Self::IncompatibleCheckpoint { .. } => "INCOMPATIBLE_CHECKPOINT",
            Self::NotActive { .. } => "PROCESS_NOT_ACTIVE",
            Self::Store(err) => err.error_code(),
            Self::Bus(err) => err.error_code(),
        }
    }

    /// Shorthand for an invalid-operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Shorthand for a validation error.
    pub fn validation(port: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            port: port.into(),
            message: message.into(),
        }
    }
}
