// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for provena-store.

use crate::types::Pk;

/// Result type using StoreError
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during store operations.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum StoreError {
    /// No node exists with the given primary key.
    #[error("Node '{pk}' not found")]
    NodeNotFound {
        /// The primary key that was not found.
        pk: Pk,
    },

    /// The node is sealed and can no longer be mutated.
    #[error("Node '{pk}' is sealed and rejects mutation of '{key}'")]
    Sealed {
        /// The sealed node.
        pk: Pk,
        /// The attribute key whose mutation was rejected.
        key: String,
    },

    /// A link with the same label already exists in the same uniqueness scope.
    #[error("Duplicate {link_type} link label '{label}' on node '{pk}'")]
    DuplicateLinkLabel {
        /// The node owning the uniqueness scope (target for inputs, source otherwise).
        pk: Pk,
        /// The link type.
        link_type: String,
        /// The offending label.
        label: String,
    },

    /// Backend storage failure.
    #[error("Storage error during '{operation}': {details}")]
    Storage {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl StoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NodeNotFound { .. } => "NODE_NOT_FOUND",
            Self::Sealed { .. } => "NODE_SEALED",
            Self::DuplicateLinkLabel { .. } => "DUPLICATE_LINK_LABEL",
            Self::Storage { .. } => "STORAGE_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            StoreError::NodeNotFound { pk: 1 }.error_code(),
            "NODE_NOT_FOUND"
        );
        assert_eq!(
            StoreError::Sealed {
                pk: 1,
                key: "x".to_string()
            }
            .error_code(),
            "NODE_SEALED"
        );
        assert_eq!(
            StoreError::DuplicateLinkLabel {
                pk: 1,
                link_type: "create".to_string(),
                label: "result".to_string()
            }
            .error_code(),
            "DUPLICATE_LINK_LABEL"
        );
    }

    #[test]
    fn test_error_display() {
        let err = StoreError::NodeNotFound { pk: 42 };
        assert_eq!(err.to_string(), "Node '42' not found");

        let err = StoreError::Sealed {
            pk: 7,
            key: "checkpoint".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Node '7' is sealed and rejects mutation of 'checkpoint'"
        );
    }
}
