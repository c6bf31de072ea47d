// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Provena Store - Entity store for the process engine.
//!
//! This crate is the durable home of everything the engine needs to remember:
//! process and data nodes (attribute/extra maps with a one-way `sealed` flag),
//! immutable directed provenance links between nodes, and per-node log
//! records ("reports").
//!
//! The engine consumes the [`EntityStore`] trait only; backends are
//! interchangeable. The crate ships [`InMemoryStore`], the reference backend
//! used by the runner and the test suites.
//!
//! # Node lifecycle
//!
//! ```text
//! create_node ──► mutate attributes/links ──► seal ──► extras only
//! ```
//!
//! A node is created unsealed, mutated freely by its owning process, and
//! sealed exactly once when the process reaches a terminal state. After
//! sealing, attribute writes are rejected with [`StoreError::Sealed`] while
//! extras stay writable (the caching layer annotates sealed nodes).
//!
//! # Links
//!
//! | Link type | Direction | Meaning |
//! |-----------|-----------|---------|
//! | `Create` | process → data | calculation produced a fresh artifact |
//! | `Return` | process → data | workflow returned an existing artifact |
//! | `InputCalc` | data → process | input to a calculation |
//! | `InputWork` | data → process | input to a workflow |
//! | `CallCalc` | process → process | workflow called a calculation |
//! | `CallWork` | process → process | workflow called a sub-workflow |
//!
//! Labels are unique per (target, label) for input links and per
//! (source, link type, label) otherwise; violations fail with
//! [`StoreError::DuplicateLinkLabel`].

#![deny(missing_docs)]

/// Error types for store operations.
pub mod error;

/// In-memory reference backend.
pub mod memory;

/// Node, link, and log record types plus the [`EntityStore`] trait.
pub mod types;

pub use error::StoreError;
pub use memory::InMemoryStore;
pub use types::{
    EntityStore, LinkRecord, LinkType, LogLevel, LogRecord, NodeKind, NodeRecord, Pk,
    ProcessNodeFilter,
};
