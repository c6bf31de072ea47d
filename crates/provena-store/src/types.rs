// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Record types and the [`EntityStore`] trait.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;

/// Primary key of a node.
pub type Pk = u64;

/// The two kinds of node the engine distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    /// A node backing one process instance.
    Process,
    /// A node holding a data artifact (an input or output value).
    Data,
}

/// Node record from the store.
#[derive(Debug, Clone)]
pub struct NodeRecord {
    /// Primary key.
    pub pk: Pk,
    /// Stable universally unique identifier.
    pub uuid: Uuid,
    /// Process or data node.
    pub kind: NodeKind,
    /// Mutable-until-sealed attribute map.
    pub attributes: BTreeMap<String, serde_json::Value>,
    /// Extras map, writable even after sealing.
    pub extras: BTreeMap<String, serde_json::Value>,
    /// True once the owning process reached a terminal state.
    pub sealed: bool,
    /// When the node was created.
    pub created_at: DateTime<Utc>,
}

impl NodeRecord {
    /// Convenience accessor for an attribute.
    pub fn attribute(&self, key: &str) -> Option<&serde_json::Value> {
        self.attributes.get(key)
    }

    /// Convenience accessor for an extra.
    pub fn extra(&self, key: &str) -> Option<&serde_json::Value> {
        self.extras.get(key)
    }
}

/// Provenance link types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkType {
    /// A calculation produced a fresh data artifact.
    Create,
    /// A workflow returned an existing artifact unmodified.
    Return,
    /// Input to a calculation.
    InputCalc,
    /// Input to a workflow.
    InputWork,
    /// A workflow called a calculation.
    CallCalc,
    /// A workflow called a sub-workflow.
    CallWork,
}

impl LinkType {
    /// Whether this is an input-category link (data flowing into a process).
    pub fn is_input(self) -> bool {
        matches!(self, LinkType::InputCalc | LinkType::InputWork)
    }

    /// Whether this is a call link (parent process to child process).
    pub fn is_call(self) -> bool {
        matches!(self, LinkType::CallCalc | LinkType::CallWork)
    }

    /// Whether this is an output-category link (process producing data).
    pub fn is_output(self) -> bool {
        matches!(self, LinkType::Create | LinkType::Return)
    }

    /// Stable lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            LinkType::Create => "create",
            LinkType::Return => "return",
            LinkType::InputCalc => "input_calc",
            LinkType::InputWork => "input_work",
            LinkType::CallCalc => "call_calc",
            LinkType::CallWork => "call_work",
        }
    }
}

/// An immutable directed provenance edge between two nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkRecord {
    /// Source node.
    pub source: Pk,
    /// Target node.
    pub target: Pk,
    /// Edge type.
    pub link_type: LinkType,
    /// Edge label (port path, flattened with `__` for nested namespaces).
    pub label: String,
}

/// Severity of a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    /// Informational report emitted by a process step.
    Report,
    /// Something worth surfacing but not fatal.
    Warning,
    /// Exception text or other failure detail.
    Error,
}

/// A log record attached to a node.
#[derive(Debug, Clone)]
pub struct LogRecord {
    /// Node the record belongs to.
    pub pk: Pk,
    /// Severity.
    pub level: LogLevel,
    /// Message text.
    pub message: String,
    /// When the record was appended.
    pub created_at: DateTime<Utc>,
}

/// Filter options for listing process nodes.
#[derive(Debug, Clone, Default)]
pub struct ProcessNodeFilter {
    /// Filter by the sealed flag.
    pub sealed: Option<bool>,
}

/// Entity store interface consumed by the engine.
///
/// Implementations must be safe for concurrent use; the engine treats the
/// store as the single source of truth for durable process state.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Create a new unsealed node of the given kind.
    async fn create_node(&self, kind: NodeKind) -> Result<NodeRecord, StoreError>;

    /// Load a node by primary key.
    async fn load_node(&self, pk: Pk) -> Result<NodeRecord, StoreError>;

    /// Look a node up by its UUID.
    async fn node_by_uuid(&self, uuid: Uuid) -> Result<Option<NodeRecord>, StoreError>;

    /// Set an attribute. Fails with [`StoreError::Sealed`] on sealed nodes.
    async fn set_attribute(
        &self,
        pk: Pk,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), StoreError>;

    /// Get an attribute value, `None` if absent.
    async fn get_attribute(&self, pk: Pk, key: &str)
    -> Result<Option<serde_json::Value>, StoreError>;

    /// Delete an attribute.
    ///
    /// Deleting an absent key is a no-op, even on sealed nodes; deleting a
    /// present key on a sealed node fails with [`StoreError::Sealed`].
    async fn delete_attribute(&self, pk: Pk, key: &str) -> Result<(), StoreError>;

    /// Set an extra. Allowed on sealed nodes.
    async fn set_extra(&self, pk: Pk, key: &str, value: serde_json::Value)
    -> Result<(), StoreError>;

    /// Get an extra value, `None` if absent.
    async fn get_extra(&self, pk: Pk, key: &str) -> Result<Option<serde_json::Value>, StoreError>;

    /// Seal a node. Idempotent, one-way.
    async fn seal(&self, pk: Pk) -> Result<(), StoreError>;

    /// Add a provenance link, enforcing label uniqueness per scope.
    async fn add_link(
        &self,
        source: Pk,
        target: Pk,
        link_type: LinkType,
        label: &str,
    ) -> Result<(), StoreError>;

    /// Incoming links of a node, optionally filtered by type.
    async fn incoming(
        &self,
        pk: Pk,
        link_type: Option<LinkType>,
    ) -> Result<Vec<LinkRecord>, StoreError>;

    /// Outgoing links of a node, optionally filtered by type.
    async fn outgoing(
        &self,
        pk: Pk,
        link_type: Option<LinkType>,
    ) -> Result<Vec<LinkRecord>, StoreError>;

    /// Append a log record ("report") to a node.
    async fn append_log(&self, pk: Pk, level: LogLevel, message: &str) -> Result<(), StoreError>;

    /// All log records of a node, oldest first.
    async fn logs(&self, pk: Pk) -> Result<Vec<LogRecord>, StoreError>;

    /// Find nodes whose extra under `key` equals `value`, ascending pk.
    ///
    /// The ascending order is load-bearing: the caching layer relies on it
    /// for deterministic candidate selection.
    async fn find_by_extra(
        &self,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<Vec<Pk>, StoreError>;

    /// List process-kind nodes matching the filter, ascending pk.
    async fn list_process_nodes(
        &self,
        filter: &ProcessNodeFilter,
    ) -> Result<Vec<NodeRecord>, StoreError>;
}
