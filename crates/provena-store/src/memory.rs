// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory reference backend for the entity store.
//!
//! Backs the runner and the test suites. All state lives behind a single
//! `tokio::sync::RwLock`; primary keys are allocated sequentially so that
//! "first by pk" is also "first created", which the caching layer uses as
//! its deterministic tie-break.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::error::StoreError;
use crate::types::{
    EntityStore, LinkRecord, LinkType, LogLevel, LogRecord, NodeKind, NodeRecord, Pk,
    ProcessNodeFilter,
};

#[derive(Default)]
struct Inner {
    next_pk: Pk,
    nodes: BTreeMap<Pk, NodeRecord>,
    by_uuid: HashMap<Uuid, Pk>,
    links: Vec<LinkRecord>,
    logs: Vec<LogRecord>,
}

impl Inner {
    fn node(&self, pk: Pk) -> Result<&NodeRecord, StoreError> {
        self.nodes.get(&pk).ok_or(StoreError::NodeNotFound { pk })
    }

    fn node_mut(&mut self, pk: Pk) -> Result<&mut NodeRecord, StoreError> {
        self.nodes
            .get_mut(&pk)
            .ok_or(StoreError::NodeNotFound { pk })
    }
}

/// In-memory [`EntityStore`] implementation.
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EntityStore for InMemoryStore {
    async fn create_node(&self, kind: NodeKind) -> Result<NodeRecord, StoreError> {
        let mut inner = self.inner.write().await;
        inner.next_pk += 1;
        let record = NodeRecord {
            pk: inner.next_pk,
            uuid: Uuid::new_v4(),
            kind,
            attributes: BTreeMap::new(),
            extras: BTreeMap::new(),
            sealed: false,
            created_at: Utc::now(),
        };
        inner.by_uuid.insert(record.uuid, record.pk);
        inner.nodes.insert(record.pk, record.clone());
        debug!(pk = record.pk, kind = ?kind, "node created");
        Ok(record)
    }

    async fn load_node(&self, pk: Pk) -> Result<NodeRecord, StoreError> {
        let inner = self.inner.read().await;
        inner.node(pk).cloned()
    }

    async fn node_by_uuid(&self, uuid: Uuid) -> Result<Option<NodeRecord>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .by_uuid
            .get(&uuid)
            .and_then(|pk| inner.nodes.get(pk))
            .cloned())
    }

    async fn set_attribute(
        &self,
        pk: Pk,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let node = inner.node_mut(pk)?;
        if node.sealed {
            return Err(StoreError::Sealed {
                pk,
                key: key.to_string(),
            });
        }
        node.attributes.insert(key.to_string(), value);
        Ok(())
    }

    async fn get_attribute(
        &self,
        pk: Pk,
        key: &str,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.node(pk)?.attributes.get(key).cloned())
    }

    async fn delete_attribute(&self, pk: Pk, key: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let node = inner.node_mut(pk)?;
        if !node.attributes.contains_key(key) {
            return Ok(());
        }
        if node.sealed {
            return Err(StoreError::Sealed {
                pk,
                key: key.to_string(),
            });
        }
        node.attributes.remove(key);
        Ok(())
    }

    async fn set_extra(
        &self,
        pk: Pk,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let node = inner.node_mut(pk)?;
        node.extras.insert(key.to_string(), value);
        Ok(())
    }

    async fn get_extra(&self, pk: Pk, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.node(pk)?.extras.get(key).cloned())
    }

    async fn seal(&self, pk: Pk) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let node = inner.node_mut(pk)?;
        node.sealed = true;
        debug!(pk, "node sealed");
        Ok(())
    }

    async fn add_link(
        &self,
        source: Pk,
        target: Pk,
        link_type: LinkType,
        label: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.node(source)?;
        inner.node(target)?;

        // Uniqueness scope: (target, label) across the input category,
        // (source, link_type, label) for outputs and calls.
        let duplicate = inner.links.iter().any(|link| {
            if link_type.is_input() {
                link.link_type.is_input() && link.target == target && link.label == label
            } else {
                link.link_type == link_type && link.source == source && link.label == label
            }
        });
        if duplicate {
            return Err(StoreError::DuplicateLinkLabel {
                pk: if link_type.is_input() { target } else { source },
                link_type: link_type.as_str().to_string(),
                label: label.to_string(),
            });
        }

        inner.links.push(LinkRecord {
            source,
            target,
            link_type,
            label: label.to_string(),
        });
        debug!(source, target, link_type = link_type.as_str(), label, "link added");
        Ok(())
    }

    async fn incoming(
        &self,
        pk: Pk,
        link_type: Option<LinkType>,
    ) -> Result<Vec<LinkRecord>, StoreError> {
        let inner = self.inner.read().await;
        inner.node(pk)?;
        Ok(inner
            .links
            .iter()
            .filter(|link| link.target == pk && link_type.is_none_or(|lt| link.link_type == lt))
            .cloned()
            .collect())
    }

    async fn outgoing(
        &self,
        pk: Pk,
        link_type: Option<LinkType>,
    ) -> Result<Vec<LinkRecord>, StoreError> {
        let inner = self.inner.read().await;
        inner.node(pk)?;
        Ok(inner
            .links
            .iter()
            .filter(|link| link.source == pk && link_type.is_none_or(|lt| link.link_type == lt))
            .cloned()
            .collect())
    }

    async fn append_log(&self, pk: Pk, level: LogLevel, message: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.node(pk)?;
        inner.logs.push(LogRecord {
            pk,
            level,
            message: message.to_string(),
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn logs(&self, pk: Pk) -> Result<Vec<LogRecord>, StoreError> {
        let inner = self.inner.read().await;
        inner.node(pk)?;
        Ok(inner
            .logs
            .iter()
            .filter(|log| log.pk == pk)
            .cloned()
            .collect())
    }

    async fn find_by_extra(
        &self,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<Vec<Pk>, StoreError> {
        let inner = self.inner.read().await;
        // BTreeMap iteration is already ascending by pk.
        Ok(inner
            .nodes
            .values()
            .filter(|node| node.extras.get(key) == Some(value))
            .map(|node| node.pk)
            .collect())
    }

    async fn list_process_nodes(
        &self,
        filter: &ProcessNodeFilter,
    ) -> Result<Vec<NodeRecord>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .nodes
            .values()
            .filter(|node| node.kind == NodeKind::Process)
            .filter(|node| filter.sealed.is_none_or(|sealed| node.sealed == sealed))
            .cloned()
            .collect())
    }
}
