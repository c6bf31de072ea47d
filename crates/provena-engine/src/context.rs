// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mutable workchain context and deferred child-result placement.
//!
//! Steps communicate through a JSON context that survives checkpoints.
//! When a step submits children, it does not block on them; instead it
//! registers where each child's result should land once the child reaches
//! a terminal state. `assign` overwrites the slot, `append` pushes onto a
//! list in the slot. Over the lifetime of one workchain the two modes
//! must never touch overlapping slots: mixing them would silently clobber
//! accumulated results, so registration fails fast instead.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use provena_store::Pk;

use crate::error::{EngineError, Result};

/// JSON scratch space shared by the steps of one workchain execution.
///
/// Keys are dotted paths; intermediate objects are created on write.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkContext {
    values: BTreeMap<String, Value>,
}

impl WorkContext {
    /// An empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the value at a dotted path.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let (head, rest) = split_path(path);
        let mut current = self.values.get(head)?;
        for segment in rest {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    /// Write a value at a dotted path, creating intermediate objects.
    ///
    /// Fails if an intermediate segment exists but is not an object.
    pub fn set(&mut self, path: &str, value: Value) -> Result<()> {
        let (head, rest) = split_path(path);
        let Some((last, intermediate)) = rest.split_last() else {
            self.values.insert(head.to_string(), value);
            return Ok(());
        };

        let mut current = self
            .values
            .entry(head.to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
        for segment in intermediate {
            let object = current.as_object_mut().ok_or_else(|| {
                EngineError::invalid_operation(format!(
                    "context path '{path}' crosses a non-object value"
                ))
            })?;
            current = object
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(serde_json::Map::new()));
        }
        let object = current.as_object_mut().ok_or_else(|| {
            EngineError::invalid_operation(format!(
                "context path '{path}' crosses a non-object value"
            ))
        })?;
        object.insert(last.to_string(), value);
        Ok(())
    }

    /// Push a value onto the list at a dotted path, creating the list if
    /// the slot is empty. Fails if the slot holds a non-list.
    pub fn push(&mut self, path: &str, value: Value) -> Result<()> {
        match self.get(path).cloned() {
            None => self.set(path, Value::Array(vec![value])),
            Some(Value::Array(mut items)) => {
                items.push(value);
                self.set(path, Value::Array(items))
            }
            Some(other) => Err(EngineError::invalid_operation(format!(
                "cannot append to context path '{path}': holds {other}, not a list"
            ))),
        }
    }

    /// Whether a path resolves to a value.
    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Top-level keys.
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.values.keys()
    }
}

fn split_path(path: &str) -> (&str, Vec<&str>) {
    let mut segments = path.split('.');
    let head = segments.next().unwrap_or(path);
    (head, segments.collect())
}

/// How a child's result lands in the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContextAction {
    /// Overwrite the slot.
    Assign,
    /// Push onto the list in the slot.
    Append,
}

/// One registered child-to-context placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextRequest {
    /// The context slot (dotted path).
    pub path: String,
    /// The submitted child whose result fills the slot.
    pub child_pk: Pk,
    /// Overwrite or append.
    pub action: ContextAction,
}

/// Whether two dotted paths name the same slot or nest one inside the
/// other.
fn overlapping(a: &str, b: &str) -> bool {
    a == b
        || b.strip_prefix(a).is_some_and(|rest| rest.starts_with('.'))
        || a.strip_prefix(b).is_some_and(|rest| rest.starts_with('.'))
}

/// Assign/append bookkeeping for the lifetime of one workchain.
///
/// A slot may be appended to across any number of steps, or assigned,
/// never both: once any step assigns a path, no step may append to that
/// path or to anything nested under it, and vice versa. Violations fail
/// the registering step instead of silently clobbering the context. The
/// sets persist in the checkpoint, so the rule holds across suspensions
/// and worker handoffs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlacementHistory {
    assigned: BTreeSet<String>,
    appended: BTreeSet<String>,
}

impl PlacementHistory {
    /// Validate a step's placements against the batch itself and against
    /// everything registered earlier in the workchain, then record them.
    pub fn record(&mut self, requests: &[ContextRequest]) -> Result<()> {
        // Within one step a slot may be appended to many times but
        // assigned at most once.
        let mut batch_assigned: BTreeSet<&str> = BTreeSet::new();
        for request in requests {
            if request.action == ContextAction::Assign
                && !batch_assigned.insert(request.path.as_str())
            {
                return Err(EngineError::invalid_operation(format!(
                    "context slot '{}' assigned twice in one step",
                    request.path
                )));
            }
        }

        for request in requests {
            let (own, other, verb) = match request.action {
                ContextAction::Assign => (&mut self.assigned, &self.appended, "assigned"),
                ContextAction::Append => (&mut self.appended, &self.assigned, "appended"),
            };
            if let Some(taken) = other.iter().find(|path| overlapping(path, &request.path)) {
                return Err(EngineError::invalid_operation(format!(
                    "context slot '{}' cannot be {verb}: overlapping slot '{taken}' \
                     already uses the opposite placement",
                    request.path
                )));
            }
            own.insert(request.path.clone());
        }

        Ok(())
    }
}
