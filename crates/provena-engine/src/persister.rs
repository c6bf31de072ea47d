// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Checkpointing: the serialized execution state of a live process.
//!
//! A checkpoint contains everything needed to resume a process on any
//! worker: the class identifier, the state machine (including pause and
//! suspend detail), the workchain context and outline position, input
//! values and their data-node references, buffered outputs, registered
//! child-to-context placements, and the calcjob stage. It is stored as a
//! single JSON attribute on the process node and deleted at terminal
//! finalization; a node with no checkpoint and a terminal state is fully
//! described by its attributes and links.
//!
//! Serialization is deterministic (ordered maps throughout), so saving an
//! unchanged checkpoint twice writes the same bytes; saves are idempotent.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use provena_store::{EntityStore, Pk};

use crate::calcjob::JobStage;
use crate::context::{ContextRequest, PlacementHistory, WorkContext};
use crate::error::{EngineError, Result};
use crate::outline::OutlinePosition;
use crate::ports::ValidatedInputs;
use crate::process::attrs;
use crate::registry::ProcessDefinition;
use crate::state::StateMachine;

/// Version written into every checkpoint this engine produces.
pub const CHECKPOINT_VERSION: u32 = 1;

/// The resumable execution state of one process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Format version; loads reject mismatches.
    pub version: u32,
    /// Registered class identifier.
    pub process_class: String,
    /// Lifecycle state, pause flag, and suspend reason.
    pub machine: StateMachine,
    /// Workchain scratch context.
    pub ctx: WorkContext,
    /// Outline position; `None` until the first workchain tick.
    pub position: Option<OutlinePosition>,
    /// Resolved input values keyed by dotted port path.
    pub input_values: BTreeMap<String, Value>,
    /// Paths of metadata inputs (excluded from provenance and hashing).
    pub metadata_paths: BTreeSet<String>,
    /// Data-node pks backing the non-metadata inputs.
    pub input_refs: BTreeMap<String, Pk>,
    /// Outputs registered by steps, attached as links at finalization.
    pub pending_outputs: BTreeMap<String, Value>,
    /// Child-to-context placements awaiting terminal children.
    pub context_requests: Vec<ContextRequest>,
    /// Placement modes already used per context slot, across all steps.
    #[serde(default)]
    pub placements: PlacementHistory,
    /// Calcjob stage, when this process is a calcjob.
    pub stage: Option<JobStage>,
}

impl Checkpoint {
    /// The checkpoint of a freshly instantiated process.
    pub fn initial(
        definition: &ProcessDefinition,
        validated: &ValidatedInputs,
        input_refs: BTreeMap<String, Pk>,
    ) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            process_class: definition.identifier.clone(),
            machine: StateMachine::new(),
            ctx: WorkContext::new(),
            position: None,
            input_values: validated.values.clone(),
            metadata_paths: validated.metadata.clone(),
            input_refs,
            pending_outputs: BTreeMap::new(),
            context_requests: Vec::new(),
            placements: PlacementHistory::default(),
            stage: None,
        }
    }

    /// Reassemble the validated-inputs view steps and functions consume.
    pub fn validated_inputs(&self) -> ValidatedInputs {
        ValidatedInputs {
            values: self.input_values.clone(),
            metadata: self.metadata_paths.clone(),
        }
    }
}

/// Saves, loads, and deletes checkpoints on process nodes.
#[derive(Clone)]
pub struct Persister {
    store: Arc<dyn EntityStore>,
}

impl Persister {
    /// A persister over the given store.
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store }
    }

    /// Serialize and store the checkpoint on the node.
    pub async fn save(&self, pk: Pk, checkpoint: &Checkpoint) -> Result<()> {
        let value = serde_json::to_value(checkpoint).map_err(|err| {
            EngineError::invalid_operation(format!("checkpoint serialization failed: {err}"))
        })?;
        self.store.set_attribute(pk, attrs::CHECKPOINT, value).await?;
        debug!(pk, "checkpoint saved");
        Ok(())
    }

    /// Load and validate the checkpoint of a node.
    pub async fn load(&self, pk: Pk) -> Result<Checkpoint> {
        let value = self
            .store
            .get_attribute(pk, attrs::CHECKPOINT)
            .await?
            .ok_or(EngineError::NotExistent {
                pk,
                what: "checkpoint",
            })?;

        let found = value
            .get("version")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32;
        if found != CHECKPOINT_VERSION {
            return Err(EngineError::IncompatibleCheckpoint {
                pk,
                found,
                expected: CHECKPOINT_VERSION,
            });
        }

        serde_json::from_value(value).map_err(|err| EngineError::Reconstruction {
            pk,
            message: format!("checkpoint deserialization failed: {err}"),
        })
    }

    /// Remove the checkpoint. Idempotent: deleting an absent checkpoint
    /// succeeds, including on sealed nodes.
    pub async fn delete(&self, pk: Pk) -> Result<()> {
        self.store.delete_attribute(pk, attrs::CHECKPOINT).await?;
        debug!(pk, "checkpoint deleted");
        Ok(())
    }
}
