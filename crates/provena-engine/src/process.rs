// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process node lifecycle helpers shared by the runner, driver, and
//! controller: instantiation, attribute keys, output linking, reports,
//! and terminal finalization.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use provena_bus::{MessageBus, ProcessEvent};
use provena_store::{EntityStore, LinkType, LogLevel, NodeKind, Pk};

use crate::calcjob::JobRunner;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::exit_code::ExitCode;
use crate::persister::Checkpoint;
use crate::ports;
use crate::registry::{FunctionKind, ProcessDefinition, ProcessLogic, ProcessRegistry};
use crate::state::ProcessState;

/// Attribute keys written on process and data nodes.
pub mod attrs {
    /// Lowercase process state name.
    pub const PROCESS_STATE: &str = "process_state";
    /// Human-readable status line (pause reason, waiting detail).
    pub const PROCESS_STATUS: &str = "process_status";
    /// The registered class identifier.
    pub const PROCESS_LABEL: &str = "process_label";
    /// Numeric exit status.
    pub const EXIT_STATUS: &str = "exit_status";
    /// Exit message, when one was set.
    pub const EXIT_MESSAGE: &str = "exit_message";
    /// Whether the exit poisons the cache.
    pub const EXIT_INVALIDATES_CACHE: &str = "exit_invalidates_cache";
    /// Exception text for `EXCEPTED` processes.
    pub const EXCEPTION: &str = "exception";
    /// Whether the process is paused.
    pub const PAUSED: &str = "paused";
    /// The serialized checkpoint; removed at terminal finalization.
    pub const CHECKPOINT: &str = "checkpoint";
    /// Payload of a data node.
    pub const VALUE: &str = "value";
}

/// Extra keys written on process nodes. Extras stay writable after
/// sealing, which the caching layer depends on.
pub mod extras {
    /// Content hash of a sealed process node.
    pub const HASH: &str = "_provena_hash";
    /// UUID of the node this one was cloned from by a cache hit.
    pub const CACHED_FROM: &str = "_provena_cached_from";
    /// Set to `false` to exclude a node from cache candidacy.
    pub const VALID_CACHE: &str = "_provena_valid_cache";
}

/// Everything a worker needs to drive processes.
pub struct EngineShared {
    /// Entity store, the single source of durable truth.
    pub store: Arc<dyn EntityStore>,
    /// Message bus for control RPCs, events, and the task queue.
    pub bus: Arc<dyn MessageBus>,
    /// Registered process classes.
    pub registry: Arc<ProcessRegistry>,
    /// Runtime knobs.
    pub config: EngineConfig,
    /// Scheduler interface for calcjobs.
    pub jobs: Arc<dyn JobRunner>,
}

impl std::fmt::Debug for EngineShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineShared")
            .field("config", &self.config)
            .finish()
    }
}

/// Input-category link type for a process flavor.
pub fn input_link_type(logic: &ProcessLogic) -> LinkType {
    match logic {
        ProcessLogic::Function {
            kind: FunctionKind::Calculation,
            ..
        }
        | ProcessLogic::CalcJob(_) => LinkType::InputCalc,
        _ => LinkType::InputWork,
    }
}

/// Output-category link type for a process flavor.
pub fn output_link_type(logic: &ProcessLogic) -> LinkType {
    match logic {
        ProcessLogic::Function {
            kind: FunctionKind::Calculation,
            ..
        }
        | ProcessLogic::CalcJob(_) => LinkType::Create,
        _ => LinkType::Return,
    }
}

/// Call link type used when a workchain submits a child of this flavor.
pub fn call_link_type(logic: &ProcessLogic) -> LinkType {
    match logic {
        ProcessLogic::Function {
            kind: FunctionKind::Calculation,
            ..
        }
        | ProcessLogic::CalcJob(_) => LinkType::CallCalc,
        _ => LinkType::CallWork,
    }
}

/// Create a data node holding `value`.
pub async fn create_data_node(store: &dyn EntityStore, value: Value) -> Result<Pk> {
    let node = store.create_node(NodeKind::Data).await?;
    store.set_attribute(node.pk, attrs::VALUE, value).await?;
    Ok(node.pk)
}

/// Instantiate a process: validate inputs against the class spec, create
/// the process node, create and link input data nodes, and build the
/// initial checkpoint. The checkpoint is returned unpersisted; the caller
/// decides whether this is a blocking run or a submission.
pub async fn instantiate(
    shared: &EngineShared,
    identifier: &str,
    inputs: &Value,
) -> Result<(Pk, Arc<ProcessDefinition>, Checkpoint)> {
    let definition = shared.registry.get(identifier).ok_or_else(|| {
        EngineError::invalid_operation(format!("unknown process class '{identifier}'"))
    })?;

    let validated = ports::validate_inputs(&definition.spec, inputs)?;

    let node = shared.store.create_node(NodeKind::Process).await?;
    let pk = node.pk;
    shared
        .store
        .set_attribute(pk, attrs::PROCESS_LABEL, Value::String(identifier.to_string()))
        .await?;
    shared
        .store
        .set_attribute(
            pk,
            attrs::PROCESS_STATE,
            Value::String(ProcessState::Created.as_str().to_string()),
        )
        .await?;

    // Non-metadata inputs become data nodes linked into the provenance
    // graph; metadata inputs only live in the checkpoint.
    let link_type = input_link_type(&definition.logic);
    let mut input_refs = BTreeMap::new();
    for (path, value) in validated.provenance_values() {
        let data_pk = create_data_node(shared.store.as_ref(), value).await?;
        shared
            .store
            .add_link(data_pk, pk, link_type, &ports::path_to_label(&path))
            .await?;
        input_refs.insert(path, data_pk);
    }

    let checkpoint = Checkpoint::initial(&definition, &validated, input_refs);
    info!(pk, identifier, "process instantiated");
    Ok((pk, definition, checkpoint))
}

/// Attach outputs to a process node: one data node and output link per
/// dotted path. Idempotent against duplicate labels is not required; the
/// driver attaches outputs exactly once, right before sealing.
pub async fn attach_outputs(
    store: &dyn EntityStore,
    pk: Pk,
    logic: &ProcessLogic,
    outputs: &BTreeMap<String, Value>,
) -> Result<BTreeMap<String, Pk>> {
    let link_type = output_link_type(logic);
    let mut refs = BTreeMap::new();
    for (path, value) in outputs {
        let data_pk = create_data_node(store, value.clone()).await?;
        store
            .add_link(pk, data_pk, link_type, &ports::path_to_label(path))
            .await?;
        refs.insert(path.clone(), data_pk);
    }
    Ok(refs)
}

/// Collect the outputs of a terminal process from its output links.
pub async fn collect_outputs(
    store: &dyn EntityStore,
    pk: Pk,
) -> Result<BTreeMap<String, Value>> {
    let mut outputs = BTreeMap::new();
    for link in store.outgoing(pk, None).await? {
        if !link.link_type.is_output() {
            continue;
        }
        let node = store.load_node(link.target).await?;
        let value = node
            .attribute(attrs::VALUE)
            .cloned()
            .unwrap_or(Value::Null);
        outputs.insert(ports::label_to_path(&link.label), value);
    }
    Ok(outputs)
}

/// Append a report to the process node and mirror it to the log stream.
pub async fn report(store: &dyn EntityStore, pk: Pk, message: &str) -> Result<()> {
    info!(pk, message, "process report");
    store.append_log(pk, LogLevel::Report, message).await?;
    Ok(())
}

/// Read the terminal exit code recorded on a process node, if any.
pub async fn stored_exit_code(store: &dyn EntityStore, pk: Pk) -> Result<Option<ExitCode>> {
    let node = store.load_node(pk).await?;
    let Some(status) = node.attribute(attrs::EXIT_STATUS).and_then(Value::as_i64) else {
        return Ok(None);
    };
    let message = node
        .attribute(attrs::EXIT_MESSAGE)
        .and_then(Value::as_str)
        .map(str::to_string);
    let invalidates_cache = node
        .attribute(attrs::EXIT_INVALIDATES_CACHE)
        .and_then(Value::as_bool)
        .unwrap_or(false);
    Ok(Some(ExitCode {
        status: status as i32,
        message,
        invalidates_cache,
    }))
}

/// Read the stored process state of a node.
pub async fn stored_state(store: &dyn EntityStore, pk: Pk) -> Result<Option<ProcessState>> {
    let node = store.load_node(pk).await?;
    Ok(node
        .attribute(attrs::PROCESS_STATE)
        .and_then(|value| serde_json::from_value(value.clone()).ok()))
}

/// Persist the current state name and status line on the node and emit a
/// state-change event on the bus.
pub async fn publish_state(
    shared: &EngineShared,
    pk: Pk,
    state: ProcessState,
    status_line: Option<String>,
) -> Result<()> {
    shared
        .store
        .set_attribute(
            pk,
            attrs::PROCESS_STATE,
            Value::String(state.as_str().to_string()),
        )
        .await?;
    match status_line {
        Some(line) => {
            shared
                .store
                .set_attribute(pk, attrs::PROCESS_STATUS, Value::String(line))
                .await?;
        }
        None => {
            shared
                .store
                .delete_attribute(pk, attrs::PROCESS_STATUS)
                .await?;
        }
    }
    shared.bus.broadcast(ProcessEvent {
        pk,
        state: state.as_str().to_string(),
        terminal: state.is_terminal(),
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{Port, ProcessSpec, ValidatedInputs, ValueKind};
    use crate::registry::FunctionResult;
    use provena_bus::LocalBus;
    use provena_store::InMemoryStore;
    use serde_json::json;

    fn add_definition() -> ProcessDefinition {
        ProcessDefinition {
            identifier: "math.add".to_string(),
            version: 1,
            spec: ProcessSpec::builder()
                .input("x", Port::required(ValueKind::Int))
                .input("y", Port::required(ValueKind::Int))
                .output("result", Port::required(ValueKind::Int))
                .build(),
            logic: ProcessLogic::Function {
                kind: FunctionKind::Calculation,
                func: Arc::new(|inputs: &ValidatedInputs| {
                    let x = inputs.get("x").and_then(Value::as_i64).unwrap_or(0);
                    let y = inputs.get("y").and_then(Value::as_i64).unwrap_or(0);
                    let mut outputs = BTreeMap::new();
                    outputs.insert("result".to_string(), json!(x + y));
                    Ok(FunctionResult::Outputs(outputs))
                }),
                cacheable: true,
            },
        }
    }

    fn shared() -> EngineShared {
        let registry = ProcessRegistry::new();
        registry.register(add_definition()).unwrap();
        EngineShared {
            store: Arc::new(InMemoryStore::new()),
            bus: Arc::new(LocalBus::new()),
            registry: Arc::new(registry),
            config: EngineConfig::default(),
            jobs: Arc::new(crate::calcjob::NullJobRunner),
        }
    }

    #[tokio::test]
    async fn test_instantiate_links_inputs() {
        let shared = shared();
        let (pk, definition, checkpoint) =
            instantiate(&shared, "math.add", &json!({"x": 1, "y": 2}))
                .await
                .unwrap();

        assert_eq!(definition.identifier, "math.add");
        assert_eq!(checkpoint.process_class, "math.add");

        let node = shared.store.load_node(pk).await.unwrap();
        assert_eq!(
            node.attribute(attrs::PROCESS_LABEL),
            Some(&json!("math.add"))
        );
        assert_eq!(node.attribute(attrs::PROCESS_STATE), Some(&json!("created")));

        let incoming = shared.store.incoming(pk, Some(LinkType::InputCalc)).await.unwrap();
        assert_eq!(incoming.len(), 2);
        let labels: Vec<_> = incoming.iter().map(|link| link.label.as_str()).collect();
        assert!(labels.contains(&"x"));
        assert!(labels.contains(&"y"));
    }

    #[tokio::test]
    async fn test_instantiate_unknown_class() {
        let shared = shared();
        let err = instantiate(&shared, "math.sub", &json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_OPERATION");
    }

    #[tokio::test]
    async fn test_instantiate_invalid_inputs() {
        let shared = shared();
        let err = instantiate(&shared, "math.add", &json!({"x": 1}))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_attach_and_collect_outputs() {
        let shared = shared();
        let (pk, definition, _) = instantiate(&shared, "math.add", &json!({"x": 1, "y": 2}))
            .await
            .unwrap();

        let mut outputs = BTreeMap::new();
        outputs.insert("result".to_string(), json!(3));
        attach_outputs(shared.store.as_ref(), pk, &definition.logic, &outputs)
            .await
            .unwrap();

        let collected = collect_outputs(shared.store.as_ref(), pk).await.unwrap();
        assert_eq!(collected, outputs);
    }

    #[tokio::test]
    async fn test_publish_state_broadcasts() {
        let shared = shared();
        let mut events = shared.bus.subscribe();
        let (pk, _, _) = instantiate(&shared, "math.add", &json!({"x": 1, "y": 2}))
            .await
            .unwrap();

        publish_state(&shared, pk, ProcessState::Running, Some("busy".to_string()))
            .await
            .unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event.pk, pk);
        assert_eq!(event.state, "running");
        assert!(!event.terminal);

        let node = shared.store.load_node(pk).await.unwrap();
        assert_eq!(node.attribute(attrs::PROCESS_STATUS), Some(&json!("busy")));

        // Clearing the status line removes the attribute.
        publish_state(&shared, pk, ProcessState::Running, None)
            .await
            .unwrap();
        let node = shared.store.load_node(pk).await.unwrap();
        assert!(node.attribute(attrs::PROCESS_STATUS).is_none());
    }

    #[tokio::test]
    async fn test_stored_exit_code_roundtrip() {
        let shared = shared();
        let (pk, _, _) = instantiate(&shared, "math.add", &json!({"x": 1, "y": 2}))
            .await
            .unwrap();

        assert!(stored_exit_code(shared.store.as_ref(), pk)
            .await
            .unwrap()
            .is_none());

        shared
            .store
            .set_attribute(pk, attrs::EXIT_STATUS, json!(11))
            .await
            .unwrap();
        shared
            .store
            .set_attribute(pk, attrs::EXIT_MESSAGE, json!("missing output"))
            .await
            .unwrap();
        shared
            .store
            .set_attribute(pk, attrs::EXIT_INVALIDATES_CACHE, json!(true))
            .await
            .unwrap();

        let exit = stored_exit_code(shared.store.as_ref(), pk)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit.status, 11);
        assert!(exit.invalidates_cache);
    }

    #[tokio::test]
    async fn test_report_appends_log() {
        let shared = shared();
        let (pk, _, _) = instantiate(&shared, "math.add", &json!({"x": 1, "y": 2}))
            .await
            .unwrap();
        report(shared.store.as_ref(), pk, "halfway there").await.unwrap();

        let logs = shared.store.logs(pk).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].message, "halfway there");
        assert_eq!(logs[0].level, LogLevel::Report);
    }
}
