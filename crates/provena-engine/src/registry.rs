// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process class definitions and the registry that resolves them.
//!
//! A checkpoint stores only the class identifier; the executable logic
//! (function bodies, workchain steps, predicates, job preparation) lives
//! here. Restoring a checkpoint whose identifier is unknown to this
//! registry is a reconstruction failure for that process only, never for
//! the hosting worker.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;

use crate::calcjob::CalcJobLogic;
use crate::error::{EngineError, Result};
use crate::exit_code::ExitCode;
use crate::outline::Outline;
use crate::ports::{ProcessSpec, ValidatedInputs};
use crate::scope::StepFn;
use crate::context::WorkContext;

/// What a process function evaluates to.
#[derive(Debug, Clone)]
pub enum FunctionResult {
    /// Outputs keyed by dotted port path; implies a successful exit unless
    /// output validation fails.
    Outputs(BTreeMap<String, Value>),
    /// An explicit structured exit, with no outputs.
    Exit(ExitCode),
}

/// The provenance flavor of a process function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    /// Creates data from data; eligible for caching.
    Calculation,
    /// Orchestrates and returns existing data; never cached.
    Work,
}

/// A plain function run as a process.
pub type ProcessFn =
    Arc<dyn Fn(&ValidatedInputs) -> anyhow::Result<FunctionResult> + Send + Sync>;

/// A predicate over the workchain context, evaluated by outline
/// conditionals and loops. Predicates must be cheap and side-effect free.
pub type PredicateFn = Arc<dyn Fn(&WorkContext, &ValidatedInputs) -> bool + Send + Sync>;

/// The executable logic of a workchain: its outline plus the step and
/// predicate bodies the outline references by name.
pub struct WorkChainLogic {
    /// The declarative step order.
    pub outline: Outline,
    /// Step bodies keyed by the names the outline uses.
    pub steps: BTreeMap<String, StepFn>,
    /// Predicate bodies keyed by the names the outline uses.
    pub predicates: BTreeMap<String, PredicateFn>,
}

impl std::fmt::Debug for WorkChainLogic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkChainLogic")
            .field("steps", &self.steps.keys().collect::<Vec<_>>())
            .field("predicates", &self.predicates.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// How a process class executes.
pub enum ProcessLogic {
    /// A single function call.
    Function {
        /// Calculation or work flavor.
        kind: FunctionKind,
        /// The body.
        func: ProcessFn,
        /// Opt-out from caching even when globally enabled.
        cacheable: bool,
    },
    /// A staged external-scheduler job.
    CalcJob(CalcJobLogic),
    /// An outline-driven workchain.
    WorkChain(WorkChainLogic),
}

impl ProcessLogic {
    /// Whether finished instances of this class may serve as cache sources
    /// and whether new instances may be short-circuited from the cache.
    ///
    /// Only calculation-flavored classes qualify: workchains and work
    /// functions return existing data, so replaying them from a cache
    /// would skip the sub-processes that provenance requires.
    pub fn is_cacheable(&self) -> bool {
        match self {
            Self::Function { kind, cacheable, .. } => {
                *kind == FunctionKind::Calculation && *cacheable
            }
            Self::CalcJob(logic) => logic.cacheable,
            Self::WorkChain(_) => false,
        }
    }
}

impl std::fmt::Debug for ProcessLogic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Function { kind, .. } => f.debug_struct("Function").field("kind", kind).finish(),
            Self::CalcJob(_) => f.write_str("CalcJob"),
            Self::WorkChain(logic) => logic.fmt(f),
        }
    }
}

/// A registered process class.
#[derive(Debug)]
pub struct ProcessDefinition {
    /// Stable class identifier, stored in checkpoints and node attributes.
    pub identifier: String,
    /// Class version, part of the content hash.
    pub version: u32,
    /// Declared input/output interface.
    pub spec: ProcessSpec,
    /// Executable logic.
    pub logic: ProcessLogic,
}

/// Registry of process classes available to this engine instance.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    definitions: RwLock<BTreeMap<String, Arc<ProcessDefinition>>>,
}

impl ProcessRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a process class.
    ///
    /// Workchain outlines are validated here: an empty outline, or an
    /// outline referencing a step or predicate with no registered body,
    /// is rejected up front rather than failing mid-execution.
    pub fn register(&self, definition: ProcessDefinition) -> Result<()> {
        if let ProcessLogic::WorkChain(logic) = &definition.logic {
            if logic.outline.is_empty() {
                return Err(EngineError::invalid_operation(format!(
                    "workchain '{}' has an empty outline",
                    definition.identifier
                )));
            }
            for step in logic.outline.step_names() {
                if !logic.steps.contains_key(step) {
                    return Err(EngineError::invalid_operation(format!(
                        "workchain '{}' outline references unknown step '{step}'",
                        definition.identifier
                    )));
                }
            }
            for predicate in logic.outline.predicate_names() {
                if !logic.predicates.contains_key(predicate) {
                    return Err(EngineError::invalid_operation(format!(
                        "workchain '{}' outline references unknown predicate '{predicate}'",
                        definition.identifier
                    )));
                }
            }
        }

        let mut definitions = self.definitions.write().map_err(|_| {
            EngineError::invalid_operation("process registry lock poisoned".to_string())
        })?;
        if definitions.contains_key(&definition.identifier) {
            return Err(EngineError::invalid_operation(format!(
                "process class '{}' is already registered",
                definition.identifier
            )));
        }
        definitions.insert(definition.identifier.clone(), Arc::new(definition));
        Ok(())
    }

    /// Resolve a class identifier.
    pub fn get(&self, identifier: &str) -> Option<Arc<ProcessDefinition>> {
        self.definitions
            .read()
            .ok()
            .and_then(|definitions| definitions.get(identifier).cloned())
    }

    /// Registered identifiers, sorted.
    pub fn identifiers(&self) -> Vec<String> {
        self.definitions
            .read()
            .map(|definitions| definitions.keys().cloned().collect())
            .unwrap_or_default()
    }
}
