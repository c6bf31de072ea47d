// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The runner: the caller-facing entry point for executing processes.
//!
//! `run` drives a process inline and blocks until it terminates, servicing
//! the task queue meanwhile so that submitted children make progress even
//! without a separate worker. `submit` persists an initial checkpoint and
//! queues the process for whichever worker picks it up. Terminal futures
//! are shared per pk: any number of callers can await the same process
//! through one monitor.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use provena_bus::TaskMessage;
use provena_store::Pk;

use crate::driver::{self, Driver, TerminalInfo};
use crate::error::{EngineError, Result};
use crate::exit_code::ExitCode;
use crate::persister::Persister;
use crate::process::{self, EngineShared};
use crate::registry::ProcessLogic;
use crate::state::ProcessState;

/// Output label used by the single-result convenience accessor.
pub const DEFAULT_OUTPUT_LABEL: &str = "result";

/// What a blocking `run` hands back for a `FINISHED` process.
#[derive(Debug, Clone)]
pub struct RunResult {
    /// The process node.
    pub pk: Pk,
    /// The structured exit (zero or non-zero).
    pub exit: ExitCode,
    /// Outputs keyed by dotted port path.
    pub outputs: BTreeMap<String, Value>,
}

impl RunResult {
    /// The conventional single output, when the process declared one.
    pub fn output(&self) -> Option<&Value> {
        self.outputs.get(DEFAULT_OUTPUT_LABEL)
    }
}

type TerminalRx = watch::Receiver<Option<TerminalInfo>>;

/// Executes processes against a store, bus, and registry.
pub struct Runner {
    shared: Arc<EngineShared>,
    persister: Persister,
    terminals: Mutex<HashMap<Pk, TerminalRx>>,
}

impl Runner {
    /// A runner over the shared engine environment.
    pub fn new(shared: Arc<EngineShared>) -> Self {
        Self {
            persister: Persister::new(shared.store.clone()),
            shared,
            terminals: Mutex::new(HashMap::new()),
        }
    }

    /// The shared engine environment.
    pub fn shared(&self) -> &Arc<EngineShared> {
        &self.shared
    }

    /// Run a process to termination, inline.
    ///
    /// Children submitted along the way are serviced from the task queue
    /// by this call. A `FINISHED` process returns its result whatever the
    /// exit status; `EXCEPTED` and `KILLED` are raised as errors.
    #[instrument(skip(self, inputs))]
    pub async fn run(&self, identifier: &str, inputs: &Value) -> Result<RunResult> {
        let (pk, definition, checkpoint) =
            process::instantiate(&self.shared, identifier, inputs).await?;
        self.persister.save(pk, &checkpoint).await?;

        let driver = Driver::new(self.shared.clone(), pk, definition, checkpoint)?;
        let mut main = tokio::spawn(driver.run());

        let info = loop {
            tokio::select! {
                result = &mut main => {
                    break result.map_err(|err| {
                        EngineError::invalid_operation(format!("driver task panicked: {err}"))
                    })??;
                }
                task = self.shared.bus.pop_task() => {
                    match task {
                        Ok(task) => {
                            let shared = self.shared.clone();
                            tokio::spawn(driver::run_queued(shared, task.process_pk));
                        }
                        Err(err) => warn!(error = %err, "task queue unavailable"),
                    }
                }
            }
        };

        match info.state {
            ProcessState::Finished => Ok(RunResult {
                pk: info.pk,
                exit: info.exit.unwrap_or(ExitCode::OK),
                outputs: info.outputs,
            }),
            ProcessState::Excepted => Err(EngineError::Excepted {
                pk: info.pk,
                message: info.message.unwrap_or_else(|| "unknown failure".to_string()),
            }),
            ProcessState::Killed => Err(EngineError::Killed {
                pk: info.pk,
                message: info.message,
            }),
            other => Err(EngineError::invalid_operation(format!(
                "driver returned non-terminal state '{other}'"
            ))),
        }
    }

    /// Persist and queue a process for background execution. Returns the
    /// pk immediately.
    ///
    /// Process functions cannot be submitted: they are plain function
    /// calls with no resumable structure, so they only make sense inline.
    #[instrument(skip(self, inputs))]
    pub async fn submit(&self, identifier: &str, inputs: &Value) -> Result<Pk> {
        let definition = self.shared.registry.get(identifier).ok_or_else(|| {
            EngineError::invalid_operation(format!("unknown process class '{identifier}'"))
        })?;
        if matches!(definition.logic, ProcessLogic::Function { .. }) {
            return Err(EngineError::invalid_operation(format!(
                "process function '{identifier}' cannot be submitted; use run"
            )));
        }

        let (pk, _, checkpoint) =
            process::instantiate(&self.shared, identifier, inputs).await?;
        self.persister.save(pk, &checkpoint).await?;
        self.shared
            .bus
            .push_task(TaskMessage {
                process_pk: pk,
                tag: None,
            })
            .await?;
        info!(pk, identifier, "process submitted");
        Ok(pk)
    }

    /// Await the terminal summary of a process, whenever it lands.
    ///
    /// Safe to call before, during, or after execution; all callers for
    /// one pk share a single monitor.
    pub async fn wait_terminal(&self, pk: Pk) -> Result<TerminalInfo> {
        let mut receiver = self.terminal_receiver(pk);
        loop {
            if let Some(info) = receiver.borrow().clone() {
                return Ok(info);
            }
            receiver
                .changed()
                .await
                .map_err(|_| EngineError::NotExistent {
                    pk,
                    what: "terminal monitor",
                })?;
        }
    }

    /// Invoke `callback` once the process terminates. Duplicate
    /// registrations for one pk share the underlying monitor.
    pub fn call_on_process_finish(
        &self,
        pk: Pk,
        callback: impl FnOnce(TerminalInfo) + Send + 'static,
    ) {
        let mut receiver = self.terminal_receiver(pk);
        tokio::spawn(async move {
            loop {
                let info = receiver.borrow().clone();
                if let Some(info) = info {
                    callback(info);
                    return;
                }
                if receiver.changed().await.is_err() {
                    return;
                }
            }
        });
    }

    /// The shared terminal watch for a pk, creating its monitor on first
    /// use.
    fn terminal_receiver(&self, pk: Pk) -> TerminalRx {
        let mut terminals = self
            .terminals
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(receiver) = terminals.get(&pk) {
            return receiver.clone();
        }

        let (sender, receiver) = watch::channel(None);
        terminals.insert(pk, receiver.clone());

        let shared = self.shared.clone();
        tokio::spawn(async move {
            // Subscribe before the store check so a termination in between
            // is never missed.
            let mut events = shared.bus.subscribe();
            loop {
                match driver::load_terminal_info(shared.as_ref(), pk).await {
                    Ok(Some(info)) => {
                        let _ = sender.send(Some(info));
                        return;
                    }
                    Ok(None) => {}
                    Err(err) => {
                        debug!(pk, error = %err, "terminal monitor store check failed");
                    }
                }
                match events.recv().await {
                    Ok(event) if event.pk == pk && event.terminal => continue,
                    Ok(_) => continue,
                    // Lagged: just re-check the store.
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        receiver
    }
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calcjob::NullJobRunner;
    use crate::config::EngineConfig;
    use crate::ports::{Port, ProcessSpec, ValidatedInputs, ValueKind};
    use crate::registry::{
        FunctionKind, FunctionResult, ProcessDefinition, ProcessRegistry,
    };
    use provena_bus::LocalBus;
    use provena_store::InMemoryStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

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

    fn runner() -> Runner {
        let registry = ProcessRegistry::new();
        registry.register(add_definition()).unwrap();
        Runner::new(Arc::new(EngineShared {
            store: Arc::new(InMemoryStore::new()),
            bus: Arc::new(LocalBus::new()),
            registry: Arc::new(registry),
            config: EngineConfig::default(),
            jobs: Arc::new(NullJobRunner),
        }))
    }

    #[tokio::test]
    async fn test_run_function() {
        let runner = runner();
        let result = runner.run("math.add", &json!({"x": 20, "y": 22})).await.unwrap();
        assert!(result.exit.is_success());
        assert_eq!(result.output(), Some(&json!(42)));
    }

    #[tokio::test]
    async fn test_run_excepted_raises() {
        let runner = runner();
        let mut definition = add_definition();
        definition.identifier = "math.broken".to_string();
        definition.logic = ProcessLogic::Function {
            kind: FunctionKind::Calculation,
            func: Arc::new(|_| anyhow::bail!("nope")),
            cacheable: false,
        };
        runner.shared.registry.register(definition).unwrap();

        let err = runner
            .run("math.broken", &json!({"x": 1, "y": 1}))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "PROCESS_EXCEPTED");
    }

    #[tokio::test]
    async fn test_submit_function_rejected() {
        let runner = runner();
        let err = runner
            .submit("math.add", &json!({"x": 1, "y": 1}))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_OPERATION");
        assert!(runner.shared.bus.try_pop_task().is_none());
    }

    #[tokio::test]
    async fn test_wait_terminal_resolves_after_the_fact() {
        let runner = runner();
        let result = runner.run("math.add", &json!({"x": 1, "y": 2})).await.unwrap();

        // The process is long terminal; the future resolves immediately.
        let info = runner.wait_terminal(result.pk).await.unwrap();
        assert_eq!(info.state, ProcessState::Finished);
        assert_eq!(info.outputs.get("result"), Some(&json!(3)));
    }

    #[tokio::test]
    async fn test_finish_callbacks_share_one_monitor() {
        let runner = runner();
        let result = runner.run("math.add", &json!({"x": 1, "y": 2})).await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let calls = calls.clone();
            runner.call_on_process_finish(result.pk, move |info| {
                assert_eq!(info.state, ProcessState::Finished);
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }

        // Each registered callback fires exactly once.
        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while calls.load(Ordering::SeqCst) < 3 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        // Only one monitor entry exists for the pk.
        assert_eq!(runner.terminals.lock().unwrap().len(), 1);
    }
}
