// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Remote control of processes, worker loops, and queue repair.
//!
//! The controller talks to live processes over the bus RPC channel and
//! falls back to the store when nobody is listening. Control verbs are
//! total: applied to a terminal process they report "nothing changed"
//! instead of failing, so a caller never has to race termination. Killing
//! a process that is queued but not yet picked up bypasses RPC entirely
//! and finalizes the node straight in the store.
//!
//! A [`Worker`] is the consuming end of the task queue: it pops tasks and
//! spawns one driver per process, absorbing per-task failures so a single
//! bad checkpoint never takes the loop down.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use provena_bus::{BusError, ControlMessage, ControlReply, ProcessEvent, TaskMessage};
use provena_store::{Pk, ProcessNodeFilter, StoreError};

use crate::driver::{self, TerminalInfo};
use crate::error::{EngineError, Result};
use crate::persister::Persister;
use crate::process::{EngineShared, attrs, stored_state};
use crate::state::ProcessState;

/// Sends control verbs to processes, live or queued.
#[derive(Clone)]
pub struct Controller {
    shared: Arc<EngineShared>,
}

impl Controller {
    /// A controller over the shared engine environment.
    pub fn new(shared: Arc<EngineShared>) -> Self {
        Self { shared }
    }

    /// Requeue a checkpointed process so a worker resumes it.
    ///
    /// Already-terminal processes resolve immediately with their stored
    /// summary. With `nowait` the task is queued and `None` returned;
    /// otherwise the call blocks until the process terminates.
    #[instrument(skip(self))]
    pub async fn continue_process(
        &self,
        pk: Pk,
        nowait: bool,
    ) -> Result<Option<TerminalInfo>> {
        if let Some(info) = driver::load_terminal_info(&self.shared, pk).await? {
            debug!(pk, "continue resolved from the store");
            return Ok(Some(info));
        }

        // Subscribe before queueing so the terminal event cannot slip by.
        let mut events = self.shared.bus.subscribe();
        self.shared
            .bus
            .push_task(TaskMessage {
                process_pk: pk,
                tag: None,
            })
            .await?;
        info!(pk, "process requeued");
        if nowait {
            return Ok(None);
        }

        loop {
            if let Some(info) = driver::load_terminal_info(&self.shared, pk).await? {
                return Ok(Some(info));
            }
            match events.recv().await {
                Ok(event) if event.pk == pk && event.terminal => continue,
                Ok(_) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    return Err(BusError::Closed.into());
                }
            }
        }
    }

    /// Pause a running process. Returns whether anything changed; `false`
    /// for already-paused and terminal processes.
    #[instrument(skip(self))]
    pub async fn pause_process(&self, pk: Pk, reason: &str) -> Result<bool> {
        self.applied(
            pk,
            ControlMessage::Pause {
                reason: Some(reason.to_string()),
            },
        )
        .await
    }

    /// Resume a paused process. Returns whether anything changed.
    #[instrument(skip(self))]
    pub async fn play_process(&self, pk: Pk) -> Result<bool> {
        self.applied(pk, ControlMessage::Play).await
    }

    /// Kill a process. Returns whether the kill was accepted; `false` for
    /// terminal processes.
    ///
    /// A queued process with no live driver is killed directly: its task
    /// is removed and the node finalized in the store.
    #[instrument(skip(self, message))]
    pub async fn kill_process(&self, pk: Pk, message: Option<String>) -> Result<bool> {
        if self.stored_terminal(pk).await? {
            return Ok(false);
        }
        let verb = ControlMessage::Kill {
            message: message.clone(),
        };
        match self
            .shared
            .bus
            .send_rpc(pk, verb, self.shared.config.rpc_timeout())
            .await
        {
            Ok(ControlReply::Applied(changed)) => Ok(changed),
            Ok(reply) => Err(EngineError::invalid_operation(format!(
                "unexpected control reply: {reply:?}"
            ))),
            Err(BusError::NoSubscriber { .. }) => self.kill_queued(pk, message).await,
            Err(err) => Err(err.into()),
        }
    }

    /// The current state of a process, live over RPC or from the store.
    pub async fn status(&self, pk: Pk) -> Result<String> {
        match self
            .shared
            .bus
            .send_rpc(pk, ControlMessage::Status, self.shared.config.rpc_timeout())
            .await
        {
            Ok(ControlReply::Status { state }) => Ok(state),
            Ok(reply) => Err(EngineError::invalid_operation(format!(
                "unexpected control reply: {reply:?}"
            ))),
            Err(BusError::NoSubscriber { .. }) => {
                let state = stored_state(self.shared.store.as_ref(), pk)
                    .await?
                    .ok_or(EngineError::NotExistent {
                        pk,
                        what: "process state",
                    })?;
                Ok(state.as_str().to_string())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Inspect the task queue against the store and report (optionally
    /// fix) inconsistencies.
    ///
    /// Assumes a quiescent system: no workers consuming the queue and no
    /// live drivers. Three defects are recognized: the same process queued
    /// more than once, tasks whose process is terminal or gone, and
    /// checkpointed unsealed processes with no task at all.
    #[instrument(skip(self))]
    pub async fn repair(&self, apply: bool) -> Result<RepairReport> {
        let mut report = RepairReport::default();
        let mut queued: HashSet<Pk> = HashSet::new();

        for task in self.shared.bus.snapshot_tasks() {
            let pk = task.process_pk;
            if !queued.insert(pk) {
                report.duplicates.push(pk);
                if apply {
                    self.shared.bus.remove_task(&task);
                }
                continue;
            }
            let stale = match self.shared.store.load_node(pk).await {
                Err(StoreError::NodeNotFound { .. }) => true,
                Err(err) => return Err(err.into()),
                Ok(node) => node.sealed || node.attribute(attrs::CHECKPOINT).is_none(),
            };
            if stale {
                report.stale.push(pk);
                if apply {
                    self.shared.bus.remove_task(&task);
                }
            }
        }

        let filter = ProcessNodeFilter {
            sealed: Some(false),
        };
        for node in self.shared.store.list_process_nodes(&filter).await? {
            if node.attribute(attrs::CHECKPOINT).is_some() && !queued.contains(&node.pk) {
                report.orphaned.push(node.pk);
                if apply {
                    self.shared
                        .bus
                        .push_task(TaskMessage {
                            process_pk: node.pk,
                            tag: None,
                        })
                        .await?;
                }
            }
        }

        if !report.is_clean() {
            warn!(
                duplicates = report.duplicates.len(),
                stale = report.stale.len(),
                orphaned = report.orphaned.len(),
                apply,
                "task queue inconsistencies found"
            );
        }
        Ok(report)
    }

    /// Pause/play plumbing: terminal processes short-circuit to `false`,
    /// queued processes with no driver are an error since the verb has
    /// nothing to act on.
    async fn applied(&self, pk: Pk, verb: ControlMessage) -> Result<bool> {
        if self.stored_terminal(pk).await? {
            return Ok(false);
        }
        match self
            .shared
            .bus
            .send_rpc(pk, verb, self.shared.config.rpc_timeout())
            .await
        {
            Ok(ControlReply::Applied(changed)) => Ok(changed),
            Ok(reply) => Err(EngineError::invalid_operation(format!(
                "unexpected control reply: {reply:?}"
            ))),
            Err(BusError::NoSubscriber { .. }) => Err(EngineError::NotActive { pk }),
            Err(err) => Err(err.into()),
        }
    }

    async fn stored_terminal(&self, pk: Pk) -> Result<bool> {
        Ok(stored_state(self.shared.store.as_ref(), pk)
            .await?
            .is_some_and(|state| state.is_terminal()))
    }

    /// Kill a process nobody is driving: drop its task and finalize the
    /// node in the store.
    async fn kill_queued(&self, pk: Pk, message: Option<String>) -> Result<bool> {
        let removed = self.shared.bus.remove_task(&TaskMessage {
            process_pk: pk,
            tag: None,
        });
        if !removed {
            return Err(EngineError::NotActive { pk });
        }

        info!(pk, ?message, "killed queued process");
        self.shared
            .store
            .set_attribute(
                pk,
                attrs::PROCESS_STATE,
                json!(ProcessState::Killed.as_str()),
            )
            .await?;
        if let Some(message) = &message {
            self.shared
                .store
                .set_attribute(pk, attrs::PROCESS_STATUS, json!(format!("killed: {message}")))
                .await?;
        }
        Persister::new(self.shared.store.clone()).delete(pk).await?;
        self.shared.store.seal(pk).await?;
        self.shared.bus.broadcast(ProcessEvent {
            pk,
            state: ProcessState::Killed.as_str().to_string(),
            terminal: true,
        });
        Ok(true)
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller").finish()
    }
}

/// What [`Controller::repair`] found (and, with `apply`, fixed).
#[derive(Debug, Clone, Default)]
pub struct RepairReport {
    /// Processes queued more than once; extra tasks are removed.
    pub duplicates: Vec<Pk>,
    /// Tasks whose process is terminal, unresumable, or gone; removed.
    pub stale: Vec<Pk>,
    /// Checkpointed unsealed processes with no task; requeued.
    pub orphaned: Vec<Pk>,
}

impl RepairReport {
    /// True when queue and store agree.
    pub fn is_clean(&self) -> bool {
        self.duplicates.is_empty() && self.stale.is_empty() && self.orphaned.is_empty()
    }
}

/// A background consumer of the task queue.
pub struct Worker {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Worker {
    /// Start a worker loop on the current runtime.
    pub fn spawn(shared: Arc<EngineShared>) -> Self {
        let (shutdown, mut signal) = watch::channel(false);
        let handle = tokio::spawn(async move {
            info!("worker started");
            loop {
                tokio::select! {
                    _ = signal.changed() => break,
                    task = shared.bus.pop_task() => match task {
                        Ok(task) => {
                            // Spawned, not awaited: a workchain waiting for
                            // its children must not block the worker that
                            // would run them.
                            let shared = shared.clone();
                            tokio::spawn(driver::run_queued(shared, task.process_pk));
                        }
                        Err(err) => {
                            warn!(error = %err, "task queue closed, worker stopping");
                            break;
                        }
                    },
                }
            }
            info!("worker stopped");
        });
        Self { shutdown, handle }
    }

    /// Stop pulling tasks and wait for the loop to exit. Processes already
    /// spawned keep running to completion.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker").finish()
    }
}
