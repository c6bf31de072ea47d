// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The per-process driver: owns one process from checkpoint to terminal
//! state.
//!
//! The driver loop interleaves control messages with execution ticks. Each
//! iteration drains pending control verbs, services a requested kill, and
//! then advances the process by exactly one tick: one function call, one
//! outline action, one job stage, or one wait-resolution. The checkpoint
//! is saved after every tick, so a crash at any point resumes at the last
//! tick boundary. A paused driver persists its checkpoint and blocks on
//! the control channel until played or killed.
//!
//! Terminal finalization is ordered so that a node is sealed only once it
//! is fully described: exit attributes, then output links, then checkpoint
//! removal, then the seal, then post-seal extras, then the terminal event.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use provena_bus::{
    BusError, ControlMessage, ControlReply, RpcRequest, RpcSubscription, TaskMessage,
};
use provena_store::{LogLevel, Pk};

use crate::caching;
use crate::calcjob::{JobSnapshot, JobStage, JobStatus, MonitorVerdict};
use crate::context::ContextAction;
use crate::error::{EngineError, Result};
use crate::exit_code::ExitCode;
use crate::outline::OutlineAction;
use crate::persister::{Checkpoint, Persister};
use crate::ports;
use crate::process::{
    self, EngineShared, attrs, collect_outputs, extras, stored_exit_code, stored_state,
};
use crate::registry::{FunctionResult, ProcessDefinition, ProcessLogic};
use crate::scope::{StepOutcome, StepScope};
use crate::state::{ProcessState, SuspendReason};

/// What a terminal process left behind.
#[derive(Debug, Clone)]
pub struct TerminalInfo {
    /// The process.
    pub pk: Pk,
    /// The terminal state reached.
    pub state: ProcessState,
    /// The structured exit, for `FINISHED` processes.
    pub exit: Option<ExitCode>,
    /// Attached outputs keyed by dotted port path.
    pub outputs: BTreeMap<String, Value>,
    /// Exception or kill detail, when there is one.
    pub message: Option<String>,
}

/// The result of one execution tick.
enum Tick {
    /// State advanced; checkpoint and keep looping.
    Progressed,
    /// The process logic finished with this exit code.
    Finished(ExitCode),
    /// An unhandled failure occurred.
    Excepted(String),
    /// A kill must be serviced now.
    Killed(Option<String>),
    /// The process was finalized out-of-band (cache hit).
    Terminal(TerminalInfo),
}

/// Drives one process to a terminal state.
pub struct Driver {
    shared: Arc<EngineShared>,
    persister: Persister,
    pk: Pk,
    definition: Arc<ProcessDefinition>,
    checkpoint: Checkpoint,
    subscription: RpcSubscription,
}

impl Driver {
    /// Take ownership of a freshly instantiated process.
    pub fn new(
        shared: Arc<EngineShared>,
        pk: Pk,
        definition: Arc<ProcessDefinition>,
        checkpoint: Checkpoint,
    ) -> Result<Self> {
        let subscription = shared.bus.register_rpc(pk)?;
        Ok(Self {
            persister: Persister::new(shared.store.clone()),
            shared,
            pk,
            definition,
            checkpoint,
            subscription,
        })
    }

    /// Reconstruct a process from its stored checkpoint.
    ///
    /// An unknown class identifier is a reconstruction failure for this
    /// process; the caller decides how to record it.
    pub async fn restore(shared: Arc<EngineShared>, pk: Pk) -> Result<Self> {
        let persister = Persister::new(shared.store.clone());
        let checkpoint = persister.load(pk).await?;
        let definition = shared
            .registry
            .get(&checkpoint.process_class)
            .ok_or_else(|| EngineError::Reconstruction {
                pk,
                message: format!(
                    "process class '{}' is not registered",
                    checkpoint.process_class
                ),
            })?;
        let subscription = shared.bus.register_rpc(pk)?;
        Ok(Self {
            persister,
            shared,
            pk,
            definition,
            checkpoint,
            subscription,
        })
    }

    /// The driven process.
    pub fn pk(&self) -> Pk {
        self.pk
    }

    /// Drive the process until it reaches a terminal state.
    #[instrument(skip(self), fields(pk = self.pk, class = %self.definition.identifier))]
    pub async fn run(mut self) -> Result<TerminalInfo> {
        loop {
            while let Some(request) = self.subscription.try_recv() {
                self.handle_control(request).await?;
            }

            if let Some(message) = self.checkpoint.machine.take_pending_kill() {
                return self.kill_now(message).await;
            }

            if self.checkpoint.machine.is_paused() {
                self.persister.save(self.pk, &self.checkpoint).await?;
                let Some(request) = self.subscription.recv().await else {
                    return Err(BusError::Closed.into());
                };
                self.handle_control(request).await?;
                continue;
            }

            let tick = match self.checkpoint.machine.state() {
                ProcessState::Created => self.tick_start().await?,
                ProcessState::Running => self.tick_running().await?,
                ProcessState::Waiting => self.tick_waiting().await?,
                terminal => {
                    return Err(EngineError::invalid_operation(format!(
                        "driver attached to process in terminal state '{terminal}'"
                    )));
                }
            };

            match tick {
                Tick::Progressed => {
                    self.persister.save(self.pk, &self.checkpoint).await?;
                }
                Tick::Finished(exit) => return self.finalize_finished(exit).await,
                Tick::Excepted(message) => return self.finalize_excepted(message).await,
                Tick::Killed(message) => return self.kill_now(message).await,
                Tick::Terminal(info) => return Ok(info),
            }
        }
    }

    /// First tick: cache lookup, then `CREATED` → `RUNNING`.
    async fn tick_start(&mut self) -> Result<Tick> {
        if self.shared.config.caching_enabled && self.definition.logic.is_cacheable() {
            let hash = caching::process_hash(&self.definition, &self.checkpoint);
            if let Some(source) =
                caching::find_cache_source(self.shared.store.as_ref(), &hash).await?
            {
                info!(pk = self.pk, source = source.pk, "cache hit, skipping execution");
                let exit = caching::apply_cache_hit(
                    self.shared.store.as_ref(),
                    &source,
                    self.pk,
                    &hash,
                )
                .await?;
                // Output links and exit attributes are already in place;
                // finalize directly instead of re-validating outputs.
                self.shared
                    .store
                    .set_attribute(
                        self.pk,
                        attrs::PROCESS_STATE,
                        json!(ProcessState::Finished.as_str()),
                    )
                    .await?;
                self.persister.delete(self.pk).await?;
                self.shared.store.seal(self.pk).await?;
                self.broadcast_terminal(ProcessState::Finished);
                let outputs = collect_outputs(self.shared.store.as_ref(), self.pk).await?;
                return Ok(Tick::Terminal(TerminalInfo {
                    pk: self.pk,
                    state: ProcessState::Finished,
                    exit: Some(exit),
                    outputs,
                    message: None,
                }));
            }
        }

        self.checkpoint.machine.start()?;
        if let ProcessLogic::WorkChain(logic) = &self.definition.logic {
            self.checkpoint.position = Some(logic.outline.begin()?);
        }
        if matches!(self.definition.logic, ProcessLogic::CalcJob(_)) {
            self.checkpoint.stage = Some(JobStage::Upload);
        }
        self.publish().await?;
        Ok(Tick::Progressed)
    }

    /// One `RUNNING` tick, dispatched by process flavor.
    async fn tick_running(&mut self) -> Result<Tick> {
        let definition = self.definition.clone();
        match &definition.logic {
            ProcessLogic::Function { func, .. } => {
                let inputs = self.checkpoint.validated_inputs();
                match func(&inputs) {
                    Ok(FunctionResult::Outputs(outputs)) => {
                        self.checkpoint.pending_outputs.extend(outputs);
                        Ok(Tick::Finished(ExitCode::OK))
                    }
                    Ok(FunctionResult::Exit(exit)) => Ok(Tick::Finished(exit)),
                    Err(err) => Ok(Tick::Excepted(format!("{err:#}"))),
                }
            }
            ProcessLogic::WorkChain(logic) => self.tick_outline(logic).await,
            ProcessLogic::CalcJob(logic) => self.tick_job(logic).await,
        }
    }

    /// One outline action: a step, a predicate, or a return.
    async fn tick_outline(
        &mut self,
        logic: &crate::registry::WorkChainLogic,
    ) -> Result<Tick> {
        let Some(position) = self.checkpoint.position.clone() else {
            return Ok(Tick::Excepted(
                "workchain checkpoint has no outline position".to_string(),
            ));
        };

        match logic.outline.next_action(&position)? {
            OutlineAction::Done => Ok(Tick::Finished(ExitCode::OK)),
            OutlineAction::Return { exit } => Ok(Tick::Finished(exit)),
            OutlineAction::EvalPredicate { name } => {
                let Some(predicate) = logic.predicates.get(name) else {
                    return Ok(Tick::Excepted(format!("unknown predicate '{name}'")));
                };
                let inputs = self.checkpoint.validated_inputs();
                let value = predicate(&self.checkpoint.ctx, &inputs);
                debug!(pk = self.pk, predicate = name, value, "predicate evaluated");
                let mut position = position;
                logic.outline.predicate_evaluated(&mut position, value)?;
                self.checkpoint.position = Some(position);
                Ok(Tick::Progressed)
            }
            OutlineAction::RunStep { name } => {
                let Some(step) = logic.steps.get(name) else {
                    return Ok(Tick::Excepted(format!("unknown step '{name}'")));
                };
                debug!(pk = self.pk, step = name, "running step");

                let ctx = std::mem::take(&mut self.checkpoint.ctx);
                let outputs = std::mem::take(&mut self.checkpoint.pending_outputs);
                let mut scope = StepScope::new(
                    self.shared.clone(),
                    self.pk,
                    ctx,
                    self.checkpoint.validated_inputs(),
                    outputs,
                );
                let outcome = step(&mut scope).await;
                let result = scope.finish();
                self.checkpoint.ctx = result.ctx;
                self.checkpoint.pending_outputs = result.outputs;

                let outcome = match outcome {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        return Ok(Tick::Excepted(format!("step '{name}' failed: {err:#}")));
                    }
                };

                if let Err(err) = self.checkpoint.placements.record(&result.requests) {
                    return Ok(Tick::Excepted(err.to_string()));
                }

                if let StepOutcome::Exit(exit) = outcome {
                    return Ok(Tick::Finished(exit));
                }

                let mut position = position;
                logic.outline.step_completed(&mut position)?;
                self.checkpoint.position = Some(position);

                if !result.submitted.is_empty() {
                    self.checkpoint.context_requests = result.requests;
                    self.checkpoint.machine.wait(SuspendReason::AwaitingChildren {
                        pks: result.submitted,
                    })?;
                    self.publish().await?;
                }
                Ok(Tick::Progressed)
            }
        }
    }

    /// One calcjob stage transition.
    async fn tick_job(&mut self, logic: &crate::calcjob::CalcJobLogic) -> Result<Tick> {
        let inputs = self.checkpoint.validated_inputs();
        match self.checkpoint.stage.clone() {
            Some(JobStage::Upload) => {
                let payload = match (logic.prepare)(&inputs) {
                    Ok(payload) => payload,
                    Err(err) => return Ok(Tick::Excepted(format!("prepare failed: {err:#}"))),
                };
                if let Err(err) = self.shared.jobs.upload(self.pk, &payload).await {
                    return Ok(Tick::Excepted(format!("upload failed: {err:#}")));
                }
                self.checkpoint.stage = Some(JobStage::Submit);
                Ok(Tick::Progressed)
            }
            Some(JobStage::Submit) => {
                let payload = match (logic.prepare)(&inputs) {
                    Ok(payload) => payload,
                    Err(err) => return Ok(Tick::Excepted(format!("prepare failed: {err:#}"))),
                };
                let job_id = match self.shared.jobs.submit(self.pk, &payload).await {
                    Ok(job_id) => job_id,
                    Err(err) => return Ok(Tick::Excepted(format!("submit failed: {err:#}"))),
                };
                info!(pk = self.pk, job_id, "job submitted");
                self.checkpoint.stage = Some(JobStage::Wait { job_id, polls: 0 });
                self.checkpoint.machine.wait(SuspendReason::AwaitingJob)?;
                self.publish().await?;
                Ok(Tick::Progressed)
            }
            Some(JobStage::Retrieve { job_id }) => {
                let retrieved = match self.shared.jobs.retrieve(&job_id).await {
                    Ok(retrieved) => retrieved,
                    Err(err) => return Ok(Tick::Excepted(format!("retrieve failed: {err:#}"))),
                };
                self.checkpoint.stage = Some(JobStage::Parse { retrieved });
                Ok(Tick::Progressed)
            }
            Some(JobStage::Parse { retrieved }) => match (logic.parse)(&retrieved, &inputs) {
                Ok(FunctionResult::Outputs(outputs)) => {
                    self.checkpoint.pending_outputs.extend(outputs);
                    Ok(Tick::Finished(ExitCode::OK))
                }
                Ok(FunctionResult::Exit(exit)) => Ok(Tick::Finished(exit)),
                Err(err) => Ok(Tick::Excepted(format!("parse failed: {err:#}"))),
            },
            Some(JobStage::Wait { .. }) | None => Ok(Tick::Excepted(
                "calcjob checkpoint stage is inconsistent".to_string(),
            )),
        }
    }

    /// Resolve a `WAITING` state: children, scheduler polls, or an ack.
    async fn tick_waiting(&mut self) -> Result<Tick> {
        match self.checkpoint.machine.suspend_reason().cloned() {
            Some(SuspendReason::AwaitingChildren { pks }) => self.await_children(pks).await,
            Some(SuspendReason::AwaitingJob) => self.poll_job().await,
            Some(SuspendReason::AwaitingRpcAck) | None => {
                self.checkpoint.machine.resume()?;
                self.publish().await?;
                Ok(Tick::Progressed)
            }
        }
    }

    /// Block until every awaited child is terminal, servicing control
    /// messages meanwhile, then fold child results into the context.
    async fn await_children(&mut self, pks: Vec<Pk>) -> Result<Tick> {
        // Subscribe before checking, so a child finishing in between is
        // never missed.
        let mut events = self.shared.bus.subscribe();
        loop {
            let mut outstanding = false;
            for child in &pks {
                let terminal = stored_state(self.shared.store.as_ref(), *child)
                    .await?
                    .is_some_and(|state| state.is_terminal());
                if !terminal {
                    outstanding = true;
                    break;
                }
            }
            if !outstanding {
                break;
            }

            // Arms only produce values; control handling happens after the
            // select so the subscription borrow has ended.
            let request = tokio::select! {
                request = self.subscription.recv() => Some(request),
                // Any terminal event re-checks; a lagged receiver just
                // re-checks immediately.
                _ = events.recv() => None,
            };
            if let Some(request) = request {
                let Some(request) = request else {
                    return Err(BusError::Closed.into());
                };
                self.handle_control(request).await?;
                if let Some(message) = self.checkpoint.machine.take_pending_kill() {
                    return Ok(Tick::Killed(message));
                }
            }
        }

        for request in std::mem::take(&mut self.checkpoint.context_requests) {
            let outputs =
                collect_outputs(self.shared.store.as_ref(), request.child_pk).await?;
            let state = stored_state(self.shared.store.as_ref(), request.child_pk).await?;
            let exit = stored_exit_code(self.shared.store.as_ref(), request.child_pk).await?;
            let value = json!({
                "pk": request.child_pk,
                "state": state.map(|s| s.as_str()),
                "exit_status": exit.as_ref().map(|e| e.status),
                "outputs": outputs,
            });
            match request.action {
                ContextAction::Assign => self.checkpoint.ctx.set(&request.path, value)?,
                ContextAction::Append => self.checkpoint.ctx.push(&request.path, value)?,
            }
        }

        self.checkpoint.machine.resume()?;
        self.publish().await?;
        Ok(Tick::Progressed)
    }

    /// One scheduler poll, with monitors, control messages interleaved.
    async fn poll_job(&mut self) -> Result<Tick> {
        let Some(JobStage::Wait { job_id, polls }) = self.checkpoint.stage.clone() else {
            return Ok(Tick::Excepted(
                "waiting for a job without a wait stage".to_string(),
            ));
        };

        let request = tokio::select! {
            request = self.subscription.recv() => Some(request),
            _ = tokio::time::sleep(self.shared.config.poll_interval()) => None,
        };
        if let Some(request) = request {
            let Some(request) = request else {
                return Err(BusError::Closed.into());
            };
            self.handle_control(request).await?;
            if let Some(message) = self.checkpoint.machine.take_pending_kill() {
                return Ok(Tick::Killed(message));
            }
            return Ok(Tick::Progressed);
        }

        let status = match self.shared.jobs.poll(&job_id).await {
            Ok(status) => status,
            Err(err) => return Ok(Tick::Excepted(format!("poll failed: {err:#}"))),
        };

        if status == JobStatus::Done {
            self.checkpoint.stage = Some(JobStage::Retrieve { job_id });
            self.checkpoint.machine.resume()?;
            self.publish().await?;
            return Ok(Tick::Progressed);
        }

        let polls = polls + 1;
        let snapshot = JobSnapshot {
            job_id: job_id.clone(),
            polls,
        };
        if let ProcessLogic::CalcJob(logic) = &self.definition.logic {
            for monitor in &logic.monitors {
                if let MonitorVerdict::Kill { message } = monitor(&snapshot) {
                    warn!(pk = self.pk, job_id, message, "monitor killed job");
                    if let Err(err) = self.shared.jobs.kill(&job_id).await {
                        return Ok(Tick::Excepted(format!("job kill failed: {err:#}")));
                    }
                    process::report(
                        self.shared.store.as_ref(),
                        self.pk,
                        &format!("scheduler job killed by monitor: {message}"),
                    )
                    .await?;
                    self.checkpoint.stage = Some(JobStage::Retrieve { job_id });
                    self.checkpoint.machine.resume()?;
                    self.publish().await?;
                    return Ok(Tick::Progressed);
                }
            }
        }

        self.checkpoint.stage = Some(JobStage::Wait { job_id, polls });
        Ok(Tick::Progressed)
    }

    /// Apply one control verb and reply.
    async fn handle_control(&mut self, request: RpcRequest) -> Result<()> {
        match &request.message {
            ControlMessage::Pause { reason } => {
                let changed = self.checkpoint.machine.pause(reason.clone());
                if changed {
                    info!(pk = self.pk, "process paused");
                    self.shared
                        .store
                        .set_attribute(self.pk, attrs::PAUSED, json!(true))
                        .await?;
                    self.set_status_line().await?;
                    self.persister.save(self.pk, &self.checkpoint).await?;
                }
                request.respond(ControlReply::Applied(changed));
            }
            ControlMessage::Play => {
                let changed = self.checkpoint.machine.play();
                if changed {
                    info!(pk = self.pk, "process played");
                    self.shared
                        .store
                        .set_attribute(self.pk, attrs::PAUSED, json!(false))
                        .await?;
                    self.set_status_line().await?;
                    self.persister.save(self.pk, &self.checkpoint).await?;
                }
                request.respond(ControlReply::Applied(changed));
            }
            ControlMessage::Kill { message } => {
                let accepted = self.checkpoint.machine.request_kill(message.clone());
                request.respond(ControlReply::Applied(accepted));
            }
            ControlMessage::Status => {
                request.respond(ControlReply::Status {
                    state: self.checkpoint.machine.state().as_str().to_string(),
                });
            }
        }
        Ok(())
    }

    /// Kill this process, cascading to awaited children first.
    async fn kill_now(mut self, message: Option<String>) -> Result<TerminalInfo> {
        if let Some(SuspendReason::AwaitingChildren { pks }) =
            self.checkpoint.machine.suspend_reason().cloned()
        {
            self.cascade_kill(&pks).await?;
        }

        info!(pk = self.pk, ?message, "process killed");
        self.checkpoint.machine.kill();
        let status_line = match &message {
            Some(message) => format!("killed: {message}"),
            None => "killed".to_string(),
        };
        self.shared
            .store
            .set_attribute(
                self.pk,
                attrs::PROCESS_STATE,
                json!(ProcessState::Killed.as_str()),
            )
            .await?;
        self.shared
            .store
            .set_attribute(self.pk, attrs::PROCESS_STATUS, json!(status_line))
            .await?;
        self.persister.delete(self.pk).await?;
        self.shared.store.seal(self.pk).await?;
        self.broadcast_terminal(ProcessState::Killed);

        Ok(TerminalInfo {
            pk: self.pk,
            state: ProcessState::Killed,
            exit: None,
            outputs: BTreeMap::new(),
            message,
        })
    }

    /// Kill every non-terminal awaited child and wait for them to land.
    async fn cascade_kill(&mut self, pks: &[Pk]) -> Result<()> {
        let mut events = self.shared.bus.subscribe();
        let reason = Some("parent process was killed".to_string());

        for child in pks {
            let terminal = stored_state(self.shared.store.as_ref(), *child)
                .await?
                .is_some_and(|state| state.is_terminal());
            if terminal {
                continue;
            }
            match self
                .shared
                .bus
                .send_rpc(
                    *child,
                    ControlMessage::Kill {
                        message: reason.clone(),
                    },
                    self.shared.config.rpc_timeout(),
                )
                .await
            {
                Ok(_) => {}
                Err(BusError::NoSubscriber { .. }) => {
                    // Still queued: drop the task and finalize it here.
                    self.shared.bus.remove_task(&TaskMessage {
                        process_pk: *child,
                        tag: None,
                    });
                    debug!(child, "killed queued child directly");
                    self.shared
                        .store
                        .set_attribute(
                            *child,
                            attrs::PROCESS_STATE,
                            json!(ProcessState::Killed.as_str()),
                        )
                        .await?;
                    self.persister.delete(*child).await?;
                    self.shared.store.seal(*child).await?;
                    self.shared.bus.broadcast(provena_bus::ProcessEvent {
                        pk: *child,
                        state: ProcessState::Killed.as_str().to_string(),
                        terminal: true,
                    });
                }
                Err(err) => return Err(err.into()),
            }
        }

        // Wait until every child actually reached a terminal state.
        loop {
            let mut outstanding = false;
            for child in pks {
                let terminal = stored_state(self.shared.store.as_ref(), *child)
                    .await?
                    .is_some_and(|state| state.is_terminal());
                if !terminal {
                    outstanding = true;
                    break;
                }
            }
            if !outstanding {
                return Ok(());
            }
            let _ = events.recv().await;
        }
    }

    /// Finish: validate outputs, record the exit, attach, seal, announce.
    async fn finalize_finished(mut self, exit: ExitCode) -> Result<TerminalInfo> {
        let violations =
            ports::validate_outputs(&self.definition.spec, &self.checkpoint.pending_outputs);

        // Output problems override a successful exit; an explicit failure
        // exit stands as-is.
        let exit = if exit.is_success() && !violations.is_empty() {
            let invalid = violations.iter().find_map(|violation| match violation {
                ports::OutputViolation::Invalid { path, message } => {
                    Some(format!("{path}: {message}"))
                }
                ports::OutputViolation::Missing { .. } => None,
            });
            match invalid {
                Some(detail) => ExitCode::invalid_output(detail),
                None => {
                    let missing: Vec<_> = violations
                        .iter()
                        .filter_map(|violation| match violation {
                            ports::OutputViolation::Missing { path } => Some(path.as_str()),
                            _ => None,
                        })
                        .collect();
                    ExitCode::missing_output(missing.join(", "))
                }
            }
        } else {
            exit
        };

        self.checkpoint.machine.finish(&exit)?;
        info!(pk = self.pk, status = exit.status, "process finished");

        self.shared
            .store
            .set_attribute(self.pk, attrs::EXIT_STATUS, json!(exit.status))
            .await?;
        if let Some(message) = &exit.message {
            self.shared
                .store
                .set_attribute(self.pk, attrs::EXIT_MESSAGE, json!(message))
                .await?;
        }
        if exit.invalidates_cache {
            self.shared
                .store
                .set_attribute(self.pk, attrs::EXIT_INVALIDATES_CACHE, json!(true))
                .await?;
        }
        self.shared
            .store
            .set_attribute(
                self.pk,
                attrs::PROCESS_STATE,
                json!(ProcessState::Finished.as_str()),
            )
            .await?;
        self.shared
            .store
            .delete_attribute(self.pk, attrs::PROCESS_STATUS)
            .await?;

        // Attach outputs only when they validated cleanly; a 10/11 exit
        // leaves the node without output links.
        let outputs = if violations.is_empty() {
            process::attach_outputs(
                self.shared.store.as_ref(),
                self.pk,
                &self.definition.logic,
                &self.checkpoint.pending_outputs,
            )
            .await?;
            self.checkpoint.pending_outputs.clone()
        } else {
            BTreeMap::new()
        };

        self.persister.delete(self.pk).await?;
        self.shared.store.seal(self.pk).await?;

        if exit.is_success() && self.definition.logic.is_cacheable() {
            let hash = caching::process_hash(&self.definition, &self.checkpoint);
            self.shared
                .store
                .set_extra(self.pk, extras::HASH, json!(hash))
                .await?;
        }

        self.broadcast_terminal(ProcessState::Finished);
        Ok(TerminalInfo {
            pk: self.pk,
            state: ProcessState::Finished,
            exit: Some(exit),
            outputs,
            message: None,
        })
    }

    /// Record an unhandled failure and seal the node.
    async fn finalize_excepted(mut self, message: String) -> Result<TerminalInfo> {
        warn!(pk = self.pk, message, "process excepted");
        self.checkpoint.machine.except();

        self.shared
            .store
            .set_attribute(self.pk, attrs::EXCEPTION, json!(message))
            .await?;
        self.shared
            .store
            .set_attribute(
                self.pk,
                attrs::PROCESS_STATE,
                json!(ProcessState::Excepted.as_str()),
            )
            .await?;
        self.shared
            .store
            .delete_attribute(self.pk, attrs::PROCESS_STATUS)
            .await?;
        self.shared
            .store
            .append_log(self.pk, LogLevel::Error, &message)
            .await?;
        self.persister.delete(self.pk).await?;
        self.shared.store.seal(self.pk).await?;
        self.broadcast_terminal(ProcessState::Excepted);

        Ok(TerminalInfo {
            pk: self.pk,
            state: ProcessState::Excepted,
            exit: None,
            outputs: BTreeMap::new(),
            message: Some(message),
        })
    }

    /// Persist the state name and status line, and announce the change.
    async fn publish(&self) -> Result<()> {
        process::publish_state(
            &self.shared,
            self.pk,
            self.checkpoint.machine.state(),
            self.checkpoint.machine.status_line(),
        )
        .await
    }

    /// Update only the status line attribute from the machine.
    async fn set_status_line(&self) -> Result<()> {
        match self.checkpoint.machine.status_line() {
            Some(line) => {
                self.shared
                    .store
                    .set_attribute(self.pk, attrs::PROCESS_STATUS, json!(line))
                    .await?;
            }
            None => {
                self.shared
                    .store
                    .delete_attribute(self.pk, attrs::PROCESS_STATUS)
                    .await?;
            }
        }
        Ok(())
    }

    fn broadcast_terminal(&self, state: ProcessState) {
        self.shared.bus.broadcast(provena_bus::ProcessEvent {
            pk: self.pk,
            state: state.as_str().to_string(),
            terminal: true,
        });
    }
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("pk", &self.pk)
            .field("class", &self.definition.identifier)
            .field("state", &self.checkpoint.machine.state())
            .finish()
    }
}

/// Rebuild the terminal summary of a process from its stored node, or
/// `None` when the process has not terminated.
pub async fn load_terminal_info(
    shared: &EngineShared,
    pk: Pk,
) -> Result<Option<TerminalInfo>> {
    let Some(state) = stored_state(shared.store.as_ref(), pk).await? else {
        return Ok(None);
    };
    if !state.is_terminal() {
        return Ok(None);
    }
    let node = shared.store.load_node(pk).await?;
    let message = node
        .attribute(attrs::EXCEPTION)
        .or_else(|| node.attribute(attrs::PROCESS_STATUS))
        .and_then(Value::as_str)
        .map(str::to_string);
    Ok(Some(TerminalInfo {
        pk,
        state,
        exit: stored_exit_code(shared.store.as_ref(), pk).await?,
        outputs: collect_outputs(shared.store.as_ref(), pk).await?,
        message,
    }))
}

/// Run one queued process to termination.
///
/// Every failure mode is absorbed: a missing node or an already-terminal
/// process drops the task, a reconstruction failure excepts the process,
/// and a duplicate subscriber means another worker owns it. The hosting
/// worker never dies because of one bad task.
pub async fn run_queued(shared: Arc<EngineShared>, pk: Pk) {
    match stored_state(shared.store.as_ref(), pk).await {
        Ok(Some(state)) if state.is_terminal() => {
            debug!(pk, state = %state, "dropping task for terminal process");
            return;
        }
        Ok(_) => {}
        Err(err) => {
            warn!(pk, error = %err, "dropping task: process node unavailable");
            return;
        }
    }

    match Driver::restore(shared.clone(), pk).await {
        Ok(driver) => {
            if let Err(err) = driver.run().await {
                warn!(pk, error = %err, "driver failed");
            }
        }
        Err(EngineError::Bus(BusError::DuplicateSubscriber { .. })) => {
            warn!(pk, "dropping task: process already owned by another worker");
        }
        Err(err @ (EngineError::Reconstruction { .. }
        | EngineError::IncompatibleCheckpoint { .. }
        | EngineError::NotExistent { .. })) => {
            warn!(pk, error = %err, "reconstruction failed, excepting process");
            if let Err(err) = except_in_store(shared.as_ref(), pk, &err.to_string()).await {
                warn!(pk, error = %err, "failed to record reconstruction failure");
            }
        }
        Err(err) => {
            warn!(pk, error = %err, "failed to restore process");
        }
    }
}

/// Force a process to `EXCEPTED` purely through the store, for processes
/// that cannot even be reconstructed into a driver.
async fn except_in_store(shared: &EngineShared, pk: Pk, message: &str) -> Result<()> {
    shared
        .store
        .set_attribute(pk, attrs::EXCEPTION, json!(message))
        .await?;
    shared
        .store
        .set_attribute(
            pk,
            attrs::PROCESS_STATE,
            json!(ProcessState::Excepted.as_str()),
        )
        .await?;
    shared
        .store
        .append_log(pk, LogLevel::Error, message)
        .await?;
    shared.store.delete_attribute(pk, attrs::CHECKPOINT).await?;
    shared.store.seal(pk).await?;
    shared.bus.broadcast(provena_bus::ProcessEvent {
        pk,
        state: ProcessState::Excepted.as_str().to_string(),
        terminal: true,
    });
    Ok(())
}
