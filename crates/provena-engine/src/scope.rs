// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The scope handed to a workchain step while it runs.
//!
//! A step sees its inputs and the mutable context, and interacts with the
//! engine only through the scope: registering outputs, submitting child
//! processes, deferring child results into the context, and emitting
//! reports. Mutations are buffered in the scope and folded back into the
//! checkpoint by the driver after the step returns, so a step that fails
//! halfway leaves the persisted state untouched.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::debug;

use provena_bus::TaskMessage;
use provena_store::Pk;

use crate::context::{ContextAction, ContextRequest, WorkContext};
use crate::exit_code::ExitCode;
use crate::persister::Persister;
use crate::ports::ValidatedInputs;
use crate::process::{self, EngineShared};

/// What a step decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Proceed with the outline.
    Continue,
    /// Finish the whole workchain with this exit code.
    Exit(ExitCode),
}

/// The boxed future a step body returns.
pub type StepFuture<'a> = BoxFuture<'a, anyhow::Result<StepOutcome>>;

/// A registered step body.
pub type StepFn = Arc<dyn for<'a> Fn(&'a mut StepScope) -> StepFuture<'a> + Send + Sync>;

/// Everything a running step may touch.
pub struct StepScope {
    shared: Arc<EngineShared>,
    pk: Pk,
    ctx: WorkContext,
    inputs: ValidatedInputs,
    outputs: BTreeMap<String, Value>,
    requests: Vec<ContextRequest>,
    submitted: Vec<Pk>,
}

impl StepScope {
    /// Build a scope for one step execution. Driver-internal.
    pub(crate) fn new(
        shared: Arc<EngineShared>,
        pk: Pk,
        ctx: WorkContext,
        inputs: ValidatedInputs,
        outputs: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            shared,
            pk,
            ctx,
            inputs,
            outputs,
            requests: Vec::new(),
            submitted: Vec::new(),
        }
    }

    /// Tear the scope down into the pieces the driver folds back into the
    /// checkpoint.
    pub(crate) fn finish(self) -> ScopeResult {
        ScopeResult {
            ctx: self.ctx,
            outputs: self.outputs,
            requests: self.requests,
            submitted: self.submitted,
        }
    }

    /// The pk of the workchain this step belongs to.
    pub fn pk(&self) -> Pk {
        self.pk
    }

    /// The workchain's validated inputs.
    pub fn inputs(&self) -> &ValidatedInputs {
        &self.inputs
    }

    /// Read-only view of the context.
    pub fn ctx(&self) -> &WorkContext {
        &self.ctx
    }

    /// Mutable view of the context.
    pub fn ctx_mut(&mut self) -> &mut WorkContext {
        &mut self.ctx
    }

    /// Register an output under a dotted port path. Outputs accumulate
    /// across steps and are validated and linked at finalization.
    pub fn out(&mut self, path: impl Into<String>, value: Value) {
        self.outputs.insert(path.into(), value);
    }

    /// Submit a child process. The child is instantiated, linked to this
    /// workchain with a call link, checkpointed, and queued; it runs on
    /// whichever worker picks it up. After the step returns, the workchain
    /// waits for all children submitted during the step.
    pub async fn submit(
        &mut self,
        identifier: &str,
        inputs: &Value,
    ) -> anyhow::Result<Pk> {
        let (child_pk, definition, checkpoint) =
            process::instantiate(&self.shared, identifier, inputs).await?;

        self.shared
            .store
            .add_link(
                self.pk,
                child_pk,
                process::call_link_type(&definition.logic),
                &format!("call_{child_pk}"),
            )
            .await?;

        Persister::new(self.shared.store.clone())
            .save(child_pk, &checkpoint)
            .await?;
        self.shared
            .bus
            .push_task(TaskMessage {
                process_pk: child_pk,
                tag: None,
            })
            .await?;

        debug!(parent = self.pk, child = child_pk, identifier, "child submitted");
        self.submitted.push(child_pk);
        Ok(child_pk)
    }

    /// Place the child's result into the context slot once it terminates,
    /// overwriting whatever the slot holds.
    pub fn to_context(&mut self, path: impl Into<String>, child_pk: Pk) {
        self.requests.push(ContextRequest {
            path: path.into(),
            child_pk,
            action: ContextAction::Assign,
        });
    }

    /// Append the child's result to the list in the context slot once it
    /// terminates.
    pub fn append_to_context(&mut self, path: impl Into<String>, child_pk: Pk) {
        self.requests.push(ContextRequest {
            path: path.into(),
            child_pk,
            action: ContextAction::Append,
        });
    }

    /// Emit a report: logged and attached to the process node.
    pub async fn report(&self, message: &str) -> anyhow::Result<()> {
        process::report(self.shared.store.as_ref(), self.pk, message).await?;
        Ok(())
    }
}

impl std::fmt::Debug for StepScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepScope")
            .field("pk", &self.pk)
            .field("submitted", &self.submitted)
            .finish()
    }
}

/// The buffered effects of one step execution.
pub(crate) struct ScopeResult {
    pub ctx: WorkContext,
    pub outputs: BTreeMap<String, Value>,
    pub requests: Vec<ContextRequest>,
    pub submitted: Vec<Pk>,
}
