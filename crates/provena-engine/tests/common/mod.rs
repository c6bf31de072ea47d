// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for provena-engine integration tests.
//!
//! Provides a TestContext wiring an in-memory store and local bus to a
//! registry of small but representative process classes.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::{Value, json};

use provena_bus::LocalBus;
use provena_engine::calcjob::{
    CalcJobLogic, JobRunner, JobSnapshot, JobStatus, MonitorVerdict,
};
use provena_engine::config::EngineConfig;
use provena_engine::controller::Controller;
use provena_engine::exit_code::ExitCode;
use provena_engine::outline::{Outline, OutlineNode, arm};
use provena_engine::ports::{Port, ProcessSpec, ValidatedInputs, ValueKind};
use provena_engine::process::{EngineShared, attrs};
use provena_engine::registry::{
    FunctionKind, FunctionResult, PredicateFn, ProcessDefinition, ProcessLogic,
    ProcessRegistry, WorkChainLogic,
};
use provena_engine::runner::Runner;
use provena_engine::scope::{StepFn, StepOutcome, StepScope};
use provena_engine::state::ProcessState;
use provena_store::{EntityStore, InMemoryStore, Pk};

/// A scheduler stub driven by a scripted poll sequence.
///
/// Every call is recorded, so tests can assert the exact interaction.
/// Once the script runs dry, polls keep reporting `Queued`.
#[derive(Default)]
pub struct ScriptedJobRunner {
    polls: Mutex<Vec<JobStatus>>,
    pub calls: Mutex<Vec<String>>,
}

impl ScriptedJobRunner {
    pub fn with_polls(polls: Vec<JobStatus>) -> Self {
        Self {
            polls: Mutex::new(polls),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn recorded(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }
}

#[async_trait]
impl JobRunner for ScriptedJobRunner {
    async fn upload(&self, pk: Pk, _payload: &Value) -> anyhow::Result<()> {
        self.record(format!("upload:{pk}"));
        Ok(())
    }

    async fn submit(&self, pk: Pk, _payload: &Value) -> anyhow::Result<String> {
        self.record(format!("submit:{pk}"));
        Ok(format!("job-{pk}"))
    }

    async fn poll(&self, job_id: &str) -> anyhow::Result<JobStatus> {
        self.record(format!("poll:{job_id}"));
        let mut polls = self.polls.lock().unwrap();
        if polls.is_empty() {
            Ok(JobStatus::Queued)
        } else {
            Ok(polls.remove(0))
        }
    }

    async fn retrieve(&self, job_id: &str) -> anyhow::Result<Value> {
        self.record(format!("retrieve:{job_id}"));
        Ok(json!({"stdout": "42"}))
    }

    async fn kill(&self, job_id: &str) -> anyhow::Result<()> {
        self.record(format!("kill:{job_id}"));
        Ok(())
    }
}

/// In-memory engine with the full fixture registry.
pub struct TestContext {
    pub store: Arc<InMemoryStore>,
    pub bus: Arc<LocalBus>,
    pub jobs: Arc<ScriptedJobRunner>,
    pub shared: Arc<EngineShared>,
    pub runner: Runner,
    pub controller: Controller,
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default().with_poll_interval_ms(1))
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self::build(config, ScriptedJobRunner::default())
    }

    pub fn with_jobs(jobs: ScriptedJobRunner) -> Self {
        Self::build(EngineConfig::default().with_poll_interval_ms(1), jobs)
    }

    fn build(config: EngineConfig, jobs: ScriptedJobRunner) -> Self {
        provena_engine::logging::init_subscriber();
        let store = Arc::new(InMemoryStore::new());
        let bus = Arc::new(LocalBus::new());
        let jobs = Arc::new(jobs);

        let registry = ProcessRegistry::new();
        register_fixtures(&registry);

        let shared = Arc::new(EngineShared {
            store: store.clone(),
            bus: bus.clone(),
            registry: Arc::new(registry),
            config,
            jobs: jobs.clone(),
        });
        Self {
            store,
            bus,
            jobs,
            runner: Runner::new(shared.clone()),
            controller: Controller::new(shared.clone()),
            shared,
        }
    }

    /// Poll the stored state of a node until it matches, or panic after a
    /// second.
    pub async fn await_state(&self, pk: Pk, wanted: ProcessState) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        loop {
            let state = self
                .store
                .get_attribute(pk, attrs::PROCESS_STATE)
                .await
                .unwrap()
                .and_then(|value| value.as_str().map(str::to_string));
            if state.as_deref() == Some(wanted.as_str()) {
                return;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("process {pk} never reached state '{wanted}', last seen {state:?}");
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }
}

fn step(body: impl for<'a> Fn(&'a mut StepScope) -> BoxFuture<'a, anyhow::Result<StepOutcome>>
        + Send
        + Sync
        + 'static) -> StepFn {
    Arc::new(body)
}

fn predicate(
    body: impl Fn(&provena_engine::context::WorkContext, &ValidatedInputs) -> bool
        + Send
        + Sync
        + 'static,
) -> PredicateFn {
    Arc::new(body)
}

fn int_input(value: Option<&Value>) -> i64 {
    value.and_then(Value::as_i64).unwrap_or(0)
}

/// `math.add`: the canonical cacheable calculation function.
fn math_add() -> ProcessDefinition {
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
                let sum = int_input(inputs.get("x")) + int_input(inputs.get("y"));
                let mut outputs = BTreeMap::new();
                outputs.insert("result".to_string(), json!(sum));
                Ok(FunctionResult::Outputs(outputs))
            }),
            cacheable: true,
        },
    }
}

/// `math.lossy`: declares an output it never produces.
fn math_lossy() -> ProcessDefinition {
    ProcessDefinition {
        identifier: "math.lossy".to_string(),
        version: 1,
        spec: ProcessSpec::builder()
            .input("x", Port::required(ValueKind::Int))
            .output("result", Port::required(ValueKind::Int))
            .build(),
        logic: ProcessLogic::Function {
            kind: FunctionKind::Calculation,
            func: Arc::new(|_| Ok(FunctionResult::Outputs(BTreeMap::new()))),
            cacheable: true,
        },
    }
}

/// `flow.add_many`: fans `math.add` children out over the input terms,
/// gathers their results from the context, and labels the total.
fn flow_add_many() -> ProcessDefinition {
    let outline = Outline::new()
        .step("fan_out")
        .step("gather")
        .if_(
            vec![arm("is_large", vec![OutlineNode::step("tag_large")])],
            vec![OutlineNode::step("tag_small")],
        )
        .step("finalize");

    let mut steps: BTreeMap<String, StepFn> = BTreeMap::new();
    steps.insert(
        "fan_out".to_string(),
        step(|scope| {
            Box::pin(async move {
                let terms: Vec<i64> = scope
                    .inputs()
                    .get("terms")
                    .and_then(Value::as_array)
                    .map(|terms| terms.iter().filter_map(Value::as_i64).collect())
                    .unwrap_or_default();
                for term in terms {
                    let child = scope
                        .submit("math.add", &json!({"x": term, "y": 0}))
                        .await?;
                    scope.append_to_context("children", child);
                }
                Ok(StepOutcome::Continue)
            })
        }),
    );
    steps.insert(
        "gather".to_string(),
        step(|scope| {
            Box::pin(async move {
                let sum: i64 = scope
                    .ctx()
                    .get("children")
                    .and_then(Value::as_array)
                    .map(|children| {
                        children
                            .iter()
                            .filter_map(|child| child["outputs"]["result"].as_i64())
                            .sum()
                    })
                    .unwrap_or(0);
                scope.ctx_mut().set("sum", json!(sum))?;
                Ok(StepOutcome::Continue)
            })
        }),
    );
    steps.insert(
        "tag_large".to_string(),
        step(|scope| {
            Box::pin(async move {
                scope.ctx_mut().set("label", json!("large"))?;
                scope.report("sum crossed the threshold").await?;
                Ok(StepOutcome::Continue)
            })
        }),
    );
    steps.insert(
        "tag_small".to_string(),
        step(|scope| {
            Box::pin(async move {
                scope.ctx_mut().set("label", json!("small"))?;
                Ok(StepOutcome::Continue)
            })
        }),
    );
    steps.insert(
        "finalize".to_string(),
        step(|scope| {
            Box::pin(async move {
                let sum = scope.ctx().get("sum").cloned().unwrap_or(json!(0));
                let label = scope.ctx().get("label").cloned().unwrap_or(json!(""));
                scope.out("sum", sum);
                scope.out("label", label);
                Ok(StepOutcome::Continue)
            })
        }),
    );

    let mut predicates: BTreeMap<String, PredicateFn> = BTreeMap::new();
    predicates.insert(
        "is_large".to_string(),
        predicate(|ctx, _| int_input(ctx.get("sum")) > 10),
    );

    ProcessDefinition {
        identifier: "flow.add_many".to_string(),
        version: 1,
        spec: ProcessSpec::builder()
            .input("terms", Port::required(ValueKind::List))
            .output("sum", Port::required(ValueKind::Int))
            .output("label", Port::required(ValueKind::Str))
            .build(),
        logic: ProcessLogic::WorkChain(WorkChainLogic {
            outline,
            steps,
            predicates,
        }),
    }
}

/// `flow.countdown`: a while loop decrementing a context counter.
fn flow_countdown() -> ProcessDefinition {
    let outline = Outline::new()
        .step("setup")
        .while_("remaining_positive", vec![OutlineNode::step("decrement")])
        .step("finalize");

    let mut steps: BTreeMap<String, StepFn> = BTreeMap::new();
    steps.insert(
        "setup".to_string(),
        step(|scope| {
            Box::pin(async move {
                let n = int_input(scope.inputs().get("n"));
                scope.ctx_mut().set("remaining", json!(n))?;
                scope.ctx_mut().set("ticks", json!(0))?;
                Ok(StepOutcome::Continue)
            })
        }),
    );
    steps.insert(
        "decrement".to_string(),
        step(|scope| {
            Box::pin(async move {
                let remaining = int_input(scope.ctx().get("remaining")) - 1;
                let ticks = int_input(scope.ctx().get("ticks")) + 1;
                scope.ctx_mut().set("remaining", json!(remaining))?;
                scope.ctx_mut().set("ticks", json!(ticks))?;
                Ok(StepOutcome::Continue)
            })
        }),
    );
    steps.insert(
        "finalize".to_string(),
        step(|scope| {
            Box::pin(async move {
                let ticks = scope.ctx().get("ticks").cloned().unwrap_or(json!(0));
                scope.out("iterations", ticks);
                Ok(StepOutcome::Continue)
            })
        }),
    );

    let mut predicates: BTreeMap<String, PredicateFn> = BTreeMap::new();
    predicates.insert(
        "remaining_positive".to_string(),
        predicate(|ctx, _| int_input(ctx.get("remaining")) > 0),
    );

    ProcessDefinition {
        identifier: "flow.countdown".to_string(),
        version: 1,
        spec: ProcessSpec::builder()
            .input("n", Port::required(ValueKind::Int))
            .output("iterations", Port::required(ValueKind::Int))
            .build(),
        logic: ProcessLogic::WorkChain(WorkChainLogic {
            outline,
            steps,
            predicates,
        }),
    }
}

/// `flow.bail`: returns early with a failure exit when asked to.
fn flow_bail() -> ProcessDefinition {
    let outline = Outline::new()
        .if_(
            vec![arm(
                "should_bail",
                vec![OutlineNode::Return {
                    exit: Some(ExitCode::failure(400, "bailed out")),
                }],
            )],
            vec![],
        )
        .step("finalize");

    let mut steps: BTreeMap<String, StepFn> = BTreeMap::new();
    steps.insert(
        "finalize".to_string(),
        step(|scope| {
            Box::pin(async move {
                scope.out("done", json!(true));
                Ok(StepOutcome::Continue)
            })
        }),
    );

    let mut predicates: BTreeMap<String, PredicateFn> = BTreeMap::new();
    predicates.insert(
        "should_bail".to_string(),
        predicate(|_, inputs| {
            inputs.get("bail").and_then(Value::as_bool).unwrap_or(false)
        }),
    );

    ProcessDefinition {
        identifier: "flow.bail".to_string(),
        version: 1,
        spec: ProcessSpec::builder()
            .input("bail", Port::required(ValueKind::Bool))
            .output("done", Port::optional(ValueKind::Bool))
            .build(),
        logic: ProcessLogic::WorkChain(WorkChainLogic {
            outline,
            steps,
            predicates,
        }),
    }
}

/// `flow.wait_child`: submits one `job.echo` calcjob and mirrors its
/// result. Used by control tests because it stays `WAITING` as long as
/// the scripted scheduler keeps the job queued.
fn flow_wait_child() -> ProcessDefinition {
    let outline = Outline::new().step("spawn").step("finalize");

    let mut steps: BTreeMap<String, StepFn> = BTreeMap::new();
    steps.insert(
        "spawn".to_string(),
        step(|scope| {
            Box::pin(async move {
                let text = scope.inputs().get("text").cloned().unwrap_or(json!(""));
                let child = scope.submit("job.echo", &json!({"text": text})).await?;
                scope.to_context("child", child);
                Ok(StepOutcome::Continue)
            })
        }),
    );
    steps.insert(
        "finalize".to_string(),
        step(|scope| {
            Box::pin(async move {
                let result = scope
                    .ctx()
                    .get("child")
                    .map(|child| child["outputs"]["result"].clone())
                    .unwrap_or(Value::Null);
                scope.out("result", result);
                Ok(StepOutcome::Continue)
            })
        }),
    );

    ProcessDefinition {
        identifier: "flow.wait_child".to_string(),
        version: 1,
        spec: ProcessSpec::builder()
            .input("text", Port::required(ValueKind::Str))
            .output("result", Port::required(ValueKind::Str))
            .build(),
        logic: ProcessLogic::WorkChain(WorkChainLogic {
            outline,
            steps,
            predicates: BTreeMap::new(),
        }),
    }
}

/// `flow.clobber`: appends a child result to a slot, then tries to assign
/// the same slot from a later step. The second placement must fail the
/// workchain instead of overwriting the accumulated list.
fn flow_clobber() -> ProcessDefinition {
    let outline = Outline::new()
        .step("collect")
        .step("replace")
        .step("finalize");

    let mut steps: BTreeMap<String, StepFn> = BTreeMap::new();
    steps.insert(
        "collect".to_string(),
        step(|scope| {
            Box::pin(async move {
                let child = scope.submit("math.add", &json!({"x": 1, "y": 2})).await?;
                scope.append_to_context("slot", child);
                Ok(StepOutcome::Continue)
            })
        }),
    );
    steps.insert(
        "replace".to_string(),
        step(|scope| {
            Box::pin(async move {
                let child = scope.submit("math.add", &json!({"x": 3, "y": 4})).await?;
                scope.to_context("slot", child);
                Ok(StepOutcome::Continue)
            })
        }),
    );
    steps.insert(
        "finalize".to_string(),
        step(|scope| {
            Box::pin(async move {
                let shape = match scope.ctx().get("slot") {
                    Some(Value::Array(_)) => "list",
                    Some(_) => "overwritten",
                    None => "empty",
                };
                scope.out("shape", json!(shape));
                Ok(StepOutcome::Continue)
            })
        }),
    );

    ProcessDefinition {
        identifier: "flow.clobber".to_string(),
        version: 1,
        spec: ProcessSpec::builder()
            .output("shape", Port::optional(ValueKind::Str))
            .build(),
        logic: ProcessLogic::WorkChain(WorkChainLogic {
            outline,
            steps,
            predicates: BTreeMap::new(),
        }),
    }
}

/// `job.echo`: a calcjob parsing the scheduler stdout into its result.
fn job_echo() -> ProcessDefinition {
    ProcessDefinition {
        identifier: "job.echo".to_string(),
        version: 1,
        spec: ProcessSpec::builder()
            .input("text", Port::required(ValueKind::Str))
            .output("result", Port::required(ValueKind::Str))
            .build(),
        logic: ProcessLogic::CalcJob(CalcJobLogic {
            prepare: Arc::new(|inputs: &ValidatedInputs| {
                Ok(json!({"text": inputs.get("text").cloned().unwrap_or(json!(""))}))
            }),
            parse: Arc::new(|retrieved: &Value, _| {
                let Some(stdout) = retrieved["stdout"].as_str() else {
                    anyhow::bail!("scheduler returned no stdout");
                };
                let mut outputs = BTreeMap::new();
                outputs.insert("result".to_string(), json!(stdout));
                Ok(FunctionResult::Outputs(outputs))
            }),
            monitors: Vec::new(),
            cacheable: false,
        }),
    }
}

/// `job.limited`: like `job.echo` but with a monitor that kills the job
/// after two polls, and a parse that reports the truncation.
fn job_limited() -> ProcessDefinition {
    ProcessDefinition {
        identifier: "job.limited".to_string(),
        version: 1,
        spec: ProcessSpec::builder()
            .input("text", Port::required(ValueKind::Str))
            .output("result", Port::optional(ValueKind::Str))
            .build(),
        logic: ProcessLogic::CalcJob(CalcJobLogic {
            prepare: Arc::new(|_| Ok(json!({}))),
            parse: Arc::new(|_, _| {
                Ok(FunctionResult::Exit(ExitCode::failure(
                    210,
                    "job was cut short",
                )))
            }),
            monitors: vec![Arc::new(|snapshot: &JobSnapshot| {
                if snapshot.polls >= 2 {
                    MonitorVerdict::Kill {
                        message: "poll budget exhausted".to_string(),
                    }
                } else {
                    MonitorVerdict::Continue
                }
            })],
            cacheable: false,
        }),
    }
}

fn register_fixtures(registry: &ProcessRegistry) {
    for definition in [
        math_add(),
        math_lossy(),
        flow_add_many(),
        flow_countdown(),
        flow_bail(),
        flow_wait_child(),
        flow_clobber(),
        job_echo(),
        job_limited(),
    ] {
        registry.register(definition).unwrap();
    }
}
