// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Staged execution of external scheduler jobs.
//!
//! A calcjob advances through upload, submit, wait, retrieve, and parse
//! stages, exactly one stage transition per tick, with the current stage
//! persisted in the checkpoint. A worker crash therefore resumes at the
//! stage boundary instead of resubmitting the job. Interaction with the
//! actual scheduler is abstracted behind [`JobRunner`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use provena_store::Pk;

use crate::ports::ValidatedInputs;
use crate::registry::FunctionResult;

/// Where a calcjob currently is in its staged lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStage {
    /// Input files are being placed on the target resource.
    Upload,
    /// The job is being handed to the scheduler.
    Submit,
    /// The job is queued or running; polled until it leaves the queue.
    Wait {
        /// Scheduler-assigned job id.
        job_id: String,
        /// Completed polls, for monitor bookkeeping.
        polls: u32,
    },
    /// The job left the queue; results are being fetched.
    Retrieve {
        /// Scheduler-assigned job id.
        job_id: String,
    },
    /// Retrieved data is being parsed into outputs.
    Parse {
        /// The raw retrieved payload.
        retrieved: Value,
    },
}

/// Scheduler-side job status, as reported by a poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// Still queued.
    Queued,
    /// Executing.
    Running,
    /// Left the queue; results can be retrieved.
    Done,
}

/// Interface to the external scheduler.
///
/// Implementations must be idempotent per stage where possible: `upload`
/// and `kill` may be retried after a crash, `submit` is called at most
/// once per process because the returned job id is checkpointed before
/// the stage advances.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Place input files on the target resource.
    async fn upload(&self, pk: Pk, payload: &Value) -> anyhow::Result<()>;

    /// Hand the job to the scheduler; returns the scheduler job id.
    async fn submit(&self, pk: Pk, payload: &Value) -> anyhow::Result<String>;

    /// Query the scheduler for the job's status.
    async fn poll(&self, job_id: &str) -> anyhow::Result<JobStatus>;

    /// Fetch the job's results.
    async fn retrieve(&self, job_id: &str) -> anyhow::Result<Value>;

    /// Remove the job from the scheduler.
    async fn kill(&self, job_id: &str) -> anyhow::Result<()>;
}

/// A job runner for engines without a scheduler. Every operation fails,
/// which excepts any calcjob that reaches it.
#[derive(Debug, Default)]
pub struct NullJobRunner;

#[async_trait]
impl JobRunner for NullJobRunner {
    async fn upload(&self, _pk: Pk, _payload: &Value) -> anyhow::Result<()> {
        anyhow::bail!("no job runner configured")
    }

    async fn submit(&self, _pk: Pk, _payload: &Value) -> anyhow::Result<String> {
        anyhow::bail!("no job runner configured")
    }

    async fn poll(&self, _job_id: &str) -> anyhow::Result<JobStatus> {
        anyhow::bail!("no job runner configured")
    }

    async fn retrieve(&self, _job_id: &str) -> anyhow::Result<Value> {
        anyhow::bail!("no job runner configured")
    }

    async fn kill(&self, _job_id: &str) -> anyhow::Result<()> {
        anyhow::bail!("no job runner configured")
    }
}

/// What a monitor sees on each poll.
#[derive(Debug, Clone)]
pub struct JobSnapshot {
    /// Scheduler-assigned job id.
    pub job_id: String,
    /// Completed polls so far.
    pub polls: u32,
}

/// A monitor's decision after inspecting a running job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorVerdict {
    /// Keep waiting.
    Continue,
    /// Kill the scheduler job and proceed to retrieval anyway.
    Kill {
        /// Reason recorded as a report on the process node.
        message: String,
    },
}

/// A job monitor, evaluated on every poll while the job is in the queue.
pub type MonitorFn = Arc<dyn Fn(&JobSnapshot) -> MonitorVerdict + Send + Sync>;

/// The executable logic of a calcjob class.
pub struct CalcJobLogic {
    /// Build the scheduler payload from validated inputs.
    pub prepare:
        Arc<dyn Fn(&ValidatedInputs) -> anyhow::Result<Value> + Send + Sync>,
    /// Turn retrieved data into outputs or an explicit exit.
    pub parse: Arc<
        dyn Fn(&Value, &ValidatedInputs) -> anyhow::Result<FunctionResult> + Send + Sync,
    >,
    /// Monitors evaluated on every poll.
    pub monitors: Vec<MonitorFn>,
    /// Opt-out from caching even when globally enabled.
    pub cacheable: bool,
}

impl std::fmt::Debug for CalcJobLogic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CalcJobLogic")
            .field("monitors", &self.monitors.len())
            .field("cacheable", &self.cacheable)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stage_serde_roundtrip() {
        let stages = vec![
            JobStage::Upload,
            JobStage::Submit,
            JobStage::Wait {
                job_id: "slurm-91".to_string(),
                polls: 3,
            },
            JobStage::Retrieve {
                job_id: "slurm-91".to_string(),
            },
            JobStage::Parse {
                retrieved: json!({"stdout": "42"}),
            },
        ];
        for stage in stages {
            let encoded = serde_json::to_string(&stage).unwrap();
            let decoded: JobStage = serde_json::from_str(&encoded).unwrap();
            assert_eq!(decoded, stage);
        }
    }

    #[tokio::test]
    async fn test_null_runner_always_fails() {
        let runner = NullJobRunner;
        assert!(runner.upload(1, &json!({})).await.is_err());
        assert!(runner.submit(1, &json!({})).await.is_err());
        assert!(runner.poll("x").await.is_err());
        assert!(runner.retrieve("x").await.is_err());
        assert!(runner.kill("x").await.is_err());
    }

    #[test]
    fn test_monitor_verdicts() {
        let limit: MonitorFn = Arc::new(|snapshot: &JobSnapshot| {
            if snapshot.polls >= 10 {
                MonitorVerdict::Kill {
                    message: "poll budget exhausted".to_string(),
                }
            } else {
                MonitorVerdict::Continue
            }
        });

        let young = JobSnapshot {
            job_id: "j".to_string(),
            polls: 2,
        };
        assert_eq!(limit(&young), MonitorVerdict::Continue);

        let old = JobSnapshot {
            job_id: "j".to_string(),
            polls: 10,
        };
        assert!(matches!(limit(&old), MonitorVerdict::Kill { .. }));
    }
}
