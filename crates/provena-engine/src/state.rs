// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process lifecycle state machine.
//!
//! States and transitions:
//!
//! ```text
//!                  start            wait
//!   CREATED ────────────▶ RUNNING ◀──────▶ WAITING
//!                            │    resume      │
//!                            │                │
//!              finish/except/kill  finish/except/kill
//!                            │                │
//!                            ▼                ▼
//!                 FINISHED / EXCEPTED / KILLED   (terminal)
//! ```
//!
//! Pausing is orthogonal to the state: a paused process keeps its state and
//! simply stops being advanced until played. Control verbs are total on
//! terminal states (they succeed as no-ops) so that callers racing against
//! completion never observe an error. A kill always beats a pause: killing
//! a paused process terminates it without requiring play first.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::exit_code::ExitCode;
use provena_store::Pk;

/// The lifecycle state of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    /// Instantiated and validated, not yet advanced.
    Created,
    /// Actively being advanced by a worker.
    Running,
    /// Parked on an external condition (children, scheduler job, ack).
    Waiting,
    /// Completed with a structured [`ExitCode`] (success or failure).
    Finished,
    /// Terminated by an unhandled error.
    Excepted,
    /// Terminated by an explicit kill.
    Killed,
}

impl ProcessState {
    /// Whether this state is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Excepted | Self::Killed)
    }

    /// Lowercase state name, as stored in the `process_state` attribute.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Finished => "finished",
            Self::Excepted => "excepted",
            Self::Killed => "killed",
        }
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a `WAITING` process is parked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SuspendReason {
    /// Waiting for called sub-processes to reach a terminal state.
    AwaitingChildren {
        /// The outstanding children.
        pks: Vec<Pk>,
    },
    /// Waiting for a scheduler job to leave the queue.
    AwaitingJob,
    /// Waiting for an external acknowledgement.
    AwaitingRpcAck,
}

/// Per-process state machine driven by the engine.
///
/// Owns the state, the orthogonal pause flag, and the parked-on reason.
/// All mutation goes through transition methods; illegal transitions are
/// [`EngineError::InvalidOperation`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateMachine {
    state: ProcessState,
    paused: bool,
    pause_reason: Option<String>,
    /// Kill requested while the machine could not terminate immediately
    /// (e.g. children still being cancelled).
    pending_kill: Option<Option<String>>,
    suspend: Option<SuspendReason>,
}

impl StateMachine {
    /// A fresh machine in `CREATED`.
    pub fn new() -> Self {
        Self {
            state: ProcessState::Created,
            paused: false,
            pause_reason: None,
            pending_kill: None,
            suspend: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Whether the process is paused.
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// The recorded pause reason, if paused with one.
    pub fn pause_reason(&self) -> Option<&str> {
        self.pause_reason.as_deref()
    }

    /// Why the process is parked, when `WAITING`.
    pub fn suspend_reason(&self) -> Option<&SuspendReason> {
        self.suspend.as_ref()
    }

    /// Whether this machine has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// A kill that was requested but not yet serviced.
    pub fn pending_kill(&self) -> Option<&Option<String>> {
        self.pending_kill.as_ref()
    }

    /// Take a pending kill request out of the machine for servicing.
    pub fn take_pending_kill(&mut self) -> Option<Option<String>> {
        self.pending_kill.take()
    }

    /// Human-readable status line for the node's `process_status` attribute.
    pub fn status_line(&self) -> Option<String> {
        if self.paused {
            return Some(match &self.pause_reason {
                Some(reason) => format!("paused: {reason}"),
                None => "paused".to_string(),
            });
        }
        match &self.suspend {
            Some(SuspendReason::AwaitingChildren { pks }) => {
                let pks = pks
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ");
                Some(format!("waiting for child processes [{pks}]"))
            }
            Some(SuspendReason::AwaitingJob) => Some("waiting for scheduler job".to_string()),
            Some(SuspendReason::AwaitingRpcAck) => {
                Some("waiting for acknowledgement".to_string())
            }
            None => None,
        }
    }

    /// `CREATED` → `RUNNING`.
    pub fn start(&mut self) -> Result<()> {
        match self.state {
            ProcessState::Created => {
                self.state = ProcessState::Running;
                Ok(())
            }
            other => Err(EngineError::invalid_operation(format!(
                "cannot start a process in state '{other}'"
            ))),
        }
    }

    /// `RUNNING` → `WAITING`, recording why.
    pub fn wait(&mut self, reason: SuspendReason) -> Result<()> {
        match self.state {
            ProcessState::Running => {
                self.state = ProcessState::Waiting;
                self.suspend = Some(reason);
                Ok(())
            }
            other => Err(EngineError::invalid_operation(format!(
                "cannot suspend a process in state '{other}'"
            ))),
        }
    }

    /// `WAITING` → `RUNNING`, clearing the parked-on reason.
    pub fn resume(&mut self) -> Result<()> {
        match self.state {
            ProcessState::Waiting => {
                self.state = ProcessState::Running;
                self.suspend = None;
                Ok(())
            }
            other => Err(EngineError::invalid_operation(format!(
                "cannot resume a process in state '{other}'"
            ))),
        }
    }

    /// Any non-terminal state → `FINISHED`.
    pub fn finish(&mut self, exit: &ExitCode) -> Result<()> {
        if self.state.is_terminal() {
            return Err(EngineError::invalid_operation(format!(
                "cannot finish a process in terminal state '{}'",
                self.state
            )));
        }
        let _ = exit;
        self.state = ProcessState::Finished;
        self.suspend = None;
        self.paused = false;
        self.pause_reason = None;
        Ok(())
    }

    /// Any non-terminal state → `EXCEPTED`.
    ///
    /// Infallible: excepting is the fallback path and must always succeed.
    /// Excepting an already-terminal machine is a no-op.
    pub fn except(&mut self) {
        if !self.state.is_terminal() {
            self.state = ProcessState::Excepted;
            self.suspend = None;
            self.paused = false;
            self.pause_reason = None;
        }
    }

    /// Any non-terminal state → `KILLED`. No-op when already terminal.
    pub fn kill(&mut self) {
        if !self.state.is_terminal() {
            self.state = ProcessState::Killed;
            self.suspend = None;
            self.paused = false;
            self.pause_reason = None;
            self.pending_kill = None;
        }
    }

    /// Set the pause flag. Returns whether anything changed; pausing a
    /// terminal or already-paused process is a successful no-op.
    pub fn pause(&mut self, reason: Option<String>) -> bool {
        if self.state.is_terminal() || self.paused {
            return false;
        }
        self.paused = true;
        self.pause_reason = reason;
        true
    }

    /// Clear the pause flag. Returns whether anything changed.
    pub fn play(&mut self) -> bool {
        if self.state.is_terminal() || !self.paused {
            return false;
        }
        self.paused = false;
        self.pause_reason = None;
        true
    }

    /// Record a kill request for servicing at the next tick boundary.
    ///
    /// Returns whether the request was accepted (false on terminal states).
    /// The request is honored even while paused.
    pub fn request_kill(&mut self, message: Option<String>) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.pending_kill = Some(message);
        true
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}
