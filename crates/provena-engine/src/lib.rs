// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Provena Engine - Provenance-Tracking Process Execution
//!
//! This crate executes processes - plain functions, outline-driven
//! workchains, and staged scheduler jobs - while recording every input,
//! output, and call relationship as nodes and links in an entity store.
//! Live execution state is checkpointed after every tick, so any worker
//! can resume any process after a crash.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           Callers                               │
//! │              (runner::Runner, controller::Controller)           │
//! └─────────────────────────────────────────────────────────────────┘
//!          │ run / submit                     │ pause / play / kill
//!          ▼                                  ▼
//! ┌───────────────────────┐       ┌───────────────────────────────┐
//! │     Task Queue        │       │        RPC Channel            │
//! │  (provena-bus)        │       │  one subscriber per process   │
//! └──────────┬────────────┘       └──────────────┬────────────────┘
//!            │ pop                                │
//!            ▼                                    ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      driver::Driver                             │
//! │   one tick at a time: function call, outline step/predicate,    │
//! │   or scheduler-job stage; checkpoint saved after every tick     │
//! └──────────┬──────────────────────────────────────────────────────┘
//!            │ nodes, links, attributes, logs
//!            ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Entity Store                                │
//! │                   (provena-store)                               │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Process State Machine
//!
//! ```text
//!                  ┌─────────┐
//!                  │ CREATED │
//!                  └────┬────┘
//!                       │ start
//!                       ▼
//!                  ┌─────────┐  wait   ┌─────────┐
//!       ┌──────────│ RUNNING │────────▶│ WAITING │
//!       │          └────┬────┘◀────────└────┬────┘
//!       │               │         resume    │
//!   finish              │ raise             │ kill
//!       │               ▼                   ▼
//!       ▼          ┌──────────┐       ┌────────┐
//! ┌──────────┐     │ EXCEPTED │       │ KILLED │
//! │ FINISHED │     └──────────┘       └────────┘
//! └──────────┘
//! ```
//!
//! Pausing is orthogonal to the state: a paused process keeps its state
//! and simply stops ticking until played or killed. All three terminal
//! states seal the node; sealed nodes accept no attribute mutations.
//!
//! # Terminal States
//!
//! | State | Meaning |
//! |-------|---------|
//! | `FINISHED` | Ran to completion; carries an exit code, zero or not |
//! | `EXCEPTED` | An unexpected error escaped the process logic |
//! | `KILLED` | Terminated on request, cascading to awaited children |
//!
//! # Control Verbs
//!
//! Control messages reach live processes over the bus RPC channel and are
//! total: applied to a terminal process they report "nothing changed"
//! rather than failing.
//!
//! | Verb | Effect |
//! |------|--------|
//! | `Pause` | Stop ticking after the current tick; checkpoint survives |
//! | `Play` | Resume ticking |
//! | `Kill` | Terminate; overrides pause, cascades to awaited children |
//! | `Status` | Report the current lifecycle state |
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `PROVENA_CACHING_ENABLED` | No | `false` | Reuse results of equivalent finished calculations |
//! | `PROVENA_RPC_TIMEOUT_MS` | No | `5000` | Control-verb reply deadline |
//! | `PROVENA_POLL_INTERVAL_MS` | No | `1000` | Scheduler-job poll interval |
//!
//! # Modules
//!
//! - [`config`]: Engine configuration from environment variables
//! - [`error`]: Error types with error code mapping
//! - [`logging`]: Tracing subscriber setup for embedding hosts
//! - [`state`]: The process lifecycle state machine
//! - [`exit_code`]: Structured exit codes for finished processes
//! - [`ports`]: Input/output port declarations and validation
//! - [`registry`]: Process class definitions and lookup
//! - [`outline`]: Declarative workchain control flow and its interpreter
//! - [`context`]: The mutable scratch context of a workchain
//! - [`scope`]: The capability surface handed to a running step
//! - [`calcjob`]: Staged scheduler-job execution and monitors
//! - [`process`]: Node instantiation and provenance plumbing
//! - [`persister`]: Checkpoint serialization on process nodes
//! - [`caching`]: Content-addressed reuse of finished calculations
//! - [`driver`]: The per-process execution loop
//! - [`runner`]: Caller-facing run and submit entry points
//! - [`controller`]: Remote control verbs, workers, and queue repair

#![deny(missing_docs)]

/// Content-addressed reuse of finished calculations.
pub mod caching;

/// Staged scheduler-job execution (upload, submit, wait, retrieve, parse).
pub mod calcjob;

/// Engine configuration loaded from environment variables.
pub mod config;

/// The mutable scratch context a workchain threads between steps.
pub mod context;

/// Remote control of processes, worker loops, and queue repair.
pub mod controller;

/// The per-process execution loop: ticks, control handling, finalization.
pub mod driver;

/// Error types for engine operations with error code mapping.
pub mod error;

/// Tracing subscriber setup for embedding hosts.
pub mod logging;

/// Structured exit codes recorded on finished processes.
pub mod exit_code;

/// Declarative workchain control flow and its resumable interpreter.
pub mod outline;

/// Checkpoint serialization, loading, and deletion on process nodes.
pub mod persister;

/// Input/output port declarations and validation.
pub mod ports;

/// Process instantiation and provenance plumbing shared by all flavors.
pub mod process;

/// Process class definitions, logic flavors, and the registry.
pub mod registry;

/// Caller-facing entry points: blocking runs, submission, terminal futures.
pub mod runner;

/// The capability surface handed to a workchain step while it runs.
pub mod scope;

/// The process lifecycle state machine with orthogonal pause.
pub mod state;
