// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Provena Bus - Messaging between the engine, its workers, and callers.
//!
//! Three channels, one crate:
//!
//! | Channel | Shape | Used for |
//! |---------|-------|----------|
//! | Control RPC | point-to-point, request/reply | pause / play / kill / status of one process |
//! | Broadcast | fan-out | state-change events (terminal states resolve waiters) |
//! | Task queue | durable, at-least-once | (re)starting a process on any available worker |
//!
//! The engine consumes the [`MessageBus`] trait; [`LocalBus`] is the
//! in-process backend. A worker that owns a process holds an
//! [`RpcSubscription`] for its pk; registration is exclusive, so a second
//! claim for the same pk fails with [`BusError::DuplicateSubscriber`] -
//! that failure is how duplicate task deliveries are detected and dropped.
//!
//! RPC sends carry a caller-chosen timeout. Exceeding it yields
//! [`BusError::Timeout`] without any guarantee the operation did not still
//! take effect (at-least-once, not exactly-once).

#![deny(missing_docs)]

/// Error types for bus operations.
pub mod error;

/// In-process bus backend.
pub mod local;

/// Message types and the [`MessageBus`] trait.
pub mod messages;

pub use error::BusError;
pub use local::LocalBus;
pub use messages::{
    ControlMessage, ControlReply, MessageBus, Pk, ProcessEvent, RpcRequest, RpcSubscription,
    TaskMessage,
};
