// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Message types and the [`MessageBus`] trait.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::warn;

use crate::error::BusError;

/// Primary key of a process node, as carried on the bus.
pub type Pk = u64;

/// Control verbs routed to whichever worker owns a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Stop advancing the process at the next tick boundary.
    Pause {
        /// Human-readable reason, mirrored into the process status.
        reason: Option<String>,
    },
    /// Clear the pause flag and resume ticking.
    Play,
    /// Terminate the process; beats pause at every decision point.
    Kill {
        /// Human-readable reason recorded on the node.
        message: Option<String>,
    },
    /// Query the current state.
    Status,
}

/// Reply to a [`ControlMessage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlReply {
    /// Whether the verb changed anything (false = already in target state).
    Applied(bool),
    /// State tag in response to [`ControlMessage::Status`].
    Status {
        /// Lowercase process state name.
        state: String,
    },
}

/// Broadcast event emitted on every persisted state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEvent {
    /// The process that changed.
    pub pk: Pk,
    /// Lowercase process state name after the change.
    pub state: String,
    /// Whether the new state is terminal.
    pub terminal: bool,
}

/// The minimal payload placed on the durable work queue to (re)start a
/// process on any available worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMessage {
    /// The process to continue.
    pub process_pk: Pk,
    /// Optional routing/debugging tag.
    pub tag: Option<String>,
}

/// One in-flight control request delivered to a subscriber.
#[derive(Debug)]
pub struct RpcRequest {
    /// The control verb.
    pub message: ControlMessage,
    reply: Option<oneshot::Sender<ControlReply>>,
}

impl RpcRequest {
    /// Create a request/reply pair. Used by bus backends.
    pub fn new(message: ControlMessage) -> (Self, oneshot::Receiver<ControlReply>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                message,
                reply: Some(tx),
            },
            rx,
        )
    }

    /// Send the reply back to the caller.
    pub fn respond(mut self, reply: ControlReply) {
        if let Some(tx) = self.reply.take()
            && tx.send(reply).is_err()
        {
            // Caller gave up (timeout); nothing left to do.
            warn!("control reply dropped: caller no longer waiting");
        }
    }
}

/// Exclusive RPC subscription for one process.
///
/// Dropping the subscription deregisters the pk, allowing another worker to
/// claim it.
pub struct RpcSubscription {
    pk: Pk,
    receiver: mpsc::UnboundedReceiver<RpcRequest>,
    _guard: SubscriptionGuard,
}

/// RAII deregistration hook, runs on drop.
struct SubscriptionGuard(Option<Box<dyn FnOnce() + Send + Sync>>);

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(unregister) = self.0.take() {
            unregister();
        }
    }
}

impl RpcSubscription {
    /// Assemble a subscription from its parts. Used by bus backends.
    pub fn new(
        pk: Pk,
        receiver: mpsc::UnboundedReceiver<RpcRequest>,
        unregister: Box<dyn FnOnce() + Send + Sync>,
    ) -> Self {
        Self {
            pk,
            receiver,
            _guard: SubscriptionGuard(Some(unregister)),
        }
    }

    /// The subscribed process.
    pub fn pk(&self) -> Pk {
        self.pk
    }

    /// Wait for the next control request. `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<RpcRequest> {
        self.receiver.recv().await
    }

    /// Non-blocking poll for a pending control request.
    pub fn try_recv(&mut self) -> Option<RpcRequest> {
        self.receiver.try_recv().ok()
    }
}

impl std::fmt::Debug for RpcSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcSubscription").field("pk", &self.pk).finish()
    }
}

/// Message bus interface consumed by the engine.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Claim exclusive control-message ownership of a process.
    ///
    /// Fails with [`BusError::DuplicateSubscriber`] if another subscription
    /// for the same pk is alive.
    fn register_rpc(&self, pk: Pk) -> Result<RpcSubscription, BusError>;

    /// Send a control verb to the process's subscriber and await the reply.
    async fn send_rpc(
        &self,
        pk: Pk,
        message: ControlMessage,
        timeout: Duration,
    ) -> Result<ControlReply, BusError>;

    /// Publish a state-change event to all subscribers.
    fn broadcast(&self, event: ProcessEvent);

    /// Subscribe to state-change events.
    fn subscribe(&self) -> broadcast::Receiver<ProcessEvent>;

    /// Append a task to the durable work queue.
    async fn push_task(&self, task: TaskMessage) -> Result<(), BusError>;

    /// Wait for the next task. Workers pull from here.
    async fn pop_task(&self) -> Result<TaskMessage, BusError>;

    /// Non-blocking task pull.
    fn try_pop_task(&self) -> Option<TaskMessage>;

    /// Snapshot of all queued tasks, in queue order.
    ///
    /// Only meaningful while no worker is consuming the queue; the repair
    /// operation relies on that quiescence.
    fn snapshot_tasks(&self) -> Vec<TaskMessage>;

    /// Remove the first queued task equal to `task`. Returns whether one
    /// was removed.
    fn remove_task(&self, task: &TaskMessage) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_message_roundtrip() {
        let task = TaskMessage {
            process_pk: 17,
            tag: Some("resubmit".to_string()),
        };
        let encoded = serde_json::to_string(&task).unwrap();
        let decoded: TaskMessage = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, task);
    }

    #[tokio::test]
    async fn test_rpc_request_reply() {
        let (request, rx) = RpcRequest::new(ControlMessage::Play);
        assert_eq!(request.message, ControlMessage::Play);
        request.respond(ControlReply::Applied(true));
        assert_eq!(rx.await.unwrap(), ControlReply::Applied(true));
    }

    #[test]
    fn test_respond_without_waiter_does_not_panic() {
        let (request, rx) = RpcRequest::new(ControlMessage::Status);
        drop(rx);
        request.respond(ControlReply::Status {
            state: "running".to_string(),
        });
    }

    #[test]
    fn test_subscription_is_send_and_sync() {
        // Drivers hold their subscription across awaits inside spawned
        // tasks, so the subscription must be shareable between threads.
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<RpcSubscription>();
    }
}
