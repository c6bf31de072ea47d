// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process bus backend.
//!
//! Suitable for a single OS process hosting the runner, workers, and
//! callers. The task queue is "durable" relative to workers: tasks survive
//! worker drops and re-registration, not host crashes.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, broadcast, mpsc};
use tracing::debug;

use crate::error::BusError;
use crate::messages::{
    ControlMessage, ControlReply, MessageBus, Pk, ProcessEvent, RpcRequest, RpcSubscription,
    TaskMessage,
};

const BROADCAST_CAPACITY: usize = 256;

/// In-process [`MessageBus`] implementation.
pub struct LocalBus {
    handlers: Arc<Mutex<HashMap<Pk, mpsc::UnboundedSender<RpcRequest>>>>,
    events: broadcast::Sender<ProcessEvent>,
    tasks: Mutex<VecDeque<TaskMessage>>,
    task_ready: Notify,
}

impl LocalBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            handlers: Arc::new(Mutex::new(HashMap::new())),
            events,
            tasks: Mutex::new(VecDeque::new()),
            task_ready: Notify::new(),
        }
    }

    /// Number of queued tasks.
    pub fn task_count(&self) -> usize {
        self.queue().len()
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<TaskMessage>> {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    fn register_rpc(&self, pk: Pk) -> Result<RpcSubscription, BusError> {
        let mut handlers = self
            .handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if handlers.contains_key(&pk) {
            return Err(BusError::DuplicateSubscriber { pk });
        }
        let (tx, rx) = mpsc::unbounded_channel();
        handlers.insert(pk, tx);
        debug!(pk, "rpc subscriber registered");

        let map = Arc::clone(&self.handlers);
        Ok(RpcSubscription::new(
            pk,
            rx,
            Box::new(move || {
                map.lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .remove(&pk);
                debug!(pk, "rpc subscriber deregistered");
            }),
        ))
    }

    async fn send_rpc(
        &self,
        pk: Pk,
        message: ControlMessage,
        timeout: Duration,
    ) -> Result<ControlReply, BusError> {
        let sender = {
            let handlers = self
                .handlers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            handlers.get(&pk).cloned()
        };
        let sender = sender.ok_or(BusError::NoSubscriber { pk })?;

        let (request, reply_rx) = RpcRequest::new(message);
        sender
            .send(request)
            .map_err(|_| BusError::NoSubscriber { pk })?;

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(BusError::Closed),
            Err(_) => Err(BusError::Timeout {
                pk,
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    fn broadcast(&self, event: ProcessEvent) {
        // A send error only means nobody is listening right now.
        let _ = self.events.send(event);
    }

    fn subscribe(&self) -> broadcast::Receiver<ProcessEvent> {
        self.events.subscribe()
    }

    async fn push_task(&self, task: TaskMessage) -> Result<(), BusError> {
        self.queue().push_back(task);
        self.task_ready.notify_one();
        Ok(())
    }

    async fn pop_task(&self) -> Result<TaskMessage, BusError> {
        loop {
            if let Some(task) = self.try_pop_task() {
                return Ok(task);
            }
            self.task_ready.notified().await;
        }
    }

    fn try_pop_task(&self) -> Option<TaskMessage> {
        self.queue().pop_front()
    }

    fn snapshot_tasks(&self) -> Vec<TaskMessage> {
        self.queue().iter().cloned().collect()
    }

    fn remove_task(&self, task: &TaskMessage) -> bool {
        let mut tasks = self.queue();
        if let Some(position) = tasks.iter().position(|queued| queued == task) {
            tasks.remove(position);
            true
        } else {
            false
        }
    }
}
