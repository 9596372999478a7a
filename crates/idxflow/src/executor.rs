//! 🏭 The per-index executor — a handful of bounded queues and one worker per queue.
//!
//! 🎬 *[a plan arrives. it is finalized. it is sequenced. it wants OUT.]*
//!
//! Each index gets its own `IndexExecutor`. Operations are routed to one of
//! `queue_count` bounded queues by hashing the routing key (or the identifier when
//! there is none), so every operation on one document lands in the same queue and
//! is applied in submission order. Each queue is drained by exactly one worker.
//!
//! 📐 Ordering: with one queue (the default) the backend sees operations in exactly
//! the order they were submitted, across documents too, which is what a plan's
//! first-touch order needs. With `queue_count > 1` the queues drain concurrently and
//! only per-document order survives; two documents of one plan may land in either
//! order. The executor logs a warning when started that way.
//!
//! 🚧 Backpressure is a submitter choice:
//! - `Blocking`: the submitting task waits for room. Nobody loses anything, everyone waits.
//! - `Rejecting`: a full queue fails the submission right away with `QueueFull`.
//!
//! 🧠 Knowledge graph:
//! - `resolve_sync` turns a `SynchronizationStrategy` into a `SyncPlan` BEFORE anything
//!   is queued, consulting the capability gate. Unsupported refresh under `Fail` never
//!   reaches the queue; under `Ignore` it is quietly downgraded.
//! - Each submission returns a `Completion` (a oneshot receiver) that resolves once
//!   the worker has written the batch and run whatever flush/refresh it asked for.
//! - The worker never dies on a backend error: the error is handed to the waiting
//!   completions and the worker goes back to draining.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::{Arc, Mutex};

use anyhow::{Context, anyhow};
use async_channel::{Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backends::{BackendHandle, IndexBackend, OperationOutcome, SequencedOperation};
use crate::capabilities::{AdminOperation, CapabilityGate, GateDecision, UnsupportedOperationPolicy};
use crate::error::IndexingError;
use crate::reference::DocumentKey;
use crate::sync::{CommitMode, RefreshMode, SyncPlan, SynchronizationStrategy};

mod worker;
use worker::{IndexWorker, Worker};

/// 🚧 What a submitter does when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationSubmitter {
    /// ⏳ Wait for room.
    #[default]
    Blocking,
    /// 🙅 Fail with `QueueFull`.
    Rejecting,
}

/// 🔧 Knobs for one executor. Zeroes are clamped to one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorSettings {
    pub queue_capacity: usize,
    pub queue_count: usize,
    pub max_bulk_size: usize,
    pub submitter: OperationSubmitter,
    pub unsupported_operations: UnsupportedOperationPolicy,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            queue_count: 1,
            max_bulk_size: 100,
            submitter: OperationSubmitter::default(),
            unsupported_operations: UnsupportedOperationPolicy::default(),
        }
    }
}

impl ExecutorSettings {
    /// 📐 Whether operations on different documents reach the backend in submission order.
    pub fn preserves_submission_order(&self) -> bool {
        self.queue_count <= 1
    }

    fn clamped(self) -> Self {
        Self {
            queue_capacity: self.queue_capacity.max(1),
            queue_count: self.queue_count.max(1),
            max_bulk_size: self.max_bulk_size.max(1),
            ..self
        }
    }
}

/// 📦 What actually travels through a queue: the operation, what to do after
/// writing it, and who to tell.
#[derive(Debug)]
pub(crate) struct QueuedOperation {
    pub(crate) operation: SequencedOperation,
    pub(crate) sync: SyncPlan,
    pub(crate) done: oneshot::Sender<OperationOutcome>,
}

/// 🎟️ A claim ticket for one submitted operation.
#[derive(Debug)]
pub struct Completion {
    receiver: oneshot::Receiver<OperationOutcome>,
}

impl Completion {
    /// ⏳ Resolves once the worker has written (and flushed/refreshed, if asked) the operation.
    pub async fn wait(self) -> OperationOutcome {
        match self.receiver.await {
            Ok(outcome) => outcome,
            Err(_) => Err(anyhow!(
                "💀 The worker went away before reporting on this operation. \
                 It did not leave a note."
            )),
        }
    }
}

/// 🏭 Queues plus workers for one index.
#[derive(Debug)]
pub struct IndexExecutor {
    index: String,
    backend: Arc<BackendHandle>,
    gate: CapabilityGate,
    settings: ExecutorSettings,
    queues: Vec<Sender<QueuedOperation>>,
    workers: Mutex<Vec<JoinHandle<anyhow::Result<()>>>>,
}

impl IndexExecutor {
    /// 🚀 Spawn one worker per queue. Must be called from inside a tokio runtime.
    pub fn start(
        index: impl Into<String>,
        backend: Arc<BackendHandle>,
        settings: ExecutorSettings,
    ) -> Self {
        let index = index.into();
        let settings = settings.clamped();
        let gate = CapabilityGate::new(backend.distribution(), settings.unsupported_operations);

        let mut queues = Vec::with_capacity(settings.queue_count);
        let mut workers = Vec::with_capacity(settings.queue_count);
        for queue_number in 0..settings.queue_count {
            let (tx, rx) = async_channel::bounded(settings.queue_capacity);
            let worker = IndexWorker::new(
                index.clone(),
                queue_number,
                rx,
                backend.clone(),
                settings.max_bulk_size,
            );
            queues.push(tx);
            workers.push(worker.start());
        }

        info!(
            "🏭 Executor for '{}' is up: {} queue(s) × capacity {}, bulk size {}, backend '{}'",
            index,
            settings.queue_count,
            settings.queue_capacity,
            settings.max_bulk_size,
            gate.distribution()
        );
        if !settings.preserves_submission_order() {
            warn!(
                "⚠️ '{}' runs {} queues: per-document order holds, order across documents does not",
                index, settings.queue_count
            );
        }

        Self {
            index,
            backend,
            gate,
            settings,
            queues,
            workers: Mutex::new(workers),
        }
    }

    pub fn index(&self) -> &str {
        &self.index
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    pub fn gate(&self) -> &CapabilityGate {
        &self.gate
    }

    pub fn backend(&self) -> &Arc<BackendHandle> {
        &self.backend
    }

    /// 📏 Operations currently waiting in the queues (not yet taken by a worker).
    pub fn queued(&self) -> usize {
        self.queues.iter().map(Sender::len).sum()
    }

    pub fn is_closed(&self) -> bool {
        self.queues.iter().all(Sender::is_closed)
    }

    /// 📋 Translate a strategy into what the workers must do, consulting the gate first.
    ///
    /// - commit is dropped when the backend is durable on acknowledgment;
    /// - an unsupported commit or refresh fails here under `Fail`, and is downgraded
    ///   under `Ignore`.
    pub fn resolve_sync(
        &self,
        strategy: SynchronizationStrategy,
    ) -> Result<SyncPlan, IndexingError> {
        let mut plan = strategy.plan();

        if plan.commit == CommitMode::Force {
            let needs_commit = self.gate.capabilities().commit_required;
            if !needs_commit || self.gate.check(AdminOperation::Flush)? == GateDecision::Skip {
                plan.commit = CommitMode::None;
            }
        }

        if plan.refresh == RefreshMode::Force
            && self.gate.check(AdminOperation::Refresh)? == GateDecision::Skip
        {
            warn!(
                "⚠️ '{}' cannot refresh index '{}'; '{:?}' will only wait for the write",
                self.gate.distribution(),
                self.index,
                strategy
            );
            plan.refresh = RefreshMode::None;
        }

        Ok(plan)
    }

    /// 📬 Submit with the configured submitter.
    pub async fn submit(
        &self,
        operation: SequencedOperation,
        sync: SyncPlan,
    ) -> Result<Completion, IndexingError> {
        self.submit_with(operation, sync, self.settings.submitter).await
    }

    /// 📬 Submit one operation to the queue its key hashes to.
    pub async fn submit_with(
        &self,
        operation: SequencedOperation,
        sync: SyncPlan,
        submitter: OperationSubmitter,
    ) -> Result<Completion, IndexingError> {
        let queue = &self.queues[self.queue_for(operation.reference.key())];
        let (done, receiver) = oneshot::channel();
        let queued = QueuedOperation { operation, sync, done };

        match submitter {
            OperationSubmitter::Blocking => {
                queue
                    .send(queued)
                    .await
                    .map_err(|_| IndexingError::ExecutorClosed {
                        index: self.index.clone(),
                    })?
            }
            OperationSubmitter::Rejecting => queue.try_send(queued).map_err(|err| match err {
                TrySendError::Full(_) => IndexingError::QueueFull {
                    index: self.index.clone(),
                    capacity: self.settings.queue_capacity,
                },
                TrySendError::Closed(_) => IndexingError::ExecutorClosed {
                    index: self.index.clone(),
                },
            })?,
        }

        Ok(Completion { receiver })
    }

    fn queue_for(&self, key: &DocumentKey) -> usize {
        if self.queues.len() == 1 {
            return 0;
        }
        let mut hasher = DefaultHasher::new();
        key.routing_key.as_deref().unwrap_or(&key.identifier).hash(&mut hasher);
        (hasher.finish() % self.queues.len() as u64) as usize
    }

    /// 🛑 Stop accepting work, let the workers drain what is queued, and join them.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        for queue in &self.queues {
            queue.close();
        }
        let workers = {
            let mut guard = self.workers.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::take(&mut *guard)
        };
        debug!("🛑 Waiting for {} worker(s) of '{}' to drain", workers.len(), self.index);
        for worker in workers {
            worker.await.with_context(|| {
                format!("💀 A worker for '{}' panicked on the way out", self.index)
            })??;
        }
        info!("🏁 Executor for '{}' shut down", self.index);
        Ok(())
    }
}
