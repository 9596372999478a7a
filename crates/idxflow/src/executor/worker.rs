//! 🎬 *[a queue fills with operations. somewhere, a worker waits.]*
//! *[the clock on the wall reads 2:47am.]*
//!
//! 🧵 The IndexWorker — drains one queue, batches what it finds, and writes it.
//! It asks no questions. It does not know what a plan is. It knows operations,
//! and it knows who is waiting for them.
//!
//! 🔄 One turn of the loop:
//! 1. wait for one operation (or the end of the world, i.e. a closed queue);
//! 2. grab whatever else is already waiting, up to `max_bulk_size`;
//! 3. one backend `write` for the lot;
//! 4. one `flush` if anyone in the batch asked for a commit, one `refresh` if anyone
//!    asked for visibility;
//! 5. hand every waiting completion its own outcome.
//!
//! 🦆 The worker never returns an error for a backend failure. Those belong to the
//! completions. The worker's own `Result` is for the worker dying, which it doesn't.

use std::sync::Arc;

use anyhow::{Result, anyhow};
use async_channel::Receiver;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::QueuedOperation;
use crate::backends::{BackendHandle, IndexBackend, OperationOutcome, SequencedOperation};
use crate::sync::{CommitMode, RefreshMode, SyncPlan};

/// 🏗️ A background worker, that does work. duh.
pub(crate) trait Worker {
    fn start(self) -> JoinHandle<Result<()>>;
}

/// 🧵 Drains one queue of one index.
#[derive(Debug)]
pub(crate) struct IndexWorker {
    index: String,
    queue_number: usize,
    rx: Receiver<QueuedOperation>,
    backend: Arc<BackendHandle>,
    max_bulk_size: usize,
}

impl IndexWorker {
    pub(crate) fn new(
        index: String,
        queue_number: usize,
        rx: Receiver<QueuedOperation>,
        backend: Arc<BackendHandle>,
        max_bulk_size: usize,
    ) -> Self {
        Self {
            index,
            queue_number,
            rx,
            backend,
            max_bulk_size,
        }
    }

    /// 🪣 Block for the first operation, then take what is already there.
    async fn next_batch(&self) -> Option<Vec<QueuedOperation>> {
        let first = self.rx.recv().await.ok()?;
        let mut batch = Vec::with_capacity(self.max_bulk_size.min(self.rx.len() + 1));
        batch.push(first);
        while batch.len() < self.max_bulk_size {
            match self.rx.try_recv() {
                Ok(queued) => batch.push(queued),
                Err(_) => break,
            }
        }
        Some(batch)
    }

    async fn process(&self, batch: Vec<QueuedOperation>) {
        let mut operations = Vec::with_capacity(batch.len());
        let mut waiting: Vec<(SyncPlan, oneshot::Sender<OperationOutcome>)> =
            Vec::with_capacity(batch.len());
        for queued in batch {
            operations.push(queued.operation);
            waiting.push((queued.sync, queued.done));
        }

        let mut outcomes = match self.backend.write(&self.index, &operations).await {
            Ok(outcomes) if outcomes.len() == operations.len() => outcomes,
            Ok(outcomes) => {
                let err = anyhow!(
                    "💀 The backend returned {} outcomes for {} operations on '{}'",
                    outcomes.len(),
                    operations.len(),
                    self.index
                );
                self.fail_all(&operations, &err)
            }
            Err(err) => {
                warn!(
                    "💀 Bulk write of {} operation(s) to '{}' failed: {:#}",
                    operations.len(),
                    self.index,
                    err
                );
                self.fail_all(&operations, &err)
            }
        };

        let wants_commit = waiting
            .iter()
            .zip(&outcomes)
            .any(|((sync, _), outcome)| sync.commit == CommitMode::Force && outcome.is_ok());
        if wants_commit {
            if let Err(err) = self.backend.flush(&self.index).await {
                warn!("💀 Flush of '{}' after a batch failed: {:#}", self.index, err);
                let asked = |sync: &SyncPlan| sync.commit == CommitMode::Force;
                Self::fail_where(&mut outcomes, &waiting, asked, "flush", &err);
            }
        }

        let wants_refresh = waiting
            .iter()
            .zip(&outcomes)
            .any(|((sync, _), outcome)| sync.refresh == RefreshMode::Force && outcome.is_ok());
        if wants_refresh {
            if let Err(err) = self.backend.refresh(&self.index).await {
                warn!("💀 Refresh of '{}' after a batch failed: {:#}", self.index, err);
                let asked = |sync: &SyncPlan| sync.refresh == RefreshMode::Force;
                Self::fail_where(&mut outcomes, &waiting, asked, "refresh", &err);
            }
        }

        for ((_, done), outcome) in waiting.into_iter().zip(outcomes) {
            // 👻 a dropped receiver just means nobody is listening anymore
            let _ = done.send(outcome);
        }
    }

    /// 💀 anyhow errors don't clone, so every operation gets its own copy of the story.
    fn fail_all(
        &self,
        operations: &[SequencedOperation],
        err: &anyhow::Error,
    ) -> Vec<OperationOutcome> {
        operations
            .iter()
            .map(|op| {
                Err(anyhow!(
                    "💀 Writing document '{}' to '{}' failed with its whole batch: {:#}",
                    op.reference.identifier(),
                    self.index,
                    err
                ))
            })
            .collect()
    }

    fn fail_where(
        outcomes: &mut [OperationOutcome],
        waiting: &[(SyncPlan, oneshot::Sender<OperationOutcome>)],
        asked: impl Fn(&SyncPlan) -> bool,
        what: &str,
        err: &anyhow::Error,
    ) {
        for (outcome, (sync, _)) in outcomes.iter_mut().zip(waiting) {
            if outcome.is_ok() && asked(sync) {
                *outcome = Err(anyhow!(
                    "💀 The document was written but the {what} afterwards failed: {err:#}"
                ));
            }
        }
    }
}

impl Worker for IndexWorker {
    fn start(self) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            debug!(
                "📥 Worker {} for '{}' started draining its queue",
                self.queue_number, self.index
            );
            while let Some(batch) = self.next_batch().await {
                trace!(
                    "🪣 Worker {} for '{}' picked up {} operation(s)",
                    self.queue_number,
                    self.index,
                    batch.len()
                );
                self.process(batch).await;
            }
            debug!(
                "🏁 Worker {} for '{}': queue closed and empty. Going home.",
                self.queue_number, self.index
            );
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{DocumentWork, InMemoryBackend};
    use crate::document::DocumentState;
    use crate::reference::DocumentReference;
    use serde_json::json;

    fn queued(id: &str, sync: SyncPlan) -> (QueuedOperation, oneshot::Receiver<OperationOutcome>) {
        let mut doc = DocumentState::new();
        doc.add_value("id", id);
        let (done, rx) = oneshot::channel();
        (
            QueuedOperation {
                operation: SequencedOperation {
                    reference: DocumentReference::new(id, None, "Book", json!(id)),
                    work: DocumentWork::Add(doc.into_payload()),
                },
                sync,
                done,
            },
            rx,
        )
    }

    #[tokio::test]
    async fn the_one_where_one_batch_gets_one_write_and_one_refresh() -> Result<()> {
        let backend = InMemoryBackend::default();
        let (tx, rx) = async_channel::bounded(10);
        let read_sync = SyncPlan {
            commit: CommitMode::None,
            refresh: RefreshMode::Force,
            await_completion: true,
        };
        let mut receivers = Vec::new();
        for id in ["1", "2", "3"] {
            let (op, done) = queued(id, read_sync);
            tx.send(op).await?;
            receivers.push(done);
        }
        tx.close();

        let handle = Arc::new(BackendHandle::InMemory(backend.clone()));
        let worker = IndexWorker::new("books".into(), 0, rx, handle, 10);
        worker.start().await??;

        for done in receivers {
            done.await??;
        }
        let calls = backend.calls();
        assert_eq!(calls.writes, 1);
        assert_eq!(calls.operations, 3);
        assert_eq!(calls.refreshes, 1);
        assert_eq!(calls.flushes, 0);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_rejected_document_fails_alone() -> Result<()> {
        let backend = InMemoryBackend::default();
        backend.reject_document("2", "mapper_parsing_exception").await;
        let (tx, rx) = async_channel::bounded(10);
        let (first, first_done) = queued("1", SyncPlan::QUEUED);
        let (second, second_done) = queued("2", SyncPlan::QUEUED);
        tx.send(first).await?;
        tx.send(second).await?;
        tx.close();

        IndexWorker::new("books".into(), 0, rx, Arc::new(BackendHandle::InMemory(backend)), 10)
            .start()
            .await??;

        assert!(first_done.await?.is_ok());
        let err = second_done.await?.expect_err("doc 2 was rejected");
        assert!(format!("{err:#}").contains("mapper_parsing_exception"));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_bulk_size_caps_each_write() -> Result<()> {
        let backend = InMemoryBackend::default();
        let (tx, rx) = async_channel::bounded(10);
        let mut receivers = Vec::new();
        for id in ["1", "2", "3", "4", "5"] {
            let (op, done) = queued(id, SyncPlan::QUEUED);
            tx.send(op).await?;
            receivers.push(done);
        }
        tx.close();

        let handle = Arc::new(BackendHandle::InMemory(backend.clone()));
        IndexWorker::new("books".into(), 0, rx, handle, 2).start().await??;
        for done in receivers {
            done.await??;
        }
        assert_eq!(backend.calls().writes, 3, "2 + 2 + 1");
        Ok(())
    }
}
