//! # Previously, on idxflow...
//!
//! 🎬 The documents needed somewhere to land that was not a cluster behind three
//! VPNs and a change-management ticket. Somewhere you could poke at in a test.
//! Somewhere that would tell you exactly how many times you called `refresh`.
//!
//! That somewhere is this module.
//!
//! `InMemoryBackend` behaves like an embedded index writer:
//! - writes land in the **written** view immediately,
//! - `flush` copies written → **committed** (durable),
//! - `refresh` copies written → **searchable** (visible to searches).
//!
//! Documents are keyed by identifier plus routing key, the same identity the plan
//! deduplicates on: `42` routed to `eu` and `42` routed to `us` are two documents.
//!
//! It also counts every call, can be told to reject specific documents (by
//! identifier, whatever the routing), and can hold writes hostage (`pause_writes`)
//! so backpressure tests don't rely on luck.
//! Clone it before handing it to the engine; every clone shares the same state.
//!
//! ⚠️ This is NOT for production. If you're deploying this to prod, please also
//! deploy a therapist. 🦆

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{Mutex, watch};
use tracing::{debug, trace};

use crate::backends::{
    DocumentWork, IndexBackend, IndexStatus, OperationOutcome, SequencedOperation,
};
use crate::capabilities::BackendDistribution;
use crate::reference::DocumentKey;
use crate::sequencing::OperationKind;

/// 🧪 Config for the in-memory backend. Pretending to be a managed service is allowed.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct InMemoryBackendConfig {
    #[serde(default)]
    pub distribution: Option<BackendDistribution>,
}

/// 📚 One in-memory index and its three views of the truth.
#[derive(Debug, Clone, PartialEq)]
pub struct InMemoryIndex {
    pub written: BTreeMap<DocumentKey, Value>,
    pub committed: BTreeMap<DocumentKey, Value>,
    pub searchable: BTreeMap<DocumentKey, Value>,
    pub open: bool,
    pub segments: usize,
    /// 📜 Every operation applied, in order: (kind, document identifier).
    pub log: Vec<(OperationKind, String)>,
}

impl Default for InMemoryIndex {
    fn default() -> Self {
        Self {
            written: BTreeMap::new(),
            committed: BTreeMap::new(),
            searchable: BTreeMap::new(),
            open: true,
            segments: 0,
            log: Vec::new(),
        }
    }
}

/// 📊 A snapshot of how many times each backend method was invoked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub writes: usize,
    pub operations: usize,
    pub flushes: usize,
    pub refreshes: usize,
    pub merges: usize,
    pub opens: usize,
    pub closes: usize,
    pub status_waits: usize,
    pub deletes_by_query: usize,
}

#[derive(Debug, Default)]
struct CallCounters {
    writes: AtomicUsize,
    operations: AtomicUsize,
    flushes: AtomicUsize,
    refreshes: AtomicUsize,
    merges: AtomicUsize,
    opens: AtomicUsize,
    closes: AtomicUsize,
    status_waits: AtomicUsize,
    deletes_by_query: AtomicUsize,
}

impl CallCounters {
    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::SeqCst);
    }

    fn snapshot(&self) -> CallCounts {
        CallCounts {
            writes: self.writes.load(Ordering::SeqCst),
            operations: self.operations.load(Ordering::SeqCst),
            flushes: self.flushes.load(Ordering::SeqCst),
            refreshes: self.refreshes.load(Ordering::SeqCst),
            merges: self.merges.load(Ordering::SeqCst),
            opens: self.opens.load(Ordering::SeqCst),
            closes: self.closes.load(Ordering::SeqCst),
            status_waits: self.status_waits.load(Ordering::SeqCst),
            deletes_by_query: self.deletes_by_query.load(Ordering::SeqCst),
        }
    }
}

#[derive(Debug)]
struct SharedState {
    indexes: Mutex<HashMap<String, InMemoryIndex>>,
    rejected_documents: Mutex<HashMap<String, String>>,
    calls: CallCounters,
    // 🚧 true = writes wait at the door
    writes_paused: watch::Sender<bool>,
}

/// 🧪 The in-process backend. Cheap to clone, shared state behind an `Arc`.
#[derive(Debug, Clone)]
pub struct InMemoryBackend {
    distribution: BackendDistribution,
    state: Arc<SharedState>,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new(BackendDistribution::InMemory)
    }
}

impl InMemoryBackend {
    /// 🚀 A fresh backend that claims to be `distribution`.
    pub fn new(distribution: BackendDistribution) -> Self {
        let (writes_paused, _) = watch::channel(false);
        Self {
            distribution,
            state: Arc::new(SharedState {
                indexes: Mutex::new(HashMap::new()),
                rejected_documents: Mutex::new(HashMap::new()),
                calls: CallCounters::default(),
                writes_paused,
            }),
        }
    }

    pub fn from_config(config: &InMemoryBackendConfig) -> Self {
        Self::new(config.distribution.unwrap_or(BackendDistribution::InMemory))
    }

    pub fn calls(&self) -> CallCounts {
        self.state.calls.snapshot()
    }

    /// 📸 Copy of an index's current state (default if it was never touched).
    pub async fn snapshot(&self, index: &str) -> InMemoryIndex {
        self.state.indexes.lock().await.get(index).cloned().unwrap_or_default()
    }

    /// 🙅 Make every future write of this document fail with `reason`.
    pub async fn reject_document(&self, identifier: impl Into<String>, reason: impl Into<String>) {
        self.state
            .rejected_documents
            .lock()
            .await
            .insert(identifier.into(), reason.into());
    }

    /// 🚧 Hold every write at the door until `resume_writes`.
    pub fn pause_writes(&self) {
        self.state.writes_paused.send_replace(true);
    }

    pub fn resume_writes(&self) {
        self.state.writes_paused.send_replace(false);
    }

    async fn wait_until_writes_allowed(&self) -> Result<()> {
        let mut paused = self.state.writes_paused.subscribe();
        paused
            .wait_for(|is_paused| !*is_paused)
            .await
            .context("💀 The write gate vanished while a write was waiting at it")?;
        Ok(())
    }

    fn apply(index: &mut InMemoryIndex, op: &SequencedOperation) {
        let key = op.reference.key();
        match &op.work {
            DocumentWork::Add(payload) | DocumentWork::Update(payload) => {
                index.written.insert(key.clone(), payload.as_json().clone());
            }
            DocumentWork::Delete => {
                index.written.remove(key);
            }
        }
        index.log.push((op.work.kind(), key.identifier.clone()));
    }

    /// 🔎 A very small query language: `match_all`, or `term` on a top-level field.
    fn matches(query: &Value, document: &Value) -> Result<bool> {
        if query.get("match_all").is_some() {
            return Ok(true);
        }
        if let Some(Value::Object(term)) = query.get("term") {
            let (field, expected) = term
                .iter()
                .next()
                .ok_or_else(|| {
                    anyhow!("💀 An empty 'term' query matches nothing and means nothing")
                })?;
            let expected = expected.get("value").unwrap_or(expected);
            return Ok(match document.get(field) {
                Some(Value::Array(values)) => values.contains(expected),
                Some(value) => value == expected,
                None => false,
            });
        }
        bail!(
            "💀 The in-memory backend only understands 'match_all' and 'term' queries, \
             got: {query}"
        )
    }
}

#[async_trait]
impl IndexBackend for InMemoryBackend {
    fn distribution(&self) -> BackendDistribution {
        self.distribution
    }

    async fn write(
        &self,
        index: &str,
        batch: &[SequencedOperation],
    ) -> Result<Vec<OperationOutcome>> {
        CallCounters::bump(&self.state.calls.writes);
        self.wait_until_writes_allowed().await?;
        self.state
            .calls
            .operations
            .fetch_add(batch.len(), Ordering::SeqCst);

        let rejected = self.state.rejected_documents.lock().await.clone();
        let mut indexes = self.state.indexes.lock().await;
        let target = indexes.entry(index.to_string()).or_default();
        if !target.open {
            bail!(
                "💀 Index '{index}' is closed. \
                 Writes bounce off it like mail off a boarded-up house."
            );
        }

        let outcomes = batch
            .iter()
            .map(|op| match rejected.get(op.reference.identifier()) {
                Some(reason) => Err(anyhow!(
                    "💀 Document '{}' was rejected by index '{}': {}",
                    op.reference.identifier(),
                    index,
                    reason
                )),
                None => {
                    Self::apply(target, op);
                    Ok(())
                }
            })
            .collect();
        trace!("🧪 In-memory index '{}' absorbed a batch of {}", index, batch.len());
        Ok(outcomes)
    }

    async fn flush(&self, index: &str) -> Result<()> {
        CallCounters::bump(&self.state.calls.flushes);
        let mut indexes = self.state.indexes.lock().await;
        let target = indexes.entry(index.to_string()).or_default();
        target.committed = target.written.clone();
        target.segments += 1;
        debug!("💾 In-memory index '{}' committed {} documents", index, target.committed.len());
        Ok(())
    }

    async fn refresh(&self, index: &str) -> Result<()> {
        CallCounters::bump(&self.state.calls.refreshes);
        let mut indexes = self.state.indexes.lock().await;
        let target = indexes.entry(index.to_string()).or_default();
        target.searchable = target.written.clone();
        Ok(())
    }

    async fn merge_segments(&self, index: &str) -> Result<()> {
        CallCounters::bump(&self.state.calls.merges);
        let mut indexes = self.state.indexes.lock().await;
        let target = indexes.entry(index.to_string()).or_default();
        target.segments = target.segments.min(1);
        Ok(())
    }

    async fn open_index(&self, index: &str) -> Result<()> {
        CallCounters::bump(&self.state.calls.opens);
        self.state.indexes.lock().await.entry(index.to_string()).or_default().open = true;
        Ok(())
    }

    async fn close_index(&self, index: &str) -> Result<()> {
        CallCounters::bump(&self.state.calls.closes);
        self.state.indexes.lock().await.entry(index.to_string()).or_default().open = false;
        Ok(())
    }

    async fn wait_for_status(
        &self,
        index: &str,
        status: IndexStatus,
        timeout: Duration,
    ) -> Result<()> {
        CallCounters::bump(&self.state.calls.status_waits);
        let current = match self.state.indexes.lock().await.get(index) {
            Some(target) if !target.open => IndexStatus::Red,
            _ => IndexStatus::Green,
        };
        if current >= status {
            return Ok(());
        }
        // ⏳ nothing in here ever changes health on its own; wait out the clock, then give up
        tokio::time::sleep(timeout).await;
        bail!("💀 Index '{index}' stayed '{current}' for {timeout:?}; wanted at least '{status}'")
    }

    async fn delete_by_query(&self, index: &str, query: &Value) -> Result<u64> {
        CallCounters::bump(&self.state.calls.deletes_by_query);
        let mut indexes = self.state.indexes.lock().await;
        let target = indexes.entry(index.to_string()).or_default();
        let mut doomed = Vec::new();
        for (key, document) in &target.written {
            if Self::matches(query, document)? {
                doomed.push(key.clone());
            }
        }
        for key in &doomed {
            target.written.remove(key);
            target.log.push((OperationKind::Delete, key.identifier.clone()));
        }
        Ok(doomed.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::DocumentState;
    use crate::reference::DocumentReference;
    use serde_json::json;

    fn add(id: &str, title: &str) -> SequencedOperation {
        let mut doc = DocumentState::new();
        doc.add_value("title", title);
        SequencedOperation {
            reference: DocumentReference::new(id, None, "Book", json!(id)),
            work: DocumentWork::Add(doc.into_payload()),
        }
    }

    fn delete(id: &str) -> SequencedOperation {
        SequencedOperation {
            reference: DocumentReference::new(id, None, "Book", json!(id)),
            work: DocumentWork::Delete,
        }
    }

    #[tokio::test]
    async fn the_one_where_writes_are_invisible_until_refresh() -> Result<()> {
        let backend = InMemoryBackend::default();
        backend.write("books", &[add("1", "Dune")]).await?;

        let before = backend.snapshot("books").await;
        assert_eq!(before.written.len(), 1);
        assert!(before.searchable.is_empty(), "no refresh, no visibility");
        assert!(before.committed.is_empty(), "no flush, no durability");

        backend.refresh("books").await?;
        backend.flush("books").await?;
        let after = backend.snapshot("books").await;
        assert_eq!(after.searchable.len(), 1);
        assert_eq!(after.committed.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_one_bad_document_does_not_sink_the_batch() -> Result<()> {
        let backend = InMemoryBackend::default();
        backend.reject_document("2", "mapper_parsing_exception").await;

        let outcomes = backend
            .write("books", &[add("1", "Dune"), add("2", "Emma"), add("3", "Ulysses")])
            .await?;

        assert!(outcomes[0].is_ok());
        assert!(outcomes[1].is_err());
        assert!(outcomes[2].is_ok());
        assert_eq!(backend.snapshot("books").await.written.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_closed_index_refuses_writes() -> Result<()> {
        let backend = InMemoryBackend::default();
        backend.close_index("books").await?;
        assert!(backend.write("books", &[add("1", "Dune")]).await.is_err());
        backend.open_index("books").await?;
        assert!(backend.write("books", &[add("1", "Dune")]).await.is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_delete_by_query_takes_out_matching_documents() -> Result<()> {
        let backend = InMemoryBackend::default();
        backend
            .write("books", &[add("1", "Dune"), add("2", "Emma"), add("3", "Dune")])
            .await?;

        let deleted = backend
            .delete_by_query("books", &json!({"term": {"title": "Dune"}}))
            .await?;
        assert_eq!(deleted, 2);
        assert_eq!(
            backend.snapshot("books").await.written.keys().collect::<Vec<_>>(),
            vec![&DocumentKey::unrouted("2")]
        );

        backend.write("books", &[delete("2")]).await?;
        assert!(backend.snapshot("books").await.written.is_empty());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_a_closed_index_never_turns_green() {
        let backend = InMemoryBackend::default();
        backend.close_index("books").await.expect("closing is infallible here");
        let result = backend
            .wait_for_status("books", IndexStatus::Yellow, Duration::from_secs(5))
            .await;
        assert!(result.is_err());
        assert_eq!(backend.calls().status_waits, 1);
    }

    #[tokio::test]
    async fn the_one_where_routing_keeps_same_id_documents_apart() -> Result<()> {
        let backend = InMemoryBackend::default();
        let routed = |routing: &str, title: &str| {
            let mut doc = DocumentState::new();
            doc.add_value("title", title);
            SequencedOperation {
                reference: DocumentReference::new("42", Some(routing.into()), "Book", json!(42)),
                work: DocumentWork::Add(doc.into_payload()),
            }
        };
        backend.write("books", &[routed("eu", "Dune"), routed("us", "Emma")]).await?;

        let index = backend.snapshot("books").await;
        assert_eq!(index.written.len(), 2, "same identifier, different routing, two documents");
        assert_eq!(
            index.written.get(&DocumentKey::routed("42", "eu")),
            Some(&json!({"title": "Dune"}))
        );
        assert_eq!(
            index.written.get(&DocumentKey::routed("42", "us")),
            Some(&json!({"title": "Emma"}))
        );
        assert!(!index.written.contains_key(&DocumentKey::unrouted("42")));
        Ok(())
    }
}
