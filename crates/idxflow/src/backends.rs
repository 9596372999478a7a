//! 🔌 Backends — where the real I/O happens.
//!
//! The pipeline core never talks to a search engine directly. It talks to an
//! `IndexBackend`, which turns a finalized batch of document writes into whatever
//! the engine speaks (a `_bulk` NDJSON body, or a mutation of an in-process index),
//! and exposes the administrative knobs (flush, refresh, merge, open/close,
//! wait-for-status, delete-by-query).
//!
//! 🎭 This module is the casting agency. Need a real cluster? Elasticsearch and
//! OpenSearch, over HTTP. Need something you can assert against in a test without
//! docker-compose? The in-memory backend. Same trait, same enum dispatch.
//!
//! 🧠 Knowledge graph:
//! - Pattern: trait → concrete impls (`InMemoryBackend`, `ElasticsearchBackend`)
//!   → `BackendHandle` enum
//! - The backend does I/O. It does NOT check capabilities; the `CapabilityGate` in
//!   front of it does, so an unsupported call never reaches this layer.
//! - `write` returns one outcome per operation: one bad document must not fail its siblings.
//!   An outer `Err` means the whole request failed (network, auth, 5xx).

use std::fmt;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::app_config::BackendConfig;
use crate::capabilities::BackendDistribution;
use crate::document::DocumentPayload;
use crate::reference::DocumentReference;
use crate::sequencing::OperationKind;

pub mod elasticsearch;
pub mod in_mem;

pub use elasticsearch::{ElasticsearchBackend, ElasticsearchBackendConfig};
pub use in_mem::{InMemoryBackend, InMemoryBackendConfig, InMemoryIndex};

/// ✍️ A finalized, backend-ready write.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentWork {
    Add(DocumentPayload),
    Update(DocumentPayload),
    Delete,
}

impl DocumentWork {
    pub fn kind(&self) -> OperationKind {
        match self {
            DocumentWork::Add(_) => OperationKind::Add,
            DocumentWork::Update(_) => OperationKind::Update,
            DocumentWork::Delete => OperationKind::Delete,
        }
    }

    pub fn payload(&self) -> Option<&DocumentPayload> {
        match self {
            DocumentWork::Add(payload) | DocumentWork::Update(payload) => Some(payload),
            DocumentWork::Delete => None,
        }
    }
}

/// 📦 One operation out of a reduced plan, in the order it must be applied.
#[derive(Debug, Clone, PartialEq)]
pub struct SequencedOperation {
    pub reference: DocumentReference,
    pub work: DocumentWork,
}

/// ✅ or 💀, per operation.
pub type OperationOutcome = Result<()>;

/// 🚦 Cluster/index health levels for `wait_for_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexStatus {
    Red,
    Yellow,
    Green,
}

impl IndexStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            IndexStatus::Red => "red",
            IndexStatus::Yellow => "yellow",
            IndexStatus::Green => "green",
        }
    }
}

impl fmt::Display for IndexStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 🔌 A search backend, seen from the pipeline.
///
/// # Contract 📜
/// - `write` applies the batch in order and returns exactly one outcome per operation.
/// - ADD and UPDATE are both upserts: a missing document is created, an existing one replaced.
/// - Deleting a missing document is not an error.
/// - Administrative calls are only made after the capability gate said yes.
#[async_trait]
pub trait IndexBackend: fmt::Debug + Send + Sync {
    fn distribution(&self) -> BackendDistribution;

    async fn write(
        &self,
        index: &str,
        batch: &[SequencedOperation],
    ) -> Result<Vec<OperationOutcome>>;

    async fn flush(&self, index: &str) -> Result<()>;

    async fn refresh(&self, index: &str) -> Result<()>;

    async fn merge_segments(&self, index: &str) -> Result<()>;

    async fn open_index(&self, index: &str) -> Result<()>;

    async fn close_index(&self, index: &str) -> Result<()>;

    /// ⏱️ Wait until the index reaches `status`, failing rather than hanging past `timeout`.
    async fn wait_for_status(
        &self,
        index: &str,
        status: IndexStatus,
        timeout: Duration,
    ) -> Result<()>;

    /// 🗑️ Delete every document matching `query`; returns how many went away.
    async fn delete_by_query(&self, index: &str, query: &Value) -> Result<u64>;
}

/// 🎭 The many faces of a backend — enum dispatch, no vtables required.
#[derive(Debug)]
pub enum BackendHandle {
    InMemory(InMemoryBackend),
    Elasticsearch(ElasticsearchBackend),
}

impl BackendHandle {
    /// 🏗️ Build the configured backend. Remote backends connect (and maybe sniff) here.
    pub async fn from_config(config: &BackendConfig) -> Result<Self> {
        Ok(match config {
            BackendConfig::InMemory(in_mem_config) => {
                BackendHandle::InMemory(InMemoryBackend::from_config(in_mem_config))
            }
            BackendConfig::Elasticsearch(es_config) => {
                BackendHandle::Elasticsearch(ElasticsearchBackend::new(es_config.clone()).await?)
            }
        })
    }
}

#[async_trait]
impl IndexBackend for BackendHandle {
    fn distribution(&self) -> BackendDistribution {
        match self {
            BackendHandle::InMemory(b) => b.distribution(),
            BackendHandle::Elasticsearch(b) => b.distribution(),
        }
    }

    async fn write(
        &self,
        index: &str,
        batch: &[SequencedOperation],
    ) -> Result<Vec<OperationOutcome>> {
        match self {
            BackendHandle::InMemory(b) => b.write(index, batch).await,
            BackendHandle::Elasticsearch(b) => b.write(index, batch).await,
        }
    }

    async fn flush(&self, index: &str) -> Result<()> {
        match self {
            BackendHandle::InMemory(b) => b.flush(index).await,
            BackendHandle::Elasticsearch(b) => b.flush(index).await,
        }
    }

    async fn refresh(&self, index: &str) -> Result<()> {
        match self {
            BackendHandle::InMemory(b) => b.refresh(index).await,
            BackendHandle::Elasticsearch(b) => b.refresh(index).await,
        }
    }

    async fn merge_segments(&self, index: &str) -> Result<()> {
        match self {
            BackendHandle::InMemory(b) => b.merge_segments(index).await,
            BackendHandle::Elasticsearch(b) => b.merge_segments(index).await,
        }
    }

    async fn open_index(&self, index: &str) -> Result<()> {
        match self {
            BackendHandle::InMemory(b) => b.open_index(index).await,
            BackendHandle::Elasticsearch(b) => b.open_index(index).await,
        }
    }

    async fn close_index(&self, index: &str) -> Result<()> {
        match self {
            BackendHandle::InMemory(b) => b.close_index(index).await,
            BackendHandle::Elasticsearch(b) => b.close_index(index).await,
        }
    }

    async fn wait_for_status(
        &self,
        index: &str,
        status: IndexStatus,
        timeout: Duration,
    ) -> Result<()> {
        match self {
            BackendHandle::InMemory(b) => b.wait_for_status(index, status, timeout).await,
            BackendHandle::Elasticsearch(b) => b.wait_for_status(index, status, timeout).await,
        }
    }

    async fn delete_by_query(&self, index: &str, query: &Value) -> Result<u64> {
        match self {
            BackendHandle::InMemory(b) => b.delete_by_query(index, query).await,
            BackendHandle::Elasticsearch(b) => b.delete_by_query(index, query).await,
        }
    }
}
