//! 🎬 *[camera pans across a dimly lit server room]*
//! 🎬 "In a world where every index needs its own queue..."
//! 🎬 "One engine dared to manage them all."
//!
//! 📦 The `IndexingEngine` owns the backend and one `IndexExecutor` per index,
//! created the first time somebody asks for that index and kept until `shutdown`.
//! Each executor gets its own queues and capacity, so one saturated index cannot
//! starve the others.
//!
//! 🔧 It also hands out `IndexAdmin`, the capability-gated front door for
//! administrative calls. Every admin call asks the gate first. The gate does not
//! negotiate.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use serde_json::Value;
use tracing::{debug, info};

use crate::app_config::{AppConfig, PipelineConfig};
use crate::backends::{BackendHandle, IndexBackend, IndexStatus};
use crate::capabilities::{AdminOperation, CapabilityGate, GateDecision};
use crate::error::IndexingError;
use crate::executor::IndexExecutor;
use crate::plan::WorkPlan;
use crate::sync::SynchronizationStrategy;

/// ⏳ Extra time a backend gets past a status-wait deadline to report what it saw.
const STATUS_WAIT_GRACE: Duration = Duration::from_secs(1);

/// 🏭 Backend + per-index executors + the config that shapes them.
#[derive(Debug)]
pub struct IndexingEngine {
    backend: Arc<BackendHandle>,
    pipeline: PipelineConfig,
    executors: Mutex<HashMap<String, Arc<IndexExecutor>>>,
}

impl IndexingEngine {
    pub fn new(backend: BackendHandle, pipeline: PipelineConfig) -> Self {
        info!(
            "🚀 Indexing engine up on '{}' ({:?}, unsupported operations: {:?})",
            backend.distribution(),
            pipeline.synchronization,
            pipeline.unsupported_operations
        );
        Self {
            backend: Arc::new(backend),
            pipeline,
            executors: Mutex::new(HashMap::new()),
        }
    }

    /// 🏗️ Connect the configured backend and build an engine around it.
    pub async fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let backend = BackendHandle::from_config(&config.backend)
            .await
            .context("💀 The engine could not start because its backend would not")?;
        Ok(Self::new(backend, config.pipeline.clone()))
    }

    pub fn backend(&self) -> &Arc<BackendHandle> {
        &self.backend
    }

    pub fn pipeline(&self) -> &PipelineConfig {
        &self.pipeline
    }

    /// ⏳ The deployment-wide default strategy.
    pub fn synchronization(&self) -> SynchronizationStrategy {
        self.pipeline.synchronization
    }

    /// 🏭 The executor for `index`, started on first use. Needs a tokio runtime.
    pub fn executor(&self, index: &str) -> Arc<IndexExecutor> {
        let mut executors = self.executors.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        executors
            .entry(index.to_string())
            .or_insert_with(|| {
                debug!("🏭 First touch of index '{}', starting its executor", index);
                Arc::new(IndexExecutor::start(
                    index,
                    self.backend.clone(),
                    self.pipeline.settings_for(index),
                ))
            })
            .clone()
    }

    pub fn create_plan(&self, index: impl Into<String>) -> WorkPlan {
        WorkPlan::new(index)
    }

    /// 🔧 Capability-gated administrative access to one index.
    pub fn admin(&self, index: impl Into<String>) -> IndexAdmin {
        IndexAdmin {
            index: index.into(),
            backend: self.backend.clone(),
            gate: CapabilityGate::new(
                self.backend.distribution(),
                self.pipeline.unsupported_operations,
            ),
        }
    }

    /// 🛑 Drain and stop every executor started so far.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        let executors: Vec<Arc<IndexExecutor>> = {
            let mut guard = self.executors.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.drain().map(|(_, executor)| executor).collect()
        };
        for executor in executors {
            executor.shutdown().await?;
        }
        info!("🏁 Indexing engine shut down");
        Ok(())
    }
}

/// 🔧 Administrative calls for one index, each checked against the capability table first.
///
/// Under `UnsupportedOperationPolicy::Ignore`, an unsupported call returns `Ok` without
/// touching the backend (and `delete_by_query` reports zero deletions).
#[derive(Debug, Clone)]
pub struct IndexAdmin {
    index: String,
    backend: Arc<BackendHandle>,
    gate: CapabilityGate,
}

impl IndexAdmin {
    pub fn index(&self) -> &str {
        &self.index
    }

    fn allowed(&self, operation: AdminOperation) -> Result<bool, IndexingError> {
        let decision = self.gate.check(operation)?;
        if decision == GateDecision::Proceed {
            debug!("🔧 '{}' on '{}'", operation, self.index);
        }
        Ok(decision == GateDecision::Proceed)
    }

    pub async fn refresh(&self) -> Result<(), IndexingError> {
        if self.allowed(AdminOperation::Refresh)? {
            self.backend.refresh(&self.index).await?;
        }
        Ok(())
    }

    pub async fn flush(&self) -> Result<(), IndexingError> {
        if self.allowed(AdminOperation::Flush)? {
            self.backend.flush(&self.index).await?;
        }
        Ok(())
    }

    pub async fn merge_segments(&self) -> Result<(), IndexingError> {
        if self.allowed(AdminOperation::MergeSegments)? {
            self.backend.merge_segments(&self.index).await?;
        }
        Ok(())
    }

    pub async fn open(&self) -> Result<(), IndexingError> {
        if self.allowed(AdminOperation::OpenIndex)? {
            self.backend.open_index(&self.index).await?;
        }
        Ok(())
    }

    pub async fn close(&self) -> Result<(), IndexingError> {
        if self.allowed(AdminOperation::CloseIndex)? {
            self.backend.close_index(&self.index).await?;
        }
        Ok(())
    }

    /// ⏱️ Wait for `status`. A backend that reports a miss yields `IndexingError::Backend` with
    /// the status it saw; one that is still silent a grace second past `timeout` yields
    /// `IndexingError::Timeout`.
    pub async fn wait_for_status(
        &self,
        status: IndexStatus,
        timeout: Duration,
    ) -> Result<(), IndexingError> {
        if !self.allowed(AdminOperation::WaitForStatus)? {
            return Ok(());
        }
        // ⏱️ the backend answers for its own deadline; the guard only catches a hang
        let guard = timeout + STATUS_WAIT_GRACE;
        let waiting = self.backend.wait_for_status(&self.index, status, timeout);
        match tokio::time::timeout(guard, waiting).await {
            Ok(outcome) => Ok(outcome?),
            Err(_elapsed) => Err(IndexingError::Timeout {
                index: self.index.clone(),
                operation: AdminOperation::WaitForStatus,
                timeout,
            }),
        }
    }

    /// 🗑️ Returns how many documents went away.
    pub async fn delete_by_query(&self, query: &Value) -> Result<u64, IndexingError> {
        if !self.allowed(AdminOperation::DeleteByQuery)? {
            return Ok(0);
        }
        Ok(self.backend.delete_by_query(&self.index, query).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{ElasticsearchBackend, ElasticsearchBackendConfig, InMemoryBackend};
    use crate::capabilities::{BackendDistribution, UnsupportedOperationPolicy};
    use crate::document::DocumentContributor;
    use crate::reference::DocumentReference;
    use anyhow::Result;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn engine_over(backend: &InMemoryBackend, pipeline: PipelineConfig) -> IndexingEngine {
        IndexingEngine::new(BackendHandle::InMemory(backend.clone()), pipeline)
    }

    #[tokio::test]
    async fn the_one_where_each_index_gets_its_own_executor() -> Result<()> {
        let mut pipeline = PipelineConfig::default();
        pipeline.indexes.insert(
            "books".into(),
            crate::app_config::IndexOverrides {
                queue_capacity: Some(3),
                ..Default::default()
            },
        );
        let engine = engine_over(&InMemoryBackend::default(), pipeline);

        let books = engine.executor("books");
        let again = engine.executor("books");
        let authors = engine.executor("authors");
        assert!(Arc::ptr_eq(&books, &again));
        assert!(!Arc::ptr_eq(&books, &authors));
        assert_eq!(books.settings().queue_capacity, 3);
        assert_eq!(authors.settings().queue_capacity, 1000);

        engine.shutdown().await?;
        assert!(books.is_closed() && authors.is_closed());
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_unsupported_admin_calls_never_leave_the_building() -> Result<()> {
        let backend = InMemoryBackend::new(BackendDistribution::AmazonOpenSearchServerless);
        let engine = engine_over(&backend, PipelineConfig::default());
        let admin = engine.admin("books");

        let err = admin.refresh().await.expect_err("no refresh on serverless");
        assert!(matches!(err, IndexingError::UnsupportedOperation { .. }));
        assert!(admin.merge_segments().await.is_err());
        assert!(admin.close().await.is_err());
        assert!(admin.delete_by_query(&json!({"match_all": {}})).await.is_err());

        let calls = backend.calls();
        assert_eq!(calls.refreshes + calls.merges + calls.closes + calls.deletes_by_query, 0);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_ignore_turns_unsupported_calls_into_no_ops() -> Result<()> {
        let backend = InMemoryBackend::new(BackendDistribution::ElasticsearchServerless);
        let engine = engine_over(
            &backend,
            PipelineConfig {
                unsupported_operations: UnsupportedOperationPolicy::Ignore,
                ..PipelineConfig::default()
            },
        );
        let admin = engine.admin("books");
        admin.flush().await?;
        admin.merge_segments().await?;
        admin.refresh().await?;

        let calls = backend.calls();
        assert_eq!(calls.flushes, 0);
        assert_eq!(calls.merges, 0);
        assert_eq!(calls.refreshes, 1, "serverless can still refresh");
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_admin_calls_reach_a_capable_backend() -> Result<()> {
        let backend = InMemoryBackend::default();
        let engine = engine_over(&backend, PipelineConfig::default());

        let mut plan = engine.create_plan("books");
        for (id, genre) in [("1", "scifi"), ("2", "poetry"), ("3", "scifi")] {
            let genre = genre.to_string();
            plan.add(
                &DocumentReference::new(id, None, "Book", json!(id)),
                DocumentContributor::new(move |doc| {
                    doc.add_value("genre", genre);
                    Ok(())
                }),
            );
        }
        plan.execute(&engine.executor("books"), engine.synchronization()).await?;

        let admin = engine.admin("books");
        assert_eq!(admin.delete_by_query(&json!({"term": {"genre": "scifi"}})).await?, 2);
        admin.close().await?;
        admin.open().await?;
        admin.wait_for_status(IndexStatus::Green, Duration::from_secs(1)).await?;
        assert_eq!(backend.snapshot("books").await.written.len(), 1);
        engine.shutdown().await
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_a_closed_index_never_turns_green() -> Result<()> {
        let backend = InMemoryBackend::default();
        let engine = engine_over(&backend, PipelineConfig::default());
        let admin = engine.admin("books");
        admin.close().await?;

        let err = admin
            .wait_for_status(IndexStatus::Yellow, Duration::from_secs(5))
            .await
            .expect_err("closed is red");
        assert!(matches!(err, IndexingError::Backend(_)));
        assert!(err.to_string().contains("red"));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_hanging_cluster_times_out() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/_cluster/health/books"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"status": "green", "timed_out": false}))
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;
        let backend = ElasticsearchBackend::new(ElasticsearchBackendConfig {
            url: server.uri(),
            username: Some("elastic".into()),
            password: Some("changeme".into()),
            api_key: None,
            distribution: Some(BackendDistribution::Elasticsearch),
            connect_timeout_secs: 1,
            request_timeout_secs: 5,
        })
        .await?;
        let engine =
            IndexingEngine::new(BackendHandle::Elasticsearch(backend), PipelineConfig::default());

        let err = engine
            .admin("books")
            .wait_for_status(IndexStatus::Green, Duration::from_millis(100))
            .await
            .expect_err("the cluster is taking a nap");
        assert!(matches!(
            err,
            IndexingError::Timeout { operation: AdminOperation::WaitForStatus, .. }
        ));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_the_cluster_gets_to_say_what_colour_it_stayed() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/_cluster/health/books"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"status": "yellow", "timed_out": true}))
                    .set_delay(Duration::from_millis(200)),
            )
            .mount(&server)
            .await;
        let backend = ElasticsearchBackend::new(ElasticsearchBackendConfig {
            url: server.uri(),
            username: None,
            password: None,
            api_key: None,
            distribution: Some(BackendDistribution::Elasticsearch),
            connect_timeout_secs: 1,
            request_timeout_secs: 5,
        })
        .await?;
        let engine =
            IndexingEngine::new(BackendHandle::Elasticsearch(backend), PipelineConfig::default());

        let err = engine
            .admin("books")
            .wait_for_status(IndexStatus::Green, Duration::from_millis(200))
            .await
            .expect_err("yellow is not green");
        assert!(matches!(err, IndexingError::Backend(_)), "got {err:?}");
        assert!(err.to_string().contains("yellow"));
        Ok(())
    }
}
