//! # 📡 THE ELASTICSEARCH BACKEND
//!
//! 🎬 COLD OPEN — INT. SERVER ROOM — 3:47 AM
//!
//! The monitoring dashboard glows amber in the dark. A bulk request of five hundred
//! documents went out. Four hundred and ninety-nine came back `201`. One came back
//! `mapper_parsing_exception`. The on-call engineer stares at it. It stares back.
//!
//! 🚀 This module speaks the `_bulk` dialect of Elasticsearch and OpenSearch. It
//! turns a sequenced batch into NDJSON (`index` actions for adds/updates, `delete`
//! actions for deletes), fires it, and reads the response item by item so one bad
//! document fails alone. It also knows the administrative endpoints: `_flush`,
//! `_refresh`, `_forcemerge`, `_open`, `_close`, `_cluster/health` and
//! `_delete_by_query`.
//!
//! ⚠️ It does not retry. Retries are a connection-layer concern and this is not
//! the connection layer. It also does not check capabilities; the gate in front
//! of it already did.
//!
//! 🦆 (mandatory duck, no context provided, none shall be requested)

use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, trace};

use crate::backends::{
    DocumentWork, IndexBackend, IndexStatus, OperationOutcome, SequencedOperation,
};
use crate::capabilities::BackendDistribution;

/// 📡 Where the cluster lives and how to get past the bouncer.
#[derive(Debug, Deserialize, Clone)]
pub struct ElasticsearchBackendConfig {
    /// 📡 Include scheme and port. Yes, all of it.
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// 🔒 API key auth wins over basic auth when both are set.
    #[serde(default)]
    pub api_key: Option<String>,
    /// 🏷️ Skip sniffing and trust this. Mandatory for Amazon OpenSearch Serverless.
    #[serde(default)]
    pub distribution: Option<BackendDistribution>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

// 🔧 if the cluster can't shake hands in 10s, it's not having a good day
fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    30
}

/// 📦 The HTTP side of the pipeline.
#[derive(Debug)]
pub struct ElasticsearchBackend {
    client: reqwest::Client,
    config: ElasticsearchBackendConfig,
    distribution: BackendDistribution,
}

impl ElasticsearchBackend {
    /// 🚀 Build the client and settle the distribution question.
    ///
    /// If `distribution` is configured we take it at its word. Otherwise we `GET /`
    /// and read the version block. This doubles as the connectivity ping: a dead
    /// URL fails here, not fifty thousand documents later.
    pub async fn new(config: ElasticsearchBackendConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context(
                "💀 The HTTP client refused to be born. Probably a TLS stack having a moment.",
            )?;

        let mut backend = Self {
            client,
            distribution: config.distribution.unwrap_or(BackendDistribution::Elasticsearch),
            config,
        };

        if backend.config.distribution.is_none() {
            let root = backend
                .send(backend.request(Method::GET, ""), "cluster root ping")
                .await
                .with_context(|| {
                    format!(
                        "💀 Could not reach '{}' to figure out what kind of cluster it is. \
                         Check the URL, then check the firewall, then check your feelings.",
                        backend.config.url
                    )
                })?;
            backend.distribution = BackendDistribution::detect(&root);
            info!(
                "📡 Connected to '{}', it says it's '{}'",
                backend.config.url, backend.distribution
            );
        }
        Ok(backend)
    }

    fn url(&self, path: &str) -> String {
        let base = self.config.url.trim_end_matches('/');
        if path.is_empty() {
            format!("{base}/")
        } else {
            format!("{base}/{path}")
        }
    }

    /// 🔒 Auth priority: API key first, basic auth second, anonymous and hopeful third.
    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let request = self.client.request(method, self.url(path));
        if let Some(ref api_key) = self.config.api_key {
            request.header("Authorization", format!("ApiKey {api_key}"))
        } else if let Some(ref username) = self.config.username {
            request.basic_auth(username, self.config.password.as_ref())
        } else {
            request
        }
    }

    /// 📡 Send, insist on 2xx, parse whatever JSON comes back (or `null` for an empty body).
    async fn send(&self, request: RequestBuilder, what: &str) -> Result<Value> {
        let response = request
            .send()
            .await
            .with_context(|| format!("💀 The {what} request never made it to the cluster"))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .with_context(|| format!("💀 The {what} response body got lost on the way back"))?;
        if !status.is_success() {
            bail!("💀 The {what} request came back '{status}'. The body read: '{body}'");
        }
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body)
            .with_context(|| format!("💀 The {what} response was not JSON: '{body}'"))
    }

    /// 📦 Render a batch as a `_bulk` NDJSON body.
    ///
    /// Adds and updates become `index` actions (create-or-replace), deletes become
    /// `delete` actions with no source line. Trailing newline included, because
    /// `_bulk` refuses to finish a sentence without one.
    pub(crate) fn render_bulk(index: &str, batch: &[SequencedOperation]) -> Result<String> {
        let estimated_size: usize = batch
            .iter()
            .map(|op| op.work.payload().map_or(0, |p| p.as_json().to_string().len()) + 100)
            .sum();
        let mut body = String::with_capacity(estimated_size);

        for op in batch {
            let action_name = match op.work {
                DocumentWork::Add(_) | DocumentWork::Update(_) => "index",
                DocumentWork::Delete => "delete",
            };
            let mut metadata = json!({
                "_index": index,
                "_id": op.reference.identifier(),
            });
            if let Some(routing) = op.reference.routing_key() {
                metadata["routing"] = json!(routing);
            }
            let action = json!({ action_name: metadata });
            let action_line = serde_json::to_string(&action)
                .context("💀 Failed to serialize a bulk action line")?;
            body.push_str(&action_line);
            body.push('\n');
            if let Some(payload) = op.work.payload() {
                let source_line = serde_json::to_string(payload.as_json())
                    .context("💀 Failed to serialize a document")?;
                body.push_str(&source_line);
                body.push('\n');
            }
        }
        Ok(body)
    }

    /// 🔍 Read a `_bulk` response back into one outcome per operation.
    pub(crate) fn parse_bulk_response(
        response: &Value,
        batch: &[SequencedOperation],
    ) -> Result<Vec<OperationOutcome>> {
        let items = response["items"]
            .as_array()
            .ok_or_else(|| anyhow!("💀 The bulk response had no 'items' array: {response}"))?;
        if items.len() != batch.len() {
            bail!(
                "💀 Sent {} bulk operations but got {} items back. The math is not mathing.",
                batch.len(),
                items.len()
            );
        }

        Ok(items
            .iter()
            .zip(batch)
            .map(|(item, op)| {
                let (action, result) = item
                    .as_object()
                    .and_then(|obj| obj.iter().next())
                    .ok_or_else(|| anyhow!("💀 A bulk response item was empty: {item}"))?;
                let status = result["status"].as_u64().unwrap_or(0);
                if (200..300).contains(&status) {
                    return Ok(());
                }
                // 🗑️ deleting something that isn't there is the same as deleting it
                if action == "delete" && status == 404 {
                    return Ok(());
                }
                let error = &result["error"];
                Err(anyhow!(
                    "💀 Document '{}' failed with status {}: {}: {}",
                    op.reference.identifier(),
                    status,
                    error["type"].as_str().unwrap_or("unknown_error"),
                    error["reason"].as_str().unwrap_or("no reason given"),
                ))
            })
            .collect())
    }

    async fn post_index_endpoint(&self, index: &str, endpoint: &str) -> Result<()> {
        let path = format!("{index}/{endpoint}");
        self.send(self.request(Method::POST, &path), endpoint).await?;
        debug!("🔧 '{}' on '{}' acknowledged", endpoint, index);
        Ok(())
    }
}

#[async_trait]
impl IndexBackend for ElasticsearchBackend {
    fn distribution(&self) -> BackendDistribution {
        self.distribution
    }

    async fn write(
        &self,
        index: &str,
        batch: &[SequencedOperation],
    ) -> Result<Vec<OperationOutcome>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let body = Self::render_bulk(index, batch)?;
        let response = self
            .send(
                self.request(Method::POST, "_bulk")
                    .header("Content-Type", "application/x-ndjson")
                    .body(body),
                "bulk",
            )
            .await?;
        trace!("🚀 Bulk request of {} operations landed on '{}'", batch.len(), index);
        Self::parse_bulk_response(&response, batch)
    }

    async fn flush(&self, index: &str) -> Result<()> {
        self.post_index_endpoint(index, "_flush").await
    }

    async fn refresh(&self, index: &str) -> Result<()> {
        self.post_index_endpoint(index, "_refresh").await
    }

    async fn merge_segments(&self, index: &str) -> Result<()> {
        self.post_index_endpoint(index, "_forcemerge?max_num_segments=1").await
    }

    async fn open_index(&self, index: &str) -> Result<()> {
        self.post_index_endpoint(index, "_open").await
    }

    async fn close_index(&self, index: &str) -> Result<()> {
        self.post_index_endpoint(index, "_close").await
    }

    async fn wait_for_status(
        &self,
        index: &str,
        status: IndexStatus,
        timeout: Duration,
    ) -> Result<()> {
        let path = format!(
            "_cluster/health/{index}?wait_for_status={}&timeout={}ms",
            status.as_str(),
            timeout.as_millis()
        );
        // ⏱️ the cluster holds the request open for `timeout`, so our own deadline must outlast it
        let request = self
            .request(Method::GET, &path)
            .timeout(timeout + Duration::from_secs(self.config.request_timeout_secs));
        let health = self.send(request, "cluster health").await?;
        if health["timed_out"].as_bool().unwrap_or(false) {
            bail!(
                "💀 Index '{}' did not reach '{}' within {:?}; it is '{}'",
                index,
                status,
                timeout,
                health["status"].as_str().unwrap_or("unknown")
            );
        }
        Ok(())
    }

    async fn delete_by_query(&self, index: &str, query: &Value) -> Result<u64> {
        let path = format!("{index}/_delete_by_query?conflicts=proceed");
        let body = serde_json::to_string(&json!({ "query": query }))
            .context("💀 Failed to serialize the query")?;
        let response = self
            .send(
                self.request(Method::POST, &path)
                    .header("Content-Type", "application/json")
                    .body(body),
                "delete-by-query",
            )
            .await?;
        Ok(response["deleted"].as_u64().unwrap_or(0))
    }
}
