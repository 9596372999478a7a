//! 🎛️ Capabilities — what a backend distribution will and will not do for you.
//!
//! Not every cluster is created equal. A self-hosted Elasticsearch will happily
//! flush, force-merge and close indexes all day. A managed serverless offering will
//! look at the same request and return a 400 with a paragraph of regret.
//!
//! 🧠 Knowledge graph:
//! - `BackendDistribution` is decided once per backend connection (configured, or
//!   sniffed from the root endpoint). It never changes afterwards.
//! - `BackendCapabilities` is a flat table of flags derived from the distribution.
//!   No subclass per version, no virtual dispatch: one `match`, one struct.
//! - `CapabilityGate` sits in front of every administrative call and fails fast
//!   BEFORE anything touches the network, unless the deployment configured
//!   `UnsupportedOperationPolicy::Ignore`.
//!
//! 🦆 The duck is supported on every distribution.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::IndexingError;

/// 🏷️ Which flavour of search engine sits on the other end of the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendDistribution {
    /// 🧪 The in-process backend. Commits and refreshes are explicit, like an embedded writer.
    InMemory,
    Elasticsearch,
    #[serde(alias = "opensearch")]
    OpenSearch,
    /// ☁️ Elastic's serverless offering — writes and refreshes yes, shard housekeeping no.
    ElasticsearchServerless,
    /// ☁️ Amazon OpenSearch Serverless — the most opinionated of the bunch.
    #[serde(alias = "amazon_opensearch_serverless")]
    AmazonOpenSearchServerless,
}

impl fmt::Display for BackendDistribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InMemory => "in-memory",
            Self::Elasticsearch => "elasticsearch",
            Self::OpenSearch => "opensearch",
            Self::ElasticsearchServerless => "elasticsearch-serverless",
            Self::AmazonOpenSearchServerless => "amazon-opensearch-serverless",
        };
        f.write_str(name)
    }
}

impl BackendDistribution {
    /// 📋 The static capability table. One row per distribution.
    pub const fn capabilities(self) -> BackendCapabilities {
        match self {
            Self::InMemory => BackendCapabilities {
                commit_required: true,
                ..BackendCapabilities::ALL
            },
            Self::Elasticsearch | Self::OpenSearch => BackendCapabilities::ALL,
            Self::ElasticsearchServerless => BackendCapabilities {
                refresh: true,
                flush: false,
                merge_segments: false,
                open_close_index: false,
                wait_for_status: false,
                delete_by_query: true,
                commit_required: false,
            },
            Self::AmazonOpenSearchServerless => BackendCapabilities {
                refresh: false,
                flush: false,
                merge_segments: false,
                open_close_index: false,
                wait_for_status: false,
                delete_by_query: false,
                commit_required: false,
            },
        }
    }

    /// 🔍 Sniff the distribution out of the cluster root endpoint (`GET /`).
    ///
    /// OpenSearch announces itself through `version.distribution`. Elastic's serverless
    /// flavour uses `version.build_flavor`. Everyone else is plain Elasticsearch until
    /// proven otherwise. Amazon OpenSearch Serverless does not serve a root document at
    /// all, so it must be configured explicitly.
    pub fn detect(root: &serde_json::Value) -> Self {
        let version = &root["version"];
        if version["distribution"].as_str() == Some("opensearch") {
            Self::OpenSearch
        } else if version["build_flavor"].as_str() == Some("serverless") {
            Self::ElasticsearchServerless
        } else {
            Self::Elasticsearch
        }
    }
}

/// 📋 Immutable flags describing what a backend instance supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendCapabilities {
    pub refresh: bool,
    pub flush: bool,
    pub merge_segments: bool,
    pub open_close_index: bool,
    pub wait_for_status: bool,
    pub delete_by_query: bool,
    /// 💾 Writes are only durable after an explicit flush (embedded-writer semantics).
    /// Remote clusters persist on acknowledgment, so a "commit" there is a no-op.
    pub commit_required: bool,
}

impl BackendCapabilities {
    pub const ALL: Self = Self {
        refresh: true,
        flush: true,
        merge_segments: true,
        open_close_index: true,
        wait_for_status: true,
        delete_by_query: true,
        commit_required: false,
    };

    pub fn supports(&self, operation: AdminOperation) -> bool {
        match operation {
            AdminOperation::Refresh => self.refresh,
            AdminOperation::Flush => self.flush,
            AdminOperation::MergeSegments => self.merge_segments,
            AdminOperation::OpenIndex | AdminOperation::CloseIndex => self.open_close_index,
            AdminOperation::WaitForStatus => self.wait_for_status,
            AdminOperation::DeleteByQuery => self.delete_by_query,
        }
    }
}

/// 🔧 Administrative operations that may or may not exist on a given distribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdminOperation {
    Refresh,
    Flush,
    MergeSegments,
    OpenIndex,
    CloseIndex,
    WaitForStatus,
    DeleteByQuery,
}

impl fmt::Display for AdminOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Refresh => "refresh",
            Self::Flush => "flush",
            Self::MergeSegments => "merge-segments",
            Self::OpenIndex => "open-index",
            Self::CloseIndex => "close-index",
            Self::WaitForStatus => "wait-for-status",
            Self::DeleteByQuery => "delete-by-query",
        };
        f.write_str(name)
    }
}

/// ⚖️ What to do when someone asks for an operation the distribution cannot perform.
///
/// Deployment-wide, never per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnsupportedOperationPolicy {
    /// 💀 Fail fast with `IndexingError::UnsupportedOperation`.
    #[default]
    Fail,
    /// 🙈 Silently skip the call. Opt-in only.
    Ignore,
}

/// 🚦 The verdict of the gate for one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Proceed,
    Skip,
}

/// 🚦 Stands in front of every administrative call. Consulted, never bypassed.
#[derive(Debug, Clone, Copy)]
pub struct CapabilityGate {
    distribution: BackendDistribution,
    capabilities: BackendCapabilities,
    policy: UnsupportedOperationPolicy,
}

impl CapabilityGate {
    pub fn new(distribution: BackendDistribution, policy: UnsupportedOperationPolicy) -> Self {
        Self {
            distribution,
            capabilities: distribution.capabilities(),
            policy,
        }
    }

    pub fn distribution(&self) -> BackendDistribution {
        self.distribution
    }

    pub fn capabilities(&self) -> &BackendCapabilities {
        &self.capabilities
    }

    pub fn policy(&self) -> UnsupportedOperationPolicy {
        self.policy
    }

    /// 🚦 Decide whether `operation` may proceed.
    ///
    /// Supported → `Proceed`. Unsupported + `Ignore` → `Skip`.
    /// Unsupported + `Fail` → `Err(UnsupportedOperation)`, and nothing was sent anywhere.
    pub fn check(&self, operation: AdminOperation) -> Result<GateDecision, IndexingError> {
        if self.capabilities.supports(operation) {
            return Ok(GateDecision::Proceed);
        }
        match self.policy {
            UnsupportedOperationPolicy::Ignore => {
                debug!(
                    "🙈 '{}' is not supported on '{}' — skipping as configured",
                    operation, self.distribution
                );
                Ok(GateDecision::Skip)
            }
            UnsupportedOperationPolicy::Fail => Err(IndexingError::UnsupportedOperation {
                operation,
                distribution: self.distribution,
            }),
        }
    }
}
