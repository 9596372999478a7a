//! 🔧 App Configuration — the sacred TOML-to-struct pipeline.
//!
//! 📡 "Config not found: We looked everywhere. Under the couch. Behind the fridge.
//! In the junk drawer. Nothing." — every developer at 3am 🦆
//!
//! 🏗️ Powered by Figment: `IDXFLOW_*` environment variables first, an optional TOML
//! file layered on top (TOML wins on conflicts). Nested keys in env vars use a double
//! underscore: `IDXFLOW_PIPELINE__QUEUE_CAPACITY=64`.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::Deserialize;
use tracing::info;

use crate::backends::{ElasticsearchBackendConfig, InMemoryBackendConfig};
use crate::capabilities::UnsupportedOperationPolicy;
use crate::executor::{ExecutorSettings, OperationSubmitter};
use crate::sync::SynchronizationStrategy;

/// 📦 One struct to rule them all.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub backend: BackendConfig,
}

/// 🔌 Which backend the engine talks to. Externally tagged: `[backend.Elasticsearch]`.
#[derive(Debug, Deserialize, Clone)]
pub enum BackendConfig {
    #[serde(alias = "in_memory")]
    InMemory(InMemoryBackendConfig),
    #[serde(alias = "elasticsearch", alias = "OpenSearch", alias = "opensearch")]
    Elasticsearch(ElasticsearchBackendConfig),
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::InMemory(InMemoryBackendConfig::default())
    }
}

/// 🚰 Queue, batching and synchronization knobs shared by every index.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct PipelineConfig {
    /// 📏 Bounded capacity of each queue. Full means backpressure.
    #[serde(default = "default_queue_capacity", alias = "channel_size")]
    pub queue_capacity: usize,
    #[serde(default = "default_queue_count")]
    pub queue_count: usize,
    /// 📦 Upper bound on operations per backend write.
    #[serde(default = "default_max_bulk_size")]
    pub max_bulk_size: usize,
    #[serde(default)]
    pub submitter: OperationSubmitter,
    #[serde(default)]
    pub synchronization: SynchronizationStrategy,
    #[serde(default)]
    pub unsupported_operations: UnsupportedOperationPolicy,
    /// 🗂️ Per-index overrides, keyed by index name.
    #[serde(default)]
    pub indexes: HashMap<String, IndexOverrides>,
}

/// 🎛️ Anything left unset falls back to the pipeline-wide value.
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct IndexOverrides {
    #[serde(default)]
    pub queue_capacity: Option<usize>,
    #[serde(default)]
    pub queue_count: Option<usize>,
    #[serde(default)]
    pub max_bulk_size: Option<usize>,
    #[serde(default)]
    pub submitter: Option<OperationSubmitter>,
}

fn default_queue_capacity() -> usize {
    1000
}

fn default_queue_count() -> usize {
    1
}

fn default_max_bulk_size() -> usize {
    100
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            queue_count: default_queue_count(),
            max_bulk_size: default_max_bulk_size(),
            submitter: OperationSubmitter::default(),
            synchronization: SynchronizationStrategy::default(),
            unsupported_operations: UnsupportedOperationPolicy::default(),
            indexes: HashMap::new(),
        }
    }
}

impl PipelineConfig {
    /// 🏭 The executor settings for one index, overrides applied.
    pub fn settings_for(&self, index: &str) -> ExecutorSettings {
        let overrides = self.indexes.get(index).cloned().unwrap_or_default();
        ExecutorSettings {
            queue_capacity: overrides.queue_capacity.unwrap_or(self.queue_capacity),
            queue_count: overrides.queue_count.unwrap_or(self.queue_count),
            max_bulk_size: overrides.max_bulk_size.unwrap_or(self.max_bulk_size),
            submitter: overrides.submitter.unwrap_or(self.submitter),
            unsupported_operations: self.unsupported_operations,
        }
    }
}

/// 🚀 Load the config from `IDXFLOW_*` env vars, plus the TOML file if one is given.
///
/// - `None` → env vars only. No file, no assumptions.
/// - `Some(path)` → env vars + TOML, merged. TOML wins on conflicts.
pub fn load_config(config_file_name: Option<&Path>) -> anyhow::Result<AppConfig> {
    info!(
        "🔧 Loading configuration: {}",
        config_file_name.map_or_else(|| "<env only>".to_string(), |p| p.display().to_string())
    );

    let config = Figment::new().merge(Env::prefixed("IDXFLOW_").split("__"));
    let config = match config_file_name {
        Some(file_name) => config.merge(Toml::file(file_name)),
        None => config,
    };

    let context_msg = match config_file_name {
        Some(path) => format!(
            "💀 Failed to parse configuration from file '{}' \
             and environment variables (IDXFLOW_*). \
             The file exists in our hearts, but apparently not in a shape serde recognizes.",
            path.display()
        ),
        None => "💀 Failed to parse configuration from environment variables (IDXFLOW_*). \
                 No file was provided, so this one's all on the environment."
            .to_string(),
    };

    config.extract().context(context_msg)
}
