//! 🚀 idxflow — the indexing work pipeline.
//!
//! 🎬 *[an application changes some entities. a search cluster should find out.]*
//! *[exactly once per document. in the right order. without drowning.]*
//!
//! The flow, end to end:
//! 1. the caller records `add`/`update`/`delete` on a `WorkPlan` (or through an
//!    `IndexingSession` and a `MappingRegistry`);
//! 2. the plan reduces them as they arrive to at most one operation per document;
//! 3. `execute` runs the deferred contributors and submits the result to the
//!    index's `IndexExecutor`, whose bounded queues are the only backpressure;
//! 4. workers batch operations into backend writes and flush/refresh as the
//!    `SynchronizationStrategy` demands;
//! 5. outcomes come back as an `ExecutionReport`, or as an `IndexingError` in
//!    simple mode.
//!
//! 🦆 The duck has been indexed. It is searchable after refresh.

use std::path::Path;

use anyhow::Context;
use tracing::info;

pub mod app_config;
pub mod backends;
pub mod capabilities;
pub mod changelog;
pub mod document;
pub mod engine;
pub mod error;
pub mod executor;
pub mod mapping;
pub mod plan;
pub mod reference;
pub mod report;
pub mod sequencing;
pub mod sync;

pub use app_config::{AppConfig, BackendConfig, PipelineConfig, load_config};
pub use backends::{BackendHandle, IndexBackend, IndexStatus};
pub use capabilities::{BackendDistribution, UnsupportedOperationPolicy};
pub use document::{DocumentContributor, DocumentState};
pub use engine::{IndexAdmin, IndexingEngine};
pub use error::IndexingError;
pub use executor::{IndexExecutor, OperationSubmitter};
pub use mapping::{EntityBinding, IndexingSession, MappingRegistry};
pub use plan::WorkPlan;
pub use reference::{DocumentReference, EntityReference, EntityReferenceFactory};
pub use report::ExecutionReport;
pub use sync::SynchronizationStrategy;

/// 🔁 Replay an NDJSON change log through a fresh engine and report what happened.
///
/// The engine is shut down before returning, so with `async` synchronization every
/// queued write has still been attempted by the time the report comes back.
pub async fn run(app_config: AppConfig, change_log: &Path) -> anyhow::Result<ExecutionReport> {
    let records = changelog::read_change_log(change_log).await?;
    let engine = IndexingEngine::from_config(&app_config).await?;
    let registry = MappingRegistry::new();

    let mut session = IndexingSession::new(&engine, &registry);
    let applied = changelog::replay(&mut session, records);
    info!("📜 Replaying {} change(s) as {} document operation(s)", applied, session.len());

    let report = session
        .execute_and_report(&reference::DefaultEntityReferenceFactory)
        .await
        .context("💀 The change log could not be executed")?;
    engine.shutdown().await?;
    Ok(report)
}
