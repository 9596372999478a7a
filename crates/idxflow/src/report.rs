//! 📊 Execution reports — the post-mortem, one entity at a time.
//!
//! 🎬 *[three indexes were touched. two were fine. one had opinions.]*
//!
//! A report holds at most one failure chain and a list of the caller's entities
//! that did not make it. Reports from several plans (one per index) merge into
//! one: the first failure seen stays primary, everything after it is attached as
//! suppressed, and the failing-entity lists are concatenated in merge order.
//! Merging never turns a failure into a success or the other way around.
//!
//! 🧠 Knowledge graph:
//! - `ReportBuilder` is where per-operation outcomes land. It owns the
//!   `EntityReferenceFactory` call and swallows ITS failures into the chain, so a
//!   broken identifier bridge never hides the failure it was trying to describe.
//! - `ExecutionReport::into_result` is the whole difference between `execute()` and
//!   `execute_and_report()`. One aggregator, two thin doors.

use std::fmt;

use tracing::warn;

use crate::error::IndexingError;
use crate::reference::{EntityIdentity, EntityReference, EntityReferenceFactory};

/// 🧅 A primary cause plus everything that went wrong after it.
#[derive(Debug)]
pub struct IndexingFailure {
    primary: anyhow::Error,
    suppressed: Vec<anyhow::Error>,
}

impl IndexingFailure {
    pub fn new(primary: anyhow::Error) -> Self {
        Self {
            primary,
            suppressed: Vec::new(),
        }
    }

    pub fn primary(&self) -> &anyhow::Error {
        &self.primary
    }

    pub fn suppressed(&self) -> &[anyhow::Error] {
        &self.suppressed
    }

    /// 🧅 Every cause in the chain, primary first.
    pub fn causes(&self) -> impl Iterator<Item = &anyhow::Error> {
        std::iter::once(&self.primary).chain(self.suppressed.iter())
    }

    pub fn add_suppressed(&mut self, err: anyhow::Error) {
        self.suppressed.push(err);
    }

    /// 🔗 Fold another chain into this one; its primary becomes suppressed here.
    pub fn absorb(&mut self, other: IndexingFailure) {
        self.suppressed.push(other.primary);
        self.suppressed.extend(other.suppressed);
    }
}

impl fmt::Display for IndexingFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.primary)?;
        if !self.suppressed.is_empty() {
            write!(f, " (+{} suppressed)", self.suppressed.len())?;
        }
        Ok(())
    }
}

impl std::error::Error for IndexingFailure {}

/// 📊 The outcome of executing one or more plans.
#[derive(Debug, Default)]
pub struct ExecutionReport {
    failure: Option<IndexingFailure>,
    failing_entities: Vec<EntityReference>,
}

impl ExecutionReport {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none() && self.failing_entities.is_empty()
    }

    pub fn failure(&self) -> Option<&IndexingFailure> {
        self.failure.as_ref()
    }

    pub fn failing_entities(&self) -> &[EntityReference] {
        &self.failing_entities
    }

    /// 🔗 Associative merge: first failure stays primary, lists concatenate.
    pub fn merge(mut self, other: ExecutionReport) -> Self {
        if let Some(theirs) = other.failure {
            match &mut self.failure {
                Some(ours) => ours.absorb(theirs),
                None => self.failure = Some(theirs),
            }
        }
        self.failing_entities.extend(other.failing_entities);
        self
    }

    /// 🚪 The simple-mode door: any failure becomes an error.
    pub fn into_result(self) -> Result<(), IndexingError> {
        let Some(cause) = self.failure else {
            return Ok(());
        };
        let entities = self
            .failing_entities
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        Err(IndexingError::IndexingFailed {
            failed_count: self.failing_entities.len(),
            entities,
            cause,
        })
    }

    fn record_throwable(&mut self, err: anyhow::Error) {
        match &mut self.failure {
            None => self.failure = Some(IndexingFailure::new(err)),
            Some(existing) => existing.add_suppressed(err),
        }
    }
}

/// 🏗️ Accumulates per-operation outcomes into an `ExecutionReport`.
pub struct ReportBuilder<'f> {
    factory: &'f dyn EntityReferenceFactory,
    report: ExecutionReport,
}

impl<'f> ReportBuilder<'f> {
    pub fn new(factory: &'f dyn EntityReferenceFactory) -> Self {
        Self {
            factory,
            report: ExecutionReport::default(),
        }
    }

    /// 💀 One entity failed with one cause.
    pub fn failure(&mut self, entity: &EntityIdentity, err: anyhow::Error) {
        self.throwable(err);
        self.failing_entity(entity);
    }

    pub fn throwable(&mut self, err: anyhow::Error) {
        self.report.record_throwable(err);
    }

    /// 🎯 Record an entity as failing without adding a new cause.
    pub fn failing_entity(&mut self, entity: &EntityIdentity) {
        match self.factory.create_entity_reference(entity) {
            Ok(reference) => self.report.failing_entities.push(reference),
            Err(err) => {
                // 🩹 the reporting path must not crash: keep the chain, lose only the pretty name
                warn!(
                    "⚠️ Could not build an entity reference for '{}' ({}): {:#}",
                    entity.entity_name, entity.identifier, err
                );
                self.report.record_throwable(err.context(format!(
                    "💀 Failed to build the entity reference for a '{}' with identifier {}",
                    entity.entity_name, entity.identifier
                )));
            }
        }
    }

    pub fn build(self) -> ExecutionReport {
        self.report
    }
}
