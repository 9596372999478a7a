//! 📋 The work plan — one unit of work's worth of document changes, for one index.
//!
//! 🎬 *[the application touches the same book four times in one transaction.]*
//! *[the cluster will hear about it once.]*
//!
//! A `WorkPlan` is an ordered map from document identity (identifier + routing key)
//! to the one effective operation left after reduction (see `sequencing`). Slots keep
//! the order in which each document was first touched. A slot that cancels out is
//! removed; touching that document again later gives it a fresh slot at the end.
//! Removed slots leave a hole that is swept once holes outnumber live slots, so
//! add/delete churn on one document does not grow the plan.
//!
//! Contributors are deferred. `process()` runs them ahead of time (each at most
//! once, so calling it twice is harmless); `execute*` runs whatever is still
//! pending. A contributor failure is a per-document failure: the entity ends up in
//! the report and its siblings still go out.
//!
//! ⚠️ Not `Sync`-shared by design. One plan, one unit of work, one owner. The
//! executor it hands off to is the shared, thread-safe part.

use std::collections::HashMap;

use futures::future::join_all;
use tracing::{debug, trace, warn};

use crate::backends::{DocumentWork, SequencedOperation};
use crate::document::{Contribution, DocumentContributor};
use crate::error::IndexingError;
use crate::executor::{Completion, IndexExecutor};
use crate::reference::{
    DefaultEntityReferenceFactory, DocumentKey, DocumentReference, DocumentReferenceProvider,
    EntityIdentity, EntityReferenceFactory,
};
use crate::report::{ExecutionReport, ReportBuilder};
use crate::sequencing::{OperationKind, Reduction, reduce};
use crate::sync::SynchronizationStrategy;

#[derive(Debug)]
struct PlanSlot {
    reference: DocumentReference,
    kind: OperationKind,
    // 🧟 the first touch was not an ADD, so the index may already hold this document
    present_before_plan: bool,
    contribution: Option<Contribution>,
}

/// 📦 A plan after contributors ran: what to send, and what already failed.
#[derive(Debug, Default)]
pub(crate) struct FinalizedPlan {
    pub(crate) operations: Vec<SequencedOperation>,
    pub(crate) failures: Vec<(EntityIdentity, anyhow::Error)>,
}

/// 📋 Pending document operations for one index, reduced as they arrive.
#[derive(Debug)]
pub struct WorkPlan {
    index: String,
    slots: Vec<Option<PlanSlot>>,
    positions: HashMap<DocumentKey, usize>,
    cancelled: usize,
}

impl WorkPlan {
    pub fn new(index: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            slots: Vec::new(),
            positions: HashMap::new(),
            cancelled: 0,
        }
    }

    pub fn index(&self) -> &str {
        &self.index
    }

    /// 📏 Documents that will receive an operation.
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn add(
        &mut self,
        reference: &(impl DocumentReferenceProvider + ?Sized),
        contributor: DocumentContributor,
    ) {
        self.push(OperationKind::Add, reference, Some(contributor));
    }

    pub fn update(
        &mut self,
        reference: &(impl DocumentReferenceProvider + ?Sized),
        contributor: DocumentContributor,
    ) {
        self.push(OperationKind::Update, reference, Some(contributor));
    }

    pub fn delete(&mut self, reference: &(impl DocumentReferenceProvider + ?Sized)) {
        self.push(OperationKind::Delete, reference, None);
    }

    fn push(
        &mut self,
        kind: OperationKind,
        provider: &(impl DocumentReferenceProvider + ?Sized),
        contributor: Option<DocumentContributor>,
    ) {
        let reference = DocumentReference::from_provider(provider);
        let existing = self
            .positions
            .get(reference.key())
            .copied()
            .and_then(|position| Some((position, self.slots.get(position)?.as_ref()?)));

        let Some((position, slot)) = existing else {
            trace!("📋 '{}': first touch of '{}' is {}", self.index, reference.identifier(), kind);
            self.positions.insert(reference.key().clone(), self.slots.len());
            self.slots.push(Some(PlanSlot {
                reference,
                kind,
                present_before_plan: kind != OperationKind::Add,
                contribution: contributor.map(Contribution::pending),
            }));
            return;
        };

        match reduce(Some(slot.kind), kind, slot.present_before_plan) {
            Reduction::Keep(effective) => {
                trace!(
                    "📋 '{}': {} + {} on '{}' reduces to {}",
                    self.index,
                    slot.kind,
                    kind,
                    reference.identifier(),
                    effective
                );
                if let Some(slot) = self.slots[position].as_mut() {
                    slot.kind = effective;
                    slot.reference = reference;
                    // 🎨 the newest contributor sees the newest entity state; older ones never run
                    slot.contribution = contributor.map(Contribution::pending);
                }
            }
            Reduction::Cancel => {
                trace!(
                    "📋 '{}': '{}' was added then deleted. Never happened.",
                    self.index,
                    reference.identifier()
                );
                self.slots[position] = None;
                self.positions.remove(reference.key());
                self.cancelled += 1;
                if self.cancelled * 2 > self.slots.len() {
                    self.compact();
                }
            }
        }
    }

    /// 🧹 Drop the holes left by cancelled slots and re-point the index at the survivors.
    fn compact(&mut self) {
        self.slots.retain(Option::is_some);
        self.positions.clear();
        for (position, slot) in self.slots.iter().enumerate() {
            if let Some(slot) = slot {
                self.positions.insert(slot.reference.key().clone(), position);
            }
        }
        self.cancelled = 0;
    }

    fn live_slots(&self) -> impl Iterator<Item = &PlanSlot> {
        self.slots.iter().flatten()
    }

    /// 🔍 The effective operations, in execution order.
    pub fn operations(&self) -> impl Iterator<Item = (OperationKind, &DocumentReference)> {
        self.live_slots().map(|slot| (slot.kind, &slot.reference))
    }

    /// 🏃 Run every pending contributor now. Returns how many ran on this call.
    pub fn process(&mut self) -> usize {
        let ran = self
            .slots
            .iter_mut()
            .flatten()
            .filter_map(|slot| slot.contribution.as_mut())
            .map(Contribution::prepare)
            .filter(|ran| *ran)
            .count();
        if ran > 0 {
            debug!("🎨 '{}': {} contributor(s) ran during process()", self.index, ran);
        }
        ran
    }

    /// 🗑️ Forget everything. Nothing is executed, nothing is reported.
    pub fn discard(&mut self) {
        if !self.is_empty() {
            debug!("🗑️ '{}': discarding {} pending operation(s)", self.index, self.len());
        }
        self.slots.clear();
        self.positions.clear();
        self.cancelled = 0;
    }

    /// 🧊 Resolve every slot into a backend-ready operation, or a failure.
    pub(crate) fn finalize(self) -> FinalizedPlan {
        let mut finalized = FinalizedPlan::default();
        for slot in self.slots.into_iter().flatten() {
            let work = match (slot.kind, slot.contribution) {
                (OperationKind::Delete, _) => Ok(DocumentWork::Delete),
                (kind, Some(contribution)) => contribution.into_payload().map(|payload| match kind {
                    OperationKind::Add => DocumentWork::Add(payload),
                    _ => DocumentWork::Update(payload),
                }),
                (kind, None) => Err(anyhow::anyhow!(
                    "💀 A '{kind}' operation arrived without a contributor"
                )),
            };
            match work {
                Ok(work) => finalized.operations.push(SequencedOperation {
                    reference: slot.reference,
                    work,
                }),
                Err(err) => {
                    let err = err.context(format!(
                        "💀 Could not build document '{}' for index '{}'",
                        slot.reference.identifier(),
                        self.index
                    ));
                    finalized.failures.push((slot.reference.entity().clone(), err));
                }
            }
        }
        finalized
    }

    /// 🚪 Simple mode: execute and turn any failure into an error.
    pub async fn execute(
        self,
        executor: &IndexExecutor,
        strategy: SynchronizationStrategy,
    ) -> Result<(), IndexingError> {
        self.execute_and_report(executor, strategy, &DefaultEntityReferenceFactory)
            .await?
            .into_result()
    }

    /// 📊 Detailed mode: execute and describe what happened per entity.
    ///
    /// `Err` is reserved for refusals that happen before anything is submitted (for
    /// instance a strategy needing a refresh the distribution cannot do under the
    /// `Fail` policy). Everything after that point lands in the report.
    pub async fn execute_and_report(
        self,
        executor: &IndexExecutor,
        strategy: SynchronizationStrategy,
        factory: &dyn EntityReferenceFactory,
    ) -> Result<ExecutionReport, IndexingError> {
        let sync = executor.resolve_sync(strategy)?;
        let index = self.index.clone();
        let FinalizedPlan { operations, failures } = self.finalize();
        debug!(
            "🚀 '{}': executing {} operation(s) with {:?} ({} failed to contribute)",
            index,
            operations.len(),
            strategy,
            failures.len()
        );

        let mut builder = ReportBuilder::new(factory);
        for (entity, err) in failures {
            builder.failure(&entity, err);
        }

        let mut completions: Vec<(EntityIdentity, Completion)> =
            Vec::with_capacity(operations.len());
        let mut remaining = operations.into_iter();
        while let Some(operation) = remaining.next() {
            let entity = operation.reference.entity().clone();
            match executor.submit(operation, sync).await {
                Ok(completion) => completions.push((entity, completion)),
                Err(err) => {
                    warn!("💀 '{}': submission stopped: {}", index, err);
                    builder.failure(&entity, anyhow::Error::from(err));
                    for unsent in remaining.by_ref() {
                        builder.failing_entity(unsent.reference.entity());
                    }
                }
            }
        }

        if !sync.await_completion {
            tokio::spawn(async move {
                for (entity, completion) in completions {
                    if let Err(err) = completion.wait().await {
                        warn!(
                            "💀 '{}': background write of '{}' {} failed: {:#}",
                            index, entity.entity_name, entity.identifier, err
                        );
                    }
                }
            });
            return Ok(builder.build());
        }

        let outcomes = join_all(
            completions
                .into_iter()
                .map(|(entity, completion)| async move { (entity, completion.wait().await) }),
        )
        .await;
        for (entity, outcome) in outcomes {
            if let Err(err) = outcome {
                builder.failure(&entity, err);
            }
        }
        Ok(builder.build())
    }
}
