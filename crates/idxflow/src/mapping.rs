//! 🗺️ Mapping — how application types become documents, and the session that uses it.
//!
//! 🎬 *[the application holds a `Book`. the cluster wants JSON. somebody has to translate.]*
//!
//! A `MappingRegistry` is built once at startup: one `EntityBinding<E>` per entity
//! type, saying which index it lives in, how to get its identifier (and routing key,
//! if any), and how to fill a document from it. Nothing reflective happens at
//! runtime; a type nobody registered is an `UnmappedEntity` error, not a guess.
//!
//! An `IndexingSession` is one unit of work. It keeps one `WorkPlan` per touched
//! index, in first-touch order, and executes them all at the end, merging the
//! per-index reports into one.
//!
//! 📸 The entity is cloned when the operation is enqueued and the contributor runs
//! against that snapshot. A later `update` of the same entity replaces the snapshot.

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use serde_json::Value;
use tracing::debug;

use crate::document::{DocumentContributor, DocumentState};
use crate::engine::IndexingEngine;
use crate::error::IndexingError;
use crate::plan::WorkPlan;
use crate::reference::{DefaultEntityReferenceFactory, DocumentReference, EntityReferenceFactory};
use crate::report::ExecutionReport;
use crate::sync::SynchronizationStrategy;

type IdFn<E> = Box<dyn Fn(&E) -> String + Send + Sync>;
type ContributeFn<E> = Arc<dyn Fn(&E, &mut DocumentState) -> anyhow::Result<()> + Send + Sync>;

/// 🔗 How one entity type maps onto one index.
pub struct EntityBinding<E> {
    index: String,
    entity_name: String,
    identifier: IdFn<E>,
    routing: Option<IdFn<E>>,
    contribute: ContributeFn<E>,
}

impl<E> EntityBinding<E>
where
    E: Clone + Send + 'static,
{
    pub fn new(
        index: impl Into<String>,
        entity_name: impl Into<String>,
        identifier: impl Fn(&E) -> String + Send + Sync + 'static,
        contribute: impl Fn(&E, &mut DocumentState) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            index: index.into(),
            entity_name: entity_name.into(),
            identifier: Box::new(identifier),
            routing: None,
            contribute: Arc::new(contribute),
        }
    }

    /// 🧭 Route documents of this type by a key derived from the entity.
    pub fn with_routing(mut self, routing: impl Fn(&E) -> String + Send + Sync + 'static) -> Self {
        self.routing = Some(Box::new(routing));
        self
    }

    pub fn index(&self) -> &str {
        &self.index
    }

    fn reference(&self, entity: &E) -> DocumentReference {
        let identifier = (self.identifier)(entity);
        let routing = self.routing.as_ref().map(|routing| routing(entity));
        DocumentReference::new(
            identifier.clone(),
            routing,
            self.entity_name.clone(),
            Value::String(identifier),
        )
    }

    fn contributor(&self, entity: &E) -> DocumentContributor {
        let snapshot = entity.clone();
        let contribute = self.contribute.clone();
        DocumentContributor::new(move |document| contribute(&snapshot, document))
    }
}

impl<E> fmt::Debug for EntityBinding<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityBinding")
            .field("index", &self.index)
            .field("entity_name", &self.entity_name)
            .field("routed", &self.routing.is_some())
            .finish_non_exhaustive()
    }
}

/// 📚 Every binding, keyed by Rust type.
#[derive(Default)]
pub struct MappingRegistry {
    bindings: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl MappingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 📌 Bind `E`. Registering the same type twice replaces the earlier binding.
    pub fn register<E>(&mut self, binding: EntityBinding<E>) -> &mut Self
    where
        E: Clone + Send + 'static,
    {
        debug!("🗺️ '{}' maps to index '{}'", type_name::<E>(), binding.index);
        self.bindings.insert(TypeId::of::<E>(), Box::new(binding));
        self
    }

    pub fn binding<E: 'static>(&self) -> Result<&EntityBinding<E>, IndexingError> {
        self.bindings
            .get(&TypeId::of::<E>())
            .and_then(|binding| binding.downcast_ref::<EntityBinding<E>>())
            .ok_or(IndexingError::UnmappedEntity {
                type_name: type_name::<E>(),
            })
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

impl fmt::Debug for MappingRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappingRegistry").field("bindings", &self.bindings.len()).finish()
    }
}

/// 🧾 One unit of work across however many indexes it touches.
#[derive(Debug)]
pub struct IndexingSession<'e> {
    engine: &'e IndexingEngine,
    registry: &'e MappingRegistry,
    plans: Vec<WorkPlan>,
    synchronization: SynchronizationStrategy,
}

impl<'e> IndexingSession<'e> {
    /// 🚀 A session using the engine's default synchronization strategy.
    pub fn new(engine: &'e IndexingEngine, registry: &'e MappingRegistry) -> Self {
        Self {
            engine,
            registry,
            plans: Vec::new(),
            synchronization: engine.synchronization(),
        }
    }

    pub fn with_synchronization(mut self, synchronization: SynchronizationStrategy) -> Self {
        self.synchronization = synchronization;
        self
    }

    pub fn synchronization(&self) -> SynchronizationStrategy {
        self.synchronization
    }

    /// 📋 The plan for `index`, created on first touch. For callers without a typed binding.
    pub fn plan_mut(&mut self, index: &str) -> &mut WorkPlan {
        let position = match self.plans.iter().position(|plan| plan.index() == index) {
            Some(position) => position,
            None => {
                self.plans.push(self.engine.create_plan(index));
                self.plans.len() - 1
            }
        };
        &mut self.plans[position]
    }

    pub fn add<E: Clone + Send + 'static>(&mut self, entity: &E) -> Result<(), IndexingError> {
        let registry = self.registry;
        let binding = registry.binding::<E>()?;
        let (reference, contributor) = (binding.reference(entity), binding.contributor(entity));
        self.plan_mut(binding.index()).add(&reference, contributor);
        Ok(())
    }

    pub fn update<E: Clone + Send + 'static>(&mut self, entity: &E) -> Result<(), IndexingError> {
        let registry = self.registry;
        let binding = registry.binding::<E>()?;
        let (reference, contributor) = (binding.reference(entity), binding.contributor(entity));
        self.plan_mut(binding.index()).update(&reference, contributor);
        Ok(())
    }

    pub fn delete<E: Clone + Send + 'static>(&mut self, entity: &E) -> Result<(), IndexingError> {
        let registry = self.registry;
        let binding = registry.binding::<E>()?;
        let reference = binding.reference(entity);
        self.plan_mut(binding.index()).delete(&reference);
        Ok(())
    }

    /// 📏 Pending operations across every index.
    pub fn len(&self) -> usize {
        self.plans.iter().map(WorkPlan::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.plans.iter().all(WorkPlan::is_empty)
    }

    /// 🏃 Run every pending contributor now.
    pub fn process(&mut self) -> usize {
        self.plans.iter_mut().map(WorkPlan::process).sum()
    }

    /// 🗑️ Roll back: drop every plan without executing or reporting anything.
    pub fn discard(&mut self) {
        for plan in &mut self.plans {
            plan.discard();
        }
        self.plans.clear();
    }

    pub async fn execute(self) -> Result<(), IndexingError> {
        self.execute_and_report(&DefaultEntityReferenceFactory).await?.into_result()
    }

    /// 📊 Execute every plan concurrently (one executor per index) and merge the reports
    /// in the order the indexes were first touched.
    pub async fn execute_and_report(
        self,
        factory: &dyn EntityReferenceFactory,
    ) -> Result<ExecutionReport, IndexingError> {
        let engine = self.engine;
        let synchronization = self.synchronization;
        let executions = self
            .plans
            .into_iter()
            .filter(|plan| !plan.is_empty())
            .map(move |plan| async move {
                let executor = engine.executor(plan.index());
                plan.execute_and_report(&executor, synchronization, factory)
                    .await
            });

        let mut merged = ExecutionReport::success();
        for report in join_all(executions).await {
            merged = merged.merge(report?);
        }
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_config::PipelineConfig;
    use crate::backends::{BackendHandle, InMemoryBackend};
    use crate::capabilities::BackendDistribution;
    use crate::reference::{DocumentKey, EntityIdentity, EntityReference};
    use anyhow::{Result, bail};
    use serde_json::json;

    #[derive(Debug, Clone)]
    struct Book {
        id: u32,
        title: String,
        library: String,
    }

    #[derive(Debug, Clone)]
    struct Author {
        id: u32,
        name: String,
    }

    #[derive(Debug, Clone)]
    struct Unmapped;

    fn registry() -> MappingRegistry {
        let mut registry = MappingRegistry::new();
        registry
            .register(
                EntityBinding::<Book>::new(
                    "books",
                    "Book",
                    |b| b.id.to_string(),
                    |b, doc| {
                        if b.title.is_empty() {
                            bail!("a book needs a title");
                        }
                        doc.add_value("title", b.title.clone());
                        Ok(())
                    },
                )
                .with_routing(|b| b.library.clone()),
            )
            .register(EntityBinding::<Author>::new(
                "authors",
                "Author",
                |a| a.id.to_string(),
                |a, doc| {
                    doc.add_value("name", a.name.clone());
                    Ok(())
                },
            ));
        registry
    }

    fn book(id: u32, title: &str) -> Book {
        Book {
            id,
            title: title.into(),
            library: "main".into(),
        }
    }

    #[tokio::test]
    async fn the_one_where_one_session_spans_two_indexes() -> Result<()> {
        let backend = InMemoryBackend::default();
        let engine = IndexingEngine::new(
            BackendHandle::InMemory(backend.clone()),
            PipelineConfig::default(),
        );
        let registry = registry();

        let mut session = IndexingSession::new(&engine, &registry)
            .with_synchronization(SynchronizationStrategy::Sync);
        session.add(&book(1, "Dune"))?;
        session.add(&Author { id: 7, name: "Frank Herbert".into() })?;
        session.update(&book(1, "Dune (revised)"))?;
        assert_eq!(session.len(), 2);
        session.execute().await?;

        let books = backend.snapshot("books").await;
        assert_eq!(
            books.searchable.get(&DocumentKey::routed("1", "main")),
            Some(&json!({"title": "Dune (revised)"}))
        );
        assert_eq!(books.committed.len(), 1);
        let authors = backend.snapshot("authors").await;
        assert!(authors.searchable.contains_key(&DocumentKey::unrouted("7")));
        engine.shutdown().await
    }

    #[tokio::test]
    async fn the_one_where_an_unregistered_type_is_refused() {
        let engine = IndexingEngine::new(
            BackendHandle::InMemory(InMemoryBackend::default()),
            PipelineConfig::default(),
        );
        let registry = registry();
        let mut session = IndexingSession::new(&engine, &registry);
        match session.add(&Unmapped) {
            Err(IndexingError::UnmappedEntity { type_name }) => {
                assert!(type_name.ends_with("Unmapped"))
            }
            plot_twist => panic!("💀 expected UnmappedEntity, got {plot_twist:?}"),
        }
    }

    struct ShoutingFactory;

    impl EntityReferenceFactory for ShoutingFactory {
        fn create_entity_reference(&self, entity: &EntityIdentity) -> Result<EntityReference> {
            Ok(EntityReference {
                entity_name: entity.entity_name.to_uppercase(),
                identifier: entity.identifier.as_str().unwrap_or_default().to_string(),
            })
        }
    }

    #[tokio::test]
    async fn the_one_where_reports_from_two_indexes_merge() -> Result<()> {
        let backend = InMemoryBackend::default();
        backend.reject_document("7", "authors are not allowed today").await;
        let engine = IndexingEngine::new(
            BackendHandle::InMemory(backend.clone()),
            PipelineConfig::default(),
        );
        let registry = registry();

        let mut session = IndexingSession::new(&engine, &registry);
        session.add(&book(1, ""))?;
        session.add(&book(2, "Emma"))?;
        session.add(&Author { id: 7, name: "Jane Austen".into() })?;
        let report = session.execute_and_report(&ShoutingFactory).await?;

        assert_eq!(
            report.failing_entities().iter().map(ToString::to_string).collect::<Vec<_>>(),
            vec!["BOOK#1".to_string(), "AUTHOR#7".to_string()]
        );
        let failure = report.failure().expect("two failures");
        assert!(format!("{:#}", failure.primary()).contains("a book needs a title"));
        assert_eq!(failure.suppressed().len(), 1);
        let books = backend.snapshot("books").await;
        assert!(books.written.contains_key(&DocumentKey::routed("2", "main")));
        engine.shutdown().await
    }

    #[tokio::test]
    async fn the_one_where_discard_is_a_clean_rollback() -> Result<()> {
        let backend = InMemoryBackend::new(BackendDistribution::Elasticsearch);
        let engine = IndexingEngine::new(
            BackendHandle::InMemory(backend.clone()),
            PipelineConfig::default(),
        );
        let registry = registry();

        let mut session = IndexingSession::new(&engine, &registry);
        session.add(&book(1, "Dune"))?;
        session.delete(&Author { id: 3, name: String::new() })?;
        session.discard();
        assert!(session.is_empty());
        session.execute().await?;
        assert_eq!(backend.calls().writes, 0);
        engine.shutdown().await
    }

    #[test]
    fn the_one_where_routing_comes_from_the_binding() -> Result<()> {
        let registry = registry();
        let binding = registry.binding::<Book>()?;
        let reference = binding.reference(&book(5, "Middlemarch"));
        assert_eq!(reference.identifier(), "5");
        assert_eq!(reference.routing_key(), Some("main"));
        assert_eq!(reference.entity().entity_name, "Book");
        Ok(())
    }
}
