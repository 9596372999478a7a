//! 📝 Document contribution — the deferred "fill in the fields" step.
//!
//! 🎬 *[a closure is captured. it waits. it does not know when it will be called.]*
//! *[maybe at enqueue time. maybe at flush time. it only knows: exactly once.]*
//!
//! The mapping layer does not build documents up front. It hands the pipeline a
//! `DocumentContributor`: a one-shot function that, when invoked, populates a
//! `DocumentState`. The pipeline decides WHEN (eagerly in `process()`, or lazily at
//! execution) and guarantees it happens at most once per effective operation.
//!
//! 🧠 Knowledge graph:
//! - `DocumentContributor` wraps `FnOnce` — the type system already forbids a second call.
//! - `Contribution` is the single-shot guard around it inside the plan:
//!   `Pending → Ready(payload) | Failed(err)`, with `Spent` as the poisoned middle state.
//! - `DocumentPayload` is the immutable, backend-ready JSON.

use std::fmt;
use std::mem;

use anyhow::{Result, anyhow};
use serde_json::{Map, Value};

/// 📦 The mutable document the contributor writes into. Ordered, JSON-shaped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentState {
    fields: Map<String, Value>,
}

impl DocumentState {
    pub fn new() -> Self {
        Self::default()
    }

    /// ➕ Add a value to a field. A second value for the same field turns it multi-valued.
    pub fn add_value(&mut self, field: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        let value = value.into();
        let field = field.into();
        match self.fields.get_mut(&field) {
            None => {
                self.fields.insert(field, value);
            }
            Some(Value::Array(values)) => values.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
            }
        }
        self
    }

    /// 🪆 Add a nested object field, populated by `fill`.
    pub fn add_object(
        &mut self,
        field: impl Into<String>,
        fill: impl FnOnce(&mut DocumentState),
    ) -> &mut Self {
        let mut nested = DocumentState::new();
        fill(&mut nested);
        self.add_value(field, Value::Object(nested.fields))
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn into_payload(self) -> DocumentPayload {
        DocumentPayload(Value::Object(self.fields))
    }
}

/// 🧊 A frozen, backend-ready document body.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentPayload(Value);

impl DocumentPayload {
    pub fn as_json(&self) -> &Value {
        &self.0
    }

    pub fn into_json(self) -> Value {
        self.0
    }
}

impl fmt::Display for DocumentPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

type ContributorFn = Box<dyn FnOnce(&mut DocumentState) -> Result<()> + Send>;

/// 🎨 A one-shot function that populates a document.
pub struct DocumentContributor(ContributorFn);

impl DocumentContributor {
    pub fn new<F>(contribute: F) -> Self
    where
        F: FnOnce(&mut DocumentState) -> Result<()> + Send + 'static,
    {
        Self(Box::new(contribute))
    }

    /// 🏁 Run the contributor against a fresh state and freeze the result.
    pub fn contribute(self) -> Result<DocumentPayload> {
        let mut state = DocumentState::new();
        (self.0)(&mut state)?;
        Ok(state.into_payload())
    }
}

impl fmt::Debug for DocumentContributor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // 🎭 closures don't do Debug. they barely do introductions.
        f.write_str("DocumentContributor(..)")
    }
}

/// 🔒 Single-shot guard around a contributor, owned by a plan slot.
#[derive(Debug)]
pub(crate) enum Contribution {
    Pending(DocumentContributor),
    Ready(DocumentPayload),
    Failed(anyhow::Error),
    /// ☠️ Taken but never resolved (the contributor panicked mid-flight).
    Spent,
}

impl Contribution {
    pub(crate) fn pending(contributor: DocumentContributor) -> Self {
        Self::Pending(contributor)
    }

    /// 🏃 Run the contributor if it has not run yet. Returns whether it ran.
    pub(crate) fn prepare(&mut self) -> bool {
        if !matches!(self, Self::Pending(_)) {
            return false;
        }
        let Self::Pending(contributor) = mem::replace(self, Self::Spent) else {
            return false;
        };
        *self = match contributor.contribute() {
            Ok(payload) => Self::Ready(payload),
            Err(err) => Self::Failed(err),
        };
        true
    }

    /// 📦 Resolve to the payload, running the contributor if still pending.
    pub(crate) fn into_payload(mut self) -> Result<DocumentPayload> {
        self.prepare();
        match self {
            Self::Ready(payload) => Ok(payload),
            Self::Failed(err) => Err(err.context("💀 The document contributor failed")),
            Self::Spent => Err(anyhow!(
                "💀 The document contributor was already consumed and never produced a document"
            )),
            Self::Pending(_) => Err(anyhow!(
                "💀 The document contributor is still pending after preparation"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn the_one_where_fields_become_multi_valued() {
        let mut state = DocumentState::new();
        state.add_value("tag", "rust").add_value("tag", "search").add_value("tag", "async");
        state.add_value("title", "Dune");

        assert_eq!(state.get("tag"), Some(&json!(["rust", "search", "async"])));
        assert_eq!(state.get("title"), Some(&json!("Dune")));
    }

    #[test]
    fn the_one_where_objects_nest() {
        let mut state = DocumentState::new();
        state.add_object("author", |author| {
            author.add_value("name", "Frank Herbert");
        });
        assert_eq!(
            state.into_payload().into_json(),
            json!({"author": {"name": "Frank Herbert"}})
        );
    }

    #[test]
    fn the_one_where_prepare_runs_the_contributor_exactly_once() -> Result<()> {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut contribution = Contribution::pending(DocumentContributor::new(move |doc| {
            counter.fetch_add(1, Ordering::SeqCst);
            doc.add_value("n", 1);
            Ok(())
        }));

        assert!(contribution.prepare());
        assert!(!contribution.prepare(), "second prepare is a no-op");
        let payload = contribution.into_payload()?;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(payload.as_json(), &json!({"n": 1}));
        Ok(())
    }

    #[test]
    fn the_one_where_a_failing_contributor_stays_failed() {
        let mut contribution = Contribution::pending(DocumentContributor::new(|_| {
            Err(anyhow!("bridge exploded"))
        }));
        assert!(contribution.prepare());
        let err = contribution.into_payload().expect_err("contributor failure must surface");
        assert!(format!("{err:#}").contains("bridge exploded"));
    }
}
