//! 🪪 References — who a document is, and who the caller thinks it is.
//!
//! Two identities travel together through the pipeline:
//! - the **document** identity (`identifier` + optional `routing_key`), which the
//!   backend cares about and the plan deduplicates on;
//! - the **entity** identity (`entity_name` + opaque identifier), which only matters
//!   when something fails and the caller wants to know WHICH of their objects broke.
//!
//! The caller reasons in entities. The cluster reasons in documents. This module is
//! the couples therapist. 🦆

use std::fmt;

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;

/// 🔑 The identity the plan deduplicates on: identifier plus routing key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentKey {
    pub identifier: String,
    pub routing_key: Option<String>,
}

impl DocumentKey {
    pub fn unrouted(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            routing_key: None,
        }
    }

    pub fn routed(identifier: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            routing_key: Some(routing_key.into()),
        }
    }
}

/// 🏷️ The caller's view of the entity behind a document. Only used for reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityIdentity {
    pub entity_name: String,
    pub identifier: Value,
}

/// 📄 Everything the pipeline needs to know about the document being written.
///
/// Immutable once built. Created by the mapping layer when an operation is enqueued.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentReference {
    key: DocumentKey,
    entity: EntityIdentity,
}

impl DocumentReference {
    pub fn new(
        identifier: impl Into<String>,
        routing_key: Option<String>,
        entity_name: impl Into<String>,
        entity_identifier: Value,
    ) -> Self {
        Self {
            key: DocumentKey {
                identifier: identifier.into(),
                routing_key,
            },
            entity: EntityIdentity {
                entity_name: entity_name.into(),
                identifier: entity_identifier,
            },
        }
    }

    /// 🔄 Snapshot whatever the provider exposes into an owned reference.
    pub fn from_provider(provider: &(impl DocumentReferenceProvider + ?Sized)) -> Self {
        Self::new(
            provider.identifier(),
            provider.routing_key().map(str::to_owned),
            provider.entity_name(),
            provider.entity_identifier(),
        )
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn identifier(&self) -> &str {
        &self.key.identifier
    }

    pub fn routing_key(&self) -> Option<&str> {
        self.key.routing_key.as_deref()
    }

    pub fn entity(&self) -> &EntityIdentity {
        &self.entity
    }
}

/// 🪪 What the mapping layer hands to `add`/`update`/`delete`.
pub trait DocumentReferenceProvider {
    fn identifier(&self) -> &str;
    fn routing_key(&self) -> Option<&str>;
    fn entity_name(&self) -> &str;
    fn entity_identifier(&self) -> Value;
}

impl DocumentReferenceProvider for DocumentReference {
    fn identifier(&self) -> &str {
        &self.key.identifier
    }

    fn routing_key(&self) -> Option<&str> {
        self.key.routing_key.as_deref()
    }

    fn entity_name(&self) -> &str {
        &self.entity.entity_name
    }

    fn entity_identifier(&self) -> Value {
        self.entity.identifier.clone()
    }
}

/// 🎯 The caller-facing handle for a failed entity, e.g. `Book#42`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityReference {
    pub entity_name: String,
    pub identifier: String,
}

impl fmt::Display for EntityReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.entity_name, self.identifier)
    }
}

/// 🏭 Turns an entity identity into a caller-facing reference.
///
/// Fallible on purpose: real mappings run user code here (identifier bridges), and that
/// code can break. The report builder captures those failures instead of propagating them.
pub trait EntityReferenceFactory: Send + Sync {
    fn create_entity_reference(&self, entity: &EntityIdentity) -> Result<EntityReference>;
}

/// 🏭 Strings stay strings, everything else is rendered as compact JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultEntityReferenceFactory;

impl EntityReferenceFactory for DefaultEntityReferenceFactory {
    fn create_entity_reference(&self, entity: &EntityIdentity) -> Result<EntityReference> {
        let identifier = match &entity.identifier {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        Ok(EntityReference {
            entity_name: entity.entity_name.clone(),
            identifier,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn the_one_where_routing_makes_a_different_document() {
        let plain = DocumentReference::new("42", None, "Book", json!(42));
        let routed = DocumentReference::new("42", Some("eu".into()), "Book", json!(42));
        assert_ne!(plain.key(), routed.key(), "same id, different shard, different document");
        assert_eq!(routed.routing_key(), Some("eu"));
    }

    #[test]
    fn the_one_where_the_default_factory_renders_identifiers() -> Result<()> {
        let factory = DefaultEntityReferenceFactory;
        let numeric = DocumentReference::new("42", None, "Book", json!(42));
        let textual = DocumentReference::new("abc", None, "Author", json!("abc"));

        assert_eq!(factory.create_entity_reference(numeric.entity())?.to_string(), "Book#42");
        assert_eq!(factory.create_entity_reference(textual.entity())?.to_string(), "Author#abc");
        Ok(())
    }

    #[test]
    fn the_one_where_a_reference_can_be_rebuilt_from_itself() {
        let original = DocumentReference::new("7", Some("r1".into()), "Book", json!({"isbn": "7"}));
        let copy = DocumentReference::from_provider(&original);
        assert_eq!(original, copy);
    }
}
