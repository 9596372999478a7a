//! 🎬 *[a file full of changes. one per line. no commas. no brackets. just vibes.]*
//!
//! 📜 The change log is the untyped way in: an NDJSON file where each line says
//! "do this to that document in this index". It exists for callers that have no
//! Rust types to register (the CLI, replays, fixtures) and goes through the same
//! `WorkPlan` as everything else, so the same reduction applies.
//!
//! ```text
//! {"op":"add","index":"books","id":"1","entity":"Book","document":{"title":"Dune"}}
//! {"op":"delete","index":"books","id":"1"}
//! ```

use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, trace};

use crate::document::DocumentContributor;
use crate::mapping::IndexingSession;
use crate::plan::WorkPlan;
use crate::reference::DocumentReference;
use crate::sequencing::OperationKind;

/// 📝 One line of the change log.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ChangeRecord {
    pub op: OperationKind,
    pub index: String,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing: Option<String>,
    /// 🏷️ Only used to name the entity in failure reports.
    #[serde(default = "default_entity")]
    pub entity: String,
    /// 📄 The full document body for `add`/`update`. Must be a JSON object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<Value>,
}

fn default_entity() -> String {
    "Document".to_string()
}

impl ChangeRecord {
    pub fn reference(&self) -> DocumentReference {
        DocumentReference::new(
            self.id.clone(),
            self.routing.clone(),
            self.entity.clone(),
            Value::String(self.id.clone()),
        )
    }

    /// 📋 Enqueue this change into `plan`. A bad document body surfaces when the
    /// contributor runs, as a failure of this one document.
    pub fn apply_to(self, plan: &mut WorkPlan) {
        let reference = self.reference();
        match self.op {
            OperationKind::Delete => plan.delete(&reference),
            OperationKind::Add => plan.add(&reference, body_contributor(self.document)),
            OperationKind::Update => plan.update(&reference, body_contributor(self.document)),
        }
    }
}

fn body_contributor(document: Option<Value>) -> DocumentContributor {
    DocumentContributor::new(move |state| match document {
        Some(Value::Object(fields)) => {
            for (field, value) in fields {
                state.add_value(field, value);
            }
            Ok(())
        }
        Some(other) => bail!("💀 A document body must be a JSON object, got: {other}"),
        None => bail!("💀 add/update without a 'document' has nothing to index"),
    })
}

/// 📂 Read an NDJSON change log. Blank lines are skipped; a bad line fails the whole read.
pub async fn read_change_log(path: &Path) -> Result<Vec<ChangeRecord>> {
    let file = File::open(path)
        .await
        .with_context(|| format!("💀 Could not open change log '{}'", path.display()))?;
    let mut lines = BufReader::new(file).lines();
    let mut records = Vec::new();
    let mut line_number = 0usize;
    while let Some(line) = lines.next_line().await.with_context(|| {
        format!("💀 Reading '{}' failed after line {}", path.display(), line_number)
    })? {
        line_number += 1;
        if line.trim().is_empty() {
            continue;
        }
        let record: ChangeRecord = serde_json::from_str(&line).with_context(|| {
            format!("💀 Line {} of '{}' is not a change record", line_number, path.display())
        })?;
        trace!("📜 line {}: {} '{}' in '{}'", line_number, record.op, record.id, record.index);
        records.push(record);
    }
    debug!("📜 Read {} change(s) from '{}'", records.len(), path.display());
    Ok(records)
}

/// 🔁 Feed every record into the session's per-index plans. Returns how many were applied.
pub fn replay(
    session: &mut IndexingSession<'_>,
    records: impl IntoIterator<Item = ChangeRecord>,
) -> usize {
    let mut applied = 0;
    for record in records {
        let plan = session.plan_mut(&record.index);
        record.apply_to(plan);
        applied += 1;
    }
    applied
}
