//! 🧮 Sequencing — the reduction table that turns a noisy stream of changes into
//! the fewest writes that still land on the same final document.
//!
//! 🎬 *[add. update. update. delete. add. update.]*
//! *[the application was busy. the cluster does not need to know how busy.]*
//!
//! Every new operation for a document is compared against the effective operation
//! already recorded for it:
//!
//! | existing | incoming | result                                            |
//! |----------|----------|---------------------------------------------------|
//! | —        | any      | incoming                                          |
//! | ADD      | ADD      | ADD, re-contributed                               |
//! | ADD      | UPDATE   | ADD, re-contributed                               |
//! | ADD      | DELETE   | cancelled, or DELETE if the doc existed before    |
//! | UPDATE   | ADD      | UPDATE, re-contributed                            |
//! | UPDATE   | UPDATE   | UPDATE, re-contributed                            |
//! | UPDATE   | DELETE   | DELETE                                            |
//! | DELETE   | ADD      | ADD, re-contributed                               |
//! | DELETE   | UPDATE   | ADD, re-contributed                               |
//! | DELETE   | DELETE   | DELETE                                            |
//!
//! "Existed before" means the first touch in this plan was not an ADD. An ADD that
//! resurrected a deleted document cannot simply vanish on a later DELETE: the
//! original document is still sitting in the index and has to go.

use std::fmt;

use serde::{Deserialize, Serialize};

/// ✍️ The three things you can do to a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Add,
    Update,
    Delete,
}

impl OperationKind {
    /// 🎨 Whether this kind carries a document body.
    pub fn needs_contribution(self) -> bool {
        !matches!(self, OperationKind::Delete)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Add => "add",
            Self::Update => "update",
            Self::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// ⚖️ What the plan should do with a document slot after an incoming operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduction {
    /// Keep the slot with this effective kind. For ADD/UPDATE, the incoming contributor
    /// replaces whatever was recorded.
    Keep(OperationKind),
    /// 🗑️ Drop the slot entirely; nothing is ever sent for this document.
    Cancel,
}

/// 🧮 Apply one row of the reduction table.
pub fn reduce(
    existing: Option<OperationKind>,
    incoming: OperationKind,
    present_before_plan: bool,
) -> Reduction {
    use OperationKind::{Add, Delete, Update};

    let Some(existing) = existing else {
        return Reduction::Keep(incoming);
    };
    match (existing, incoming) {
        (Add, Add) | (Add, Update) => Reduction::Keep(Add),
        (Add, Delete) if present_before_plan => Reduction::Keep(Delete),
        (Add, Delete) => Reduction::Cancel,
        (Update, Add) | (Update, Update) => Reduction::Keep(Update),
        (Update, Delete) => Reduction::Keep(Delete),
        (Delete, Add) | (Delete, Update) => Reduction::Keep(Add),
        (Delete, Delete) => Reduction::Keep(Delete),
    }
}

#[cfg(test)]
mod tests {
    use super::OperationKind::{Add, Delete, Update};
    use super::*;

    /// 🧪 Fold a whole history for one document through the table.
    fn fold(history: &[OperationKind]) -> Option<OperationKind> {
        let mut effective = None;
        let mut present_before = false;
        for &op in history {
            if effective.is_none() {
                present_before = op != Add;
            }
            effective = match reduce(effective, op, present_before) {
                Reduction::Keep(kind) => Some(kind),
                Reduction::Cancel => None,
            };
        }
        effective
    }

    #[test]
    fn the_one_where_first_touch_is_taken_at_face_value() {
        for op in [Add, Update, Delete] {
            assert_eq!(reduce(None, op, op != Add), Reduction::Keep(op));
        }
    }

    #[test]
    fn the_one_where_every_row_of_the_table_holds() {
        assert_eq!(reduce(Some(Add), Update, false), Reduction::Keep(Add));
        assert_eq!(reduce(Some(Add), Delete, false), Reduction::Cancel);
        assert_eq!(reduce(Some(Update), Update, true), Reduction::Keep(Update));
        assert_eq!(reduce(Some(Update), Delete, true), Reduction::Keep(Delete));
        assert_eq!(reduce(Some(Delete), Add, true), Reduction::Keep(Add));
        assert_eq!(reduce(Some(Delete), Update, true), Reduction::Keep(Add));
        assert_eq!(reduce(Some(Delete), Delete, true), Reduction::Keep(Delete));
    }

    #[test]
    fn the_one_where_add_update_delete_sends_nothing() {
        assert_eq!(fold(&[Add, Update, Delete]), None);
    }

    #[test]
    fn the_one_where_a_resurrected_document_still_gets_deleted() {
        // 🧟 delete → add → delete: the original document existed, so it must still go.
        assert_eq!(fold(&[Delete, Add, Delete]), Some(Delete));
    }

    #[test]
    fn the_one_where_an_update_never_downgrades_an_add() {
        assert_eq!(fold(&[Add, Update, Update, Update]), Some(Add));
        assert_eq!(fold(&[Update, Update]), Some(Update));
        assert_eq!(fold(&[Delete, Update]), Some(Add));
    }
}
