//! ⏳ Synchronization — how long does the caller wait after handing over a plan?
//!
//! Not a state machine. Just a dial with four notches:
//!
//! | strategy     | caller resumes when...                 | commit | refresh |
//! |--------------|----------------------------------------|--------|---------|
//! | `async`      | work is queued                         | no     | no      |
//! | `write_sync` | the backend acknowledged the write     | yes    | no      |
//! | `read_sync`  | a search would see the change          | no     | yes     |
//! | `sync`       | both durable and searchable            | yes    | yes     |
//!
//! The dial is configuration attached to a session, never hard-coded at a call site.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SynchronizationStrategy {
    /// 🚀 Fire and forget.
    #[serde(alias = "fire_and_forget")]
    Async,
    /// ✅ Wait for backend acknowledgment (and commit where the backend needs one).
    #[default]
    #[serde(alias = "wait_for_ack")]
    WriteSync,
    /// 👀 Wait until the change is searchable.
    #[serde(alias = "wait_for_searchability")]
    ReadSync,
    /// 🐢 Durable and searchable before returning.
    Sync,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
    None,
    Force,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshMode {
    None,
    Force,
}

/// 📋 The concrete obligations a strategy puts on the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPlan {
    pub commit: CommitMode,
    pub refresh: RefreshMode,
    pub await_completion: bool,
}

impl SyncPlan {
    pub const QUEUED: Self = Self {
        commit: CommitMode::None,
        refresh: RefreshMode::None,
        await_completion: false,
    };
}

impl SynchronizationStrategy {
    pub fn plan(self) -> SyncPlan {
        match self {
            Self::Async => SyncPlan::QUEUED,
            Self::WriteSync => SyncPlan {
                commit: CommitMode::Force,
                refresh: RefreshMode::None,
                await_completion: true,
            },
            Self::ReadSync => SyncPlan {
                commit: CommitMode::None,
                refresh: RefreshMode::Force,
                await_completion: true,
            },
            Self::Sync => SyncPlan {
                commit: CommitMode::Force,
                refresh: RefreshMode::Force,
                await_completion: true,
            },
        }
    }
}
