//! Review system abstraction.
//!
//! [`ReviewApi`] is the seam between the propagation engine and the code
//! review server. [`GerritClient`] talks to a real server over REST;
//! [`MemoryReview`] is an in-memory implementation used by tests and dry
//! runs.

pub mod gerrit;
pub mod memory;
pub mod query;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::ReviewError;

pub use gerrit::GerritClient;
pub use memory::MemoryReview;
pub use query::{parse_topic_query, topic_query};

/// Result type for review operations.
pub type ReviewResult<T> = std::result::Result<T, ReviewError>;

pub type ChangeNumber = u64;

/// Tag on votes for normal and blank-merge downstream propagation.
pub const AUTOMERGER_TAG: &str = "autogenerated:Automerger";

/// Tag on the blocking vote left on a source change after a conflict.
pub const MERGE_CONFLICT_TAG: &str = "autogenerated:MergeConflict";

/// Prefix shared by every machine-authored tag.
pub const AUTOGENERATED_PREFIX: &str = "autogenerated:";

/// Footer linking a downstream change to its source change number.
pub const FOOTER_FROM: &str = "Automerged-From";

/// Footer recording the source commit a downstream revision was built from.
pub const FOOTER_COMMIT: &str = "Automerged-Commit";

// ---------------------------------------------------------------------------
// Change model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeStatus {
    New,
    Merged,
    Abandoned,
}

impl fmt::Display for ChangeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::New => write!(f, "NEW"),
            Self::Merged => write!(f, "MERGED"),
            Self::Abandoned => write!(f, "ABANDONED"),
        }
    }
}

/// One vote on a label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub account: String,
    pub value: i32,
    pub tag: Option<String>,
}

impl Vote {
    pub fn is_autogenerated(&self) -> bool {
        self.tag
            .as_deref()
            .is_some_and(|t| t.starts_with(AUTOGENERATED_PREFIX))
    }
}

/// A label's range and current votes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelInfo {
    pub min: i32,
    pub max: i32,
    #[serde(default)]
    pub votes: Vec<Vote>,
}

impl LabelInfo {
    /// Effective value: a vote at the label minimum blocks, otherwise the
    /// highest vote counts. No votes means 0.
    pub fn value(&self) -> i32 {
        if self.min < 0 && self.votes.iter().any(|v| v.value == self.min) {
            return self.min;
        }
        self.votes.iter().map(|v| v.value).max().unwrap_or(0)
    }

    /// The vote cast with `tag`, if any.
    pub fn tagged(&self, tag: &str) -> Option<&Vote> {
        self.votes.iter().find(|v| v.tag.as_deref() == Some(tag))
    }
}

/// A change as the engine sees it: metadata plus its current revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeInfo {
    pub number: ChangeNumber,
    pub project: String,
    pub branch: String,
    pub topic: Option<String>,
    pub subject: String,
    pub status: ChangeStatus,
    /// Commit SHA of the current revision.
    pub current_revision: String,
    /// Patchset number of the current revision, starting at 1.
    pub revision_number: u32,
    /// Full commit message of the current revision.
    pub message: String,
    #[serde(default)]
    pub labels: BTreeMap<String, LabelInfo>,
}

impl ChangeInfo {
    /// Ref under which the current revision is published.
    pub fn revision_ref(&self) -> String {
        format!(
            "refs/changes/{:02}/{}/{}",
            self.number % 100,
            self.number,
            self.revision_number
        )
    }

    pub fn label(&self, name: &str) -> Option<&LabelInfo> {
        self.labels.get(name)
    }

    /// Value of the last footer line `key: value` in the message.
    pub fn footer(&self, key: &str) -> Option<&str> {
        footer_value(&self.message, key)
    }

    /// The source change this change was propagated from.
    pub fn automerged_from(&self) -> Option<ChangeNumber> {
        self.footer(FOOTER_FROM).and_then(|v| v.parse().ok())
    }

    /// The source commit the current revision was built from.
    pub fn automerged_commit(&self) -> Option<&str> {
        self.footer(FOOTER_COMMIT)
    }
}

impl fmt::Display for ChangeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}/{})", self.number, self.project, self.branch)
    }
}

fn footer_value<'m>(message: &'m str, key: &str) -> Option<&'m str> {
    message.lines().rev().find_map(|line| {
        line.strip_prefix(key)
            .and_then(|rest| rest.strip_prefix(':'))
            .map(str::trim)
    })
}

// ---------------------------------------------------------------------------
// Write requests
// ---------------------------------------------------------------------------

/// How the review server should record a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeStrategy {
    /// Normal content merge.
    Recursive,
    /// Keep the destination tree, record the source as merged.
    Ours,
}

/// A merge commit proposed for review.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeRevision {
    /// SHA of the commit written to the object store.
    pub commit: String,
    /// Destination tip the commit's first parent points at.
    pub base_commit: String,
    /// Source commit merged as the second parent.
    pub source_commit: String,
    pub strategy: MergeStrategy,
    pub message: String,
}

impl MergeRevision {
    pub fn subject(&self) -> &str {
        self.message.lines().next().unwrap_or_default()
    }
}

/// A new change to open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewChange {
    pub project: String,
    pub branch: String,
    pub topic: String,
    pub revision: MergeRevision,
}

/// A vote to cast as the automerger account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteInput {
    pub label: String,
    pub value: i32,
    pub tag: Option<String>,
    pub message: Option<String>,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Operations the engine needs from the review server.
///
/// All writes happen as the automerger's own account, so votes cast here
/// never replace a human's vote.
#[async_trait]
pub trait ReviewApi: Send + Sync {
    async fn get_change(&self, number: ChangeNumber) -> ReviewResult<ChangeInfo>;

    /// Run a query in the server's query language.
    async fn query_changes(&self, query: &str) -> ReviewResult<Vec<ChangeInfo>>;

    async fn create_change(&self, change: NewChange) -> ReviewResult<ChangeInfo>;

    /// Append a new revision (patchset) to an existing change.
    async fn append_revision(
        &self,
        number: ChangeNumber,
        revision: MergeRevision,
    ) -> ReviewResult<ChangeInfo>;

    async fn set_vote(&self, number: ChangeNumber, vote: VoteInput) -> ReviewResult<()>;

    async fn set_topic(&self, number: ChangeNumber, topic: &str) -> ReviewResult<()>;

    /// The automerger configuration document, `None` if none is stored.
    async fn config_document(&self) -> ReviewResult<Option<String>>;
}
