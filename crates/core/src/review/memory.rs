//! In-memory review server.
//!
//! Behaves like the parts of a review server the engine relies on: votes are
//! per account and reset when a new revision is uploaded, topics are queried
//! with the same escaping rules as the real query language, and labels have
//! configurable ranges. Test helpers let a "human" upload changes, vote and
//! edit topics.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::errors::ReviewError;
use crate::review::query::{parse_query, QueryTerm};
use crate::review::*;

/// Account the engine acts as.
pub const AUTOMERGER_ACCOUNT: &str = "automerger";

#[derive(Debug)]
struct StoredChange {
    info: ChangeInfo,
    /// label -> account -> vote
    votes: BTreeMap<String, BTreeMap<String, Vote>>,
}

#[derive(Debug, Default)]
struct State {
    next_number: ChangeNumber,
    changes: BTreeMap<ChangeNumber, StoredChange>,
    labels: BTreeMap<String, (i32, i32)>,
    config: Option<String>,
    topic_writes: usize,
}

/// In-memory [`ReviewApi`] implementation.
#[derive(Debug)]
pub struct MemoryReview {
    state: Mutex<State>,
    unavailable: AtomicBool,
}

impl Default for MemoryReview {
    fn default() -> Self {
        let mut labels = BTreeMap::new();
        labels.insert("Code-Review".to_string(), (-2, 2));
        Self {
            state: Mutex::new(State {
                next_number: 1,
                labels,
                ..State::default()
            }),
            unavailable: AtomicBool::new(false),
        }
    }
}

impl MemoryReview {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define (or redefine) a label range.
    pub fn with_label(self, name: &str, min: i32, max: i32) -> Self {
        self.lock().labels.insert(name.to_string(), (min, max));
        self
    }

    pub fn set_config_document(&self, text: &str) {
        self.lock().config = Some(text.to_string());
    }

    /// Make every call fail as if the server were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Upload a change as a human. `commit` must already exist in the
    /// object store; `message` is its commit message.
    pub fn upload(
        &self,
        project: &str,
        branch: &str,
        commit: &str,
        message: &str,
        topic: Option<&str>,
    ) -> ChangeInfo {
        let mut state = self.lock();
        let number = state.next_number;
        state.next_number += 1;
        let info = ChangeInfo {
            number,
            project: project.to_string(),
            branch: branch.to_string(),
            topic: topic.map(str::to_string),
            subject: subject_of(message),
            status: ChangeStatus::New,
            current_revision: commit.to_string(),
            revision_number: 1,
            message: message.to_string(),
            labels: BTreeMap::new(),
        };
        let stored = StoredChange {
            info,
            votes: BTreeMap::new(),
        };
        let rendered = state.render_stored(&stored);
        state.changes.insert(number, stored);
        rendered
    }

    /// Upload a new patchset as a human.
    pub fn amend(&self, number: ChangeNumber, commit: &str, message: &str) -> Option<ChangeInfo> {
        let mut state = self.lock();
        let stored = state.changes.get_mut(&number)?;
        stored.push_revision(commit, message);
        state.render(number)
    }

    /// Vote as a named account.
    pub fn vote_as(&self, number: ChangeNumber, account: &str, label: &str, value: i32) {
        let mut state = self.lock();
        if let Some(stored) = state.changes.get_mut(&number) {
            stored.votes.entry(label.to_string()).or_default().insert(
                account.to_string(),
                Vote {
                    account: account.to_string(),
                    value,
                    tag: None,
                },
            );
        }
    }

    /// Change a topic as a human.
    pub fn edit_topic(&self, number: ChangeNumber, topic: Option<&str>) {
        if let Some(stored) = self.lock().changes.get_mut(&number) {
            stored.info.topic = topic.map(str::to_string);
        }
    }

    pub fn mark_merged(&self, number: ChangeNumber) {
        if let Some(stored) = self.lock().changes.get_mut(&number) {
            stored.info.status = ChangeStatus::Merged;
        }
    }

    /// Snapshot of every change.
    pub fn changes(&self) -> Vec<ChangeInfo> {
        let state = self.lock();
        state.changes.keys().filter_map(|n| state.render(*n)).collect()
    }

    /// How many topic writes the engine has made.
    pub fn topic_writes(&self) -> usize {
        self.lock().topic_writes
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A poisoned lock only means a test panicked mid-call.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_available(&self) -> ReviewResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ReviewError::Unavailable("memory review marked unavailable".into()));
        }
        Ok(())
    }
}

impl StoredChange {
    fn push_revision(&mut self, commit: &str, message: &str) {
        self.info.current_revision = commit.to_string();
        self.info.revision_number += 1;
        self.info.message = message.to_string();
        self.info.subject = subject_of(message);
        // Votes do not carry over to a new revision.
        self.votes.clear();
    }
}

impl State {
    fn render(&self, number: ChangeNumber) -> Option<ChangeInfo> {
        self.changes.get(&number).map(|stored| self.render_stored(stored))
    }

    /// Attach label ranges and current votes.
    fn render_stored(&self, stored: &StoredChange) -> ChangeInfo {
        let mut info = stored.info.clone();
        info.labels = self
            .labels
            .iter()
            .map(|(name, (min, max))| {
                let votes = stored
                    .votes
                    .get(name)
                    .map(|by_account| by_account.values().cloned().collect())
                    .unwrap_or_default();
                (
                    name.clone(),
                    LabelInfo {
                        min: *min,
                        max: *max,
                        votes,
                    },
                )
            })
            .collect();
        info
    }

    fn matches(&self, info: &ChangeInfo, terms: &[QueryTerm]) -> bool {
        terms.iter().all(|term| match term {
            QueryTerm::Topic(t) => info.topic.as_deref() == Some(t.as_str()),
            QueryTerm::Project(p) => &info.project == p,
            QueryTerm::Branch(b) => &info.branch == b,
            QueryTerm::Status(s) => match s.as_str() {
                "open" => info.status == ChangeStatus::New,
                "closed" => info.status != ChangeStatus::New,
                other => info.status.to_string().eq_ignore_ascii_case(other),
            },
            QueryTerm::Other { .. } => false,
        })
    }
}

fn subject_of(message: &str) -> String {
    message.lines().next().unwrap_or_default().to_string()
}

#[async_trait]
impl ReviewApi for MemoryReview {
    async fn get_change(&self, number: ChangeNumber) -> ReviewResult<ChangeInfo> {
        self.check_available()?;
        self.lock()
            .render(number)
            .ok_or_else(|| ReviewError::NotFound(format!("change {number}")))
    }

    async fn query_changes(&self, query: &str) -> ReviewResult<Vec<ChangeInfo>> {
        self.check_available()?;
        let terms = parse_query(query).ok_or_else(|| ReviewError::ApiError {
            status: 400,
            body: format!("cannot parse query: {query}"),
        })?;
        let state = self.lock();
        Ok(state
            .changes
            .values()
            .filter(|c| state.matches(&c.info, &terms))
            .map(|c| state.render_stored(c))
            .collect())
    }

    async fn create_change(&self, change: NewChange) -> ReviewResult<ChangeInfo> {
        self.check_available()?;
        Ok(self.upload(
            &change.project,
            &change.branch,
            &change.revision.commit,
            &change.revision.message,
            Some(&change.topic),
        ))
    }

    async fn append_revision(
        &self,
        number: ChangeNumber,
        revision: MergeRevision,
    ) -> ReviewResult<ChangeInfo> {
        self.check_available()?;
        self.amend(number, &revision.commit, &revision.message)
            .ok_or_else(|| ReviewError::NotFound(format!("change {number}")))
    }

    async fn set_vote(&self, number: ChangeNumber, vote: VoteInput) -> ReviewResult<()> {
        self.check_available()?;
        let mut state = self.lock();
        let Some(&(min, max)) = state.labels.get(&vote.label) else {
            return Err(ReviewError::Conflict(format!("label {} not defined", vote.label)));
        };
        if vote.value < min || vote.value > max {
            return Err(ReviewError::Conflict(format!(
                "value {} out of range for {}",
                vote.value, vote.label
            )));
        }
        let stored = state
            .changes
            .get_mut(&number)
            .ok_or_else(|| ReviewError::NotFound(format!("change {number}")))?;
        stored.votes.entry(vote.label).or_default().insert(
            AUTOMERGER_ACCOUNT.to_string(),
            Vote {
                account: AUTOMERGER_ACCOUNT.to_string(),
                value: vote.value,
                tag: vote.tag,
            },
        );
        Ok(())
    }

    async fn set_topic(&self, number: ChangeNumber, topic: &str) -> ReviewResult<()> {
        self.check_available()?;
        let mut state = self.lock();
        let stored = state
            .changes
            .get_mut(&number)
            .ok_or_else(|| ReviewError::NotFound(format!("change {number}")))?;
        stored.info.topic = (!topic.is_empty()).then(|| topic.to_string());
        state.topic_writes += 1;
        Ok(())
    }

    async fn config_document(&self) -> ReviewResult<Option<String>> {
        self.check_available()?;
        Ok(self.lock().config.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::review::topic_query;

    #[tokio::test]
    async fn test_topic_query_with_special_characters() {
        let review = MemoryReview::new();
        review.upload("p", "master", "a1", "one", Some("with\"quotes\"inside"));
        review.upload("p", "ds_one", "b2", "two", Some("with\"quotes\"inside"));
        review.upload("p", "master", "c3", "three", Some("other"));

        let found = review
            .query_changes(&topic_query("with\"quotes\"inside"))
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
    }

    #[tokio::test]
    async fn test_votes_are_per_account_and_reset_on_new_revision() {
        let review = MemoryReview::new();
        let change = review.upload("p", "master", "a1", "subject", None);
        review.vote_as(change.number, "alice", "Code-Review", 2);
        review
            .set_vote(
                change.number,
                VoteInput {
                    label: "Code-Review".into(),
                    value: -2,
                    tag: Some(MERGE_CONFLICT_TAG.into()),
                    message: None,
                },
            )
            .await
            .unwrap();

        let info = review.get_change(change.number).await.unwrap();
        let label = info.label("Code-Review").unwrap();
        assert_eq!(label.votes.len(), 2);
        assert_eq!(label.value(), -2);

        let amended = review.amend(change.number, "a2", "subject v2").unwrap();
        assert_eq!(amended.revision_number, 2);
        assert!(amended.label("Code-Review").unwrap().votes.is_empty());
    }

    #[tokio::test]
    async fn test_out_of_range_vote_rejected() {
        let review = MemoryReview::new();
        let change = review.upload("p", "master", "a1", "subject", None);
        let err = review
            .set_vote(
                change.number,
                VoteInput {
                    label: "Code-Review".into(),
                    value: 3,
                    tag: None,
                    message: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ReviewError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_unavailable() {
        let review = MemoryReview::new();
        review.set_unavailable(true);
        assert!(review.get_change(1).await.unwrap_err().is_unavailable());
    }
}
