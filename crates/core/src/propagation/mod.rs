//! Event-driven propagation.
//!
//! [`Automerger`] is the entry point: it turns one [`ReviewEvent`] into the
//! matching propagation, vote or topic operation. The configuration document
//! is read fresh for every event, so edits take effect without a restart.

pub mod downstream;
pub mod events;
pub mod topic;
pub mod votes;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::config::PropagationConfig;
use crate::errors::PropagationError;
use crate::merge_config::AutomergerConfig;
use crate::review::{ChangeNumber, ChangeStatus, ReviewApi};
use crate::vcs::{GitStore, Mirror, RemoteSource};

pub use downstream::{DownstreamChangeManager, EdgeReport, EdgeState, PropagationReport};
pub use events::{EventAccount, EventChange, ReviewEvent};
pub use topic::{TopicSyncReport, TopicSynchronizer};
pub use votes::VotePropagator;

/// What handling one event did.
#[derive(Debug, Clone)]
pub enum EventOutcome {
    Propagated(PropagationReport),
    VotesMirrored(usize),
    TopicSynced(TopicSyncReport),
    Ignored(&'static str),
}

impl fmt::Display for EventOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Propagated(r) => write!(
                f,
                "propagated {} edges ({} conflicted, {} failed)",
                r.edges.len(),
                r.conflicted().count(),
                r.failed().count()
            ),
            Self::VotesMirrored(n) => write!(f, "mirrored {n} votes"),
            Self::TopicSynced(r) => write!(f, "renamed topic on {} changes", r.updated.len()),
            Self::Ignored(reason) => write!(f, "ignored: {reason}"),
        }
    }
}

pub struct Automerger {
    review: Arc<dyn ReviewApi>,
    downstream: DownstreamChangeManager,
    topics: TopicSynchronizer,
    votes: VotePropagator,
    account: Option<String>,
}

impl Automerger {
    pub fn new(
        review: Arc<dyn ReviewApi>,
        store: Arc<GitStore>,
        settings: PropagationConfig,
    ) -> Self {
        Self {
            downstream: DownstreamChangeManager::new(review.clone(), store, settings.clone()),
            topics: TopicSynchronizer::new(review.clone()),
            votes: VotePropagator::new(review.clone(), &settings),
            review,
            account: None,
        }
    }

    /// Refresh the local mirror from `remote` before merging.
    pub fn with_remote(self, remote: RemoteSource) -> Self {
        self.with_mirror(Arc::new(remote))
    }

    /// Refresh the local copy through `mirror` before and during merging.
    pub fn with_mirror(mut self, mirror: Arc<dyn Mirror>) -> Self {
        self.downstream.set_mirror(mirror);
        self
    }

    /// The account the engine acts as. Its events are ignored, except new
    /// revisions of downstream changes, which continue along the edges of
    /// their own branch.
    pub fn with_account(mut self, username: impl Into<String>) -> Self {
        self.account = Some(username.into());
        self
    }

    /// Fetch and parse the configuration document. `None` when no document
    /// is stored, which disables propagation.
    pub async fn load_config(&self) -> Result<Option<AutomergerConfig>, PropagationError> {
        let Some(text) = self.review.config_document().await? else {
            return Ok(None);
        };
        let config = AutomergerConfig::parse(&text)?;
        for skipped in config.skipped() {
            warn!(error = %skipped, "ignoring malformed configuration entry");
        }
        Ok(Some(config))
    }

    #[instrument(skip(self, event), fields(kind = event.kind()))]
    pub async fn handle_event(&self, event: &ReviewEvent) -> Result<EventOutcome, PropagationError> {
        let own = self
            .account
            .as_deref()
            .is_some_and(|account| event.is_from(account));

        let outcome = match event {
            ReviewEvent::PatchsetCreated { change, .. } | ReviewEvent::ChangeRestored { change, .. } => {
                if own && !self.is_downstream(change.number).await? {
                    EventOutcome::Ignored("caused by the automerger account")
                } else {
                    EventOutcome::Propagated(self.propagate_change(change.number).await?)
                }
            }
            _ if own => EventOutcome::Ignored("caused by the automerger account"),
            ReviewEvent::TopicChanged {
                change, old_topic, ..
            } => EventOutcome::TopicSynced(self.sync_topic(change.number, old_topic.as_deref()).await?),
            ReviewEvent::CommentAdded {
                change, approvals, ..
            } => {
                if approvals.is_empty() {
                    EventOutcome::Ignored("comment without votes")
                } else {
                    EventOutcome::VotesMirrored(self.sync_votes(change.number).await?)
                }
            }
            ReviewEvent::Other => EventOutcome::Ignored("event type not handled"),
        };

        info!(%outcome, "event handled");
        Ok(outcome)
    }

    /// Propagate the current revision of change `number`.
    pub async fn propagate_change(
        &self,
        number: ChangeNumber,
    ) -> Result<PropagationReport, PropagationError> {
        let Some(config) = self.load_config().await? else {
            debug!("no configuration document, nothing to do");
            return Ok(PropagationReport::empty(number));
        };

        let change = self.review.get_change(number).await?;
        if change.status != ChangeStatus::New {
            debug!(status = %change.status, "change is closed");
            return Ok(PropagationReport::empty(number));
        }
        if config.edges_for(&change.branch, &change.project).is_empty() {
            return Ok(PropagationReport::empty(number));
        }

        self.downstream
            .refresh_mirror(&change.project, vec![change.revision_ref()])
            .await?;
        self.downstream.propagate(&change, &config).await
    }

    /// Mirror change `number`'s votes onto its open downstream changes,
    /// including those merged from its downstreams in turn.
    pub async fn sync_votes(&self, number: ChangeNumber) -> Result<usize, PropagationError> {
        let change = self.review.get_change(number).await?;
        let Some(topic) = change.topic.as_deref() else {
            return Ok(0);
        };
        let members = self.topics.members(topic).await?;

        let mut reached = BTreeSet::from([number]);
        let mut frontier = vec![number];
        let mut downstream = Vec::new();
        while let Some(from) = frontier.pop() {
            for member in members.iter().filter(|c| c.automerged_from() == Some(from)) {
                if !reached.insert(member.number) {
                    continue;
                }
                frontier.push(member.number);
                if member.status == ChangeStatus::New {
                    downstream.push(member.number);
                }
            }
        }
        if downstream.is_empty() {
            return Ok(0);
        }
        Ok(self.votes.mirror_downstream(&change, &downstream).await?)
    }

    /// Carry a topic rename on change `number` over to its group.
    pub async fn sync_topic(
        &self,
        number: ChangeNumber,
        old_topic: Option<&str>,
    ) -> Result<TopicSyncReport, PropagationError> {
        let change = self.review.get_change(number).await?;
        Ok(self.topics.on_topic_changed(&change, old_topic).await?)
    }

    /// Whether change `number` was created by propagation.
    async fn is_downstream(&self, number: ChangeNumber) -> Result<bool, PropagationError> {
        let change = self.review.get_change(number).await?;
        Ok(change.automerged_from().is_some())
    }
}
