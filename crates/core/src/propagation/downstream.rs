//! Downstream change management.
//!
//! For a source change, every applicable edge gets one downstream change on
//! the destination branch holding a merge of the source revision. Edges are
//! processed one after another but independently: a conflict or failure on
//! one edge never stops the others, and the per-edge outcomes are
//! aggregated into a [`PropagationReport`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::classifier::ChangeIntent;
use crate::config::PropagationConfig;
use crate::errors::{PropagationError, VcsError};
use crate::merge::{MergeAttemptEngine, MergeInputs, MergeOutcome, PathConflict};
use crate::merge_config::{AutomergerConfig, PropagationEdge};
use crate::propagation::topic::TopicSynchronizer;
use crate::propagation::votes::VotePropagator;
use crate::review::{
    ChangeInfo, ChangeNumber, ChangeStatus, MergeRevision, MergeStrategy, NewChange, ReviewApi,
    FOOTER_COMMIT, FOOTER_FROM,
};
use crate::vcs::{FileEntry, GitStore, Mirror, Snapshot};

/// Subject prefix of downstream changes built as blank merges.
pub const SKIPPED_PREFIX: &str = "skipped: ";

/// Where one edge ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeState {
    NotStarted,
    /// A merge was computed but nothing was published yet.
    Attempted,
    Created,
    Updated,
    /// The downstream already reflects the current source revision.
    Unchanged,
    Conflicted,
    Failed,
}

impl EdgeState {
    /// Whether the edge has a live downstream change.
    pub fn has_downstream(self) -> bool {
        matches!(self, Self::Created | Self::Updated | Self::Unchanged)
    }
}

/// Outcome of one edge.
#[derive(Debug, Clone, Serialize)]
pub struct EdgeReport {
    pub source_branch: String,
    pub dest_branch: String,
    pub state: EdgeState,
    pub downstream: Option<ChangeNumber>,
    pub blank: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<PathConflict>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Whether redelivering the event could fix a failure.
    pub transient: bool,
}

impl EdgeReport {
    fn new(edge: &PropagationEdge) -> Self {
        Self {
            source_branch: edge.source_branch.clone(),
            dest_branch: edge.dest_branch.clone(),
            state: EdgeState::NotStarted,
            downstream: None,
            blank: false,
            conflicts: Vec::new(),
            error: None,
            transient: false,
        }
    }

    fn failed(edge: &PropagationEdge, error: &PropagationError) -> Self {
        Self {
            state: EdgeState::Failed,
            error: Some(error.to_string()),
            transient: error.is_transient(),
            ..Self::new(edge)
        }
    }
}

/// Aggregate outcome of propagating one source change.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PropagationReport {
    pub source: ChangeNumber,
    pub topic: Option<String>,
    pub edges: Vec<EdgeReport>,
    /// Whether the source was blocked because of a conflict.
    pub blocked: bool,
    pub votes_mirrored: usize,
}

impl PropagationReport {
    pub fn empty(source: ChangeNumber) -> Self {
        Self {
            source,
            ..Self::default()
        }
    }

    pub fn edge(&self, dest_branch: &str) -> Option<&EdgeReport> {
        self.edges.iter().find(|e| e.dest_branch == dest_branch)
    }

    /// Downstream changes that exist after this run.
    pub fn downstream_changes(&self) -> Vec<ChangeNumber> {
        self.edges
            .iter()
            .filter(|e| e.state.has_downstream())
            .filter_map(|e| e.downstream)
            .collect()
    }

    pub fn conflicted(&self) -> impl Iterator<Item = &EdgeReport> {
        self.edges.iter().filter(|e| e.state == EdgeState::Conflicted)
    }

    pub fn failed(&self) -> impl Iterator<Item = &EdgeReport> {
        self.edges.iter().filter(|e| e.state == EdgeState::Failed)
    }

    /// Whether any failed edge would be worth retrying.
    pub fn is_transient_failure(&self) -> bool {
        self.failed().any(|e| e.transient)
    }
}

/// Source revision being propagated, resolved once per event.
struct SourceRevision {
    sha: String,
    parent: Option<String>,
}

/// Everything needed to build one edge's merge off the async workers.
struct MergeJob {
    change: ChangeInfo,
    source: SourceRevision,
    dest_branch: String,
    intent: ChangeIntent,
    merge_all: bool,
}

/// A merge computed against one destination tip.
enum BuiltMerge {
    Conflict(Vec<PathConflict>),
    Commit {
        dest_tip: String,
        commit: String,
        blank: bool,
        message: String,
    },
}

pub struct DownstreamChangeManager {
    review: Arc<dyn ReviewApi>,
    store: Arc<GitStore>,
    mirror: Option<Arc<dyn Mirror>>,
    votes: VotePropagator,
    topics: TopicSynchronizer,
    settings: PropagationConfig,
}

impl DownstreamChangeManager {
    pub fn new(
        review: Arc<dyn ReviewApi>,
        store: Arc<GitStore>,
        settings: PropagationConfig,
    ) -> Self {
        Self {
            votes: VotePropagator::new(review.clone(), &settings),
            topics: TopicSynchronizer::new(review.clone()),
            review,
            store,
            mirror: None,
            settings,
        }
    }

    /// Refresh the local copy through `mirror` before reading branch tips.
    pub fn set_mirror(&mut self, mirror: Arc<dyn Mirror>) {
        self.mirror = Some(mirror);
    }

    /// Bring `project` up to date with the review server, if a mirror is
    /// configured. A failed refresh means the server is unreachable.
    pub async fn refresh_mirror(
        &self,
        project: &str,
        extra_refs: Vec<String>,
    ) -> Result<(), PropagationError> {
        let Some(mirror) = self.mirror.clone() else {
            return Ok(());
        };
        let project = project.to_string();
        self.blocking(move |store| mirror.refresh(store, &project, &extra_refs))
            .await
            .map_err(|e| match e {
                PropagationError::Vcs(e) => PropagationError::CollaboratorUnavailable(e.to_string()),
                other => other,
            })
    }

    /// Run `work` against the object store on the blocking pool.
    async fn blocking<T, F>(&self, work: F) -> Result<T, PropagationError>
    where
        F: FnOnce(&GitStore) -> Result<T, VcsError> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        let result = tokio::task::spawn_blocking(move || work(&store))
            .await
            .map_err(|e| VcsError::IoError(std::io::Error::other(e)))?;
        Ok(result?)
    }

    /// Create or update the downstream changes of `change` for every edge
    /// leaving its branch, block it on conflicts, and mirror its votes onto
    /// the downstreams.
    ///
    /// An unreachable review server or object store aborts the whole event
    /// with [`PropagationError::CollaboratorUnavailable`]. Any other failure
    /// is confined to its edge and recorded in the report.
    #[instrument(skip(self, change, config), fields(change = change.number, branch = %change.branch))]
    pub async fn propagate(
        &self,
        change: &ChangeInfo,
        config: &AutomergerConfig,
    ) -> Result<PropagationReport, PropagationError> {
        let mut report = PropagationReport::empty(change.number);
        let mut edges = config.edges_for(&change.branch, &change.project);
        if edges.is_empty() {
            debug!("no edges leave this branch");
            return Ok(report);
        }

        let topic = self.topics.ensure_topic(change).await?;
        report.topic = Some(topic.clone());
        let group = self.topics.members(&topic).await?;

        // A merge never flows back into a branch it came from.
        let lineage = upstream_branches(change, &group);
        edges.retain(|edge| {
            let back = lineage.contains(&edge.dest_branch);
            if back {
                debug!(%edge, "destination is upstream of this change, skipping");
            }
            !back
        });
        if edges.is_empty() {
            return Ok(report);
        }

        let intent = config.classifier().classify(&change.message);
        let source = self.load_source(change).await?;
        info!(edges = edges.len(), %intent, %topic, "propagating change");

        for edge in &edges {
            let edge_report = match self
                .process_edge(change, &source, edge, intent, &topic, &group)
                .await
            {
                Ok(r) => r,
                Err(PropagationError::CollaboratorUnavailable(msg)) => {
                    warn!(%edge, error = %msg, "collaborator unavailable, aborting event");
                    return Err(PropagationError::CollaboratorUnavailable(msg));
                }
                Err(e) => {
                    warn!(%edge, error = %e, "edge failed");
                    EdgeReport::failed(edge, &e)
                }
            };
            info!(%edge, state = ?edge_report.state, downstream = ?edge_report.downstream, "edge done");
            report.edges.push(edge_report);
        }

        let conflicted: Vec<&EdgeReport> = report.conflicted().collect();
        if !conflicted.is_empty() {
            let message = conflict_summary(config.conflict_message(), &conflicted);
            let current = self.review.get_change(change.number).await?;
            self.votes.block_upstream(&current, &message).await?;
            report.blocked = true;
        }

        let downstream = report.downstream_changes();
        if !downstream.is_empty() {
            let current = self.review.get_change(change.number).await?;
            report.votes_mirrored = self.votes.mirror_downstream(&current, &downstream).await?;
        }

        Ok(report)
    }

    async fn load_source(&self, change: &ChangeInfo) -> Result<SourceRevision, PropagationError> {
        let project = change.project.clone();
        let sha = change.current_revision.clone();
        let info = self
            .blocking(move |store| store.commit_info(&project, &sha))
            .await?;
        Ok(SourceRevision {
            parent: info.parents.first().cloned(),
            sha: info.sha,
        })
    }

    async fn process_edge(
        &self,
        change: &ChangeInfo,
        source: &SourceRevision,
        edge: &PropagationEdge,
        intent: ChangeIntent,
        topic: &str,
        group: &[ChangeInfo],
    ) -> Result<EdgeReport, PropagationError> {
        let mut report = EdgeReport::new(edge);
        let project = &change.project;

        let mut previous = group.iter().filter(|c| {
            c.project == *project
                && c.branch == edge.dest_branch
                && c.automerged_from() == Some(change.number)
        });
        if let Some(done) = previous
            .clone()
            .find(|c| c.automerged_commit() == Some(source.sha.as_str()))
        {
            debug!(downstream = done.number, "downstream already up to date");
            report.state = EdgeState::Unchanged;
            report.downstream = Some(done.number);
            return Ok(report);
        }
        let open = previous.find(|c| c.status == ChangeStatus::New);

        let job = Arc::new(MergeJob {
            change: change.clone(),
            source: SourceRevision {
                sha: source.sha.clone(),
                parent: source.parent.clone(),
            },
            dest_branch: edge.dest_branch.clone(),
            intent,
            merge_all: edge.merge_all,
        });

        let attempts = self.settings.retry_attempts.max(1);
        for attempt in 1..=attempts {
            let built = {
                let job = job.clone();
                self.blocking(move |store| build_merge(store, &job)).await?
            };
            report.state = EdgeState::Attempted;

            let (dest_tip, commit, message) = match built {
                BuiltMerge::Conflict(paths) => {
                    report.state = EdgeState::Conflicted;
                    report.conflicts = paths;
                    return Ok(report);
                }
                BuiltMerge::Commit {
                    dest_tip,
                    commit,
                    blank,
                    message,
                } => {
                    report.blank = blank;
                    (dest_tip, commit, message)
                }
            };

            // One writer per (source, destination) at a time.
            let staged = {
                let (project, staging, commit) = (
                    project.clone(),
                    staging_ref(change.number, &edge.dest_branch),
                    commit.clone(),
                );
                self.blocking(move |store| {
                    let expected = store.read_ref(&project, &staging)?;
                    store.update_ref(&project, &staging, &commit, expected.as_deref())
                })
                .await
            };
            match staged {
                Ok(()) => {}
                Err(PropagationError::Vcs(VcsError::ConcurrentModification { refname })) => {
                    warn!(%refname, attempt, "lost race on staging ref, retrying");
                    tokio::time::sleep(backoff(self.settings.retry_backoff_ms, attempt)).await;
                    continue;
                }
                Err(e) => return Err(e),
            }

            self.refresh_mirror(project, Vec::new()).await?;
            let current = {
                let (project, branch) = (project.clone(), edge.dest_branch.clone());
                self.blocking(move |store| store.branch_tip(&project, &branch))
                    .await?
            };
            if current != dest_tip {
                warn!(branch = %edge.dest_branch, attempt, "destination moved during merge, retrying");
                tokio::time::sleep(backoff(self.settings.retry_backoff_ms, attempt)).await;
                continue;
            }

            let revision = MergeRevision {
                commit,
                base_commit: dest_tip,
                source_commit: source.sha.clone(),
                strategy: if report.blank {
                    MergeStrategy::Ours
                } else {
                    MergeStrategy::Recursive
                },
                message,
            };

            match open {
                Some(existing) => {
                    let updated = self.review.append_revision(existing.number, revision).await?;
                    self.votes.carry_forward(existing, updated.number).await?;
                    report.state = EdgeState::Updated;
                    report.downstream = Some(updated.number);
                }
                None => {
                    let created = self
                        .review
                        .create_change(NewChange {
                            project: project.clone(),
                            branch: edge.dest_branch.clone(),
                            topic: topic.to_string(),
                            revision,
                        })
                        .await?;
                    report.state = EdgeState::Created;
                    report.downstream = Some(created.number);
                }
            }
            return Ok(report);
        }

        Err(PropagationError::ConcurrentModification {
            branch: edge.dest_branch.clone(),
            attempts,
        })
    }
}

/// Merge the source revision into the current destination tip and write
/// the result as a commit. Blocking.
///
/// Only paths changed on one of the sides are read: everything else is the
/// same in the merge base, the source and the destination, so the commit is
/// built on the destination tree with just those paths replaced.
fn build_merge(store: &GitStore, job: &MergeJob) -> Result<BuiltMerge, VcsError> {
    let project = job.change.project.as_str();
    let source = job.source.sha.as_str();
    let dest_tip = store.branch_tip(project, &job.dest_branch)?;
    let base = store.merge_base(project, source, &dest_tip)?;

    let mut paths = store.changed_paths(project, base.as_deref(), source)?;
    paths.extend(store.changed_paths(project, base.as_deref(), &dest_tip)?);
    paths.extend(store.changed_paths(project, job.source.parent.as_deref(), source)?);

    let load = |sha: Option<&str>| match sha {
        Some(sha) => store.snapshot_paths(project, sha, &paths),
        None => Ok(Snapshot::new()),
    };
    let base_tree = load(base.as_deref())?;
    let dest_tree = load(Some(dest_tip.as_str()))?;
    let source_tree = load(Some(source))?;
    let parent_tree = load(job.source.parent.as_deref())?;
    debug!(paths = paths.len(), "loaded changed paths");

    let outcome = MergeAttemptEngine::attempt(
        &MergeInputs {
            base: &base_tree,
            dest_tip: &dest_tree,
            source: &source_tree,
            source_parent: &parent_tree,
        },
        job.intent,
        job.merge_all,
    );
    let (tree, blank) = match outcome {
        MergeOutcome::Conflict { paths } => return Ok(BuiltMerge::Conflict(paths)),
        MergeOutcome::Clean { tree } => (tree, false),
        MergeOutcome::Blank { tree, reverted } => {
            debug!(reverted = reverted.len(), "content withheld from destination");
            (tree, true)
        }
    };

    let changes: BTreeMap<String, Option<FileEntry>> = paths
        .iter()
        .filter(|path| tree.get(path) != dest_tree.get(path))
        .map(|path| (path.clone(), tree.get(path).cloned()))
        .collect();
    let message = downstream_message(&job.change, source, &job.dest_branch, blank);
    let commit = store.write_commit_onto(project, &dest_tip, &changes, &[dest_tip.as_str(), source], &message)?;
    Ok(BuiltMerge::Commit {
        dest_tip,
        commit,
        blank,
        message,
    })
}

/// Branches `change` was merged from, following `Automerged-From` links
/// through its topic group.
fn upstream_branches(change: &ChangeInfo, group: &[ChangeInfo]) -> BTreeSet<String> {
    let mut branches = BTreeSet::new();
    let mut seen = BTreeSet::from([change.number]);
    let mut next = change.automerged_from();
    while let Some(number) = next {
        if !seen.insert(number) {
            break;
        }
        let Some(parent) = group.iter().find(|c| c.number == number) else {
            break;
        };
        branches.insert(parent.branch.clone());
        next = parent.automerged_from();
    }
    branches
}

/// Commit message of a downstream revision.
pub fn downstream_message(change: &ChangeInfo, source_sha: &str, dest: &str, blank: bool) -> String {
    let prefix = if blank { SKIPPED_PREFIX } else { "" };
    format!(
        "{prefix}Merge \"{}\" into {dest}\n\n{FOOTER_FROM}: {}\n{FOOTER_COMMIT}: {source_sha}\n",
        change.subject, change.number
    )
}

/// Private ref holding the latest merge built for one edge of a change.
fn staging_ref(number: ChangeNumber, dest: &str) -> String {
    format!("refs/automerger/{number}/{dest}")
}

fn backoff(base_ms: u64, attempt: u32) -> Duration {
    let jitter = rand::thread_rng().gen_range(0..=base_ms / 2);
    Duration::from_millis(base_ms * u64::from(attempt) + jitter)
}

fn conflict_summary(headline: &str, edges: &[&EdgeReport]) -> String {
    let mut lines = Vec::with_capacity(edges.len());
    for edge in edges {
        let paths: Vec<String> = edge.conflicts.iter().map(ToString::to_string).collect();
        lines.push(format!("{headline} {}: {}", edge.dest_branch, paths.join(", ")));
    }
    lines.join("\n")
}
