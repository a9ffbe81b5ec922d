//! End-to-end tests for event-driven propagation.
//!
//! These tests exercise the real `Automerger` with:
//! - A real git object store in a temp directory
//! - The in-memory review server standing in for Gerrit
//! - Configuration documents in the git-config format
//!
//! Every test starts from a project with one initial commit shared by
//! `master`, `ds_one` and `ds_two`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tempfile::TempDir;

use automerger_core::config::PropagationConfig;
use automerger_core::errors::{PropagationError, VcsError};
use automerger_core::propagation::events::{EventAccount, EventChange, EventPatchSet};
use automerger_core::propagation::{EdgeState, EventOutcome, PropagationReport, ReviewEvent};
use automerger_core::review::memory::AUTOMERGER_ACCOUNT;
use automerger_core::review::{
    topic_query, ChangeInfo, MemoryReview, ReviewApi, AUTOMERGER_TAG, MERGE_CONFLICT_TAG,
};
use automerger_core::vcs::{
    ChangeKind, CommitIdentity, EntryKind, FileEntry, GitStore, Mirror, Snapshot, MODE_SYMLINK,
};
use automerger_core::Automerger;

const PROJECT: &str = "test-project";

const DEFAULT_CONFIG: &str = r#"
[global]
  manifestProject = platform/manifest
[automerger "master:ds_one"]
  setProjects = test-project
[automerger "master:ds_two"]
  setProjects = test-project
  mergeAll = true
"#;

// ===========================================================================
// Helpers
// ===========================================================================

struct Harness {
    _dir: TempDir,
    store: Arc<GitStore>,
    review: Arc<MemoryReview>,
    automerger: Automerger,
    initial: String,
}

impl Harness {
    fn new(config: &str) -> Self {
        Self::with_branches(config, &["master", "ds_one", "ds_two"])
    }

    fn with_branches(config: &str, branches: &[&str]) -> Self {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(GitStore::new(dir.path(), CommitIdentity::default()));
        store.create_project(PROJECT).unwrap();

        let initial = store
            .write_commit(
                PROJECT,
                &Snapshot::new().with_file("README", "initial\n"),
                &[],
                "Initial commit",
            )
            .unwrap();
        for branch in branches {
            store.create_branch(PROJECT, branch, &initial).unwrap();
        }

        let review = Arc::new(MemoryReview::new());
        review.set_config_document(config);

        let settings = PropagationConfig {
            retry_backoff_ms: 1,
            ..PropagationConfig::default()
        };
        let automerger =
            Automerger::new(review.clone(), store.clone(), settings).with_account(AUTOMERGER_ACCOUNT);

        Self {
            _dir: dir,
            store,
            review,
            automerger,
            initial,
        }
    }

    fn with_mirror(self, mirror: Arc<dyn Mirror>) -> Self {
        Self {
            automerger: self.automerger.with_mirror(mirror),
            ..self
        }
    }

    /// Commit `files` on top of the initial commit and upload it for review
    /// on `master`.
    fn upload(&self, files: &[(&str, &str)], message: &str, topic: Option<&str>) -> ChangeInfo {
        let sha = self.commit_on(&self.initial, files, message);
        self.review.upload(PROJECT, "master", &sha, message, topic)
    }

    fn commit_on(&self, parent: &str, files: &[(&str, &str)], message: &str) -> String {
        let mut tree = self.store.snapshot(PROJECT, parent).unwrap();
        for (path, content) in files {
            tree.insert(path, FileEntry::text(content));
        }
        self.store
            .write_commit(PROJECT, &tree, &[parent], message)
            .unwrap()
    }

    /// Land a commit directly on `branch`.
    fn advance(&self, branch: &str, files: &[(&str, &str)], message: &str) {
        let tip = self.store.branch_tip(PROJECT, branch).unwrap();
        let sha = self.commit_on(&tip, files, message);
        self.store
            .update_ref(PROJECT, &format!("refs/heads/{branch}"), &sha, Some(&tip))
            .unwrap();
    }

    async fn patchset_created(&self, change: &ChangeInfo) -> PropagationReport {
        let event = ReviewEvent::PatchsetCreated {
            change: event_change(change),
            patch_set: EventPatchSet {
                number: u64::from(change.revision_number),
                revision: change.current_revision.clone(),
            },
            uploader: Some(human()),
        };
        match self.automerger.handle_event(&event).await.unwrap() {
            EventOutcome::Propagated(report) => report,
            other => panic!("expected propagation, got {other}"),
        }
    }

    /// Deliver the patchset-created event the automerger account causes by
    /// uploading `change`.
    async fn own_patchset_created(&self, change: &ChangeInfo) -> EventOutcome {
        let event = ReviewEvent::PatchsetCreated {
            change: event_change(change),
            patch_set: EventPatchSet {
                number: u64::from(change.revision_number),
                revision: change.current_revision.clone(),
            },
            uploader: Some(EventAccount {
                username: Some(AUTOMERGER_ACCOUNT.into()),
                ..EventAccount::default()
            }),
        };
        self.automerger.handle_event(&event).await.unwrap()
    }

    async fn topic_changed(&self, number: u64, old_topic: &str) -> EventOutcome {
        let change = self.review.get_change(number).await.unwrap();
        let event = ReviewEvent::TopicChanged {
            change: event_change(&change),
            old_topic: Some(old_topic.to_string()),
            changer: Some(human()),
        };
        self.automerger.handle_event(&event).await.unwrap()
    }

    async fn downstream(&self, report: &PropagationReport, branch: &str) -> ChangeInfo {
        let number = report
            .edge(branch)
            .and_then(|e| e.downstream)
            .unwrap_or_else(|| panic!("no downstream on {branch}"));
        self.review.get_change(number).await.unwrap()
    }

    async fn topic_members(&self, topic: &str) -> Vec<ChangeInfo> {
        self.review.query_changes(&topic_query(topic)).await.unwrap()
    }
}

/// Lands a commit on `branch` every time the mirror is refreshed, until
/// `moves` runs out.
struct MovingMirror {
    branch: String,
    moves: AtomicU32,
}

impl MovingMirror {
    fn new(branch: &str, moves: u32) -> Arc<Self> {
        Arc::new(Self {
            branch: branch.to_string(),
            moves: AtomicU32::new(moves),
        })
    }
}

impl Mirror for MovingMirror {
    fn refresh(&self, store: &GitStore, project: &str, _extra_refs: &[String]) -> Result<(), VcsError> {
        if self
            .moves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_err()
        {
            return Ok(());
        }
        let tip = store.branch_tip(project, &self.branch)?;
        let tree = store
            .snapshot(project, &tip)?
            .with_file(&format!("landed/{}", &tip[..12]), "landed\n");
        let sha = store.write_commit(project, &tree, &[tip.as_str()], "Land concurrently")?;
        store.update_ref(project, &format!("refs/heads/{}", self.branch), &sha, Some(&tip))
    }
}

fn human() -> EventAccount {
    EventAccount {
        username: Some("alice".into()),
        ..EventAccount::default()
    }
}

fn event_change(change: &ChangeInfo) -> EventChange {
    EventChange {
        project: change.project.clone(),
        branch: change.branch.clone(),
        number: change.number,
        topic: change.topic.clone(),
        subject: change.subject.clone(),
    }
}

fn automerger_vote(change: &ChangeInfo) -> Option<i32> {
    change
        .label("Code-Review")
        .and_then(|l| l.tagged(AUTOMERGER_TAG))
        .map(|v| v.value)
}

// ===========================================================================
// Tests
// ===========================================================================

#[tokio::test]
async fn test_expected_flow() {
    let h = Harness::new(DEFAULT_CONFIG);
    let source = h.upload(&[("testfile.txt", "content\n")], "Add test file", None);

    let report = h.patchset_created(&source).await;
    assert_eq!(report.edges.len(), 2);
    assert!(report.edges.iter().all(|e| e.state == EdgeState::Created));
    assert!(!report.blocked);

    let topic = report.topic.clone().unwrap();
    assert_eq!(h.topic_members(&topic).await.len(), 3);

    for branch in ["ds_one", "ds_two"] {
        let ds = h.downstream(&report, branch).await;
        assert_eq!(ds.branch, branch);
        assert_eq!(ds.automerged_from(), Some(source.number));
        assert_eq!(ds.subject, format!("Merge \"Add test file\" into {branch}"));

        let tree = h.store.snapshot(PROJECT, &ds.current_revision).unwrap();
        assert_eq!(tree.text("testfile.txt"), Some("content\n"));

        let commit = h.store.commit_info(PROJECT, &ds.current_revision).unwrap();
        assert_eq!(commit.parents, vec![h.initial.clone(), source.current_revision.clone()]);
    }

    // Approve the source and mirror the vote downstream.
    h.review.vote_as(source.number, "alice", "Code-Review", 2);
    let event = ReviewEvent::CommentAdded {
        change: event_change(&source),
        approvals: vec![serde_json::from_str(r#"{"type":"Code-Review","value":"2"}"#).unwrap()],
        author: Some(human()),
    };
    let outcome = h.automerger.handle_event(&event).await.unwrap();
    assert!(matches!(outcome, EventOutcome::VotesMirrored(2)));

    for branch in ["ds_one", "ds_two"] {
        let ds = h.downstream(&report, branch).await;
        assert_eq!(automerger_vote(&ds), Some(2));
    }
}

#[tokio::test]
async fn test_do_not_merge_builds_blank_merge_except_on_merge_all() {
    let h = Harness::new(DEFAULT_CONFIG);
    let source = h.upload(
        &[("testfile.txt", "secret\n")],
        "DO NOT MERGE Add secret file",
        None,
    );

    let report = h.patchset_created(&source).await;
    assert!(report.edge("ds_one").unwrap().blank);
    assert!(!report.edge("ds_two").unwrap().blank);

    let ds_one = h.downstream(&report, "ds_one").await;
    assert!(ds_one.subject.starts_with("skipped: "));
    let ds_one_tree = h.store.snapshot(PROJECT, &ds_one.current_revision).unwrap();
    assert_eq!(ds_one_tree.get("testfile.txt"), None);

    // Against the source, the blank merge undoes the one added line.
    let source_tree = h.store.snapshot(PROJECT, &source.current_revision).unwrap();
    let deltas = source_tree.diff(&ds_one_tree);
    assert_eq!(deltas.len(), 1);
    assert_eq!(deltas[0].kind, ChangeKind::Deleted);
    assert_eq!(deltas[0].lines_deleted, 1);

    let ds_two = h.downstream(&report, "ds_two").await;
    let ds_two_tree = h.store.snapshot(PROJECT, &ds_two.current_revision).unwrap();
    assert_eq!(ds_two_tree, source_tree);

    // Blank merges still carry the machine vote.
    assert_eq!(automerger_vote(&ds_one), Some(0));
}

#[tokio::test]
async fn test_do_not_merge_anywhere_skips_every_edge() {
    let h = Harness::new(DEFAULT_CONFIG);
    let source = h.upload(
        &[("testfile.txt", "secret\n")],
        "DO NOT MERGE ANYWHERE Add secret file",
        None,
    );

    let report = h.patchset_created(&source).await;
    for branch in ["ds_one", "ds_two"] {
        assert!(report.edge(branch).unwrap().blank, "{branch} should be blank");
        let ds = h.downstream(&report, branch).await;
        assert!(ds.subject.starts_with("skipped: "));
        let tree = h.store.snapshot(PROJECT, &ds.current_revision).unwrap();
        assert_eq!(tree.get("testfile.txt"), None);
    }
}

#[tokio::test]
async fn test_conflict_blocks_source_and_other_edges_continue() {
    let h = Harness::new(DEFAULT_CONFIG);
    h.advance("ds_two", &[("filename", "ds_two content\n")], "Add filename on ds_two");
    let source = h.upload(&[("filename", "master content\n")], "Add filename", None);

    let report = h.patchset_created(&source).await;
    assert_eq!(report.edge("ds_one").unwrap().state, EdgeState::Created);
    let conflicted = report.edge("ds_two").unwrap();
    assert_eq!(conflicted.state, EdgeState::Conflicted);
    assert_eq!(conflicted.conflicts[0].path, "filename");
    assert!(conflicted.downstream.is_none());
    assert!(report.blocked);

    let topic = report.topic.clone().unwrap();
    assert!(topic.starts_with("am-"));
    assert_eq!(h.topic_members(&topic).await.len(), 2);

    let source = h.review.get_change(source.number).await.unwrap();
    let label = source.label("Code-Review").unwrap();
    assert_eq!(label.tagged(MERGE_CONFLICT_TAG).map(|v| v.value), Some(-2));

    // The block reaches the downstream that did merge.
    let ds_one = h.downstream(&report, "ds_one").await;
    assert_eq!(automerger_vote(&ds_one), Some(-2));
}

#[tokio::test]
async fn test_topic_renames_reach_the_whole_group() {
    let h = Harness::new(DEFAULT_CONFIG);
    let source = h.upload(&[("testfile.txt", "content\n")], "Add test file", Some("testtopic"));
    let report = h.patchset_created(&source).await;
    let ds_one = report.edge("ds_one").unwrap().downstream.unwrap();

    let mut old = "testtopic".to_string();
    for (renamed, new) in [
        (source.number, "multiple words"),
        (ds_one, "with\"quotes\"inside"),
        (source.number, "with{braces}inside"),
        (ds_one, "singlewordagain"),
    ] {
        h.review.edit_topic(renamed, Some(new));
        let outcome = h.topic_changed(renamed, &old).await;
        assert!(matches!(outcome, EventOutcome::TopicSynced(ref r) if r.updated.len() == 2));
        assert_eq!(h.topic_members(new).await.len(), 3, "topic {new:?}");
        assert!(h.topic_members(&old).await.is_empty());

        // Redelivery changes nothing.
        let writes = h.review.topic_writes();
        h.topic_changed(renamed, &old).await;
        assert_eq!(h.review.topic_writes(), writes);

        old = new.to_string();
    }
}

#[tokio::test]
async fn test_rename_leaves_unrelated_changes_alone() {
    let h = Harness::new(DEFAULT_CONFIG);
    let source = h.upload(&[("testfile.txt", "content\n")], "Add test file", Some("shared"));
    h.patchset_created(&source).await;
    let stranger = h.review.upload(PROJECT, "ds_one", &h.initial, "Unrelated", Some("shared"));

    h.review.edit_topic(source.number, Some("renamed"));
    h.topic_changed(source.number, "shared").await;

    assert_eq!(h.topic_members("renamed").await.len(), 3);
    let stranger = h.review.get_change(stranger.number).await.unwrap();
    assert_eq!(stranger.topic.as_deref(), Some("shared"));
}

#[tokio::test]
async fn test_branches_with_special_characters() {
    let config = r#"
[automerger "master:branch{}braces"]
  setProjects = test-project
[automerger "master:branch\"quotes"]
  setProjects = test-project
"#;
    let h = Harness::with_branches(config, &["master", "branch{}braces", "branch\"quotes"]);
    let source = h.upload(&[("testfile.txt", "content\n")], "Add test file", None);

    let report = h.patchset_created(&source).await;
    assert_eq!(report.edges.len(), 2);
    for branch in ["branch{}braces", "branch\"quotes"] {
        assert_eq!(report.edge(branch).unwrap().state, EdgeState::Created);
        assert_eq!(h.downstream(&report, branch).await.branch, branch);
    }
}

#[tokio::test]
async fn test_redelivery_is_idempotent() {
    let h = Harness::new(DEFAULT_CONFIG);
    let source = h.upload(&[("testfile.txt", "content\n")], "Add test file", None);
    let first = h.patchset_created(&source).await;

    let source = h.review.get_change(source.number).await.unwrap();
    let second = h.patchset_created(&source).await;

    assert!(second.edges.iter().all(|e| e.state == EdgeState::Unchanged));
    assert_eq!(second.downstream_changes(), first.downstream_changes());
    assert_eq!(h.review.changes().len(), 3);
}

#[tokio::test]
async fn test_new_source_revision_updates_downstreams() {
    let h = Harness::new(DEFAULT_CONFIG);
    let source = h.upload(&[("testfile.txt", "v1\n")], "Add test file", None);
    let first = h.patchset_created(&source).await;

    let v2 = h.commit_on(&h.initial, &[("testfile.txt", "v2\n")], "Add test file");
    let source = h.review.amend(source.number, &v2, "Add test file").unwrap();
    let second = h.patchset_created(&source).await;

    assert!(second.edges.iter().all(|e| e.state == EdgeState::Updated));
    assert_eq!(second.downstream_changes(), first.downstream_changes());

    let ds_one = h.downstream(&second, "ds_one").await;
    assert_eq!(ds_one.revision_number, 2);
    assert_eq!(ds_one.automerged_commit(), Some(v2.as_str()));
    let tree = h.store.snapshot(PROJECT, &ds_one.current_revision).unwrap();
    assert_eq!(tree.text("testfile.txt"), Some("v2\n"));
}

#[tokio::test]
async fn test_machine_votes_survive_downstream_revisions() {
    let h = Harness::new(DEFAULT_CONFIG);
    let source = h.upload(&[("testfile.txt", "v1\n")], "Add test file", None);
    let first = h.patchset_created(&source).await;

    h.review.vote_as(source.number, "alice", "Code-Review", 2);
    h.automerger.sync_votes(source.number).await.unwrap();
    assert_eq!(automerger_vote(&h.downstream(&first, "ds_one").await), Some(2));

    // The new source revision is approved again before its event arrives.
    let v2 = h.commit_on(&h.initial, &[("testfile.txt", "v2\n")], "Add test file");
    let source = h.review.amend(source.number, &v2, "Add test file").unwrap();
    h.review.vote_as(source.number, "alice", "Code-Review", 2);
    let second = h.patchset_created(&source).await;

    // The votes were carried onto the new revisions, so there was nothing
    // left to mirror.
    assert_eq!(second.votes_mirrored, 0);
    for branch in ["ds_one", "ds_two"] {
        let ds = h.downstream(&second, branch).await;
        assert_eq!(ds.revision_number, 2);
        assert_eq!(automerger_vote(&ds), Some(2), "{branch}");
    }
}

#[tokio::test]
async fn test_retries_when_destination_moves() {
    // The refresh before the first merge moves ds_one, and so do the
    // refreshes after the first two merges.
    let h = Harness::new(DEFAULT_CONFIG).with_mirror(MovingMirror::new("ds_one", 3));
    let source = h.upload(&[("testfile.txt", "content\n")], "Add test file", None);

    let report = h.patchset_created(&source).await;
    assert_eq!(report.edge("ds_one").unwrap().state, EdgeState::Created);

    let ds_one = h.downstream(&report, "ds_one").await;
    let tip = h.store.branch_tip(PROJECT, "ds_one").unwrap();
    let commit = h.store.commit_info(PROJECT, &ds_one.current_revision).unwrap();
    assert_eq!(commit.parents, vec![tip, source.current_revision.clone()]);

    let tree = h.store.snapshot(PROJECT, &ds_one.current_revision).unwrap();
    assert_eq!(tree.text("testfile.txt"), Some("content\n"));
    assert_eq!(tree.paths().filter(|p| p.starts_with("landed/")).count(), 3);
}

#[tokio::test]
async fn test_destination_that_keeps_moving_fails_the_edge() {
    let h = Harness::new(DEFAULT_CONFIG).with_mirror(MovingMirror::new("ds_one", u32::MAX));
    let source = h.upload(&[("testfile.txt", "content\n")], "Add test file", None);

    let report = h.patchset_created(&source).await;
    let failed = report.edge("ds_one").unwrap();
    assert_eq!(failed.state, EdgeState::Failed);
    assert!(failed.transient);
    assert!(failed.error.as_deref().unwrap().contains("3 attempts"));
    assert!(report.is_transient_failure());

    assert_eq!(report.edge("ds_two").unwrap().state, EdgeState::Created);
    assert_eq!(h.review.changes().len(), 2);
}

#[tokio::test]
async fn test_downstream_changes_propagate_along_their_own_edges() {
    let config = r#"
[automerger "master:ds_one"]
  setProjects = test-project
[automerger "ds_one:ds_three"]
  setProjects = test-project
"#;
    let h = Harness::with_branches(config, &["master", "ds_one", "ds_three"]);
    let source = h.upload(&[("testfile.txt", "content\n")], "Add test file", None);
    let report = h.patchset_created(&source).await;
    let ds_one = h.downstream(&report, "ds_one").await;

    let hop = match h.own_patchset_created(&ds_one).await {
        EventOutcome::Propagated(hop) => hop,
        other => panic!("expected propagation, got {other}"),
    };
    assert_eq!(hop.edge("ds_three").unwrap().state, EdgeState::Created);
    let ds_three = h.downstream(&hop, "ds_three").await;
    assert_eq!(ds_three.automerged_from(), Some(ds_one.number));
    assert_eq!(ds_three.topic, ds_one.topic);
    assert_eq!(ds_three.subject, "Merge \"Merge \"Add test file\" into ds_one\" into ds_three");
    let tree = h.store.snapshot(PROJECT, &ds_three.current_revision).unwrap();
    assert_eq!(tree.text("testfile.txt"), Some("content\n"));

    // No edges leave ds_three.
    let last = h.own_patchset_created(&ds_three).await;
    assert!(matches!(last, EventOutcome::Propagated(ref r) if r.edges.is_empty()));

    // Votes on the source reach both hops.
    h.review.vote_as(source.number, "alice", "Code-Review", 1);
    assert_eq!(h.automerger.sync_votes(source.number).await.unwrap(), 2);
    let ds_three = h.review.get_change(ds_three.number).await.unwrap();
    assert_eq!(automerger_vote(&ds_three), Some(1));
}

#[tokio::test]
async fn test_merges_never_flow_back_upstream() {
    let config = r#"
[automerger "master:ds_one"]
  setProjects = test-project
[automerger "ds_one:master"]
  setProjects = test-project
"#;
    let h = Harness::new(config);
    let source = h.upload(&[("testfile.txt", "content\n")], "Add test file", None);
    let report = h.patchset_created(&source).await;
    let ds_one = h.downstream(&report, "ds_one").await;

    let outcome = h.own_patchset_created(&ds_one).await;
    assert!(matches!(outcome, EventOutcome::Propagated(ref r) if r.edges.is_empty()));
    assert_eq!(h.review.changes().len(), 2);
}

#[tokio::test]
async fn test_symlinks_and_submodules_survive_propagation() {
    let h = Harness::new(DEFAULT_CONFIG);
    let mut tree = h.store.snapshot(PROJECT, &h.initial).unwrap();
    tree.insert("link", FileEntry::blob(b"README".to_vec(), MODE_SYMLINK));
    tree.insert("sub", FileEntry::gitlink("0123456789abcdef0123456789abcdef01234567"));
    let base = h
        .store
        .write_commit(PROJECT, &tree, &[h.initial.as_str()], "Add link and submodule")
        .unwrap();
    for branch in ["master", "ds_one", "ds_two"] {
        h.store
            .update_ref(PROJECT, &format!("refs/heads/{branch}"), &base, Some(&h.initial))
            .unwrap();
    }

    let sha = h.commit_on(&base, &[("new.txt", "new\n")], "Add new file");
    let source = h.review.upload(PROJECT, "master", &sha, "Add new file", None);
    let report = h.patchset_created(&source).await;

    for branch in ["ds_one", "ds_two"] {
        let ds = h.downstream(&report, branch).await;
        let merged = h.store.snapshot(PROJECT, &ds.current_revision).unwrap();
        assert_eq!(merged, tree.clone().with_file("new.txt", "new\n"), "{branch}");
        assert_eq!(merged.get("link").unwrap().mode, MODE_SYMLINK);
        assert_eq!(merged.get("sub").unwrap().kind(), EntryKind::Gitlink);
    }
}

#[tokio::test]
async fn test_unavailable_review_server_aborts_event() {
    let h = Harness::new(DEFAULT_CONFIG);
    let source = h.upload(&[("testfile.txt", "content\n")], "Add test file", None);
    h.review.set_unavailable(true);

    let event = ReviewEvent::PatchsetCreated {
        change: event_change(&source),
        patch_set: EventPatchSet {
            number: 1,
            revision: source.current_revision.clone(),
        },
        uploader: Some(human()),
    };
    let err = h.automerger.handle_event(&event).await.unwrap_err();
    assert!(matches!(err, PropagationError::CollaboratorUnavailable(_)));
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_malformed_edge_does_not_suppress_others() {
    let config = r#"
[automerger "master:ds_one"]
  setProjects = test-project
[automerger "master:ds_two"]
  setProjects = test-project
  mergeAll = sometimes
"#;
    let h = Harness::new(config);
    let source = h.upload(&[("testfile.txt", "content\n")], "Add test file", None);

    let report = h.patchset_created(&source).await;
    assert_eq!(report.edges.len(), 1);
    assert_eq!(report.edge("ds_one").unwrap().state, EdgeState::Created);
}

#[tokio::test]
async fn test_project_outside_set_projects_is_left_alone() {
    let config = r#"
[automerger "master:ds_one"]
  setProjects = some/other-project
"#;
    let h = Harness::new(config);
    let source = h.upload(&[("testfile.txt", "content\n")], "Add test file", None);

    let report = h.patchset_created(&source).await;
    assert!(report.edges.is_empty());
    assert_eq!(h.review.topic_writes(), 0);
    assert_eq!(h.review.changes().len(), 1);
}

#[tokio::test]
async fn test_events_from_the_automerger_account_are_ignored() {
    let h = Harness::new(DEFAULT_CONFIG);
    let source = h.upload(&[("testfile.txt", "content\n")], "Add test file", None);

    // Only downstream changes continue when the automerger uploads them.
    let outcome = h.own_patchset_created(&source).await;
    assert!(matches!(outcome, EventOutcome::Ignored(_)));

    let event = ReviewEvent::CommentAdded {
        change: event_change(&source),
        approvals: Vec::new(),
        author: Some(EventAccount {
            username: Some(AUTOMERGER_ACCOUNT.into()),
            ..EventAccount::default()
        }),
    };
    let outcome = h.automerger.handle_event(&event).await.unwrap();
    assert!(matches!(outcome, EventOutcome::Ignored(_)));
    assert_eq!(h.review.changes().len(), 1);
}
