//! Merge attempts for one propagation edge.

use std::collections::BTreeSet;
use std::fmt;

use tracing::{debug, info};

use crate::classifier::ChangeIntent;
use crate::merge::detector::{merge_path, PathConflict, PathMerge};
use crate::vcs::{FileDelta, Snapshot};

/// Trees feeding one merge attempt.
#[derive(Debug, Clone, Copy)]
pub struct MergeInputs<'a> {
    /// Common ancestor of the source commit and the destination tip.
    pub base: &'a Snapshot,
    pub dest_tip: &'a Snapshot,
    pub source: &'a Snapshot,
    /// First parent of the source commit.
    pub source_parent: &'a Snapshot,
}

/// What a merge attempt produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The source merged without conflicts.
    Clean { tree: Snapshot },
    /// At least one path could not be merged. Nothing should be written.
    Conflict { paths: Vec<PathConflict> },
    /// A content-neutral merge: the destination tree, recorded as undoing
    /// the source's change.
    Blank {
        tree: Snapshot,
        reverted: Vec<FileDelta>,
    },
}

impl MergeOutcome {
    /// The tree to commit, if any.
    pub fn tree(&self) -> Option<&Snapshot> {
        match self {
            MergeOutcome::Clean { tree } | MergeOutcome::Blank { tree, .. } => Some(tree),
            MergeOutcome::Conflict { .. } => None,
        }
    }

    pub fn is_blank(&self) -> bool {
        matches!(self, MergeOutcome::Blank { .. })
    }
}

impl fmt::Display for MergeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeOutcome::Clean { .. } => write!(f, "clean"),
            MergeOutcome::Conflict { paths } => write!(f, "conflict ({} paths)", paths.len()),
            MergeOutcome::Blank { .. } => write!(f, "blank"),
        }
    }
}

/// Stateless merge engine.
pub struct MergeAttemptEngine;

impl MergeAttemptEngine {
    /// Merge the source onto the destination tip, or build a blank merge when
    /// the intent says the content must not propagate over this edge.
    pub fn attempt(inputs: &MergeInputs<'_>, intent: ChangeIntent, merge_all: bool) -> MergeOutcome {
        if !intent.merges_content(merge_all) {
            let reverted: Vec<FileDelta> = inputs
                .source_parent
                .diff(inputs.source)
                .iter()
                .map(FileDelta::inverted)
                .collect();
            info!(%intent, merge_all, paths = reverted.len(), "building blank merge");
            return MergeOutcome::Blank {
                tree: inputs.dest_tip.clone(),
                reverted,
            };
        }

        match Self::merge_trees(inputs.base, inputs.dest_tip, inputs.source) {
            Ok(tree) => {
                info!(files = tree.len(), "clean merge");
                MergeOutcome::Clean { tree }
            }
            Err(paths) => {
                info!(conflicts = paths.len(), "merge conflict");
                MergeOutcome::Conflict { paths }
            }
        }
    }

    /// Three-way merge of whole trees.
    ///
    /// Returns every conflicting path rather than stopping at the first.
    pub fn merge_trees(
        base: &Snapshot,
        ours: &Snapshot,
        theirs: &Snapshot,
    ) -> Result<Snapshot, Vec<PathConflict>> {
        let paths: BTreeSet<&String> = base.paths().chain(ours.paths()).chain(theirs.paths()).collect();

        let mut merged = Snapshot::new();
        let mut conflicts = Vec::new();

        for path in paths {
            match merge_path(path, base.get(path), ours.get(path), theirs.get(path)) {
                PathMerge::Take(Some(entry)) | PathMerge::Merged(entry) => merged.insert(path, entry),
                PathMerge::Take(None) => {}
                PathMerge::Conflict(kind) => conflicts.push(PathConflict {
                    path: path.clone(),
                    kind,
                }),
            }
        }

        if conflicts.is_empty() {
            debug!(files = merged.len(), "trees merged");
            Ok(merged)
        } else {
            Err(conflicts)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::detector::ConflictType;
    use crate::vcs::ChangeKind;

    struct Fixture {
        base: Snapshot,
        dest: Snapshot,
        parent: Snapshot,
        source: Snapshot,
    }

    impl Fixture {
        fn inputs(&self) -> MergeInputs<'_> {
            MergeInputs {
                base: &self.base,
                dest_tip: &self.dest,
                source: &self.source,
                source_parent: &self.parent,
            }
        }
    }

    fn adds_file() -> Fixture {
        let base = Snapshot::new().with_file("README", "readme\n");
        Fixture {
            dest: base.clone().with_file("dest_only", "d\n"),
            parent: base.clone(),
            source: base.clone().with_file("filename", "content"),
            base,
        }
    }

    #[test]
    fn test_normal_intent_merges_cleanly() {
        let fx = adds_file();
        let outcome = MergeAttemptEngine::attempt(&fx.inputs(), ChangeIntent::Normal, false);
        let tree = outcome.tree().unwrap();
        assert_eq!(tree.text("filename"), Some("content"));
        assert_eq!(tree.text("dest_only"), Some("d\n"));
        assert!(!outcome.is_blank());
    }

    #[test]
    fn test_skip_here_builds_blank_merge() {
        let fx = adds_file();
        let outcome = MergeAttemptEngine::attempt(&fx.inputs(), ChangeIntent::SkipHere, false);
        match outcome {
            MergeOutcome::Blank { tree, reverted } => {
                assert_eq!(tree, fx.dest);
                assert_eq!(reverted.len(), 1);
                assert_eq!(reverted[0].path, "filename");
                assert_eq!(reverted[0].kind, ChangeKind::Deleted);
                assert_eq!(reverted[0].lines_deleted, 1);
            }
            other => panic!("expected blank merge, got {other}"),
        }
    }

    #[test]
    fn test_merge_all_overrides_skip_here_only() {
        let fx = adds_file();
        let outcome = MergeAttemptEngine::attempt(&fx.inputs(), ChangeIntent::SkipHere, true);
        assert_eq!(outcome.tree().unwrap().text("filename"), Some("content"));

        let outcome = MergeAttemptEngine::attempt(&fx.inputs(), ChangeIntent::SkipEverywhere, true);
        assert!(outcome.is_blank());
    }

    #[test]
    fn test_conflict_reports_all_paths() {
        let base = Snapshot::new().with_file("a", "base\n").with_file("b", "base\n");
        let dest = Snapshot::new().with_file("a", "dest\n").with_file("b", "dest\n");
        let source = Snapshot::new().with_file("a", "src\n");
        let fx = Fixture {
            parent: base.clone(),
            base,
            dest,
            source,
        };

        match MergeAttemptEngine::attempt(&fx.inputs(), ChangeIntent::Normal, false) {
            MergeOutcome::Conflict { paths } => {
                assert_eq!(paths.len(), 2);
                assert_eq!(paths[0].kind, ConflictType::Content);
                assert_eq!(paths[1].kind, ConflictType::EditDelete);
            }
            other => panic!("expected conflict, got {other}"),
        }
    }

    #[test]
    fn test_blank_merge_never_conflicts() {
        let base = Snapshot::new();
        let fx = Fixture {
            dest: Snapshot::new().with_file("f", "dest\n"),
            parent: base.clone(),
            source: Snapshot::new().with_file("f", "src\n"),
            base,
        };
        let outcome = MergeAttemptEngine::attempt(&fx.inputs(), ChangeIntent::SkipEverywhere, false);
        assert_eq!(outcome.tree().unwrap().text("f"), Some("dest\n"));
    }
}
