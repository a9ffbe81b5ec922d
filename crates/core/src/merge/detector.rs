//! Per-path merge classification.
//!
//! Given the base, destination ("ours") and source ("theirs") version of a
//! single path, the detector decides which side wins, merges text when both
//! sides changed it, and classifies anything it cannot reconcile.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::merge::merger::Merger;
use crate::vcs::{EntryKind, FileEntry};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Categorisation of a path that cannot be merged automatically.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Both sides changed the same lines.
    Content,
    /// Both sides added the path with different content.
    AddAdd,
    /// One side edited the path, the other deleted it.
    EditDelete,
    /// Binary content changed on both sides.
    Binary,
    /// A symbolic link was changed on both sides, or replaced by a file on one.
    Symlink,
    /// A submodule pointer was changed on both sides.
    Submodule,
    /// Both sides changed the file mode differently.
    Mode,
}

impl std::fmt::Display for ConflictType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Content => write!(f, "content"),
            Self::AddAdd => write!(f, "add/add"),
            Self::EditDelete => write!(f, "edit/delete"),
            Self::Binary => write!(f, "binary"),
            Self::Symlink => write!(f, "symlink"),
            Self::Submodule => write!(f, "submodule"),
            Self::Mode => write!(f, "mode"),
        }
    }
}

/// A path that could not be merged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathConflict {
    pub path: String,
    pub kind: ConflictType,
}

impl std::fmt::Display for PathConflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.path, self.kind)
    }
}

/// How one path resolves in the merged tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathMerge {
    /// The path takes this value (`None` = absent) without a content merge.
    Take(Option<FileEntry>),
    /// Both sides changed the text and it merged cleanly.
    Merged(FileEntry),
    Conflict(ConflictType),
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

/// Decide how a single path merges.
pub fn merge_path(
    path: &str,
    base: Option<&FileEntry>,
    ours: Option<&FileEntry>,
    theirs: Option<&FileEntry>,
) -> PathMerge {
    if theirs == base || ours == theirs {
        return PathMerge::Take(ours.cloned());
    }
    if ours == base {
        return PathMerge::Take(theirs.cloned());
    }

    // Both sides changed the path, differently.
    let (ours, theirs) = match (ours, theirs) {
        (Some(o), Some(t)) => (o, t),
        _ => {
            debug!(path, "edit/delete conflict");
            return PathMerge::Conflict(ConflictType::EditDelete);
        }
    };

    if ours.kind() == EntryKind::Gitlink || theirs.kind() == EntryKind::Gitlink {
        debug!(path, "submodule conflict");
        return PathMerge::Conflict(ConflictType::Submodule);
    }
    if !ours.is_regular() || !theirs.is_regular() {
        debug!(path, "symlink conflict");
        return PathMerge::Conflict(ConflictType::Symlink);
    }

    let base_text = match base {
        Some(b) => b.as_text(),
        None => Some(""),
    };
    let (Some(base_text), Some(ours_text), Some(theirs_text)) =
        (base_text, ours.as_text(), theirs.as_text())
    else {
        debug!(path, "binary conflict");
        return PathMerge::Conflict(ConflictType::Binary);
    };

    let result = Merger::three_way_merge(base_text, ours_text, theirs_text);
    if result.has_conflicts {
        let kind = if base.is_none() {
            ConflictType::AddAdd
        } else {
            ConflictType::Content
        };
        debug!(path, %kind, regions = result.conflict_regions, "content conflict");
        return PathMerge::Conflict(kind);
    }

    // A mode change on one side survives the merge.
    let base_mode = base.map(|b| b.mode);
    let mode = if Some(ours.mode) == base_mode {
        theirs.mode
    } else if Some(theirs.mode) == base_mode || ours.mode == theirs.mode {
        ours.mode
    } else {
        debug!(path, ours = ours.mode, theirs = theirs.mode, "mode conflict");
        return PathMerge::Conflict(ConflictType::Mode);
    };

    PathMerge::Merged(FileEntry::blob(result.merged_content.into_bytes(), mode))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vcs::{MODE_EXECUTABLE, MODE_FILE, MODE_SYMLINK};

    fn text(s: &str) -> FileEntry {
        FileEntry::text(s)
    }

    #[test]
    fn test_untouched_by_source_keeps_destination() {
        let base = text("a\n");
        let ours = text("b\n");
        assert_eq!(
            merge_path("f", Some(&base), Some(&ours), Some(&base)),
            PathMerge::Take(Some(ours))
        );
    }

    #[test]
    fn test_source_only_change_wins() {
        let base = text("a\n");
        let theirs = text("c\n");
        assert_eq!(
            merge_path("f", Some(&base), Some(&base), Some(&theirs)),
            PathMerge::Take(Some(theirs))
        );
        // Deletion on the source side.
        assert_eq!(
            merge_path("f", Some(&base), Some(&base), None),
            PathMerge::Take(None)
        );
    }

    #[test]
    fn test_edit_delete_conflict() {
        let base = text("a\n");
        let ours = text("edited\n");
        assert_eq!(
            merge_path("f", Some(&base), Some(&ours), None),
            PathMerge::Conflict(ConflictType::EditDelete)
        );
    }

    #[test]
    fn test_add_add_conflict() {
        assert_eq!(
            merge_path("f", None, Some(&text("one\n")), Some(&text("two\n"))),
            PathMerge::Conflict(ConflictType::AddAdd)
        );
    }

    #[test]
    fn test_both_deleted_no_conflict() {
        let base = text("a\n");
        assert_eq!(merge_path("f", Some(&base), None, None), PathMerge::Take(None));
    }

    #[test]
    fn test_binary_conflict() {
        let base = FileEntry::blob(vec![0xff, 0x00], MODE_FILE);
        let ours = FileEntry::blob(vec![0xff, 0x01], MODE_FILE);
        let theirs = FileEntry::blob(vec![0xff, 0x02], MODE_FILE);
        assert_eq!(
            merge_path("img.png", Some(&base), Some(&ours), Some(&theirs)),
            PathMerge::Conflict(ConflictType::Binary)
        );
    }

    #[test]
    fn test_clean_text_merge() {
        let base = text("1\n2\n3\n4\n5\n6\n7\n8\n");
        let ours = text("one\n2\n3\n4\n5\n6\n7\n8\n");
        let theirs = text("1\n2\n3\n4\n5\n6\n7\neight\n");
        match merge_path("f", Some(&base), Some(&ours), Some(&theirs)) {
            PathMerge::Merged(entry) => {
                let merged = entry.as_text().unwrap();
                assert!(merged.starts_with("one\n"));
                assert!(merged.ends_with("eight\n"));
            }
            other => panic!("expected merged, got {other:?}"),
        }
    }

    #[test]
    fn test_untouched_symlink_and_submodule_survive() {
        let link = FileEntry::blob(b"../shared".to_vec(), MODE_SYMLINK);
        let sub = FileEntry::gitlink("1111111111111111111111111111111111111111");
        assert_eq!(
            merge_path("link", Some(&link), Some(&link), Some(&link)),
            PathMerge::Take(Some(link.clone()))
        );
        assert_eq!(
            merge_path("sub", Some(&sub), Some(&sub), Some(&sub)),
            PathMerge::Take(Some(sub))
        );
    }

    #[test]
    fn test_submodule_moved_on_both_sides_conflicts() {
        let base = FileEntry::gitlink("1111111111111111111111111111111111111111");
        let ours = FileEntry::gitlink("2222222222222222222222222222222222222222");
        let theirs = FileEntry::gitlink("3333333333333333333333333333333333333333");
        assert_eq!(
            merge_path("sub", Some(&base), Some(&ours), Some(&theirs)),
            PathMerge::Conflict(ConflictType::Submodule)
        );
        // One side only: the moved pointer wins.
        assert_eq!(
            merge_path("sub", Some(&base), Some(&base), Some(&theirs)),
            PathMerge::Take(Some(theirs))
        );
    }

    #[test]
    fn test_symlink_retargeted_on_both_sides_conflicts() {
        let base = FileEntry::blob(b"a".to_vec(), MODE_SYMLINK);
        let ours = FileEntry::blob(b"b".to_vec(), MODE_SYMLINK);
        let theirs = text("now a file\n");
        assert_eq!(
            merge_path("link", Some(&base), Some(&ours), Some(&theirs)),
            PathMerge::Conflict(ConflictType::Symlink)
        );
    }

    #[test]
    fn test_mode_changes() {
        let base = text("1\n2\n3\n4\n5\n6\n7\n8\n");
        let ours = FileEntry::blob(b"one\n2\n3\n4\n5\n6\n7\n8\n".to_vec(), MODE_EXECUTABLE);
        let theirs = text("1\n2\n3\n4\n5\n6\n7\neight\n");
        match merge_path("run.sh", Some(&base), Some(&ours), Some(&theirs)) {
            PathMerge::Merged(entry) => assert_eq!(entry.mode, MODE_EXECUTABLE),
            other => panic!("expected merged, got {other:?}"),
        }

        // Added on both sides with the same text but different modes.
        let ours = FileEntry::blob(b"x\n".to_vec(), MODE_EXECUTABLE);
        let theirs = text("x\n");
        assert_eq!(
            merge_path("run.sh", None, Some(&ours), Some(&theirs)),
            PathMerge::Conflict(ConflictType::Mode)
        );
    }
}
