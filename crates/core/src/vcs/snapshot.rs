//! In-memory view of a commit's tree.
//!
//! Merges are computed over [`Snapshot`]s rather than against a working copy,
//! so the engine never touches a checkout and two edges can be merged from
//! the same source without interfering with each other.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Git filemode of a regular file.
pub const MODE_FILE: u32 = 0o100644;
/// Git filemode of an executable file.
pub const MODE_EXECUTABLE: u32 = 0o100755;
/// Git filemode of a symbolic link; the blob holds the target.
pub const MODE_SYMLINK: u32 = 0o120000;
/// Git filemode of a submodule commit.
pub const MODE_GITLINK: u32 = 0o160000;

/// What a tree entry is, derived from its filemode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Executable,
    Symlink,
    /// A submodule pinned at a commit of another repository.
    Gitlink,
}

/// One non-tree entry at a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Blob content, or the hex commit id for a gitlink.
    pub content: Vec<u8>,
    /// Raw git filemode, written back unchanged.
    pub mode: u32,
}

impl FileEntry {
    pub fn text(content: &str) -> Self {
        Self::blob(content.as_bytes().to_vec(), MODE_FILE)
    }

    pub fn blob(content: Vec<u8>, mode: u32) -> Self {
        Self { content, mode }
    }

    /// A submodule entry pointing at `commit`.
    pub fn gitlink(commit: &str) -> Self {
        Self {
            content: commit.as_bytes().to_vec(),
            mode: MODE_GITLINK,
        }
    }

    pub fn kind(&self) -> EntryKind {
        match self.mode {
            MODE_EXECUTABLE => EntryKind::Executable,
            MODE_SYMLINK => EntryKind::Symlink,
            MODE_GITLINK => EntryKind::Gitlink,
            _ => EntryKind::File,
        }
    }

    /// Whether the content is file data that can be merged line by line.
    pub fn is_regular(&self) -> bool {
        matches!(self.kind(), EntryKind::File | EntryKind::Executable)
    }

    /// The content as UTF-8, or `None` for binary blobs and gitlinks.
    pub fn as_text(&self) -> Option<&str> {
        if self.kind() == EntryKind::Gitlink {
            return None;
        }
        std::str::from_utf8(&self.content).ok()
    }
}

/// Every file in a tree, keyed by slash-separated path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    files: BTreeMap<String, FileEntry>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert of a text file.
    pub fn with_file(mut self, path: &str, content: &str) -> Self {
        self.insert(path, FileEntry::text(content));
        self
    }

    pub fn insert(&mut self, path: &str, entry: FileEntry) {
        self.files.insert(path.to_string(), entry);
    }

    pub fn get(&self, path: &str) -> Option<&FileEntry> {
        self.files.get(path)
    }

    /// Text content at `path`, if present and valid UTF-8.
    pub fn text(&self, path: &str) -> Option<&str> {
        self.get(path).and_then(FileEntry::as_text)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FileEntry)> {
        self.files.iter()
    }

    pub fn paths(&self) -> impl Iterator<Item = &String> {
        self.files.keys()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Per-path changes turning `self` into `other`.
    pub fn diff(&self, other: &Snapshot) -> Vec<FileDelta> {
        let mut deltas = Vec::new();

        for (path, old) in &self.files {
            match other.files.get(path) {
                None => deltas.push(FileDelta::between(path, Some(old), None)),
                Some(new) if new != old => deltas.push(FileDelta::between(path, Some(old), Some(new))),
                Some(_) => {}
            }
        }
        for (path, new) in &other.files {
            if !self.files.contains_key(path) {
                deltas.push(FileDelta::between(path, None, Some(new)));
            }
        }

        deltas.sort_by(|a, b| a.path.cmp(&b.path));
        deltas
    }
}

/// How a path changed between two snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

impl ChangeKind {
    fn inverted(self) -> Self {
        match self {
            ChangeKind::Added => ChangeKind::Deleted,
            ChangeKind::Deleted => ChangeKind::Added,
            ChangeKind::Modified => ChangeKind::Modified,
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Added => write!(f, "added"),
            ChangeKind::Modified => write!(f, "modified"),
            ChangeKind::Deleted => write!(f, "deleted"),
        }
    }
}

/// Line-level summary of one path's change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDelta {
    pub path: String,
    pub kind: ChangeKind,
    pub lines_added: usize,
    pub lines_deleted: usize,
}

impl FileDelta {
    fn between(path: &str, old: Option<&FileEntry>, new: Option<&FileEntry>) -> Self {
        let kind = match (old, new) {
            (None, _) => ChangeKind::Added,
            (_, None) => ChangeKind::Deleted,
            _ => ChangeKind::Modified,
        };
        let old_text = old.map_or(Some(""), FileEntry::as_text);
        let new_text = new.map_or(Some(""), FileEntry::as_text);

        let (lines_added, lines_deleted) = match (old_text, new_text) {
            (Some(a), Some(b)) => count_lines(a, b),
            // Binary content has no line counts.
            _ => (0, 0),
        };

        Self {
            path: path.to_string(),
            kind,
            lines_added,
            lines_deleted,
        }
    }

    /// The change that undoes this one.
    pub fn inverted(&self) -> Self {
        Self {
            path: self.path.clone(),
            kind: self.kind.inverted(),
            lines_added: self.lines_deleted,
            lines_deleted: self.lines_added,
        }
    }
}

fn count_lines(old: &str, new: &str) -> (usize, usize) {
    let patch = diffy::create_patch(old, new);
    let mut added = 0;
    let mut deleted = 0;
    for hunk in patch.hunks() {
        for line in hunk.lines() {
            match line {
                diffy::Line::Insert(_) => added += 1,
                diffy::Line::Delete(_) => deleted += 1,
                diffy::Line::Context(_) => {}
            }
        }
    }
    (added, deleted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diff_reports_each_kind() {
        let old = Snapshot::new()
            .with_file("keep.txt", "same\n")
            .with_file("edit.txt", "a\nb\nc\n")
            .with_file("gone.txt", "x\ny\n");
        let new = Snapshot::new()
            .with_file("keep.txt", "same\n")
            .with_file("edit.txt", "a\nB\nc\nd\n")
            .with_file("new.txt", "fresh\n");

        let deltas = old.diff(&new);
        assert_eq!(deltas.len(), 3);

        let edit = &deltas[0];
        assert_eq!(edit.path, "edit.txt");
        assert_eq!(edit.kind, ChangeKind::Modified);
        assert_eq!((edit.lines_added, edit.lines_deleted), (2, 1));

        let gone = &deltas[1];
        assert_eq!(gone.kind, ChangeKind::Deleted);
        assert_eq!(gone.lines_deleted, 2);

        let added = &deltas[2];
        assert_eq!(added.kind, ChangeKind::Added);
        assert_eq!(added.lines_added, 1);
    }

    #[test]
    fn test_inverted_delta_swaps_counts() {
        let delta = Snapshot::new().diff(&Snapshot::new().with_file("filename", "content"));
        let inverse = delta[0].inverted();
        assert_eq!(inverse.kind, ChangeKind::Deleted);
        assert_eq!(inverse.lines_deleted, 1);
        assert_eq!(inverse.lines_added, 0);
    }

    #[test]
    fn test_binary_files_have_no_line_counts() {
        let mut new = Snapshot::new();
        new.insert("blob.bin", FileEntry::blob(vec![0xff, 0xfe, 0x00], MODE_FILE));
        new.insert("vendor/lib", FileEntry::gitlink("0123456789abcdef0123456789abcdef01234567"));
        let deltas = Snapshot::new().diff(&new);
        assert_eq!(deltas[0].lines_added, 0);
        assert_eq!(deltas[1].path, "vendor/lib");
        assert_eq!(deltas[1].lines_added, 0);
    }

    #[test]
    fn test_entry_kind_follows_mode() {
        assert_eq!(FileEntry::text("x").kind(), EntryKind::File);
        assert_eq!(FileEntry::blob(b"x".to_vec(), MODE_EXECUTABLE).kind(), EntryKind::Executable);
        let link = FileEntry::blob(b"target".to_vec(), MODE_SYMLINK);
        assert_eq!(link.kind(), EntryKind::Symlink);
        assert!(!link.is_regular());
        let sub = FileEntry::gitlink("0123456789abcdef0123456789abcdef01234567");
        assert_eq!(sub.kind(), EntryKind::Gitlink);
        assert_eq!(sub.as_text(), None);
    }
}
