//! Version-control object store: snapshots, commits and ref updates.

pub mod snapshot;
pub mod store;

pub use snapshot::{
    ChangeKind, EntryKind, FileDelta, FileEntry, Snapshot, MODE_EXECUTABLE, MODE_FILE, MODE_GITLINK,
    MODE_SYMLINK,
};
pub use store::{CommitIdentity, CommitInfo, GitStore, Mirror, RemoteSource};
