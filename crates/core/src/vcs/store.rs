//! Object store access via `git2`.
//!
//! [`GitStore`] reads commits and trees into [`Snapshot`]s, writes merge
//! commits built from snapshots, and updates refs with compare-and-swap
//! semantics. Repositories are opened per call so the store can be shared
//! across tasks.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use git2::build::TreeUpdateBuilder;
use git2::{
    Cred, ErrorCode, FetchOptions, FileMode, Index, IndexEntry, IndexTime, ObjectType, Oid,
    RemoteCallbacks, Repository, Signature, Tree, TreeEntry, TreeWalkMode, TreeWalkResult,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::errors::VcsError;
use crate::vcs::snapshot::{
    EntryKind, FileEntry, Snapshot, MODE_EXECUTABLE, MODE_FILE, MODE_GITLINK, MODE_SYMLINK,
};

/// Where project repositories live on disk.
#[derive(Debug, Clone)]
enum Layout {
    /// `<root>/<project>.git`, falling back to `<root>/<project>`.
    PerProject(PathBuf),
    /// One repository serving every project name.
    Single(PathBuf),
}

/// Identity stamped on commits the store writes.
#[derive(Debug, Clone)]
pub struct CommitIdentity {
    pub name: String,
    pub email: String,
}

impl Default for CommitIdentity {
    fn default() -> Self {
        Self {
            name: "Automerger".into(),
            email: "automerger@localhost".into(),
        }
    }
}

/// Information about a single commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub sha: String,
    pub message: String,
    pub parents: Vec<String>,
    pub author_name: String,
    pub author_email: String,
}

/// Credentials and URL used to refresh a mirror from the review server.
#[derive(Debug, Clone)]
pub struct RemoteSource {
    pub base_url: String,
    pub username: String,
    pub password: String,
}

/// Brings the local copy of a project up to date with the review server.
///
/// Implementations block; callers run them off the async workers.
pub trait Mirror: Send + Sync {
    /// Refresh every branch of `project` plus `extra_refs`.
    fn refresh(&self, store: &GitStore, project: &str, extra_refs: &[String]) -> Result<(), VcsError>;
}

impl Mirror for RemoteSource {
    fn refresh(&self, store: &GitStore, project: &str, extra_refs: &[String]) -> Result<(), VcsError> {
        store.fetch(project, self, extra_refs)
    }
}

/// Git object store holding one repository per project.
#[derive(Debug, Clone)]
pub struct GitStore {
    layout: Layout,
    identity: CommitIdentity,
}

impl GitStore {
    /// A store whose repositories live under `root`.
    pub fn new<P: AsRef<Path>>(root: P, identity: CommitIdentity) -> Self {
        Self {
            layout: Layout::PerProject(root.as_ref().to_path_buf()),
            identity,
        }
    }

    /// A store backed by a single existing repository.
    pub fn single<P: AsRef<Path>>(repo_path: P, identity: CommitIdentity) -> Self {
        Self {
            layout: Layout::Single(repo_path.as_ref().to_path_buf()),
            identity,
        }
    }

    fn repo_path(&self, project: &str) -> PathBuf {
        match self.layout {
            Layout::Single(ref path) => path.clone(),
            Layout::PerProject(ref root) => {
                let bare = root.join(format!("{project}.git"));
                if bare.exists() {
                    bare
                } else {
                    root.join(project)
                }
            }
        }
    }

    fn open(&self, project: &str) -> Result<Repository, VcsError> {
        let path = self.repo_path(project);
        Repository::open(&path).map_err(|e| {
            debug!(path = %path.display(), error = %e, "failed to open repository");
            VcsError::RepositoryNotFound(project.to_string())
        })
    }

    /// Create an empty bare repository for `project`.
    #[instrument(skip(self))]
    pub fn create_project(&self, project: &str) -> Result<(), VcsError> {
        let path = match self.layout {
            Layout::PerProject(ref root) => root.join(format!("{project}.git")),
            Layout::Single(ref path) => path.clone(),
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Repository::init_bare(&path)?;
        info!(path = %path.display(), "created project repository");
        Ok(())
    }

    /// Resolve `refs/heads/<branch>` to a commit SHA.
    pub fn branch_tip(&self, project: &str, branch: &str) -> Result<String, VcsError> {
        let refname = format!("refs/heads/{branch}");
        self.read_ref(project, &refname)?
            .ok_or(VcsError::RefNotFound(refname))
    }

    /// Resolve any ref to the commit it points at.
    pub fn read_ref(&self, project: &str, refname: &str) -> Result<Option<String>, VcsError> {
        let repo = self.open(project)?;
        let result = match repo.find_reference(refname) {
            Ok(reference) => Ok(Some(reference.peel_to_commit()?.id().to_string())),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        };
        result
    }

    /// Metadata for a commit.
    pub fn commit_info(&self, project: &str, sha: &str) -> Result<CommitInfo, VcsError> {
        let repo = self.open(project)?;
        let commit = find_commit(&repo, sha)?;
        let author = commit.author();
        Ok(CommitInfo {
            sha: commit.id().to_string(),
            message: commit.message().unwrap_or_default().to_string(),
            parents: commit.parent_ids().map(|id| id.to_string()).collect(),
            author_name: author.name().unwrap_or_default().to_string(),
            author_email: author.email().unwrap_or_default().to_string(),
        })
    }

    /// Read the full tree of a commit.
    pub fn snapshot(&self, project: &str, sha: &str) -> Result<Snapshot, VcsError> {
        let repo = self.open(project)?;
        let commit = find_commit(&repo, sha)?;
        let tree = commit.tree()?;

        let mut snapshot = Snapshot::new();
        let mut failure: Option<VcsError> = None;
        let walked = tree.walk(TreeWalkMode::PreOrder, |dir, entry| {
            if entry.kind() == Some(ObjectType::Tree) {
                return TreeWalkResult::Ok;
            }
            let Some(name) = entry.name() else {
                warn!(dir, "skipping tree entry with non UTF-8 name");
                return TreeWalkResult::Skip;
            };
            match read_entry(&repo, entry) {
                Ok(Some(file)) => {
                    snapshot.insert(&format!("{dir}{name}"), file);
                    TreeWalkResult::Ok
                }
                Ok(None) => TreeWalkResult::Ok,
                Err(e) => {
                    failure = Some(e);
                    TreeWalkResult::Abort
                }
            }
        });

        // An aborted walk reports a generic callback error; surface ours.
        if let Some(err) = failure {
            return Err(err);
        }
        walked?;
        debug!(sha, files = snapshot.len(), "loaded snapshot");
        Ok(snapshot)
    }

    /// The entries at `paths` in commit `sha`. Paths absent from the tree,
    /// or naming a directory there, are left out.
    pub fn snapshot_paths(
        &self,
        project: &str,
        sha: &str,
        paths: &BTreeSet<String>,
    ) -> Result<Snapshot, VcsError> {
        let repo = self.open(project)?;
        let tree = find_commit(&repo, sha)?.tree()?;

        let mut snapshot = Snapshot::new();
        for path in paths {
            let entry = match tree.get_path(Path::new(path)) {
                Ok(entry) => entry,
                Err(e) if e.code() == ErrorCode::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            if let Some(file) = read_entry(&repo, &entry)? {
                snapshot.insert(path, file);
            }
        }
        debug!(sha, requested = paths.len(), files = snapshot.len(), "loaded partial snapshot");
        Ok(snapshot)
    }

    /// Paths whose entries differ between two commits. `from == None`
    /// compares against an empty tree.
    pub fn changed_paths(
        &self,
        project: &str,
        from: Option<&str>,
        to: &str,
    ) -> Result<BTreeSet<String>, VcsError> {
        let repo = self.open(project)?;
        let old_tree = match from {
            Some(sha) => Some(find_commit(&repo, sha)?.tree()?),
            None => None,
        };
        let new_tree = find_commit(&repo, to)?.tree()?;
        let diff = repo.diff_tree_to_tree(old_tree.as_ref(), Some(&new_tree), None)?;

        let mut paths = BTreeSet::new();
        for delta in diff.deltas() {
            for file in [delta.old_file(), delta.new_file()] {
                match file.path().map(Path::to_str) {
                    Some(Some(path)) => {
                        paths.insert(path.to_string());
                    }
                    Some(None) => warn!("skipping changed path with non UTF-8 name"),
                    None => {}
                }
            }
        }
        Ok(paths)
    }

    /// Best common ancestor of two commits, `None` for unrelated histories.
    pub fn merge_base(&self, project: &str, a: &str, b: &str) -> Result<Option<String>, VcsError> {
        let repo = self.open(project)?;
        let a = parse_oid(a)?;
        let b = parse_oid(b)?;
        match repo.merge_base(a, b) {
            Ok(oid) => Ok(Some(oid.to_string())),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write `snapshot` as a tree and commit it with the given parents.
    ///
    /// No ref is moved; use [`update_ref`](Self::update_ref) to publish.
    #[instrument(skip(self, snapshot, message))]
    pub fn write_commit(
        &self,
        project: &str,
        snapshot: &Snapshot,
        parents: &[&str],
        message: &str,
    ) -> Result<String, VcsError> {
        let repo = self.open(project)?;

        let mut index = Index::new()?;
        for (path, file) in snapshot.iter() {
            let id = write_entry(&repo, file)?;
            index.add(&index_entry(path, id, file))?;
        }
        let tree_oid = index.write_tree_to(&repo)?;
        let tree = repo.find_tree(tree_oid)?;
        self.commit_tree(&repo, &tree, parents, message)
    }

    /// Commit the tree of commit `onto` with `changes` applied: `Some`
    /// writes the entry at its path, `None` removes the path.
    ///
    /// Paths not named in `changes` keep their entries from `onto`
    /// untouched, whatever their kind.
    #[instrument(skip(self, changes, message), fields(changes = changes.len()))]
    pub fn write_commit_onto(
        &self,
        project: &str,
        onto: &str,
        changes: &BTreeMap<String, Option<FileEntry>>,
        parents: &[&str],
        message: &str,
    ) -> Result<String, VcsError> {
        let repo = self.open(project)?;
        let baseline = find_commit(&repo, onto)?.tree()?;

        let mut update = TreeUpdateBuilder::new();
        for (path, change) in changes {
            match change {
                Some(file) => {
                    let id = write_entry(&repo, file)?;
                    update.upsert(path.as_str(), id, file_mode(file.mode));
                }
                None if has_path(&baseline, path) => {
                    update.remove(path.as_str());
                }
                None => {}
            }
        }
        let tree_oid = update.create_updated(&repo, &baseline)?;
        let tree = repo.find_tree(tree_oid)?;
        self.commit_tree(&repo, &tree, parents, message)
    }

    fn commit_tree(
        &self,
        repo: &Repository,
        tree: &Tree<'_>,
        parents: &[&str],
        message: &str,
    ) -> Result<String, VcsError> {
        let parent_commits = parents
            .iter()
            .map(|sha| find_commit(repo, sha))
            .collect::<Result<Vec<_>, _>>()?;
        let parent_refs: Vec<&git2::Commit> = parent_commits.iter().collect();

        let sig = Signature::now(&self.identity.name, &self.identity.email)?;
        let oid = repo.commit(None, &sig, &sig, message, tree, &parent_refs)?;
        info!(sha = %oid, parents = parents.len(), "wrote commit");
        Ok(oid.to_string())
    }

    /// Point `refname` at `new_sha` if it currently points at `expected`.
    ///
    /// `expected == None` means the ref must not exist yet. Losing the race
    /// returns [`VcsError::ConcurrentModification`].
    #[instrument(skip(self))]
    pub fn update_ref(
        &self,
        project: &str,
        refname: &str,
        new_sha: &str,
        expected: Option<&str>,
    ) -> Result<(), VcsError> {
        let repo = self.open(project)?;
        let new_oid = parse_oid(new_sha)?;
        let log_message = format!("automerger: update {refname}");

        let result = match expected {
            Some(old) => {
                let old_oid = parse_oid(old)?;
                repo.reference_matching(refname, new_oid, true, old_oid, &log_message)
            }
            None => repo.reference(refname, new_oid, false, &log_message),
        };

        match result {
            Ok(_) => {
                debug!(refname, sha = new_sha, "ref updated");
                Ok(())
            }
            Err(e)
                if matches!(
                    e.code(),
                    ErrorCode::Modified | ErrorCode::Exists | ErrorCode::Locked | ErrorCode::NotFound
                ) =>
            {
                warn!(refname, error = %e, "ref update lost a race");
                Err(VcsError::ConcurrentModification {
                    refname: refname.to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Create `refs/heads/<name>` at `from_sha`.
    #[instrument(skip(self))]
    pub fn create_branch(&self, project: &str, name: &str, from_sha: &str) -> Result<(), VcsError> {
        self.update_ref(project, &format!("refs/heads/{name}"), from_sha, None)?;
        info!(name, from_sha, "created branch");
        Ok(())
    }

    /// Refresh a mirror from the review server.
    ///
    /// Fetches all heads plus the given extra refs (typically change refs).
    #[instrument(skip(self, remote), fields(url = %remote.base_url))]
    pub fn fetch(
        &self,
        project: &str,
        remote: &RemoteSource,
        extra_refs: &[String],
    ) -> Result<(), VcsError> {
        let path = self.repo_path(project);
        let repo = if path.exists() {
            self.open(project)?
        } else {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            info!(path = %path.display(), "initializing mirror");
            Repository::init_bare(&path)?
        };

        let url = format!("{}/a/{}", remote.base_url.trim_end_matches('/'), project);
        let mut handle = repo.remote_anonymous(&url)?;

        let mut callbacks = RemoteCallbacks::new();
        let username = remote.username.clone();
        let password = remote.password.clone();
        callbacks.credentials(move |_url, _username, _allowed| {
            Cred::userpass_plaintext(&username, &password)
        });
        let mut fetch_opts = FetchOptions::new();
        fetch_opts.remote_callbacks(callbacks);

        let mut refspecs = vec!["+refs/heads/*:refs/heads/*".to_string()];
        refspecs.extend(extra_refs.iter().map(|r| format!("+{r}:{r}")));
        handle.fetch(&refspecs, Some(&mut fetch_opts), None)?;
        debug!(project, refs = refspecs.len(), "fetch completed");
        Ok(())
    }
}

fn parse_oid(sha: &str) -> Result<Oid, VcsError> {
    Oid::from_str(sha).map_err(|_| VcsError::RefNotFound(sha.to_string()))
}

fn find_commit<'r>(repo: &'r Repository, sha: &str) -> Result<git2::Commit<'r>, VcsError> {
    let oid = parse_oid(sha)?;
    repo.find_commit(oid).map_err(|e| match e.code() {
        ErrorCode::NotFound => VcsError::RefNotFound(sha.to_string()),
        _ => VcsError::InvalidObject {
            oid: sha.to_string(),
            detail: e.message().to_string(),
        },
    })
}

/// Read a non-tree entry. Gitlinks keep the commit they point at, since the
/// submodule's objects are not in this repository.
fn read_entry(repo: &Repository, entry: &TreeEntry<'_>) -> Result<Option<FileEntry>, VcsError> {
    match entry.kind() {
        Some(ObjectType::Blob) => {
            let blob = repo.find_blob(entry.id())?;
            let mode = u32::try_from(entry.filemode()).unwrap_or(MODE_FILE);
            Ok(Some(FileEntry::blob(blob.content().to_vec(), mode)))
        }
        Some(ObjectType::Commit) => Ok(Some(FileEntry::gitlink(&entry.id().to_string()))),
        _ => Ok(None),
    }
}

/// The object id an entry is stored under, writing blobs as needed.
fn write_entry(repo: &Repository, file: &FileEntry) -> Result<Oid, VcsError> {
    if file.kind() == EntryKind::Gitlink {
        let hex = String::from_utf8_lossy(&file.content);
        return Oid::from_str(&hex).map_err(|_| VcsError::InvalidObject {
            oid: hex.to_string(),
            detail: "gitlink does not name a commit".into(),
        });
    }
    Ok(repo.blob(&file.content)?)
}

fn file_mode(mode: u32) -> FileMode {
    match mode {
        MODE_EXECUTABLE => FileMode::BlobExecutable,
        MODE_SYMLINK => FileMode::Link,
        MODE_GITLINK => FileMode::Commit,
        _ => FileMode::Blob,
    }
}

fn has_path(tree: &Tree<'_>, path: &str) -> bool {
    tree.get_path(Path::new(path)).is_ok()
}

fn index_entry(path: &str, id: Oid, file: &FileEntry) -> IndexEntry {
    let path = path.as_bytes().to_vec();
    IndexEntry {
        ctime: IndexTime::new(0, 0),
        mtime: IndexTime::new(0, 0),
        dev: 0,
        ino: 0,
        mode: file.mode,
        uid: 0,
        gid: 0,
        // Git stores sizes of 4 GiB and more saturated.
        file_size: u32::try_from(file.content.len()).unwrap_or(u32::MAX),
        id,
        flags: path.len().min(0xfff) as u16,
        flags_extended: 0,
        path,
    }
}
