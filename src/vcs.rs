//! Version-control adapter.
//!
//! The orchestrator needs very little from version control: a named,
//! restorable snapshot, the set of dirty paths, and a way to undo a single
//! remediation attempt. [`GitVcs`] provides these with git2, keeping
//! checkpoint refs under `refs/cadence/checkpoints/` and never touching the
//! `.cadence/` state directory.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use git2::{ErrorCode, IndexAddOption, Oid, Repository, ResetType, Signature, StatusOptions};

use crate::{clog, clog_debug, Error, Result};

const CHECKPOINT_REFS_PREFIX: &str = "refs/cadence/checkpoints/";
const STATE_DIR: &str = ".cadence";

/// Contents of the dirty paths at one moment, for undoing what came after.
///
/// `None` records a path that was dirty because it had been deleted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SavedWorktree {
    pub files: BTreeMap<PathBuf, Option<Vec<u8>>>,
}

pub trait VersionControl: Send + Sync {
    /// Record the current working tree and return a reference to it.
    fn snapshot(&self, message: &str) -> Result<String>;

    /// Put the working tree back to a snapshot.
    fn restore(&self, commit_ref: &str) -> Result<()>;

    /// Paths that differ from the last snapshot, relative to the root.
    fn dirty_paths(&self) -> Result<BTreeSet<PathBuf>>;

    /// Current contents of a path, `None` if it does not exist.
    fn read_file(&self, path: &Path) -> Result<Option<Vec<u8>>>;

    /// Rewind `paths`: those captured in `saved` get their saved contents,
    /// the rest go back to the last snapshot.
    fn restore_paths(&self, saved: &SavedWorktree, paths: &BTreeSet<PathBuf>) -> Result<()>;

    fn is_clean(&self) -> Result<bool> {
        Ok(self.dirty_paths()?.is_empty())
    }

    fn save_worktree(&self) -> Result<SavedWorktree> {
        let mut files = BTreeMap::new();
        for path in self.dirty_paths()? {
            let content = self.read_file(&path)?;
            files.insert(path, content);
        }
        Ok(SavedWorktree { files })
    }

    /// Paths whose contents differ from `saved`.
    fn changed_since(&self, saved: &SavedWorktree) -> Result<BTreeSet<PathBuf>> {
        let dirty = self.dirty_paths()?;
        let mut changed = BTreeSet::new();
        for path in &dirty {
            match saved.files.get(path) {
                Some(before) => {
                    if self.read_file(path)? != *before {
                        changed.insert(path.clone());
                    }
                }
                None => {
                    changed.insert(path.clone());
                }
            }
        }
        // Saved-dirty paths that are clean now were reverted to the snapshot.
        changed.extend(saved.files.keys().filter(|p| !dirty.contains(*p)).cloned());
        Ok(changed)
    }
}

/// Git-backed version control rooted at a repository work tree.
pub struct GitVcs {
    root: PathBuf,
}

impl GitVcs {
    pub fn new(path: &Path) -> Result<Self> {
        clog_debug!("GitVcs::new path={}", path.display());
        let repo = Repository::discover(path)?;
        let root = repo
            .workdir()
            .ok_or_else(|| Error::Validation("bare repositories are not supported".to_string()))?
            .to_path_buf();
        Ok(Self { root })
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::open(&self.root)?)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn head_commit(&self) -> Result<String> {
        let repo = self.repo()?;
        let commit = repo.head()?.peel_to_commit()?;
        Ok(commit.id().to_string())
    }

    /// Checkpoint refs, oldest name first, as `(name, commit)`.
    pub fn checkpoint_refs(&self) -> Result<Vec<(String, String)>> {
        let repo = self.repo()?;
        let mut refs: Vec<(String, String)> = repo
            .references_glob(&format!("{}*", CHECKPOINT_REFS_PREFIX))?
            .filter_map(|r| r.ok())
            .filter_map(|r| {
                let name = r.name()?.strip_prefix(CHECKPOINT_REFS_PREFIX)?.to_string();
                let target = r.target()?.to_string();
                Some((name, target))
            })
            .collect();
        refs.sort();
        Ok(refs)
    }

    fn commit_all(&self, repo: &Repository, message: &str) -> Result<Oid> {
        let mut index = repo.index()?;
        let skip_state: &mut git2::IndexMatchedPath = &mut |path: &Path, _: &[u8]| -> i32 {
            if path.starts_with(STATE_DIR) {
                1
            } else {
                0
            }
        };
        index.add_all(["."].iter(), IndexAddOption::DEFAULT, Some(skip_state))?;
        index.update_all(["."].iter(), None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;
        let sig = repo
            .signature()
            .or_else(|_| Signature::now("cadence", "cadence@localhost"))?;

        let parent = match repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(e) if e.code() == ErrorCode::UnbornBranch => None,
            Err(e) => return Err(e.into()),
        };
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        Ok(repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?)
    }

    fn write_path(&self, path: &Path, content: Option<&[u8]>) -> Result<()> {
        let full = self.root.join(path);
        match content {
            Some(bytes) => {
                if let Some(parent) = full.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&full, bytes)?;
            }
            None => {
                if full.exists() {
                    fs::remove_file(&full)?;
                }
            }
        }
        Ok(())
    }
}

impl VersionControl for GitVcs {
    fn snapshot(&self, message: &str) -> Result<String> {
        let repo = self.repo()?;
        let oid = if self.dirty_paths()?.is_empty() {
            repo.head()?.peel_to_commit()?.id()
        } else {
            self.commit_all(&repo, message)?
        };
        let sha = oid.to_string();
        let refname = format!("{}{}", CHECKPOINT_REFS_PREFIX, &sha[..12]);
        repo.reference(&refname, oid, true, "cadence: checkpoint")?;
        clog!("Snapshot {} ({})", sha, message);
        Ok(sha)
    }

    /// Hard-reset to the snapshot and delete untracked files created since,
    /// leaving `.cadence/` alone.
    fn restore(&self, commit_ref: &str) -> Result<()> {
        let repo = self.repo()?;
        let oid = Oid::from_str(commit_ref).map_err(|_| Error::RefNotFound(commit_ref.to_string()))?;
        let commit = match repo.find_commit(oid) {
            Ok(commit) => commit,
            Err(e) if e.code() == ErrorCode::NotFound => {
                return Err(Error::RefNotFound(commit_ref.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        repo.reset(commit.as_object(), ResetType::Hard, None)?;
        for path in self.dirty_paths()? {
            let full = self.root.join(&path);
            if full.is_file() {
                fs::remove_file(&full)?;
            }
        }
        clog!("Restored working tree to {}", commit_ref);
        Ok(())
    }

    fn dirty_paths(&self) -> Result<BTreeSet<PathBuf>> {
        let repo = self.repo()?;
        let mut opts = StatusOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .include_ignored(false);
        let statuses = repo.statuses(Some(&mut opts))?;
        Ok(statuses
            .iter()
            .filter_map(|entry| entry.path().map(PathBuf::from))
            .filter(|path| !path.starts_with(STATE_DIR))
            .collect())
    }

    fn read_file(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        match fs::read(self.root.join(path)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn restore_paths(&self, saved: &SavedWorktree, paths: &BTreeSet<PathBuf>) -> Result<()> {
        let repo = self.repo()?;
        let head_tree = match repo.head() {
            Ok(head) => Some(head.peel_to_tree()?),
            Err(e) if e.code() == ErrorCode::UnbornBranch => None,
            Err(e) => return Err(e.into()),
        };
        for path in paths {
            if let Some(content) = saved.files.get(path) {
                self.write_path(path, content.as_deref())?;
                continue;
            }
            let committed = match head_tree.as_ref().map(|tree| tree.get_path(path)) {
                Some(Ok(entry)) => Some(repo.find_blob(entry.id())?.content().to_vec()),
                Some(Err(e)) if e.code() == ErrorCode::NotFound => None,
                Some(Err(e)) => return Err(e.into()),
                None => None,
            };
            self.write_path(path, committed.as_deref())?;
        }
        clog_debug!("Restored {} paths", paths.len());
        Ok(())
    }
}
