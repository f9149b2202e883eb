//! Repository working copies.
//!
//! Scanning and committing go through [`WorkingCopy`]; the git2 backend reads
//! trees straight from the object database and writes the migration commit
//! without touching the checkout or the source branch.

use git2::build::{RepoBuilder, TreeUpdateBuilder};
use git2::{
    BranchType, Commit, Cred, FetchOptions, FileMode, ObjectType, PushOptions, RemoteCallbacks,
    Repository, Signature, TreeWalkMode, TreeWalkResult,
};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::fleet::RepoRef;
use crate::pointer::{Pointer, MAX_POINTER_SIZE};
use crate::{Error, Result};

const SYMLINK_MODE: i32 = 0o120000;
const EXECUTABLE_MODE: i32 = 0o100755;

/// A file at a path in a branch's tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeFile {
    pub path: String,
    pub content: Vec<u8>,
}

impl TreeFile {
    pub fn new(path: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        TreeFile {
            path: path.into(),
            content: content.into(),
        }
    }
}

/// A request to record `files` on the migration branch.
///
/// The commit builds on the tip of `branch` when that branch exists, else on
/// `base`. Files not listed keep their content from that parent.
#[derive(Debug, Clone, Copy)]
pub struct CommitRequest<'a> {
    pub base: &'a str,
    pub branch: &'a str,
    pub files: &'a [TreeFile],
    pub message: &'a str,
}

/// Read and write access to one repository.
pub trait WorkingCopy {
    fn describe(&self) -> String;

    fn default_branch(&self) -> Result<String>;

    fn branch_exists(&self, branch: &str) -> Result<bool>;

    /// Local and `origin` branch names, deduplicated.
    fn branches(&self) -> Result<Vec<String>>;

    /// Tags as `refs/tags/<name>`; these are accepted wherever a branch is.
    fn tags(&self) -> Result<Vec<String>>;

    /// Blobs on `branch` small enough and shaped enough to be LFS pointers.
    ///
    /// Symlinks are skipped.
    fn pointer_candidates(&self, branch: &str) -> Result<Vec<TreeFile>>;

    fn read_file(&self, branch: &str, path: &str) -> Result<Option<Vec<u8>>>;

    /// Create the commit and move the branch ref to it.
    ///
    /// Returns `None` when the resulting tree equals the parent's; nothing is
    /// written in that case.
    fn commit_files(&self, request: &CommitRequest<'_>) -> Result<Option<String>>;

    fn push(&self, branch: &str, token: Option<&str>) -> Result<()>;

    fn remote_url(&self) -> Option<String>;

    /// The `.git` directory, when the copy lives on disk.
    fn git_dir(&self) -> Option<PathBuf>;
}

/// A working copy backed by a git2 repository.
pub struct GitWorkingCopy {
    repo: Repository,
}

fn read_error(context: &str, err: git2::Error) -> Error {
    Error::RepositoryRead(format!("{}: {}", context, err.message()))
}

fn token_callbacks(token: Option<&str>) -> RemoteCallbacks<'_> {
    let mut callbacks = RemoteCallbacks::new();
    if let Some(token) = token {
        callbacks.credentials(move |_url, _username, _allowed| {
            Cred::userpass_plaintext("x-access-token", token)
        });
    }
    callbacks
}

impl GitWorkingCopy {
    pub fn new(repo: Repository) -> Self {
        GitWorkingCopy { repo }
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let repo = Repository::open(path).map_err(|e| read_error(&path.display().to_string(), e))?;
        Ok(Self::new(repo))
    }

    /// Clone `url` into `dest`, checking out `branch` when given.
    pub fn clone_from(url: &str, dest: &Path, branch: Option<&str>, token: Option<&str>) -> Result<Self> {
        tracing::info!(url, dest = %dest.display(), "cloning repository");
        let mut fetch = FetchOptions::new();
        fetch.remote_callbacks(token_callbacks(token));
        let mut builder = RepoBuilder::new();
        builder.fetch_options(fetch);
        if let Some(branch) = branch {
            builder.branch(branch);
        }
        let repo = builder
            .clone(url, dest)
            .map_err(|e| read_error(&format!("clone {}", url), e))?;
        Ok(Self::new(repo))
    }

    /// Refresh remote-tracking branches from `origin`.
    pub fn fetch(&self, token: Option<&str>) -> Result<()> {
        let mut remote = self
            .repo
            .find_remote("origin")
            .map_err(|e| read_error("find remote origin", e))?;
        let mut fetch = FetchOptions::new();
        fetch.remote_callbacks(token_callbacks(token));
        remote
            .fetch(
                &["+refs/heads/*:refs/remotes/origin/*", "+refs/tags/*:refs/tags/*"],
                Some(&mut fetch),
                None,
            )
            .map_err(|e| read_error("fetch origin", e))?;
        Ok(())
    }

    pub fn repo(&self) -> &Repository {
        &self.repo
    }

    fn local_branch(&self, name: &str) -> Option<Commit<'_>> {
        self.repo
            .find_branch(name, BranchType::Local)
            .ok()
            .and_then(|b| b.get().peel_to_commit().ok())
    }

    fn remote_branch(&self, name: &str) -> Option<Commit<'_>> {
        self.repo
            .find_branch(&format!("origin/{}", name), BranchType::Remote)
            .ok()
            .and_then(|b| b.get().peel_to_commit().ok())
    }

    /// Tip of a source branch; the fetched remote state wins over a stale local one.
    ///
    /// Full ref names such as `refs/tags/v1` are resolved directly.
    fn source_commit(&self, branch: &str) -> Result<Commit<'_>> {
        if branch.starts_with("refs/") {
            return self
                .repo
                .find_reference(branch)
                .and_then(|r| r.peel_to_commit())
                .map_err(|e| read_error(branch, e));
        }
        self.remote_branch(branch)
            .or_else(|| self.local_branch(branch))
            .ok_or_else(|| Error::RepositoryRead(format!("branch '{}' not found", branch)))
    }

    /// Tip of the migration branch; the local ref holds our latest commit.
    fn migration_commit(&self, branch: &str) -> Option<Commit<'_>> {
        self.local_branch(branch).or_else(|| self.remote_branch(branch))
    }

    fn signature(&self) -> Result<Signature<'static>> {
        self.repo
            .signature()
            .or_else(|_| Signature::now("lfs-migrate", "lfs-migrate@localhost"))
            .map_err(Error::from)
    }
}

impl WorkingCopy for GitWorkingCopy {
    fn describe(&self) -> String {
        self.repo
            .workdir()
            .unwrap_or_else(|| self.repo.path())
            .display()
            .to_string()
    }

    fn default_branch(&self) -> Result<String> {
        if let Ok(reference) = self.repo.find_reference("refs/remotes/origin/HEAD") {
            if let Some(target) = reference.symbolic_target() {
                if let Some(name) = target.strip_prefix("refs/remotes/origin/") {
                    return Ok(name.to_string());
                }
            }
        }
        let head = self.repo.head().map_err(|e| read_error("resolve HEAD", e))?;
        head.shorthand()
            .map(String::from)
            .ok_or_else(|| Error::RepositoryRead("HEAD is not a named branch".into()))
    }

    fn branch_exists(&self, branch: &str) -> Result<bool> {
        Ok(self.migration_commit(branch).is_some())
    }

    fn branches(&self) -> Result<Vec<String>> {
        let mut names = BTreeSet::new();
        let branches = self
            .repo
            .branches(None)
            .map_err(|e| read_error("list branches", e))?;
        for entry in branches {
            let (branch, kind) = entry.map_err(|e| read_error("list branches", e))?;
            let Ok(Some(name)) = branch.name() else {
                continue;
            };
            let short = match kind {
                BranchType::Local => name,
                BranchType::Remote => match name.strip_prefix("origin/") {
                    Some(short) if short != "HEAD" => short,
                    _ => continue,
                },
            };
            names.insert(short.to_string());
        }
        Ok(names.into_iter().collect())
    }

    fn tags(&self) -> Result<Vec<String>> {
        let names = self
            .repo
            .tag_names(None)
            .map_err(|e| read_error("list tags", e))?;
        Ok(names
            .iter()
            .flatten()
            .map(|tag| format!("refs/tags/{}", tag))
            .collect())
    }

    fn pointer_candidates(&self, branch: &str) -> Result<Vec<TreeFile>> {
        let tree = self
            .source_commit(branch)?
            .tree()
            .map_err(|e| read_error("read tree", e))?;

        let mut blobs = Vec::new();
        tree.walk(TreeWalkMode::PreOrder, |root, entry| {
            if entry.kind() != Some(ObjectType::Blob) {
                return TreeWalkResult::Ok;
            }
            let path = format!("{}{}", root, String::from_utf8_lossy(entry.name_bytes()));
            if entry.filemode() == SYMLINK_MODE {
                tracing::warn!(path = %path, "skipping symlink");
            } else {
                blobs.push((path, entry.id()));
            }
            TreeWalkResult::Ok
        })
        .map_err(|e| read_error("walk tree", e))?;

        let odb = self.repo.odb().map_err(|e| read_error("open object database", e))?;
        let mut candidates = Vec::new();
        for (path, id) in blobs {
            let (size, _) = odb.read_header(id).map_err(|e| read_error(&path, e))?;
            if size > MAX_POINTER_SIZE {
                continue;
            }
            let blob = self.repo.find_blob(id).map_err(|e| read_error(&path, e))?;
            if Pointer::looks_like_pointer(blob.content()) {
                candidates.push(TreeFile::new(path, blob.content()));
            }
        }
        Ok(candidates)
    }

    fn read_file(&self, branch: &str, path: &str) -> Result<Option<Vec<u8>>> {
        let tree = self
            .source_commit(branch)?
            .tree()
            .map_err(|e| read_error("read tree", e))?;
        let entry = match tree.get_path(Path::new(path)) {
            Ok(entry) => entry,
            Err(e) if e.code() == git2::ErrorCode::NotFound => return Ok(None),
            Err(e) => return Err(read_error(path, e)),
        };
        let blob = self.repo.find_blob(entry.id()).map_err(|e| read_error(path, e))?;
        Ok(Some(blob.content().to_vec()))
    }

    fn commit_files(&self, request: &CommitRequest<'_>) -> Result<Option<String>> {
        let parent = match self.migration_commit(request.branch) {
            Some(commit) => commit,
            None => self.source_commit(request.base)?,
        };
        let parent_tree = parent.tree()?;

        let mut update = TreeUpdateBuilder::new();
        for file in request.files {
            let blob = self.repo.blob(&file.content)?;
            let mode = match parent_tree.get_path(Path::new(&file.path)) {
                Ok(entry) if entry.filemode() == EXECUTABLE_MODE => FileMode::BlobExecutable,
                _ => FileMode::Blob,
            };
            update.upsert(file.path.as_str(), blob, mode);
        }
        let tree_id = update.create_updated(&self.repo, &parent_tree)?;
        if tree_id == parent_tree.id() {
            tracing::info!(branch = request.branch, "tree unchanged, no commit needed");
            return Ok(None);
        }

        let tree = self.repo.find_tree(tree_id)?;
        let sig = self.signature()?;
        // Write the commit object first; the ref only moves once it exists.
        let commit_id = self
            .repo
            .commit(None, &sig, &sig, request.message, &tree, &[&parent])?;
        self.repo.reference(
            &format!("refs/heads/{}", request.branch),
            commit_id,
            true,
            "lfs-migrate: record migrated pointers",
        )?;
        tracing::info!(branch = request.branch, commit = %commit_id, files = request.files.len(), "created migration commit");
        Ok(Some(commit_id.to_string()))
    }

    fn push(&self, branch: &str, token: Option<&str>) -> Result<()> {
        let mut remote = self.repo.find_remote("origin")?;
        let mut callbacks = token_callbacks(token);
        callbacks.push_update_reference(|refname, status| match status {
            Some(message) => Err(git2::Error::from_str(&format!(
                "push of {} rejected: {}",
                refname, message
            ))),
            None => Ok(()),
        });
        let mut options = PushOptions::new();
        options.remote_callbacks(callbacks);
        let refspec = format!("refs/heads/{0}:refs/heads/{0}", branch);
        remote.push(&[refspec.as_str()], Some(&mut options))?;
        tracing::info!(branch, "pushed migration branch");
        Ok(())
    }

    fn remote_url(&self) -> Option<String> {
        self.repo
            .find_remote("origin")
            .ok()
            .and_then(|r| r.url().map(|s| s.to_string()))
    }

    fn git_dir(&self) -> Option<PathBuf> {
        Some(self.repo.path().to_path_buf())
    }
}

/// Produces a working copy for each repository in a fleet run.
pub trait WorkingCopyProvider {
    fn materialize(&self, repo: &RepoRef) -> Result<Box<dyn WorkingCopy>>;

    fn cleanup(&self, repo: &RepoRef) -> Result<()>;
}

/// Clones under `<top_dir>/<owner>/<repo>`, reusing an existing clone.
pub struct GitProvider {
    top_dir: PathBuf,
    branch: Option<String>,
    token: Option<String>,
    dry_run: bool,
}

impl GitProvider {
    pub fn new<P: AsRef<Path>>(top_dir: P) -> Self {
        GitProvider {
            top_dir: top_dir.as_ref().to_path_buf(),
            branch: None,
            token: None,
            dry_run: false,
        }
    }

    pub fn with_branch(mut self, branch: Option<String>) -> Self {
        self.branch = branch;
        self
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn checkout_dir(&self, repo: &RepoRef) -> PathBuf {
        self.top_dir.join(&repo.owner).join(&repo.name)
    }
}

impl WorkingCopyProvider for GitProvider {
    fn materialize(&self, repo: &RepoRef) -> Result<Box<dyn WorkingCopy>> {
        let dir = self.checkout_dir(repo);
        let token = self.token.as_deref();
        if dir.join(".git").exists() {
            let copy = GitWorkingCopy::open(&dir)?;
            copy.fetch(token)?;
            return Ok(Box::new(copy));
        }
        if let Some(parent) = dir.parent() {
            fs::create_dir_all(parent)?;
        }
        let copy = GitWorkingCopy::clone_from(&repo.clone_url(), &dir, self.branch.as_deref(), token)?;
        Ok(Box::new(copy))
    }

    fn cleanup(&self, repo: &RepoRef) -> Result<()> {
        let dir = self.checkout_dir(repo);
        if self.dry_run {
            tracing::info!(dir = %dir.display(), "would remove working copy");
            return Ok(());
        }
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
            tracing::info!(dir = %dir.display(), "removed working copy");
        }
        Ok(())
    }
}
