//! Per-repository migration state machine.
//!
//! Scan the source branch for pointers, move every referenced object, then
//! record the result on the migration branch in a single commit. The commit
//! only happens after every transfer for the repository has settled.
//!
//! Release branches and tags can contribute objects too. Those are transferred
//! so old checkouts keep working, but only the source branch is rewritten.

use ini::Ini;
use serde::Serialize;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use crate::batch::{ObjectSpec, Operation, TransferAction};
use crate::cache::ObjectCache;
use crate::client::{derive_lfs_url, BatchApi, LfsClient};
use crate::config::{Endpoint, MigrationConfig, SourceSpec};
use crate::fleet::RepoRef;
use crate::mapper::{OidMapper, PresenceCache};
use crate::transfer::{CancelToken, TransferOutcome, TransferPipeline};
use crate::workcopy::{CommitRequest, TreeFile, WorkingCopy};
use crate::{Error, Oid, Pointer, Result};

/// Repository-level LFS configuration file.
pub const LFSCONFIG: &str = ".lfsconfig";

const PROGRESS_EVERY: usize = 50;

/// Where a repository is in its migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepoState {
    Pending,
    Scanning,
    Transferring,
    Rewriting,
    Committing,
    Committed,
    PartiallyFailed,
    Failed,
    /// Everything up to the commit ran; nothing was written.
    DryRun,
}

impl fmt::Display for RepoState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RepoState::Pending => "pending",
            RepoState::Scanning => "scanning",
            RepoState::Transferring => "transferring",
            RepoState::Rewriting => "rewriting",
            RepoState::Committing => "committing",
            RepoState::Committed => "committed",
            RepoState::PartiallyFailed => "partially_failed",
            RepoState::Failed => "failed",
            RepoState::DryRun => "dry_run",
        };
        f.write_str(name)
    }
}

/// An object that did not reach the destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectFailure {
    pub oid: String,
    pub size: u64,
    pub paths: Vec<String>,
    pub kind: String,
    pub reason: String,
}

/// A pointer-shaped file that could not be used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PointerIssue {
    pub path: String,
    pub kind: String,
    pub reason: String,
}

/// Outcome of migrating one repository.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationRecord {
    pub repository: String,
    pub source_branch: Option<String>,
    pub migration_branch: String,
    pub state: RepoState,
    pub objects_total: usize,
    pub objects_migrated: usize,
    /// Already stored at the destination before this run touched them.
    pub objects_skipped: usize,
    pub objects_failed: usize,
    pub uploads: usize,
    pub failures: Vec<ObjectFailure>,
    /// Paths whose pointers were left as they are because their object failed.
    pub unmigrated_paths: Vec<String>,
    pub pointer_issues: Vec<PointerIssue>,
    /// Branches and tags scanned besides the source branch.
    pub other_refs: Vec<String>,
    pub commit: Option<String>,
    /// Dry runs only: whether a real run would move the migration branch.
    pub would_commit: bool,
    pub error: Option<String>,
    pub error_kind: Option<String>,
    pub dry_run: bool,
    pub cleaned_up: bool,
}

impl MigrationRecord {
    pub fn new(repository: impl Into<String>, config: &MigrationConfig) -> Self {
        MigrationRecord {
            repository: repository.into(),
            source_branch: config.source_branch.clone(),
            migration_branch: config.migration_branch.clone(),
            state: RepoState::Pending,
            objects_total: 0,
            objects_migrated: 0,
            objects_skipped: 0,
            objects_failed: 0,
            uploads: 0,
            failures: Vec::new(),
            unmigrated_paths: Vec::new(),
            pointer_issues: Vec::new(),
            other_refs: Vec::new(),
            commit: None,
            would_commit: false,
            error: None,
            error_kind: None,
            dry_run: config.dry_run,
            cleaned_up: false,
        }
    }

    /// A record for a repository that failed before or during its run.
    pub fn failed(repository: impl Into<String>, config: &MigrationConfig, err: &Error) -> Self {
        let mut record = Self::new(repository, config);
        record.fail(err);
        record
    }

    pub fn fail(&mut self, err: &Error) {
        self.state = RepoState::Failed;
        self.error = Some(err.to_string());
        self.error_kind = Some(err.kind().to_string());
    }
}

/// Source and destination for one repository.
pub struct Endpoints {
    pub source: Box<dyn BatchApi>,
    pub destination: Box<dyn BatchApi>,
}

/// Builds the endpoints a repository migrates between.
pub trait Connector {
    fn connect(&self, config: &MigrationConfig, copy: &dyn WorkingCopy) -> Result<Endpoints>;
}

/// Connects to HTTP batch endpoints, or to the working copy's object cache.
pub struct HttpConnector;

fn http_client(endpoint: Endpoint, config: &MigrationConfig) -> LfsClient {
    LfsClient::for_endpoint(endpoint)
        .with_batch_size(config.batch_size)
        .with_timeout(config.http_timeout)
}

fn source_client(endpoint: Endpoint, config: &MigrationConfig) -> LfsClient {
    let client = http_client(endpoint, config);
    match &config.source_branch {
        Some(branch) => client.with_ref(&format!("refs/heads/{}", branch)),
        None => client,
    }
}

impl Connector for HttpConnector {
    fn connect(&self, config: &MigrationConfig, copy: &dyn WorkingCopy) -> Result<Endpoints> {
        let source: Box<dyn BatchApi> = match &config.source {
            SourceSpec::Endpoint(endpoint) => Box::new(source_client(endpoint.clone(), config)),
            SourceSpec::Remote { credentials } => {
                let remote = copy.remote_url().ok_or_else(|| {
                    Error::RepositoryRead(format!("{} has no origin remote", copy.describe()))
                })?;
                let mut endpoint = Endpoint::new(derive_lfs_url(&remote)?);
                endpoint.credentials = credentials.clone();
                Box::new(source_client(endpoint, config))
            }
            SourceSpec::LocalCache => {
                let git_dir = copy.git_dir().ok_or_else(|| {
                    Error::RepositoryRead(format!("{} has no local object cache", copy.describe()))
                })?;
                Box::new(ObjectCache::for_repo(git_dir))
            }
        };
        // Uploads land on behalf of the migration branch.
        let destination = Box::new(
            http_client(config.destination.clone(), config)
                .with_ref(&format!("refs/heads/{}", config.migration_branch)),
        );
        Ok(Endpoints {
            source,
            destination,
        })
    }
}

/// Every pointer referencing one object.
struct Tracked {
    object: ObjectSpec,
    /// Pointers on the source branch; these get rewritten.
    pointers: Vec<(String, Pointer)>,
    /// `<ref>:<path>` on other branches and tags.
    elsewhere: Vec<String>,
}

impl Tracked {
    fn new(pointer: &Pointer) -> Self {
        Tracked {
            object: ObjectSpec::from(pointer),
            pointers: Vec::new(),
            elsewhere: Vec::new(),
        }
    }
}

/// `ref -> path -> sha256:<hex>`
type FullMap = BTreeMap<String, BTreeMap<String, String>>;

#[derive(Default)]
struct Inventory {
    objects: BTreeMap<Oid, Tracked>,
    issues: Vec<PointerIssue>,
    map: FullMap,
}

impl Inventory {
    fn paths(&self, oid: &Oid) -> Vec<String> {
        self.objects
            .get(oid)
            .map(|t| {
                t.pointers
                    .iter()
                    .map(|(path, _)| path.clone())
                    .chain(t.elsewhere.iter().cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Add every pointer on `name`; `rewrite` marks the source branch.
    fn scan(&mut self, copy: &dyn WorkingCopy, name: &str, rewrite: bool) -> Result<()> {
        for file in copy.pointer_candidates(name)? {
            let label = if rewrite {
                file.path.clone()
            } else {
                format!("{}:{}", name, file.path)
            };
            let pointer = match Pointer::parse(&file.content) {
                Ok(pointer) => pointer,
                Err(e) => {
                    tracing::warn!(path = %label, error = %e, "skipping unusable pointer");
                    self.issues.push(PointerIssue {
                        path: label,
                        kind: e.kind().to_string(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            let oid = format!("sha256:{}", pointer.oid().to_hex());
            let tracked = match self.objects.entry(pointer.oid().clone()) {
                Entry::Occupied(entry) if entry.get().object.size != pointer.size() => {
                    let reason = format!(
                        "size {} disagrees with size {} recorded for the same oid",
                        pointer.size(),
                        entry.get().object.size
                    );
                    tracing::warn!(path = %label, %reason, "skipping conflicting pointer");
                    self.issues.push(PointerIssue {
                        path: label,
                        kind: "malformed_pointer".into(),
                        reason,
                    });
                    continue;
                }
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => entry.insert(Tracked::new(&pointer)),
            };
            if rewrite {
                tracked.pointers.push((file.path.clone(), pointer));
            } else {
                tracked.elsewhere.push(label);
            }
            self.map
                .entry(name.to_string())
                .or_default()
                .insert(file.path, oid);
        }
        Ok(())
    }
}

/// Point `[lfs] url` (and `pushurl`) at the destination.
pub fn rewrite_lfsconfig(existing: Option<&[u8]>, destination: &Endpoint) -> Result<Vec<u8>> {
    let mut ini = match existing {
        Some(bytes) => {
            let text = std::str::from_utf8(bytes)
                .map_err(|_| Error::RepositoryRead(format!("{} is not valid UTF-8", LFSCONFIG)))?;
            Ini::load_from_str(text)
                .map_err(|e| Error::RepositoryRead(format!("{}: {}", LFSCONFIG, e)))?
        }
        None => Ini::new(),
    };

    let read_url = destination.base_url.as_str().trim_end_matches('/').to_string();
    ini.with_section(Some("lfs")).set("url", read_url.as_str());
    match &destination.write_url {
        Some(write) if write != &destination.base_url => {
            ini.with_section(Some("lfs"))
                .set("pushurl", write.as_str().trim_end_matches('/'));
        }
        _ => {
            ini.delete_from(Some("lfs"), "pushurl");
        }
    }

    let mut out = Vec::new();
    ini.write_to(&mut out)?;
    Ok(out)
}

/// Write `{"<owner>/<repo>": [<hex oid>, ...]}` to `oids--<owner>--<repo>.json`.
pub fn write_oid_map(dir: &Path, repo: &RepoRef, oids: &[String]) -> Result<PathBuf> {
    write_keyed(dir, "oids", repo, oids)
}

/// Write `{"<owner>/<repo>": {<ref>: {<path>: "sha256:<hex>"}}}` to
/// `fullmap--<owner>--<repo>.json`.
pub fn write_full_map(
    dir: &Path,
    repo: &RepoRef,
    map: &BTreeMap<String, BTreeMap<String, String>>,
) -> Result<PathBuf> {
    write_keyed(dir, "fullmap", repo, map)
}

fn write_keyed<T: Serialize + ?Sized>(dir: &Path, prefix: &str, repo: &RepoRef, value: &T) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(format!("{}--{}--{}.json", prefix, repo.owner, repo.name));
    let mut keyed = BTreeMap::new();
    keyed.insert(format!("{}/{}", repo.owner, repo.name), value);
    fs::write(&path, serde_json::to_vec_pretty(&keyed)?)?;
    Ok(path)
}

type Outcome = (ObjectSpec, Result<TransferOutcome>);

/// Migrates one repository between two endpoints.
pub struct RepositoryMigrator<'a> {
    config: &'a MigrationConfig,
    source: &'a dyn BatchApi,
    destination: &'a dyn BatchApi,
    presence: Arc<PresenceCache>,
    cancel: CancelToken,
}

impl<'a> RepositoryMigrator<'a> {
    pub fn new(config: &'a MigrationConfig, source: &'a dyn BatchApi, destination: &'a dyn BatchApi) -> Self {
        RepositoryMigrator {
            config,
            source,
            destination,
            presence: Arc::new(PresenceCache::new()),
            cancel: CancelToken::new(),
        }
    }

    /// Share destination presence answers with other migrators.
    pub fn with_presence_cache(mut self, presence: Arc<PresenceCache>) -> Self {
        self.presence = presence;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run the repository to a terminal state.
    ///
    /// Errors are folded into the returned record; this never panics on
    /// endpoint or repository failures.
    pub fn run(&self, repo: &RepoRef, copy: &dyn WorkingCopy) -> MigrationRecord {
        let mut record = MigrationRecord::new(repo.id(), self.config);
        tracing::info!(
            repository = %repo.id(),
            source = %self.source.describe(),
            destination = %self.destination.describe(),
            dry_run = self.config.dry_run,
            "starting migration"
        );

        if let Err(e) = self.execute(repo, copy, &mut record) {
            tracing::error!(repository = %repo.id(), state = %record.state, error = %e, "migration failed");
            record.fail(&e);
        }

        tracing::info!(
            repository = %record.repository,
            state = %record.state,
            total = record.objects_total,
            migrated = record.objects_migrated,
            skipped = record.objects_skipped,
            failed = record.objects_failed,
            commit = record.commit.as_deref().unwrap_or("-"),
            "migration finished"
        );
        record
    }

    fn execute(&self, repo: &RepoRef, copy: &dyn WorkingCopy, record: &mut MigrationRecord) -> Result<()> {
        self.config.validate()?;
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        record.state = RepoState::Scanning;
        let branch = match &self.config.source_branch {
            Some(branch) => branch.clone(),
            None => copy.default_branch()?,
        };
        if branch == self.config.migration_branch {
            return Err(Error::Config(format!(
                "source branch '{}' is the migration branch",
                branch
            )));
        }
        record.source_branch = Some(branch.clone());

        let mut inventory = Inventory::default();
        inventory.scan(copy, &branch, true)?;
        let others = self.other_refs(copy, &branch)?;
        for name in &others {
            inventory.scan(copy, name, false)?;
        }
        record.other_refs = others;
        record.pointer_issues = inventory.issues.clone();
        record.objects_total = inventory.objects.len();
        tracing::info!(
            branch = %branch,
            other_refs = record.other_refs.len(),
            objects = inventory.objects.len(),
            issues = inventory.issues.len(),
            "scanned repository"
        );

        if let Some(dir) = &self.config.oid_map_dir {
            let oids: Vec<String> = inventory.objects.keys().map(Oid::to_hex).collect();
            let path = write_oid_map(dir, repo, &oids)?;
            tracing::info!(path = %path.display(), "wrote oid list");
            if self.config.full_map {
                let path = write_full_map(dir, repo, &inventory.map)?;
                tracing::info!(path = %path.display(), "wrote full oid map");
            }
        }

        if inventory.objects.is_empty() {
            tracing::warn!(branch = %branch, "no LFS pointers found, nothing to migrate");
            record.state = if self.config.dry_run {
                RepoState::DryRun
            } else {
                RepoState::Committed
            };
            return Ok(());
        }

        record.state = RepoState::Transferring;
        let mapper = OidMapper::new(self.destination, self.presence.clone());
        let all: Vec<ObjectSpec> = inventory.objects.values().map(|t| t.object.clone()).collect();
        match mapper.check_presence(&all) {
            Ok(()) => {}
            Err(e) if e.is_repository_fatal() => return Err(e),
            Err(e) => tracing::warn!(error = %e, "destination presence check failed, checking per object"),
        }
        let (present, needed): (Vec<ObjectSpec>, Vec<ObjectSpec>) =
            all.into_iter().partition(|o| mapper.cached(o) == Some(true));
        record.objects_skipped = present.len();
        tracing::info!(
            present = present.len(),
            needed = needed.len(),
            "destination already stores some objects"
        );

        let outcomes = self.transfer_all(&mapper, needed)?;

        let mut fatal: Option<Error> = None;
        let mut failed: HashSet<Oid> = HashSet::new();
        for (object, result) in outcomes {
            match result {
                Ok(TransferOutcome::Uploaded) => {
                    record.objects_migrated += 1;
                    record.uploads += 1;
                }
                Ok(TransferOutcome::DryRun) => record.objects_migrated += 1,
                Ok(TransferOutcome::AlreadyPresent) => record.objects_skipped += 1,
                Err(e) if e.is_repository_fatal() => {
                    // Cancellation is the echo of another fatal error.
                    if fatal.as_ref().map_or(true, |f| matches!(f, Error::Cancelled)) {
                        fatal = Some(e);
                    }
                }
                Err(e) => {
                    tracing::warn!(oid = %object.oid, error = %e, "object not migrated");
                    record.failures.push(ObjectFailure {
                        oid: object.hex(),
                        size: object.size,
                        paths: inventory.paths(&object.oid),
                        kind: e.kind().to_string(),
                        reason: e.to_string(),
                    });
                    failed.insert(object.oid);
                }
            }
        }
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if let Some(e) = fatal {
            return Err(e);
        }
        record.failures.sort_by(|a, b| a.oid.cmp(&b.oid));
        record.objects_failed = record.failures.len();

        if !failed.is_empty() && !self.config.allow_partial {
            record.state = RepoState::Failed;
            record.error = Some(format!(
                "{} of {} objects failed; migration branch left untouched",
                failed.len(),
                record.objects_total
            ));
            record.error_kind = Some("objects_failed".into());
            return Ok(());
        }

        record.state = RepoState::Rewriting;
        let mut files = Vec::new();
        for (oid, tracked) in &inventory.objects {
            if failed.contains(oid) {
                record
                    .unmigrated_paths
                    .extend(tracked.pointers.iter().map(|(path, _)| path.clone()));
                continue;
            }
            let target = mapper.map(&tracked.object);
            if target.oid == tracked.object.oid {
                continue;
            }
            for (path, pointer) in &tracked.pointers {
                files.push(TreeFile::new(path.as_str(), pointer.with_oid(target.oid.clone()).encode_bytes()));
            }
        }
        record.unmigrated_paths.sort();
        let lfsconfig = copy.read_file(&branch, LFSCONFIG)?;
        files.push(TreeFile::new(
            LFSCONFIG,
            rewrite_lfsconfig(lfsconfig.as_deref(), &self.config.destination)?,
        ));

        if self.config.dry_run {
            record.would_commit = self.would_change(copy, &branch, &files)?;
            tracing::info!(
                branch = %self.config.migration_branch,
                files = files.len(),
                would_commit = record.would_commit,
                "dry run, not committing"
            );
            if self.config.push {
                tracing::info!(branch = %self.config.migration_branch, "would push migration branch");
            }
            record.state = RepoState::DryRun;
            return Ok(());
        }

        record.state = RepoState::Committing;
        let message = self.commit_message(record);
        let request = CommitRequest {
            base: &branch,
            branch: &self.config.migration_branch,
            files: &files,
            message: &message,
        };
        record.commit = copy.commit_files(&request)?;
        if self.config.push && copy.branch_exists(&self.config.migration_branch)? {
            copy.push(&self.config.migration_branch, self.config.git_token.as_deref())?;
        }

        record.state = if failed.is_empty() {
            RepoState::Committed
        } else {
            RepoState::PartiallyFailed
        };
        Ok(())
    }

    /// Branches matching the configured pattern, then tags.
    fn other_refs(&self, copy: &dyn WorkingCopy, source: &str) -> Result<Vec<String>> {
        let mut refs = Vec::new();
        if let Some(pattern) = self.config.branch_regex()? {
            refs.extend(copy.branches()?.into_iter().filter(|name| {
                name != source && name != &self.config.migration_branch && pattern.is_match(name)
            }));
        }
        if self.config.copy_tags {
            refs.extend(copy.tags()?);
        }
        Ok(refs)
    }

    /// Whether committing `files` would change the migration branch.
    fn would_change(&self, copy: &dyn WorkingCopy, base: &str, files: &[TreeFile]) -> Result<bool> {
        let tip = if copy.branch_exists(&self.config.migration_branch)? {
            self.config.migration_branch.as_str()
        } else {
            base
        };
        for file in files {
            if copy.read_file(tip, &file.path)?.as_deref() != Some(file.content.as_slice()) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Move every needed object through the worker pool.
    ///
    /// Returns once every object has an outcome.
    fn transfer_all(&self, mapper: &OidMapper<'_>, needed: Vec<ObjectSpec>) -> Result<Vec<Outcome>> {
        let mut outcomes: Vec<Outcome> = Vec::with_capacity(needed.len());
        if needed.is_empty() {
            return Ok(outcomes);
        }

        let mut prefetched: HashMap<String, TransferAction> =
            match self.source.request_actions(Operation::Download, &needed) {
                Ok(actions) => actions,
                Err(e) if e.is_repository_fatal() => return Err(e),
                Err(e) => {
                    tracing::warn!(error = %e, "bulk download request failed, requesting per object");
                    HashMap::new()
                }
            };

        let mut jobs = Vec::with_capacity(needed.len());
        for object in needed {
            match prefetched.remove(&object.hex()) {
                Some(action) if action.is_not_found() => {
                    let err = Error::ObjectNotFound(object.hex());
                    outcomes.push((object, Err(err)));
                }
                action => jobs.push((object, action)),
            }
        }
        if jobs.is_empty() {
            return Ok(outcomes);
        }

        let abort = self.cancel.child();
        let pipeline = TransferPipeline::new(self.source, self.destination, mapper, self.config.retry)
            .dry_run(self.config.dry_run)
            .with_cancel(abort.clone());

        let total = jobs.len();
        let workers = self.config.concurrency.min(total).max(1);
        let (job_tx, job_rx) = crossbeam_channel::unbounded();
        let (result_tx, result_rx) = crossbeam_channel::unbounded::<Outcome>();
        for job in jobs {
            // Receiver is alive; an unbounded send cannot fail here.
            let _ = job_tx.send(job);
        }
        drop(job_tx);

        let done = AtomicUsize::new(0);
        thread::scope(|s| {
            for _ in 0..workers {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                let (pipeline, abort, done) = (&pipeline, &abort, &done);
                s.spawn(move || {
                    for (object, prefetched) in job_rx.iter() {
                        let result = pipeline.transfer(&object, prefetched).map(|t| t.outcome);
                        if matches!(result, Err(Error::Auth { .. })) {
                            abort.cancel();
                        }
                        let finished = done.fetch_add(1, Ordering::Relaxed) + 1;
                        if finished % PROGRESS_EVERY == 0 || finished == total {
                            tracing::info!(finished, total, "transfer progress");
                        }
                        if result_tx.send((object, result)).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        drop(result_tx);

        outcomes.extend(result_rx.iter());
        Ok(outcomes)
    }

    fn commit_message(&self, record: &MigrationRecord) -> String {
        let mut message = format!(
            "Migrate LFS objects to {}\n\nObjects: {}\nMigrated: {}\nAlready present: {}\nFailed: {}\n",
            self.config.destination.base_url,
            record.objects_total,
            record.objects_migrated,
            record.objects_skipped,
            record.failures.len()
        );
        if !record.failures.is_empty() {
            message.push_str("\nNot migrated:\n");
            for failure in &record.failures {
                message.push_str(&format!("  {} {} ({})\n", failure.oid, failure.paths.join(", "), failure.kind));
            }
        }
        message
    }
}
