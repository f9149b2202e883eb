//! In-memory endpoints and working copies for unit tests.

use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::io::{Cursor, Read};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use crate::batch::{ObjectSpec, Operation, SignedAction, TransferAction};
use crate::client::{check_request, BatchApi};
use crate::workcopy::{CommitRequest, TreeFile, WorkingCopy};
use crate::{Error, Oid, Pointer, Result};

pub(crate) fn spec(content: &[u8]) -> ObjectSpec {
    ObjectSpec::new(Oid::from_content(content), content.len() as u64)
}

/// A batch endpoint holding objects in a map.
///
/// Hrefs look like `mem://<name>/<oid>`.
pub(crate) struct MemoryEndpoint {
    name: String,
    objects: Mutex<HashMap<Oid, Vec<u8>>>,
    latency: Duration,
    deny: AtomicBool,
    failing_downloads: Mutex<HashMap<Oid, usize>>,
    batch_calls: AtomicUsize,
    downloads: AtomicUsize,
    uploads: AtomicUsize,
    verifications: AtomicUsize,
}

impl MemoryEndpoint {
    pub fn new(name: &str) -> Self {
        MemoryEndpoint {
            name: name.to_string(),
            objects: Mutex::new(HashMap::new()),
            latency: Duration::ZERO,
            deny: AtomicBool::new(false),
            failing_downloads: Mutex::new(HashMap::new()),
            batch_calls: AtomicUsize::new(0),
            downloads: AtomicUsize::new(0),
            uploads: AtomicUsize::new(0),
            verifications: AtomicUsize::new(0),
        }
    }

    /// Sleep this long inside every batch request.
    pub fn with_latency_ms(mut self, ms: u64) -> Self {
        self.latency = Duration::from_millis(ms);
        self
    }

    pub fn insert(&self, content: &[u8]) -> ObjectSpec {
        let object = spec(content);
        self.objects.lock().insert(object.oid.clone(), content.to_vec());
        object
    }

    /// Store `content` under an oid it does not hash to.
    pub fn insert_raw(&self, object: &ObjectSpec, content: &[u8]) {
        self.objects.lock().insert(object.oid.clone(), content.to_vec());
    }

    pub fn remove(&self, object: &ObjectSpec) {
        self.objects.lock().remove(&object.oid);
    }

    pub fn get(&self, object: &ObjectSpec) -> Option<Vec<u8>> {
        self.objects.lock().get(&object.oid).cloned()
    }

    /// Answer every batch request with an authentication failure.
    pub fn deny_all(&self) {
        self.deny.store(true, Ordering::SeqCst);
    }

    /// Fail the next `times` downloads of `object` with a transport error.
    pub fn fail_downloads(&self, object: &ObjectSpec, times: usize) {
        self.failing_downloads.lock().insert(object.oid.clone(), times);
    }

    /// A download action for `object` that expired an hour ago.
    pub fn expired_action(&self, object: &ObjectSpec) -> TransferAction {
        let mut action = SignedAction::new(self.href(&object.oid));
        action.expires_at = Some(Utc::now() - ChronoDuration::hours(1));
        TransferAction::Ready {
            oid: object.hex(),
            size: object.size,
            operation: Operation::Download,
            action,
            verify: None,
        }
    }

    pub fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }

    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    pub fn uploads(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    pub fn verifications(&self) -> usize {
        self.verifications.load(Ordering::SeqCst)
    }

    fn href(&self, oid: &Oid) -> String {
        format!("mem://{}/{}", self.name, oid)
    }

    fn oid_of(&self, action: &SignedAction) -> Result<Oid> {
        let hex = action
            .href
            .rsplit('/')
            .next()
            .ok_or_else(|| Error::InvalidUrl(action.href.clone()))?;
        Oid::from_hex(hex)
    }
}

impl BatchApi for MemoryEndpoint {
    fn describe(&self) -> String {
        format!("mem://{}", self.name)
    }

    fn request_actions(
        &self,
        operation: Operation,
        objects: &[ObjectSpec],
    ) -> Result<HashMap<String, TransferAction>> {
        check_request(objects)?;
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
        if self.deny.load(Ordering::SeqCst) {
            return Err(Error::Auth {
                endpoint: self.describe(),
            });
        }

        let stored = self.objects.lock();
        let mut actions = HashMap::new();
        for object in objects {
            let oid = object.hex();
            let present = stored.contains_key(&object.oid);
            let action = match (operation, present) {
                (Operation::Download, true) => TransferAction::Ready {
                    oid: oid.clone(),
                    size: object.size,
                    operation,
                    action: SignedAction::new(self.href(&object.oid)),
                    verify: None,
                },
                (Operation::Download, false) => TransferAction::Rejected {
                    oid: oid.clone(),
                    code: 404,
                    message: "Object does not exist".into(),
                },
                (Operation::Upload, true) => TransferAction::Present {
                    oid: oid.clone(),
                    size: object.size,
                },
                (Operation::Upload, false) => TransferAction::Ready {
                    oid: oid.clone(),
                    size: object.size,
                    operation,
                    action: SignedAction::new(self.href(&object.oid)),
                    verify: Some(SignedAction::new(format!("{}/verify", self.describe()))),
                },
            };
            actions.insert(oid, action);
        }
        Ok(actions)
    }

    fn download(&self, action: &SignedAction) -> Result<Box<dyn Read + Send>> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        let oid = self.oid_of(action)?;
        if let Some(remaining) = self.failing_downloads.lock().get_mut(&oid) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::Http("connection reset by peer".into()));
            }
        }
        match self.objects.lock().get(&oid) {
            Some(content) => Ok(Box::new(Cursor::new(content.clone()))),
            None => Err(Error::ObjectNotFound(oid.to_hex())),
        }
    }

    fn upload(&self, action: &SignedAction, body: &mut dyn Read, size: u64) -> Result<()> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        let oid = self.oid_of(action)?;
        let mut content = Vec::new();
        body.read_to_end(&mut content)?;
        if content.len() as u64 != size {
            return Err(Error::Server {
                code: 422,
                message: format!("expected {} bytes, got {}", size, content.len()),
            });
        }
        self.objects.lock().insert(oid, content);
        Ok(())
    }

    fn verify(&self, _action: &SignedAction, object: &ObjectSpec) -> Result<()> {
        self.verifications.fetch_add(1, Ordering::SeqCst);
        match self.objects.lock().get(&object.oid) {
            Some(content) if content.len() as u64 == object.size => Ok(()),
            _ => Err(Error::Server {
                code: 422,
                message: "verification failed".into(),
            }),
        }
    }
}

type Tree = BTreeMap<String, Vec<u8>>;

/// A working copy whose branches are path-to-content maps.
pub(crate) struct MemoryWorkingCopy {
    default_branch: String,
    branches: Mutex<HashMap<String, Tree>>,
    messages: Mutex<Vec<String>>,
    pushes: Mutex<Vec<String>>,
}

impl MemoryWorkingCopy {
    pub fn new(default_branch: &str) -> Self {
        let mut branches = HashMap::new();
        branches.insert(default_branch.to_string(), Tree::new());
        MemoryWorkingCopy {
            default_branch: default_branch.to_string(),
            branches: Mutex::new(branches),
            messages: Mutex::new(Vec::new()),
            pushes: Mutex::new(Vec::new()),
        }
    }

    /// Add a file to the default branch.
    pub fn with_file(self, path: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        if let Some(tree) = self.branches.lock().get_mut(&self.default_branch) {
            tree.insert(path.into(), content.into());
        }
        self
    }

    /// Add a file to another branch or tag, creating it if needed.
    pub fn with_ref_file(
        self,
        name: &str,
        path: impl Into<String>,
        content: impl Into<Vec<u8>>,
    ) -> Self {
        self.branches
            .lock()
            .entry(name.to_string())
            .or_default()
            .insert(path.into(), content.into());
        self
    }

    pub fn file(&self, branch: &str, path: &str) -> Option<Vec<u8>> {
        self.branches.lock().get(branch)?.get(path).cloned()
    }

    pub fn commits(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn last_message(&self) -> Option<String> {
        self.messages.lock().last().cloned()
    }

    pub fn pushes(&self) -> Vec<String> {
        self.pushes.lock().clone()
    }

    fn tree(&self, branch: &str) -> Result<Tree> {
        self.branches
            .lock()
            .get(branch)
            .cloned()
            .ok_or_else(|| Error::RepositoryRead(format!("branch '{}' not found", branch)))
    }
}

impl WorkingCopy for MemoryWorkingCopy {
    fn describe(&self) -> String {
        "memory".into()
    }

    fn default_branch(&self) -> Result<String> {
        Ok(self.default_branch.clone())
    }

    fn branch_exists(&self, branch: &str) -> Result<bool> {
        Ok(self.branches.lock().contains_key(branch))
    }

    fn branches(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .branches
            .lock()
            .keys()
            .filter(|name| !name.starts_with("refs/"))
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }

    fn tags(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .branches
            .lock()
            .keys()
            .filter(|name| name.starts_with("refs/tags/"))
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }

    fn pointer_candidates(&self, branch: &str) -> Result<Vec<TreeFile>> {
        Ok(self
            .tree(branch)?
            .into_iter()
            .filter(|(_, content)| Pointer::looks_like_pointer(content))
            .map(|(path, content)| TreeFile::new(path, content))
            .collect())
    }

    fn read_file(&self, branch: &str, path: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.tree(branch)?.get(path).cloned())
    }

    fn commit_files(&self, request: &CommitRequest<'_>) -> Result<Option<String>> {
        let parent = match self.tree(request.branch) {
            Ok(tree) => tree,
            Err(_) => self.tree(request.base)?,
        };
        let mut next = parent.clone();
        for file in request.files {
            next.insert(file.path.clone(), file.content.clone());
        }
        if next == parent {
            return Ok(None);
        }
        self.branches.lock().insert(request.branch.to_string(), next);
        let mut messages = self.messages.lock();
        messages.push(request.message.to_string());
        Ok(Some(format!("memory-commit-{}", messages.len())))
    }

    fn push(&self, branch: &str, _token: Option<&str>) -> Result<()> {
        self.pushes.lock().push(branch.to_string());
        Ok(())
    }

    fn remote_url(&self) -> Option<String> {
        None
    }

    fn git_dir(&self) -> Option<PathBuf> {
        None
    }
}
