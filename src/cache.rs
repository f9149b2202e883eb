//! Local object cache as a migration source.
//!
//! Reads LFS objects from `.git/lfs/objects/` when a working copy already
//! holds the content and the old service is gone or slow.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use url::Url;

use crate::batch::{ObjectSpec, Operation, SignedAction, TransferAction};
use crate::client::{check_request, BatchApi};
use crate::{Error, Oid, Result};

/// Local cache for LFS objects.
///
/// Objects are stored in the git-lfs standard layout:
/// `.git/lfs/objects/<oid[0:2]>/<oid[2:4]>/<oid>`
pub struct ObjectCache {
    base_path: PathBuf,
}

impl ObjectCache {
    /// Create a new object cache at the given base path.
    ///
    /// Typically this is `.git/lfs/objects` within a repository.
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        ObjectCache {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    /// Create a cache for a repository's `.git/lfs/objects` directory.
    pub fn for_repo<P: AsRef<Path>>(git_dir: P) -> Self {
        let base_path = git_dir.as_ref().join("lfs").join("objects");
        ObjectCache { base_path }
    }

    /// Get the path where an object with the given OID would be stored.
    pub fn object_path(&self, oid: &Oid) -> PathBuf {
        let hex = oid.to_hex();
        self.base_path.join(&hex[0..2]).join(&hex[2..4]).join(&hex)
    }

    /// Check if an object exists and has the correct size.
    pub fn contains_valid(&self, object: &ObjectSpec) -> bool {
        match fs::metadata(self.object_path(&object.oid)) {
            Ok(meta) => meta.is_file() && meta.len() == object.size,
            Err(_) => false,
        }
    }
}

impl BatchApi for ObjectCache {
    fn describe(&self) -> String {
        format!("local cache {}", self.base_path.display())
    }

    fn request_actions(
        &self,
        operation: Operation,
        objects: &[ObjectSpec],
    ) -> Result<HashMap<String, TransferAction>> {
        check_request(objects)?;
        if operation == Operation::Upload {
            return Err(Error::InvalidRequest(
                "the local object cache is a read-only source".into(),
            ));
        }

        let mut actions = HashMap::with_capacity(objects.len());
        for object in objects {
            let oid = object.hex();
            let action = if self.contains_valid(object) {
                let path = self.object_path(&object.oid);
                let href = Url::from_file_path(&path)
                    .map_err(|_| Error::InvalidUrl(path.display().to_string()))?;
                TransferAction::Ready {
                    oid: oid.clone(),
                    size: object.size,
                    operation,
                    action: SignedAction::new(href.to_string()),
                    verify: None,
                }
            } else {
                TransferAction::Rejected {
                    oid: oid.clone(),
                    code: 404,
                    message: "not in local object cache".into(),
                }
            };
            actions.insert(oid, action);
        }
        Ok(actions)
    }

    fn download(&self, action: &SignedAction) -> Result<Box<dyn Read + Send>> {
        let path = Url::parse(&action.href)?
            .to_file_path()
            .map_err(|_| Error::InvalidUrl(action.href.clone()))?;
        match File::open(&path) {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(Error::ObjectNotFound(path.display().to_string()))
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn upload(&self, _action: &SignedAction, _body: &mut dyn Read, _size: u64) -> Result<()> {
        Err(Error::InvalidRequest(
            "the local object cache is a read-only source".into(),
        ))
    }

    fn verify(&self, _action: &SignedAction, _object: &ObjectSpec) -> Result<()> {
        Ok(())
    }
}
