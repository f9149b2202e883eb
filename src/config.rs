//! Immutable run configuration.
//!
//! Every component receives the pieces it needs at construction; nothing in
//! the engine reads the process environment.

use regex::Regex;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

use crate::{Error, Result};

/// Default migration branch name.
pub const DEFAULT_MIGRATION_BRANCH: &str = "lfs-migration";

/// Default maximum number of objects per batch request.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Release branches whose objects are copied along with the source branch.
pub const DEFAULT_BRANCH_PATTERN: &str = r"V\d\d.*";

/// Credentials attached to batch requests.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Bearer token (OAuth/PAT)
    Bearer(String),
    /// Basic auth (username, password)
    Basic(String, String),
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Bearer(_) => f.write_str("Bearer(***)"),
            Credentials::Basic(user, _) => write!(f, "Basic({}, ***)", user),
        }
    }
}

/// A logical LFS storage service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Read URL; batch requests go to `<base_url>objects/batch`.
    pub base_url: Url,
    /// Separate URL for upload batches, if the service splits them.
    pub write_url: Option<Url>,
    pub credentials: Option<Credentials>,
}

impl Endpoint {
    pub fn new(base_url: Url) -> Self {
        Endpoint {
            base_url: with_trailing_slash(base_url),
            write_url: None,
            credentials: None,
        }
    }

    pub fn parse(base_url: &str) -> Result<Self> {
        let url = Url::parse(base_url).map_err(|e| Error::InvalidUrl(format!("{}: {}", base_url, e)))?;
        Ok(Endpoint::new(url))
    }

    pub fn with_write_url(mut self, write_url: Url) -> Self {
        self.write_url = Some(with_trailing_slash(write_url));
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Scope a service-wide endpoint to one repository: `<base>/<owner>/<repo>/`.
    pub fn for_repository(&self, owner: &str, repository: &str) -> Result<Self> {
        let scope = |url: &Url| -> Result<Url> {
            Ok(with_trailing_slash(url.join(&format!("{}/{}", owner, repository))?))
        };
        Ok(Endpoint {
            base_url: scope(&self.base_url)?,
            write_url: self.write_url.as_ref().map(scope).transpose()?,
            credentials: self.credentials.clone(),
        })
    }

    /// URL used for upload batches.
    pub fn upload_url(&self) -> &Url {
        self.write_url.as_ref().unwrap_or(&self.base_url)
    }
}

fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, where `attempt` starts at 1.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << exponent);
        delay.min(self.max_delay)
    }

    /// No waiting between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Where source objects are read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSpec {
    /// An LFS service, scoped per repository.
    Endpoint(Endpoint),
    /// The LFS endpoint implied by the repository's `origin` remote.
    Remote { credentials: Option<Credentials> },
    /// The working copy's `.git/lfs/objects` cache.
    LocalCache,
}

/// Configuration for migrating one repository.
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    pub source: SourceSpec,
    pub destination: Endpoint,
    /// `None` means the repository's default branch.
    pub source_branch: Option<String>,
    pub migration_branch: String,
    pub dry_run: bool,
    /// Commit the successful subset when some objects fail.
    pub allow_partial: bool,
    pub push: bool,
    /// Token used for pushing the migration branch.
    pub git_token: Option<String>,
    /// Parallel object transfers within a repository.
    pub concurrency: usize,
    pub batch_size: usize,
    pub retry: RetryPolicy,
    pub http_timeout: Duration,
    /// Write `oids--<owner>--<repo>.json` here when set.
    pub oid_map_dir: Option<PathBuf>,
    /// Also write `fullmap--<owner>--<repo>.json` into `oid_map_dir`.
    pub full_map: bool,
    /// Other branches whose objects are transferred, matched from the start
    /// of the branch name. Their pointers are not rewritten.
    pub branch_pattern: Option<String>,
    /// Transfer the objects every tag references.
    pub copy_tags: bool,
}

impl MigrationConfig {
    pub fn new(source: SourceSpec, destination: Endpoint) -> Self {
        MigrationConfig {
            source,
            destination,
            source_branch: None,
            migration_branch: DEFAULT_MIGRATION_BRANCH.to_string(),
            dry_run: false,
            allow_partial: false,
            push: false,
            git_token: None,
            concurrency: 4,
            batch_size: DEFAULT_BATCH_SIZE,
            retry: RetryPolicy::default(),
            http_timeout: Duration::from_secs(300),
            oid_map_dir: None,
            full_map: false,
            branch_pattern: None,
            copy_tags: false,
        }
    }

    /// `branch_pattern` compiled and anchored at the start of the name.
    pub fn branch_regex(&self) -> Result<Option<Regex>> {
        self.branch_pattern
            .as_deref()
            .map(|pattern| {
                Regex::new(&format!("^(?:{})", pattern))
                    .map_err(|e| Error::Config(format!("invalid branch pattern: {}", e)))
            })
            .transpose()
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.migration_branch.trim().is_empty() {
            return Err(Error::Config("migration branch must not be empty".into()));
        }
        if self.source_branch.as_deref() == Some(self.migration_branch.as_str()) {
            return Err(Error::Config(format!(
                "migration branch '{}' must differ from the source branch",
                self.migration_branch
            )));
        }
        if self.concurrency == 0 {
            return Err(Error::Config("concurrency must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch size must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("max attempts must be at least 1".into()));
        }
        if self.full_map && self.oid_map_dir.is_none() {
            return Err(Error::Config("a full map needs an oid map directory".into()));
        }
        self.branch_regex()?;
        Ok(())
    }

    /// Scope service-wide endpoints to one repository.
    pub fn for_repository(&self, owner: &str, repository: &str) -> Result<Self> {
        let mut scoped = self.clone();
        scoped.destination = self.destination.for_repository(owner, repository)?;
        if let SourceSpec::Endpoint(source) = &self.source {
            scoped.source = SourceSpec::Endpoint(source.for_repository(owner, repository)?);
        }
        Ok(scoped)
    }
}

/// Configuration for the multi-repository loop.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    /// Service-wide settings; endpoints are scoped per repository.
    pub migration: MigrationConfig,
    /// Remove working copies of committed repositories.
    pub cleanup: bool,
    /// Reuse destination presence results across repositories.
    pub share_presence_cache: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_for_repository() {
        let endpoint = Endpoint::parse("https://git-lfs.lsst.cloud")
            .unwrap()
            .with_write_url(Url::parse("https://git-lfs-rw.lsst.cloud").unwrap());
        let scoped = endpoint.for_repository("lsst", "testdata_ci").unwrap();
        assert_eq!(scoped.base_url.as_str(), "https://git-lfs.lsst.cloud/lsst/testdata_ci/");
        assert_eq!(
            scoped.upload_url().as_str(),
            "https://git-lfs-rw.lsst.cloud/lsst/testdata_ci/"
        );
    }

    #[test]
    fn test_endpoint_keeps_base_path() {
        let endpoint = Endpoint::parse("https://example.com/lfs").unwrap();
        let scoped = endpoint.for_repository("o", "r").unwrap();
        assert_eq!(scoped.base_url.as_str(), "https://example.com/lfs/o/r/");
        assert_eq!(scoped.upload_url(), &scoped.base_url);
    }

    #[test]
    fn test_backoff_is_bounded() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        };
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(400));
        assert_eq!(policy.delay_after(9), Duration::from_secs(1));
        assert_eq!(policy.delay_after(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_validate() {
        let destination = Endpoint::parse("https://dest.example.com").unwrap();
        let mut config = MigrationConfig::new(SourceSpec::LocalCache, destination);
        assert!(config.validate().is_ok());

        config.source_branch = Some(DEFAULT_MIGRATION_BRANCH.to_string());
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        config.source_branch = None;
        config.concurrency = 0;
        assert!(config.validate().is_err());

        config.concurrency = 1;
        config.full_map = true;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
        config.oid_map_dir = Some(PathBuf::from("maps"));
        assert!(config.validate().is_ok());

        config.branch_pattern = Some("V(".into());
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_branch_pattern_is_anchored() {
        let destination = Endpoint::parse("https://dest.example.com").unwrap();
        let mut config = MigrationConfig::new(SourceSpec::LocalCache, destination);
        assert!(config.branch_regex().unwrap().is_none());

        config.branch_pattern = Some(DEFAULT_BRANCH_PATTERN.into());
        let re = config.branch_regex().unwrap().unwrap();
        assert!(re.is_match("V21.0.0"));
        assert!(re.is_match("V10"));
        assert!(!re.is_match("tickets/V21"));
        assert!(!re.is_match("V2"));
        assert!(!re.is_match("main"));
    }

    #[test]
    fn test_credentials_debug_hides_secrets() {
        let debug = format!("{:?}", Credentials::Basic("me".into(), "hunter2".into()));
        assert!(!debug.contains("hunter2"));
    }
}
