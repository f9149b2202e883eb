//! Sequential migration of many repositories.
//!
//! One repository's failure never stops the loop; each ends up as exactly one
//! record in the [`FleetReport`].

use serde::Serialize;
use std::sync::Arc;
use url::Url;

use crate::config::FleetConfig;
use crate::mapper::PresenceCache;
use crate::migrator::{Connector, MigrationRecord, RepoState, RepositoryMigrator};
use crate::transfer::CancelToken;
use crate::workcopy::WorkingCopyProvider;
use crate::{Error, Result};

/// A repository named in the input list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoRef {
    pub host: String,
    pub owner: String,
    pub name: String,
}

impl RepoRef {
    pub fn new(host: impl Into<String>, owner: impl Into<String>, name: impl Into<String>) -> Self {
        RepoRef {
            host: host.into(),
            owner: owner.into(),
            name: name.into(),
        }
    }

    /// Parse `host/owner/repo` or an `https://` URL; a `.git` suffix is dropped.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim().trim_end_matches('/');
        let input = input.strip_suffix(".git").unwrap_or(input);
        let url = if input.contains("://") {
            Url::parse(input)?
        } else {
            Url::parse(&format!("https://{}", input))?
        };
        if url.scheme() != "https" {
            return Err(Error::InvalidUrl(format!(
                "{}: only https repositories are supported",
                input
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| Error::InvalidUrl(format!("{}: missing host", input)))?;
        let parts: Vec<&str> = url
            .path_segments()
            .map(|segments| segments.filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();
        match parts.as_slice() {
            [.., owner, name] => Ok(RepoRef::new(host, *owner, *name)),
            _ => Err(Error::InvalidUrl(format!(
                "{}: expected <host>/<owner>/<repo>",
                input
            ))),
        }
    }

    pub fn clone_url(&self) -> String {
        format!("https://{}/{}/{}", self.host, self.owner, self.name)
    }

    /// `host/owner/name`, or `owner/name` when the host is unknown.
    pub fn id(&self) -> String {
        if self.host.is_empty() {
            format!("{}/{}", self.owner, self.name)
        } else {
            format!("{}/{}/{}", self.host, self.owner, self.name)
        }
    }
}

/// One non-blank line of a repository list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepoEntry {
    Repo(RepoRef),
    Invalid { line: String, reason: String },
}

/// Parse a repository list: one repository per line, `#` starts a comment.
pub fn parse_repo_list(text: &str) -> Vec<RepoEntry> {
    text.lines()
        .map(|line| line.split('#').next().unwrap_or("").trim())
        .filter(|line| !line.is_empty())
        .map(|line| match RepoRef::parse(line) {
            Ok(repo) => RepoEntry::Repo(repo),
            Err(e) => RepoEntry::Invalid {
                line: line.to_string(),
                reason: e.to_string(),
            },
        })
        .collect()
}

/// Per-repository records plus totals.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FleetReport {
    pub committed: usize,
    pub partially_failed: usize,
    pub failed: usize,
    pub dry_run: usize,
    pub records: Vec<MigrationRecord>,
}

impl FleetReport {
    pub fn push(&mut self, record: MigrationRecord) {
        match record.state {
            RepoState::Committed => self.committed += 1,
            RepoState::PartiallyFailed => self.partially_failed += 1,
            RepoState::DryRun => self.dry_run += 1,
            _ => self.failed += 1,
        }
        self.records.push(record);
    }

    /// 0 when everything committed (or rehearsed without failures), 2 when
    /// any repository hit a configuration or authentication error, else 1.
    pub fn exit_code(&self) -> i32 {
        let setup_error = self.records.iter().any(|r| {
            matches!(r.error_kind.as_deref(), Some("auth_error") | Some("config"))
        });
        let clean = |r: &MigrationRecord| match r.state {
            RepoState::Committed => true,
            RepoState::DryRun => r.objects_failed == 0,
            _ => false,
        };
        if setup_error {
            2
        } else if self.records.iter().all(clean) {
            0
        } else {
            1
        }
    }
}

/// Drives repositories one at a time through [`RepositoryMigrator`].
pub struct FleetOrchestrator<'a> {
    config: &'a FleetConfig,
    provider: &'a dyn WorkingCopyProvider,
    connector: &'a dyn Connector,
    cancel: CancelToken,
}

impl<'a> FleetOrchestrator<'a> {
    pub fn new(
        config: &'a FleetConfig,
        provider: &'a dyn WorkingCopyProvider,
        connector: &'a dyn Connector,
    ) -> Self {
        FleetOrchestrator {
            config,
            provider,
            connector,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn run(&self, entries: &[RepoEntry]) -> FleetReport {
        let shared = self
            .config
            .share_presence_cache
            .then(|| Arc::new(PresenceCache::new()));
        let mut report = FleetReport::default();

        for (index, entry) in entries.iter().enumerate() {
            let record = match entry {
                RepoEntry::Invalid { line, reason } => {
                    tracing::error!(line = %line, %reason, "skipping invalid repository entry");
                    let err = Error::InvalidUrl(reason.clone());
                    MigrationRecord::failed(line.as_str(), &self.config.migration, &err)
                }
                RepoEntry::Repo(repo) if self.cancel.is_cancelled() => {
                    MigrationRecord::failed(repo.id(), &self.config.migration, &Error::Cancelled)
                }
                RepoEntry::Repo(repo) => {
                    tracing::info!(
                        repository = %repo.id(),
                        position = index + 1,
                        total = entries.len(),
                        "processing repository"
                    );
                    self.migrate(repo, shared.clone())
                }
            };
            report.push(record);
            if let Some(cache) = &shared {
                cache.forget_absent();
            }
        }

        tracing::info!(
            committed = report.committed,
            partially_failed = report.partially_failed,
            failed = report.failed,
            dry_run = report.dry_run,
            "fleet run finished"
        );
        report
    }

    fn migrate(&self, repo: &RepoRef, shared: Option<Arc<PresenceCache>>) -> MigrationRecord {
        let base = &self.config.migration;
        let config = match base.for_repository(&repo.owner, &repo.name) {
            Ok(config) => config,
            Err(e) => return MigrationRecord::failed(repo.id(), base, &e),
        };
        let copy = match self.provider.materialize(repo) {
            Ok(copy) => copy,
            Err(e) => {
                tracing::error!(repository = %repo.id(), error = %e, "cannot prepare working copy");
                return MigrationRecord::failed(repo.id(), &config, &e);
            }
        };
        let endpoints = match self.connector.connect(&config, copy.as_ref()) {
            Ok(endpoints) => endpoints,
            Err(e) => return MigrationRecord::failed(repo.id(), &config, &e),
        };

        let mut migrator = RepositoryMigrator::new(
            &config,
            endpoints.source.as_ref(),
            endpoints.destination.as_ref(),
        )
        .with_cancel(self.cancel.clone());
        if let Some(cache) = shared {
            migrator = migrator.with_presence_cache(cache);
        }
        let mut record = migrator.run(repo, copy.as_ref());

        let finished = matches!(record.state, RepoState::Committed | RepoState::DryRun);
        if self.config.cleanup && finished {
            match self.provider.cleanup(repo) {
                Ok(()) => record.cleaned_up = !config.dry_run,
                Err(e) => tracing::warn!(repository = %repo.id(), error = %e, "cleanup failed"),
            }
        }
        record
    }
}
