//! # lfs-migrate
//!
//! Move Git LFS objects from one storage service to another and record the
//! move on a migration branch of each repository.
//!
//! This crate provides:
//! - LFS pointer parsing and encoding
//! - A Batch API client for the old and new services
//! - A verified, retrying transfer pipeline with a bounded worker pool
//! - A per-repository state machine that commits once all transfers settle
//! - A fleet loop that isolates failures between repositories
//!
//! ## Example
//!
//! ```no_run
//! use lfs_migrate::{
//!     Endpoint, GitWorkingCopy, HttpConnector, Connector, MigrationConfig,
//!     RepoRef, RepositoryMigrator, SourceSpec,
//! };
//!
//! let source = Endpoint::parse("https://git-lfs.example.org").unwrap();
//! let destination = Endpoint::parse("https://git-lfs.example.net").unwrap();
//! let repo = RepoRef::new("github.com", "owner", "repo");
//! let config = MigrationConfig::new(SourceSpec::Endpoint(source), destination)
//!     .for_repository(&repo.owner, &repo.name)
//!     .unwrap();
//!
//! let copy = GitWorkingCopy::open("/path/to/repo").unwrap();
//! let endpoints = HttpConnector.connect(&config, &copy).unwrap();
//! let record = RepositoryMigrator::new(
//!     &config,
//!     endpoints.source.as_ref(),
//!     endpoints.destination.as_ref(),
//! )
//! .run(&repo, &copy);
//! println!("{}: {}", record.repository, record.state);
//! ```

mod error;
mod oid;
mod pointer;
mod batch;
mod client;
mod cache;
mod config;
mod mapper;
mod transfer;
mod workcopy;
mod migrator;
mod fleet;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{Error, Result};
pub use oid::{Oid, OidHasher};
pub use pointer::{Pointer, HAWSER_SPEC_V1, LFS_SPEC_V1, MAX_POINTER_SIZE};
pub use batch::{
    Action, BatchError, BatchObject, BatchRequest, BatchRequestObject, BatchResponse, ObjectSpec,
    Operation, SignedAction, TransferAction,
};
pub use client::{derive_lfs_url, BatchApi, LfsClient};
pub use cache::ObjectCache;
pub use config::{
    Credentials, Endpoint, FleetConfig, MigrationConfig, RetryPolicy, SourceSpec,
    DEFAULT_BATCH_SIZE, DEFAULT_BRANCH_PATTERN, DEFAULT_MIGRATION_BRANCH,
};
pub use mapper::{OidMapper, PresenceCache};
pub use transfer::{CancelToken, TransferOutcome, TransferPipeline, Transferred};
pub use workcopy::{
    CommitRequest, GitProvider, GitWorkingCopy, TreeFile, WorkingCopy, WorkingCopyProvider,
};
pub use migrator::{
    rewrite_lfsconfig, write_full_map, write_oid_map, Connector, Endpoints, HttpConnector, MigrationRecord,
    ObjectFailure, PointerIssue, RepoState, RepositoryMigrator, LFSCONFIG,
};
pub use fleet::{parse_repo_list, FleetOrchestrator, FleetReport, RepoEntry, RepoRef};
