use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use url::Url;

use lfs_migrate::{
    parse_repo_list, CancelToken, Connector, Credentials, Endpoint, FleetConfig,
    FleetOrchestrator, FleetReport, GitProvider, GitWorkingCopy, HttpConnector, MigrationConfig,
    MigrationRecord, RepoRef, RepositoryMigrator, SourceSpec, DEFAULT_BATCH_SIZE,
    DEFAULT_BRANCH_PATTERN, DEFAULT_MIGRATION_BRANCH,
};

#[derive(Parser, Debug)]
#[command(version, about = "Migrate Git LFS objects to a new storage service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Migrate one repository that is already checked out
    Migrate(MigrateArgs),
    /// Clone and migrate every repository in a list
    Fleet(FleetArgs),
}

#[derive(Args, Debug)]
struct MigrateArgs {
    /// Working copy of the repository
    #[arg(short = 'i', long, env = "LFSMIGRATOR_DIRECTORY", default_value = ".")]
    directory: PathBuf,
    #[arg(short = 'u', long, env = "LFSMIGRATOR_OWNER")]
    owner: String,
    #[arg(short = 'r', long, env = "LFSMIGRATOR_REPOSITORY")]
    repository: String,
    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Args, Debug)]
struct FleetArgs {
    /// Repository list, one `host/owner/repo` per line; `-` reads stdin
    #[arg(short = 'f', long, env = "LFSMIGRATOR_INPUT_FILE", default_value = "-")]
    input_file: String,
    /// Working copies are placed under `<top-dir>/<owner>/<repo>`
    #[arg(short = 't', long, env = "LFSMIGRATOR_TOP_DIR", default_value = ".")]
    top_dir: PathBuf,
    /// Remove working copies of fully committed repositories
    #[arg(short = 'c', long, env = "LFSMIGRATOR_CLEANUP", action = ArgAction::SetTrue, value_parser = str_bool)]
    cleanup: bool,
    /// Reuse destination presence answers across repositories
    #[arg(long, env = "LFSMIGRATOR_SHARE_PRESENCE_CACHE", action = ArgAction::SetTrue, value_parser = str_bool)]
    share_presence_cache: bool,
    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum SourceMode {
    /// The original LFS service
    Endpoint,
    /// The LFS endpoint implied by the `origin` remote
    Remote,
    /// The working copy's `.git/lfs/objects`
    Local,
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Destination read URL
    #[arg(long, env = "LFSMIGRATOR_BASE_URL", default_value = "https://git-lfs.lsst.cloud")]
    lfs_base_url: String,
    /// Destination write URL
    #[arg(long, env = "LFSMIGRATOR_BASE_WRITE_URL", default_value = "https://git-lfs-rw.lsst.cloud")]
    lfs_base_write_url: String,
    /// Source service, used with `--source-mode endpoint`
    #[arg(long, env = "LFSMIGRATOR_ORIGINAL_LFS_URL", default_value = "https://git-lfs.lsst.codes")]
    original_lfs_url: String,
    #[arg(long, env = "LFSMIGRATOR_SOURCE_MODE", value_enum, default_value_t = SourceMode::Endpoint)]
    source_mode: SourceMode,
    #[arg(long, env = "LFSMIGRATOR_SOURCE_TOKEN", hide_env_values = true)]
    source_token: Option<String>,
    #[arg(long, env = "LFSMIGRATOR_DEST_TOKEN", hide_env_values = true)]
    dest_token: Option<String>,
    /// Send the destination token as basic auth for this user
    #[arg(long, env = "LFSMIGRATOR_DEST_USER")]
    dest_user: Option<String>,
    /// Token for cloning and pushing
    #[arg(long, env = "LFSMIGRATOR_GIT_TOKEN", hide_env_values = true)]
    git_token: Option<String>,
    #[arg(short = 'm', long, env = "LFSMIGRATOR_MIGRATION_BRANCH", default_value = DEFAULT_MIGRATION_BRANCH)]
    migration_branch: String,
    /// Defaults to the repository's default branch
    #[arg(short = 's', long, env = "LFSMIGRATOR_SOURCE_BRANCH")]
    source_branch: Option<String>,
    #[arg(short = 'x', long, env = "LFSMIGRATOR_DRY_RUN", action = ArgAction::SetTrue, value_parser = str_bool)]
    dry_run: bool,
    #[arg(short = 'q', long, env = "LFSMIGRATOR_QUIET", action = ArgAction::SetTrue, value_parser = str_bool)]
    quiet: bool,
    #[arg(short = 'd', long, env = "LFSMIGRATOR_DEBUG", action = ArgAction::SetTrue, value_parser = str_bool)]
    debug: bool,
    /// Commit the migrated subset when some objects fail
    #[arg(long, env = "LFSMIGRATOR_ALLOW_PARTIAL", action = ArgAction::SetTrue, value_parser = str_bool)]
    allow_partial: bool,
    /// Push the migration branch to `origin`
    #[arg(long, env = "LFSMIGRATOR_PUSH", action = ArgAction::SetTrue, value_parser = str_bool)]
    push: bool,
    /// Parallel transfers within a repository
    #[arg(long, env = "LFSMIGRATOR_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,
    #[arg(long, env = "LFSMIGRATOR_BATCH_SIZE", default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: usize,
    #[arg(long, env = "LFSMIGRATOR_MAX_ATTEMPTS", default_value_t = 5)]
    max_attempts: u32,
    /// Per-request HTTP timeout in seconds
    #[arg(long, env = "LFSMIGRATOR_TIMEOUT", default_value_t = 300)]
    timeout: u64,
    /// JSON report destination; `-` is stdout
    #[arg(long, env = "LFSMIGRATOR_REPORT_FILE", default_value = "-")]
    report_file: String,
    /// Write `oids--<owner>--<repo>.json` files here
    #[arg(long, env = "LFSMIGRATOR_OID_MAP_DIR")]
    oid_map_dir: Option<PathBuf>,
    /// Also write `fullmap--<owner>--<repo>.json` (path to oid per branch and tag)
    #[arg(long, env = "LFSMIGRATOR_FULL_MAP", action = ArgAction::SetTrue, value_parser = str_bool)]
    full_map: bool,
    /// Copy objects of branches matching this pattern; empty disables
    #[arg(long, env = "LFSMIGRATOR_BRANCH_PATTERN", default_value = DEFAULT_BRANCH_PATTERN)]
    branch_pattern: String,
    /// Do not copy the objects tags reference
    #[arg(long, env = "LFSMIGRATOR_SKIP_TAGS", action = ArgAction::SetTrue, value_parser = str_bool)]
    skip_tags: bool,
}

/// Loose truthiness for flags: empty, `0`, `f*` and `n*` are false.
fn str_bool(input: &str) -> std::result::Result<bool, String> {
    let input = input.trim().to_ascii_uppercase();
    Ok(!(input.is_empty() || input == "0" || input.starts_with('F') || input.starts_with('N')))
}

impl CommonArgs {
    fn migration_config(&self) -> Result<MigrationConfig> {
        let write_url = Url::parse(&self.lfs_base_write_url)
            .with_context(|| format!("invalid write URL {}", self.lfs_base_write_url))?;
        let mut destination = Endpoint::parse(&self.lfs_base_url)?.with_write_url(write_url);
        destination.credentials = match (&self.dest_user, &self.dest_token) {
            (Some(user), Some(token)) => Some(Credentials::Basic(user.clone(), token.clone())),
            (None, Some(token)) => Some(Credentials::Bearer(token.clone())),
            _ => None,
        };

        let source_credentials = self.source_token.clone().map(Credentials::Bearer);
        let source = match self.source_mode {
            SourceMode::Endpoint => {
                let mut endpoint = Endpoint::parse(&self.original_lfs_url)?;
                endpoint.credentials = source_credentials;
                SourceSpec::Endpoint(endpoint)
            }
            SourceMode::Remote => SourceSpec::Remote {
                credentials: source_credentials,
            },
            SourceMode::Local => SourceSpec::LocalCache,
        };

        let mut config = MigrationConfig::new(source, destination);
        config.source_branch = self.source_branch.clone();
        config.migration_branch = self.migration_branch.clone();
        config.dry_run = self.dry_run;
        config.allow_partial = self.allow_partial;
        config.push = self.push;
        config.git_token = self.git_token.clone();
        config.concurrency = self.concurrency;
        config.batch_size = self.batch_size;
        config.retry.max_attempts = self.max_attempts;
        config.http_timeout = Duration::from_secs(self.timeout);
        config.oid_map_dir = self.oid_map_dir.clone();
        config.full_map = self.full_map;
        config.branch_pattern = Some(self.branch_pattern.clone()).filter(|p| !p.is_empty());
        config.copy_tags = !self.skip_tags;
        config.validate()?;
        Ok(config)
    }
}

fn init_tracing(common: &CommonArgs) {
    let default_level = if common.debug {
        "lfs_migrate=debug"
    } else if common.quiet {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

fn write_report(report: &FleetReport, target: &str) -> Result<()> {
    let json = serde_json::to_string_pretty(report)?;
    if target == "-" {
        println!("{}", json);
    } else {
        fs::write(target, format!("{}\n", json))
            .with_context(|| format!("failed to write report to {}", target))?;
        tracing::info!(path = target, "wrote report");
    }
    Ok(())
}

/// First SIGINT/SIGTERM drains the run; a second one exits at once.
fn install_signal_handler(cancel: &CancelToken) {
    let cancel = cancel.clone();
    let installed = ctrlc::set_handler(move || {
        if cancel.is_cancelled() {
            std::process::exit(130);
        }
        tracing::warn!("interrupted, finishing in-flight transfers; repeat to abort");
        cancel.cancel();
    });
    if let Err(e) = installed {
        tracing::warn!(error = %e, "cannot install signal handler");
    }
}

fn migrate(args: &MigrateArgs, cancel: &CancelToken) -> Result<FleetReport> {
    let base = args.common.migration_config()?;
    let repo = RepoRef::new("", args.owner.as_str(), args.repository.as_str());
    let config = base.for_repository(&repo.owner, &repo.name)?;

    let copy = GitWorkingCopy::open(&args.directory)
        .with_context(|| format!("cannot open {}", args.directory.display()))?;
    let record = match HttpConnector.connect(&config, &copy) {
        Ok(endpoints) => RepositoryMigrator::new(
            &config,
            endpoints.source.as_ref(),
            endpoints.destination.as_ref(),
        )
        .with_cancel(cancel.clone())
        .run(&repo, &copy),
        Err(e) => MigrationRecord::failed(repo.id(), &config, &e),
    };

    let mut report = FleetReport::default();
    report.push(record);
    Ok(report)
}

fn fleet(args: &FleetArgs, cancel: &CancelToken) -> Result<FleetReport> {
    let migration = args.common.migration_config()?;
    let text = if args.input_file == "-" {
        io::read_to_string(io::stdin()).context("failed to read repository list from stdin")?
    } else {
        fs::read_to_string(&args.input_file)
            .with_context(|| format!("failed to read {}", args.input_file))?
    };
    let entries = parse_repo_list(&text);
    tracing::info!(repositories = entries.len(), "loaded repository list");

    let provider = GitProvider::new(&args.top_dir)
        .with_branch(migration.source_branch.clone())
        .with_token(migration.git_token.clone())
        .dry_run(migration.dry_run);
    let config = FleetConfig {
        migration,
        cleanup: args.cleanup,
        share_presence_cache: args.share_presence_cache,
    };
    Ok(FleetOrchestrator::new(&config, &provider, &HttpConnector)
        .with_cancel(cancel.clone())
        .run(&entries))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let common = match &cli.command {
        Commands::Migrate(args) => &args.common,
        Commands::Fleet(args) => &args.common,
    };
    init_tracing(common);

    let cancel = CancelToken::new();
    install_signal_handler(&cancel);

    let report = match &cli.command {
        Commands::Migrate(args) => migrate(args, &cancel),
        Commands::Fleet(args) => fleet(args, &cancel),
    };
    let report = match report {
        Ok(report) => report,
        Err(e) => {
            tracing::error!("{:#}", e);
            return ExitCode::from(2);
        }
    };

    if let Err(e) = write_report(&report, &common.report_file) {
        tracing::error!("{:#}", e);
        return ExitCode::from(1);
    }
    tracing::info!(
        committed = report.committed,
        partially_failed = report.partially_failed,
        failed = report.failed,
        dry_run = report.dry_run,
        "done"
    );
    ExitCode::from(report.exit_code() as u8)
}
