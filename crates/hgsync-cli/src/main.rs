use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use hgsync::app::{Application, remove_pidfile, write_pidfile};
use hgsync::consumer::{PulseConnection, PulseWorker, decode_message};
use hgsync::events::Event;
use hgsync::mapping::matchers_from_config;
use hgsync::sync::RepoSynchronizer;
use hgsync_config::Config;

/// How long `dequeue` waits for a message before giving up.
const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "hgsync", version)]
#[command(about = "Mirror git push events into Mercurial destinations")]
struct Cli {
    /// Configuration file path.
    #[arg(short, long)]
    config: PathBuf,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Consume push events from the queue and sync them.
    Run {
        /// Process a single message, then exit.
        #[arg(long)]
        one_shot: bool,

        /// Write the process id to this file while running.
        #[arg(long)]
        pidfile: Option<PathBuf>,
    },
    /// Show the effective configuration, with environment overrides.
    Config,
    /// Remove one matching push message from the queue.
    Dequeue {
        /// URL of the repository for which to delete a message.
        #[arg(short = 'r', long)]
        repository_url: String,

        /// ID of the push to delete.
        #[arg(short = 'p', long)]
        push_id: u64,
    },
    /// Warm the local clone for a tracked repository.
    Fetchrepo {
        /// URL of the repository to process.
        #[arg(short = 'r', long)]
        repository_url: String,

        /// Fetch destination remotes in addition to the source url.
        #[arg(long)]
        fetch_all: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    info!(config = %cli.config.display(), "using configuration file");
    let config = Config::from_file(&cli.config)
        .with_context(|| format!("invalid configuration {}", cli.config.display()))?;

    match cli.cmd {
        Commands::Run { one_shot, pidfile } => run_service(config, one_shot, pidfile),
        Commands::Config => dump_config(&config),
        Commands::Dequeue {
            repository_url,
            push_id,
        } => dequeue(&config, &repository_url, push_id),
        Commands::Fetchrepo {
            repository_url,
            fetch_all,
        } => fetchrepo(&config, &repository_url, fetch_all),
    }
}

fn run_service(config: Config, one_shot: bool, pidfile: Option<PathBuf>) -> Result<()> {
    if let Some(dsn) = config.sentry.as_ref().and_then(|s| s.sentry_dsn.as_deref()) {
        info!(dsn, "error reporting DSN configured");
    }

    let matchers = matchers_from_config(&config).context("failed to compile mappings")?;
    let synchronizers: HashMap<String, RepoSynchronizer> = config
        .tracked_repositories
        .iter()
        .map(|repo| {
            (
                repo.url.clone(),
                RepoSynchronizer::new(config.clone_path(repo), &repo.url),
            )
        })
        .collect();

    let connection = PulseConnection::connect(&config.pulse)?;
    let worker = PulseWorker::new(connection, &config.pulse, one_shot)?;

    if let Some(path) = &pidfile {
        write_pidfile(path)?;
    }

    let result = Application::new(worker, synchronizers, matchers, pidfile.clone()).run();

    if let Some(path) = &pidfile {
        remove_pidfile(path);
    }
    result
}

fn dump_config(config: &Config) -> Result<()> {
    let rendered =
        toml::to_string_pretty(&config.redacted()).context("failed to render configuration")?;
    println!("{rendered}");
    Ok(())
}

fn dequeue(config: &Config, repository_url: &str, push_id: u64) -> Result<()> {
    let connection = PulseConnection::connect(&config.pulse)?;
    connection.declare(&config.pulse)?;

    info!(repository_url, push_id, "removing push message");

    let Some(message) = connection.receive_one(&config.pulse.queue, DEQUEUE_TIMEOUT)? else {
        info!("no message received");
        return Ok(());
    };
    let delivery = message.delivery;

    let push = match decode_message(&delivery.data) {
        Ok(Event::Push(push)) => push,
        Err(err) => {
            warn!(error = %err, "cannot parse message, requeueing");
            connection.reject(&delivery, true)?;
            bail!("first queued message is unparsable: {err}");
        }
    };

    if push.repo_url != repository_url || push.push_id != push_id {
        warn!(
            repo_url = %push.repo_url,
            push_id = push.push_id,
            "message does not match deletion criteria, requeueing"
        );
        connection.reject(&delivery, true)?;
        return Ok(());
    }

    println!("{}", String::from_utf8_lossy(&delivery.data));
    connection.ack(&delivery)?;
    info!(repository_url, "removed 1 message");
    Ok(())
}

fn fetchrepo(config: &Config, repository_url: &str, fetch_all: bool) -> Result<()> {
    let Some(repo) = config.tracked_repository(repository_url) else {
        bail!("can't find tracked repository for url {repository_url}");
    };

    let clone_path = config.clone_path(repo);
    let syncer = RepoSynchronizer::new(clone_path.clone(), &repo.url);

    info!(url = %repo.url, clone = %clone_path.display(), "setting up local clone");
    let clone = syncer.open_clone()?;

    info!(url = %repo.url, "fetching commits from source");
    clone.fetch(&repo.url, &[])?;

    if fetch_all {
        for destination in static_destinations(config, &repo.url) {
            info!(remote = %destination, "fetching commits from destination");
            syncer.fetch_all_from_remote(&clone, &format!("hg::{destination}"))?;
        }
    }

    Ok(())
}

/// Destination URLs configured for `source_url` that contain no
/// substitution back-references, deduplicated in configuration order.
/// Dynamic destinations can only be resolved against a concrete event.
fn static_destinations(config: &Config, source_url: &str) -> Vec<String> {
    let branch_urls = config
        .branch_mappings
        .iter()
        .filter(|m| m.source_url == source_url)
        .map(|m| m.destination_url.as_str());
    let tag_urls = config
        .tag_mappings
        .iter()
        .filter(|m| m.source_url == source_url)
        .map(|m| m.destination_url.as_str());

    let mut seen = HashSet::new();
    let mut destinations = Vec::new();
    for url in branch_urls.chain(tag_urls) {
        if url.contains('$') {
            info!(remote = url, "skipping remote due to dynamic replacements");
            continue;
        }
        if seen.insert(url.to_string()) {
            destinations.push(url.to_string());
        }
    }
    destinations
}
