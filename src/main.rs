// src/main.rs

//! skysweep: parallel, resumable Bluesky collection CLI.
//!
//! Resolves CLI arguments and the TOML config into a collection plan,
//! then hands the plan to the orchestrator. One worker runs per
//! configured account.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, TimeZone, Utc};
use clap::{Parser, Subcommand};

use skysweep::config::{credentials_from, load_config};
use skysweep::error::{AppError, Result};
use skysweep::models::{
    CollectionPlan, CollectionTarget, Credential, PartitionConfig, SearchFilters, TimeWindow,
    UserShare, WorkerScope,
};
use skysweep::pipeline::{Orchestrator, partition_users, partition_windows};
use skysweep::services::{ApiClient, AtpClient};
use skysweep::storage::UserRegistry;

#[derive(Parser, Debug)]
#[command(
    name = "skysweep",
    version,
    about = "Parallel social-graph collector for Bluesky"
)]
struct Cli {
    #[arg(short, long, default_value = "data/config.toml")]
    config: String,

    /// Start of the collection range (RFC 3339); defaults to the
    /// network's public launch
    #[arg(long)]
    since: Option<DateTime<Utc>>,

    /// End of the collection range (RFC 3339); defaults to now
    #[arg(long)]
    until: Option<DateTime<Utc>>,

    /// Total post limit across all workers; 0 means unlimited
    #[arg(short, long, default_value_t = 0)]
    limit: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Collect posts matching a keyword, with their interaction trees
    Search {
        keyword: String,
        #[arg(long)]
        author: Option<String>,
        #[arg(long)]
        domain: Option<String>,
        #[arg(long)]
        lang: Option<String>,
        #[arg(long)]
        mentions: Option<String>,
        #[arg(long)]
        tag: Option<String>,
        #[arg(long)]
        url: Option<String>,
        #[arg(long)]
        sort: Option<String>,
    },
    /// Collect one user's posts, with their interaction trees
    User { handle: String },
    /// Collect the feeds of previously discovered users, split evenly
    /// across the configured accounts
    Batch {
        /// Read the topic-scoped discovered-user file instead of the
        /// global one
        #[arg(long)]
        topic: Option<String>,
    },
}

/// Bluesky's public launch; nothing searchable predates it.
fn network_launch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0)
        .single()
        .unwrap_or_default()
}

fn windowed_plan(
    target: CollectionTarget,
    since: DateTime<Utc>,
    until: DateTime<Utc>,
    credentials: Vec<Credential>,
    limit: u64,
    partition: &PartitionConfig,
) -> Result<CollectionPlan> {
    let windows = partition_windows(since, until, credentials.len(), partition)?;
    Ok(CollectionPlan {
        target,
        scopes: windows.into_iter().map(WorkerScope::Window).collect(),
        credentials,
        limit,
        strategy: partition.strategy,
    })
}

/// Build a batch plan from the discovered-user files, one user share per
/// account.
async fn batch_plan(
    topic: Option<String>,
    since: DateTime<Utc>,
    until: DateTime<Utc>,
    credentials: Vec<Credential>,
    limit: u64,
    partition: &PartitionConfig,
    data_dir: &Path,
) -> Result<CollectionPlan> {
    let registry = UserRegistry::new(data_dir.join("users"));
    let users = match &topic {
        Some(topic) => registry.read_topic(topic).await?,
        None => registry.read_global().await?,
    };
    let handles: Vec<String> = users.into_iter().map(|u| u.handle).collect();
    if handles.is_empty() {
        return Err(AppError::config(
            "no discovered users to collect; run a search first",
        ));
    }
    log::info!(
        "batch run over {} discovered users with {} accounts",
        handles.len(),
        credentials.len()
    );

    let scopes = partition_users(&handles, credentials.len())?
        .into_iter()
        .enumerate()
        .map(|(i, handles)| {
            WorkerScope::UserShare(UserShare {
                handles,
                window: TimeWindow::new(since, until, i),
            })
        })
        .collect();
    Ok(CollectionPlan {
        target: CollectionTarget::UserBatch {
            label: topic.unwrap_or_else(|| "discovered".to_string()),
        },
        scopes,
        credentials,
        limit,
        strategy: partition.strategy,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let config = load_config(Path::new(&cli.config))?;
    config.validate()?;
    let credentials = credentials_from(&config);
    if credentials.is_empty() {
        return Err(AppError::config(
            "no accounts configured; add [[accounts]] entries to the config file",
        ));
    }

    let since = cli.since.unwrap_or_else(network_launch);
    let until = cli.until.unwrap_or_else(Utc::now);
    let plan = match cli.command {
        Command::Search {
            keyword,
            author,
            domain,
            lang,
            mentions,
            tag,
            url,
            sort,
        } => windowed_plan(
            CollectionTarget::Keyword {
                keyword,
                filters: SearchFilters {
                    author,
                    domain,
                    lang,
                    mentions,
                    tag,
                    url,
                    sort,
                },
            },
            since,
            until,
            credentials,
            cli.limit,
            &config.partition,
        )?,
        Command::User { handle } => windowed_plan(
            CollectionTarget::User { handle },
            since,
            until,
            credentials,
            cli.limit,
            &config.partition,
        )?,
        Command::Batch { topic } => {
            batch_plan(
                topic,
                since,
                until,
                credentials,
                cli.limit,
                &config.partition,
                Path::new(&config.paths.data_dir),
            )
            .await?
        }
    };

    // Ctrl-C requests a stop at the next batch boundary; checkpoints stay
    // valid, so rerunning the same command resumes.
    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = Arc::clone(&cancel);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::warn!("interrupt received; stopping at the next batch boundary");
                cancel.store(true, Ordering::Relaxed);
            }
        });
    }

    let collector = config.collector.clone();
    let orchestrator = Orchestrator::new(config.collector.clone(), &config.paths.data_dir);
    let report = orchestrator
        .run(
            plan,
            move || Ok(Arc::new(AtpClient::new(&collector)?) as Arc<dyn ApiClient>),
            cancel,
        )
        .await?;

    log::info!(
        "collected {} posts from {} participants -> {}",
        report.result.posts.len(),
        report.result.topic_participants.len(),
        report.output_path.display()
    );
    if !report.failed_workers.is_empty() {
        log::warn!(
            "workers {:?} failed; rerun the same command to resume them",
            report.failed_workers
        );
    }
    Ok(())
}
