//! deaddrop CLI - publish, claim, and finish tasks in a git-mediated queue.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use dd_core::{Deliverable, QueueConfig, QueueError, TaskId, TaskRecord, TaskStatus};
use dd_protocol::{ClaimResolver, Mutation, PublishProtocol, TaskAssigner};
use dd_store::QueueStore;
use dd_vcs::{GitBackend, GitCommand, GitExecutor, PushOutcome, RemoteHandle, VersionControl};
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{debug, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "deaddrop")]
#[command(about = "deaddrop - a git-mediated task queue for autonomous agents", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a queue in an existing git repository
    Init {
        /// Repository root (defaults to current directory)
        path: Option<String>,
    },

    /// Create and publish a new task
    Assign {
        /// Task prompt (opaque payload for the assignee)
        prompt: String,

        /// Agent the task is assigned to
        #[arg(long = "assigned_to")]
        assigned_to: String,

        /// Agent creating the task
        #[arg(long = "assigned_by")]
        assigned_by: String,

        /// Expected output as kind=location; repeatable
        #[arg(long = "deliverable")]
        deliverables: Vec<String>,
    },

    /// Claim a pending task
    Claim {
        /// Task id to claim
        #[arg(required_unless_present = "next", conflicts_with = "next")]
        task_id: Option<String>,

        /// Claim the oldest available pending task instead
        #[arg(long)]
        next: bool,

        /// Agent performing the claim
        #[arg(long)]
        claimant: String,
    },

    /// Mark a claimed task as completed
    Complete {
        /// Task id
        task_id: String,

        /// Agent that claimed the task
        #[arg(long)]
        claimant: String,
    },

    /// Mark a claimed task as failed
    Fail {
        /// Task id
        task_id: String,

        /// Agent that claimed the task
        #[arg(long)]
        claimant: String,
    },

    /// Withdraw a still-pending task
    Withdraw {
        /// Task id
        task_id: String,
    },

    /// Add a deliverable to an open task
    Deliverable {
        /// Task id
        task_id: String,

        /// Deliverable as kind=location
        entry: String,
    },

    /// List tasks
    List {
        /// Restrict to one state
        #[arg(short, long)]
        state: Option<String>,
    },

    /// Show one task in full
    Show {
        /// Task id
        task_id: String,
    },

    /// Show version information
    Version,
}

/// A queue opened inside a discovered repository
struct Queue {
    protocol: PublishProtocol<GitBackend<GitCommand>>,
}

/// Find the repository holding the queue by walking up from the current
/// directory until a `.deaddrop` directory appears.
fn find_queue_root() -> Result<PathBuf> {
    let mut current = env::current_dir()?;

    loop {
        if current.join(".deaddrop").is_dir() {
            return Ok(current);
        }
        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => {
                bail!("No .deaddrop directory found. Run 'deaddrop init' to initialize a queue.")
            }
        }
    }
}

fn open_queue() -> Result<Queue> {
    let repo_root = find_queue_root()?;
    let config = QueueConfig::load_or_default(&repo_root)?;

    let executor = GitCommand::new(&repo_root);
    let backend = GitBackend::new(executor, RemoteHandle::from_config(&config.remote))
        .with_network_timeout(config.network_timeout());
    let store = QueueStore::new(repo_root.join(&config.queue.root));

    Ok(Queue {
        protocol: PublishProtocol::new(backend, store, config.retry_policy()),
    })
}

impl Queue {
    fn store(&self) -> &QueueStore {
        self.protocol.store()
    }

    /// Bring the working copy up to the remote's current state so claims
    /// and listings see fresh records. An unreachable remote degrades to
    /// the local view; publishing will still detect divergence.
    async fn refresh(&self) -> Result<()> {
        match self.protocol.vcs().fetch().await {
            Ok(()) => self.protocol.vcs().integrate().await.map_err(Into::into),
            Err(e) if e.is_retryable() => {
                warn!("Remote unreachable, using local view: {}", e);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn parse_task_id(raw: &str) -> Result<TaskId> {
    raw.parse::<TaskId>()
        .map_err(QueueError::from)
        .map_err(Into::into)
}

fn parse_deliverable(entry: &str) -> Result<Deliverable> {
    let (kind, location) = entry
        .split_once('=')
        .ok_or_else(|| anyhow!("deliverable must be kind=location, got '{}'", entry))?;
    Ok(Deliverable::new(kind, location))
}

fn status_colored(status: TaskStatus) -> colored::ColoredString {
    let text = status.to_string();
    match status {
        TaskStatus::Pending => text.yellow(),
        TaskStatus::InProgress => text.cyan(),
        TaskStatus::Completed => text.green(),
        TaskStatus::Failed => text.red(),
        TaskStatus::Cancelled => text.bright_black(),
    }
}

fn print_record(record: &TaskRecord) {
    println!("{} {}", "ID:         ".bold(), record.task_id.to_string().bright_cyan());
    println!("{} {}", "Status:     ".bold(), status_colored(record.status));
    println!("{} {}", "Assigned to:".bold(), record.assigned_to);
    println!("{} {}", "Assigned by:".bold(), record.assigned_by);
    println!("{} {}", "Created:    ".bold(), record.created_at.to_rfc3339());
    if let (Some(by), Some(at)) = (&record.claimed_by, &record.claimed_at) {
        println!("{} {} at {}", "Claimed by: ".bold(), by, at.to_rfc3339());
    }
    println!("{} {}", "Prompt:     ".bold(), record.prompt);
    if !record.deliverables.is_empty() {
        println!("{}", "Deliverables:".bold());
        for deliverable in &record.deliverables {
            println!("  {} -> {}", deliverable.kind, deliverable.location);
        }
    }
}

async fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Init { path } => {
            let repo_root = match path {
                Some(path) => PathBuf::from(&path)
                    .canonicalize()
                    .with_context(|| format!("cannot open {}", path))?,
                None => env::current_dir()?,
            };

            let executor = GitCommand::new(&repo_root);
            let probe = executor.exec(&["rev-parse", "--git-dir"]).await?;
            if !probe.success {
                bail!(
                    "{} is not a git repository; clone or init one first",
                    repo_root.display()
                );
            }

            QueueConfig::write_default(&repo_root)?;
            let config = QueueConfig::load_or_default(&repo_root)?;
            let store = QueueStore::new(repo_root.join(&config.queue.root));
            let mut to_stage = store.init_partitions().await?;
            to_stage.push(repo_root.join(".deaddrop/config.toml"));

            // The bootstrap commit happens outside the publish protocol:
            // there is no queue state to race against yet.
            let backend = GitBackend::new(executor, RemoteHandle::from_config(&config.remote))
                .with_network_timeout(config.network_timeout());
            backend.stage(&to_stage).await?;
            backend.commit("initialize task queue").await?;
            match backend.push().await? {
                PushOutcome::Accepted => {}
                PushOutcome::Rejected { reason } => {
                    bail!("bootstrap push rejected ({}); pull the remote and retry", reason)
                }
            }

            println!("{}", "✓ Initialized task queue".green().bold());
            println!("  Queue:  {}", store.root().display());
            println!("  Remote: {}", backend.remote().tracking_ref());
            Ok(())
        }

        Commands::Assign {
            prompt,
            assigned_to,
            assigned_by,
            deliverables,
        } => {
            let deliverables = deliverables
                .iter()
                .map(|entry| parse_deliverable(entry))
                .collect::<Result<Vec<_>>>()?;

            let queue = open_queue()?;
            let task_id = TaskAssigner::new(&queue.protocol)
                .assign(prompt, &assigned_to, &assigned_by, deliverables)
                .await?;

            println!("{}", "✓ Published task".green().bold());
            println!("  ID: {}", task_id.to_string().bright_cyan());
            Ok(())
        }

        Commands::Claim {
            task_id,
            next,
            claimant,
        } => {
            let queue = open_queue()?;
            queue.refresh().await?;
            let resolver = ClaimResolver::new(&queue.protocol, claimant);

            let record = if next {
                match resolver.claim_next().await? {
                    Some(record) => record,
                    None => {
                        println!("{}", "No pending tasks available".yellow());
                        return Ok(());
                    }
                }
            } else {
                // clap guarantees task_id is present when --next is absent
                let task_id = parse_task_id(task_id.as_deref().unwrap_or_default())?;
                resolver.claim(task_id).await?
            };

            println!("{}", "✓ Claimed task".green().bold());
            print_record(&record);
            Ok(())
        }

        Commands::Complete { task_id, claimant } => {
            let task_id = parse_task_id(&task_id)?;
            let queue = open_queue()?;
            queue.refresh().await?;
            ClaimResolver::new(&queue.protocol, claimant)
                .complete(task_id)
                .await?;
            println!("{} {}", "✓ Completed task".green().bold(), task_id);
            Ok(())
        }

        Commands::Fail { task_id, claimant } => {
            let task_id = parse_task_id(&task_id)?;
            let queue = open_queue()?;
            queue.refresh().await?;
            ClaimResolver::new(&queue.protocol, claimant)
                .fail(task_id)
                .await?;
            println!("{} {}", "✓ Marked task failed".red().bold(), task_id);
            Ok(())
        }

        Commands::Withdraw { task_id } => {
            let task_id = parse_task_id(&task_id)?;
            let queue = open_queue()?;
            queue.refresh().await?;
            TaskAssigner::new(&queue.protocol).withdraw(task_id).await?;
            println!("{} {}", "✓ Withdrew task".yellow().bold(), task_id);
            Ok(())
        }

        Commands::Deliverable { task_id, entry } => {
            let task_id = parse_task_id(&task_id)?;
            let deliverable = parse_deliverable(&entry)?;
            let queue = open_queue()?;
            queue.refresh().await?;
            queue
                .protocol
                .publish(&Mutation::amend(task_id, deliverable))
                .await?;
            println!("{} {}", "✓ Added deliverable to".green().bold(), task_id);
            Ok(())
        }

        Commands::List { state } => {
            let queue = open_queue()?;
            queue.refresh().await?;

            let states: Vec<TaskStatus> = match state {
                Some(raw) => vec![raw.parse().map_err(QueueError::from)?],
                None => TaskStatus::ALL.to_vec(),
            };

            let mut records = Vec::new();
            for status in states {
                records.extend(queue.store().list_records(status).await?);
            }
            records.sort_by_key(|record| record.created_at);

            if records.is_empty() {
                println!("{}", "No tasks found".yellow());
                return Ok(());
            }

            println!(
                "{:<38} {:<12} {:<12} {}",
                "ID".bold(),
                "STATUS".bold(),
                "ASSIGNED TO".bold(),
                "PROMPT".bold()
            );
            println!("{}", "─".repeat(90));
            for record in records {
                let one_line = record.prompt.replace('\n', " ");
                let prompt = if one_line.chars().count() > 40 {
                    let mut short: String = one_line.chars().take(37).collect();
                    short.push_str("...");
                    short
                } else {
                    one_line
                };
                println!(
                    "{:<38} {:<12} {:<12} {}",
                    record.task_id.to_string().bright_cyan(),
                    status_colored(record.status),
                    record.assigned_to,
                    prompt
                );
            }
            Ok(())
        }

        Commands::Show { task_id } => {
            let task_id = parse_task_id(&task_id)?;
            let queue = open_queue()?;
            queue.refresh().await?;

            let (path, _) = queue
                .store()
                .locate(task_id)
                .await?
                .ok_or(QueueError::NotFound(format!("task {}", task_id)))?;
            let record = queue.store().read(&path).await?;
            print_record(&record);
            Ok(())
        }

        Commands::Version => {
            println!("deaddrop {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match run(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // Scripts branch on the stable kind, humans read the message
            let kind = e
                .downcast_ref::<QueueError>()
                .map(QueueError::kind)
                .unwrap_or("error");
            debug!("command failed: {:#}", e);
            eprintln!("{} {}", format!("error [{}]:", kind).red().bold(), e);
            ExitCode::FAILURE
        }
    }
}
