use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use vrank_core::{Event, ItemId, ItemKind, UserId};
use vrank_engine::{check_store, default_worker_id, scenario, Service, Worker, WorkerPool};
use vrank_storage::JobQueue;

#[derive(Parser)]
#[command(name = "vrank", version)]
struct Cli {
    /// Directory holding vrank.toml and the database (defaults to the current directory)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create vrank.toml and the database
    Init,

    /// Record and dispatch events from a JSON-lines file (`-` for stdin)
    Apply { file: String },

    /// Print a user's ranked list
    List {
        #[arg(long)]
        user: String,
        #[arg(long)]
        kind: String,
        /// Also show pinned items the user may still see
        #[arg(long)]
        all: bool,
    },

    /// Move the entry at one rank to another
    Move {
        #[arg(long)]
        user: String,
        #[arg(long)]
        kind: String,
        #[arg(long)]
        from: u32,
        #[arg(long)]
        to: u32,
    },

    /// Move an item onto the rank held by another item
    MoveItem {
        #[arg(long)]
        user: String,
        #[arg(long)]
        kind: String,
        #[arg(long)]
        item: String,
        #[arg(long)]
        target: String,
    },

    /// Mark (or with --off, unmark) a task as a favorite
    Favorite {
        #[arg(long)]
        user: String,
        #[arg(long)]
        task: String,
        #[arg(long)]
        off: bool,
    },

    /// Background reconciliation jobs
    Worker {
        #[command(subcommand)]
        cmd: WorkerCommand,
    },

    /// Show queued and dead-lettered jobs
    Status,

    /// Verify rank density and favorite rules across every list
    Check,

    /// Replay a YAML scenario against a scratch in-memory engine
    Scenario { file: PathBuf },
}

#[derive(Subcommand)]
enum WorkerCommand {
    /// Poll the queue until interrupted (or until empty with --drain)
    Run {
        #[arg(long)]
        drain: bool,
    },
}

fn parse_kind(s: &str) -> anyhow::Result<ItemKind> {
    ItemKind::parse(s).ok_or_else(|| anyhow!("unknown kind {s:?} (task, project, workflow)"))
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let data_dir = match cli.data_dir {
        Some(d) => d,
        None => std::env::current_dir()?,
    };

    match cli.cmd {
        Command::Init => {
            Service::init(&data_dir)?;
            println!("Initialized vrank in {}", data_dir.display());
        }
        Command::Apply { file } => {
            let svc = Service::open(data_dir)?;
            let reader: Box<dyn BufRead> = if file == "-" {
                Box::new(std::io::stdin().lock())
            } else {
                Box::new(std::io::BufReader::new(
                    std::fs::File::open(&file).with_context(|| format!("open {file}"))?,
                ))
            };
            let (mut applied, mut jobs) = (0usize, 0usize);
            for (n, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let event: Event =
                    serde_json::from_str(&line).with_context(|| format!("parse event on line {}", n + 1))?;
                let out = svc.engine.apply(&event).with_context(|| format!("apply line {}", n + 1))?;
                applied += 1;
                jobs += out.jobs_enqueued;
            }
            println!("Applied {applied} events, queued {jobs} jobs");
        }
        Command::List { user, kind, all } => {
            let svc = Service::open(data_dir)?;
            let user = UserId::from_str(&user);
            let kind = parse_kind(&kind)?;
            let entries = svc.engine.entries(&user, kind)?;
            let visible = svc.engine.ranked_list(&user, kind, all)?;
            for id in &visible {
                let Some(e) = entries.iter().find(|e| &e.item_id == id) else {
                    continue;
                };
                let mark = if e.is_favorite { " *" } else { "" };
                if e.is_pinned() {
                    println!("   - {}{}", e.item_id, mark);
                } else {
                    println!("{:>4} {}{}", e.rank, e.item_id, mark);
                }
            }
        }
        Command::Move { user, kind, from, to } => {
            let svc = Service::open(data_dir)?;
            let moved = svc
                .engine
                .move_rank(&UserId::from_str(&user), parse_kind(&kind)?, from, to)?;
            println!("Moved {} to rank {}", moved.item_id, moved.rank);
        }
        Command::MoveItem {
            user,
            kind,
            item,
            target,
        } => {
            let svc = Service::open(data_dir)?;
            let moved = svc.engine.move_item(
                &UserId::from_str(&user),
                parse_kind(&kind)?,
                &ItemId::from_str(&item),
                &ItemId::from_str(&target),
            )?;
            println!("Moved {} to rank {}", moved.item_id, moved.rank);
        }
        Command::Favorite { user, task, off } => {
            let svc = Service::open(data_dir)?;
            svc.engine
                .set_favorite(&UserId::from_str(&user), &ItemId::from_str(&task), !off)?;
            println!("{} {}", if off { "Unfavorited" } else { "Favorited" }, task);
        }
        Command::Worker {
            cmd: WorkerCommand::Run { drain },
        } => {
            let svc = Service::open(data_dir)?;
            if drain {
                let worker = Worker::new(Arc::clone(&svc.engine), default_worker_id())
                    .with_lease_secs(svc.cfg.worker.lease_secs);
                let n = worker.drain()?;
                println!("Processed {n} jobs");
            } else {
                let rt = tokio::runtime::Runtime::new()?;
                rt.block_on(async {
                    let pool = WorkerPool::spawn(Arc::clone(&svc.engine), &svc.cfg.worker, &default_worker_id());
                    tokio::signal::ctrl_c().await?;
                    info!("interrupt received, stopping workers");
                    pool.shutdown().await;
                    anyhow::Ok(())
                })?;
            }
        }
        Command::Status => {
            let svc = Service::open(data_dir)?;
            let pending = svc.engine.store().pending_jobs()?;
            let dead = svc.engine.store().dead_jobs()?;
            println!("Pending jobs: {}", pending.len());
            for j in &pending {
                println!(
                    "- {} {} {} users={} attempts={}",
                    j.id,
                    j.scope.label(),
                    j.kind,
                    j.users.len(),
                    j.attempts
                );
            }
            println!("Dead jobs: {}", dead.len());
            for j in &dead {
                println!("- {} {}", j.id, j.last_error.as_deref().unwrap_or(""));
            }
        }
        Command::Check => {
            let svc = Service::open(data_dir)?;
            let violations = check_store(&**svc.engine.store(), svc.cfg.ranking.favorite_capacity)?;
            if violations.is_empty() {
                println!("OK");
            } else {
                for v in &violations {
                    println!("{v}");
                }
                return Err(anyhow!("{} violations", violations.len()));
            }
        }
        Command::Scenario { file } => {
            let res = scenario::simulate(&file)?;
            for f in &res.failures {
                println!("FAIL {f}");
            }
            for (step, v) in &res.violations {
                println!("VIOLATION step {step}: {v}");
            }
            if !res.passed() {
                return Err(anyhow!("scenario {} failed", res.scenario_id));
            }
            println!("{}: {} steps OK", res.scenario_id, res.steps_run);
        }
    }

    Ok(())
}
