use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use hive_core::*;
use hive_runner::{Orchestrator, RunReport};
use tokio::sync::watch;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hive", version, about = "Run a pool of coding agents against an outcome's task queue")]
struct Cli {
    /// Log filter, overrides RUST_LOG (e.g. `debug`, `hive_runner=trace`)
    #[arg(long, global = true)]
    log: Option<String>,

    /// Repository root (defaults to the current directory)
    #[arg(long, global = true)]
    repo: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create .hive/ with a default config and database
    Init,

    #[command(subcommand)]
    Outcome(OutcomeCmd),

    #[command(subcommand)]
    Task(TaskCmd),

    /// Run an outcome's capability and execution phases until they drain
    Run { outcome: String },

    #[command(subcommand)]
    Workers(WorkersCmd),

    /// Stop a worker; its task goes back to pending
    Stop { worker: String },

    /// Pause a worker
    Pause {
        worker: String,
        #[arg(long, default_value = "paused by operator")]
        reason: String,
    },

    /// Stop every active worker
    StopAll {
        #[arg(long)]
        outcome: Option<String>,
    },

    /// Queue a command for a worker's next iteration
    Intervene {
        worker: String,
        #[arg(long, value_parser = parse_intervention)]
        kind: InterventionKind,
        #[arg(long)]
        message: String,
    },

    /// Show a worker's recent progress entries
    Progress {
        worker: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
        /// Include captured agent output
        #[arg(long)]
        output: bool,
    },

    /// List supervisor alerts
    Alerts {
        #[arg(long)]
        worker: Option<String>,
        /// Include acknowledged and resolved alerts
        #[arg(long)]
        all: bool,
    },

    /// Acknowledge an alert
    Ack { alert: String },

    /// Release stale claims, mark silent workers failed, run the behaviour checks
    Sweep,

    /// Merge a worker's branch into trunk
    Merge {
        #[arg(long)]
        outcome: String,
        #[arg(long)]
        worker: String,
    },

    /// Undo the file changes of a worker's last supervised session
    Rollback { worker: String },
}

#[derive(Subcommand)]
enum OutcomeCmd {
    Create {
        #[arg(long)]
        name: String,
        /// Intent document, inline or a path to a file
        #[arg(long, default_value = "")]
        intent: String,
        #[arg(long, value_parser = parse_git_mode, default_value = "none")]
        git_mode: GitMode,
        #[arg(long)]
        auto_commit: bool,
        #[arg(long)]
        base_branch: Option<String>,
    },
    List,
    Show { outcome: String },
}

#[derive(Args)]
struct TaskAddArgs {
    #[arg(long)]
    outcome: String,
    #[arg(long)]
    title: String,
    #[arg(long, default_value = "")]
    description: String,
    #[arg(long, default_value_t = DEFAULT_PRIORITY)]
    priority: i64,
    #[arg(long, value_parser = parse_phase, default_value = "execution")]
    phase: TaskPhase,
    #[arg(long = "depends-on")]
    depends_on: Vec<String>,
    #[arg(long = "skill")]
    skills: Vec<String>,
    #[arg(long, default_value_t = DEFAULT_MAX_ATTEMPTS)]
    max_attempts: u32,
}

#[derive(Subcommand)]
enum TaskCmd {
    Add(TaskAddArgs),
    /// Create tasks from a YAML planner file
    Import {
        #[arg(long)]
        outcome: String,
        file: PathBuf,
    },
    List {
        #[arg(long)]
        outcome: String,
        #[arg(long, value_parser = parse_status)]
        status: Option<TaskStatus>,
    },
    /// Give a failed task a fresh attempt budget
    Retry { task: String },
}

#[derive(Subcommand)]
enum WorkersCmd {
    List {
        #[arg(long)]
        outcome: Option<String>,
    },
    Show { worker: String },
}

fn parse_phase(s: &str) -> Result<TaskPhase, String> {
    TaskPhase::parse_lenient(s).ok_or_else(|| format!("unknown phase `{s}`"))
}

fn parse_status(s: &str) -> Result<TaskStatus, String> {
    TaskStatus::parse(s).ok_or_else(|| format!("unknown status `{s}`"))
}

fn parse_git_mode(s: &str) -> Result<GitMode, String> {
    GitMode::parse(s).ok_or_else(|| format!("unknown git mode `{s}`"))
}

fn parse_intervention(s: &str) -> Result<InterventionKind, String> {
    InterventionKind::parse(s).ok_or_else(|| format!("unknown intervention `{s}`"))
}

fn init_tracing(log: Option<&str>) -> Result<()> {
    let filter = match log {
        Some(f) => EnvFilter::try_new(f).with_context(|| format!("invalid log filter {f}"))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
    Ok(())
}

fn print_task(t: &Task) {
    let deps = if t.depends_on.is_empty() {
        String::new()
    } else {
        format!(" after {}", t.depends_on.iter().map(|d| d.as_str()).collect::<Vec<_>>().join(","))
    };
    println!(
        "- {} [{} {}] p{} {}/{} {}{}",
        t.id, t.phase, t.status, t.priority, t.attempts, t.max_attempts, t.title, deps
    );
}

fn print_worker(w: &Worker) {
    let task = w.current_task_id.as_ref().map(|t| t.as_str()).unwrap_or("-");
    println!(
        "- {} [{} {}] iter {} task {} cost ${:.2} failures {}",
        w.id, w.phase, w.status, w.iteration, task, w.cost, w.consecutive_failures
    );
}

fn print_report(report: &RunReport) {
    for (phase, summaries) in [("capability", &report.capability), ("execution", &report.execution)] {
        for s in summaries {
            println!("{phase} worker {}: {:?}, {} completed, {} failed", s.worker_id, s.exit, s.completed, s.failed);
            if let Some(m) = &s.merge {
                println!("  merge {} -> {}: {}", m.source_branch, m.target_branch, m.status);
                for f in &m.conflict_files {
                    println!("    conflict: {f}");
                }
            }
        }
    }
    if let Some(block) = &report.blocked {
        println!("blocked: {block}");
    }
    if report.interrupted {
        println!("interrupted");
    } else if report.achieved {
        println!("outcome achieved");
    }
}

async fn run_outcome(orch: Arc<Orchestrator>, outcome_id: OutcomeId) -> Result<RunReport> {
    let (stop_tx, stop_rx) = watch::channel(false);
    let interrupt = tokio::spawn({
        let orch = orch.clone();
        let outcome_id = outcome_id.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, stopping workers");
                if let Err(e) = orch.stop_all(Some(&outcome_id)) {
                    warn!(error = %format!("{e:#}"), "stop-all failed");
                }
            }
        }
    });
    let work = async {
        let report = orch.run_outcome(&outcome_id).await;
        let _ = stop_tx.send(true);
        report
    };
    let (report, ()) = tokio::join!(work, orch.maintenance_loop(stop_rx));
    interrupt.abort();
    report
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log.as_deref())?;
    let repo_root = match cli.repo {
        Some(p) => p,
        None => std::env::current_dir()?,
    };

    if let Command::Init = cli.cmd {
        let cfg = Orchestrator::init_repo(&repo_root)?;
        println!("Initialized hive for {} in {}", cfg.project.id, repo_root.display());
        return Ok(());
    }
    let orch = Orchestrator::open(&repo_root)?;
    let store = orch.store().clone();

    match cli.cmd {
        Command::Init => unreachable!("handled above"),
        Command::Outcome(OutcomeCmd::Create { name, intent, git_mode, auto_commit, base_branch }) => {
            let intent_raw = match std::fs::read_to_string(&intent) {
                Ok(text) => text,
                Err(_) => intent,
            };
            let o = orch.create_outcome(NewOutcome {
                name,
                intent_raw,
                isolation: IsolationSettings { git_mode, auto_commit, base_branch },
            })?;
            println!("{}", o.id);
        }
        Command::Outcome(OutcomeCmd::List) => {
            for o in store.list_outcomes()? {
                let counts = store.task_counts(&o.id)?;
                println!("- {} [{}] {} ({}/{} tasks done)", o.id, o.status, o.name, counts.completed, counts.total());
            }
        }
        Command::Outcome(OutcomeCmd::Show { outcome }) => {
            let o = store.get_outcome(&OutcomeId::from_str(outcome))?;
            let counts = store.task_counts(&o.id)?;
            println!("{} [{}] {}", o.id, o.status, o.name);
            println!("readiness: {:?} (phase {})", o.capability_readiness, o.capability_readiness.active_phase());
            println!("isolation: {} auto_commit={}", o.isolation.git_mode, o.isolation.auto_commit);
            println!(
                "tasks: {} pending, {} claimed, {} running, {} completed, {} failed",
                counts.pending, counts.claimed, counts.running, counts.completed, counts.failed
            );
            let summary = o.intent.summary();
            if !summary.trim().is_empty() {
                println!("\n{}", summary.trim());
            }
        }
        Command::Task(TaskCmd::Add(a)) => {
            let new = NewTask::new(OutcomeId::from_str(a.outcome), a.title)
                .description(a.description)
                .priority(a.priority)
                .phase(a.phase)
                .depends_on(a.depends_on.into_iter().map(TaskId::from_str).collect())
                .required_skills(a.skills)
                .max_attempts(a.max_attempts);
            let t = orch.submit_task(new)?;
            print_task(&t);
            for sub in store.get_subtasks(&t.id)? {
                print!("  ");
                print_task(&sub);
            }
        }
        Command::Task(TaskCmd::Import { outcome, file }) => {
            let text = std::fs::read_to_string(&file).with_context(|| format!("read {}", file.display()))?;
            for t in orch.import_tasks(&OutcomeId::from_str(outcome), &text)? {
                print_task(&t);
            }
        }
        Command::Task(TaskCmd::List { outcome, status }) => {
            let outcome_id = OutcomeId::from_str(outcome);
            let tasks = match status {
                Some(s) => store.list_tasks_by_status(&outcome_id, s)?,
                None => store.get_tasks_by_outcome(&outcome_id)?,
            };
            for t in &tasks {
                print_task(t);
            }
        }
        Command::Task(TaskCmd::Retry { task }) => {
            print_task(&store.retry_task(&TaskId::from_str(task))?);
        }
        Command::Run { outcome } => {
            let report = run_outcome(Arc::new(orch), OutcomeId::from_str(outcome)).await?;
            print_report(&report);
        }
        Command::Workers(WorkersCmd::List { outcome }) => {
            let outcome_id = outcome.map(OutcomeId::from_str);
            for w in store.list_workers(outcome_id.as_ref())? {
                print_worker(&w);
            }
        }
        Command::Workers(WorkersCmd::Show { worker }) => {
            let w = store.get_worker(&WorkerId::from_str(worker))?;
            print_worker(&w);
            if let (Some(path), Some(branch)) = (&w.worktree_path, &w.branch_name) {
                println!("worktree: {path} ({branch})");
            }
            if let Some(pid) = w.pid {
                println!("pid: {pid}");
            }
            for a in store.list_alerts(Some(&w.id), true)? {
                println!("alert {} [{} {}] {}", a.id, a.kind, a.severity, a.message);
            }
        }
        Command::Stop { worker } => {
            orch.stop_worker(&WorkerId::from_str(worker))?;
            println!("stopped");
        }
        Command::Pause { worker, reason } => {
            orch.pause_worker(&WorkerId::from_str(worker), &reason)?;
            println!("paused");
        }
        Command::StopAll { outcome } => {
            let outcome_id = outcome.map(OutcomeId::from_str);
            let n = orch.stop_all(outcome_id.as_ref())?;
            println!("stopped {n} worker(s)");
        }
        Command::Intervene { worker, kind, message } => {
            let iv = orch.intervene(&WorkerId::from_str(worker), kind, &message)?;
            println!("{}", iv.id);
        }
        Command::Progress { worker, limit, output } => {
            for p in store.progress_tail(&WorkerId::from_str(worker), limit)? {
                let task = p.task_id.as_ref().map(|t| t.as_str()).unwrap_or("-");
                println!("#{} {} {}", p.iteration, task, p.content);
                if output {
                    if let Some(out) = &p.full_output {
                        println!("{}", out.trim_end());
                    }
                }
            }
        }
        Command::Alerts { worker, all } => {
            let worker_id = worker.map(WorkerId::from_str);
            for a in store.list_alerts(worker_id.as_ref(), !all)? {
                let paused = if a.auto_paused { " (auto-paused)" } else { "" };
                println!("- {} [{} {} {}] {} {}{}", a.id, a.status, a.severity, a.kind, a.worker_id, a.message, paused);
            }
        }
        Command::Ack { alert } => {
            let a = store.acknowledge_alert(&AlertId::from_str(alert))?;
            println!("{} {}", a.id, a.status);
        }
        Command::Sweep => {
            let r = orch.sweep()?;
            println!(
                "released {} task(s), failed {} worker(s), raised {} alert(s), resolved {}",
                r.released.len(),
                r.failed_workers.len(),
                r.behavior.raised.len(),
                r.behavior.resolved
            );
        }
        Command::Merge { outcome, worker } => {
            let m = orch.merge_worker(&OutcomeId::from_str(outcome), &WorkerId::from_str(worker))?;
            println!("{} -> {}: {}", m.source_branch, m.target_branch, m.status);
            if let Some(commit) = &m.merge_commit {
                println!("commit {commit}");
            }
            for f in &m.conflict_files {
                println!("conflict: {f}");
            }
            if let Some(e) = &m.error_message {
                return Err(anyhow!("merge failed: {e}"));
            }
        }
        Command::Rollback { worker } => {
            let r = orch.rollback_worker(&WorkerId::from_str(worker))?;
            println!("restored {}, removed {}, skipped {}", r.restored.len(), r.removed.len(), r.skipped.len());
        }
    }

    Ok(())
}
