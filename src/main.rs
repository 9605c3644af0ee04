//! Entry point: parses the CLI, loads layered configuration, and dispatches
//! into the daemon lifecycle or the Main Loop.

use clap::Parser;
use rasen::cli::{Cli, Command};
use rasen::config::Config;
use rasen::daemon;
use rasen::error::{RasenError, RasenResult};
use rasen::main_loop::MainLoop;
use rasen::session_runner::SessionRunner;
use rasen::store::{MetricsStore, StatusStore};
use std::path::Path;
use std::time::Duration;
use tracing::{error, info};

const AGENT_BINARY_ENV: &str = "RASEN_AGENT_BINARY";
const DEFAULT_AGENT_BINARY: &str = "claude";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("rasen=info".parse().unwrap()))
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        error!(error = %e, "rasen exited with an error");
        eprintln!("{}", e.to_structured());
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> RasenResult<()> {
    let project_dir = cli.project_dir.canonicalize().unwrap_or(cli.project_dir);
    let state_dir = project_dir.join(".rasen");
    std::fs::create_dir_all(&state_dir)?;

    let project_config = project_dir.join("rasen.yml");
    let task_config = state_dir.join("config.yaml");
    let config = Config::load(Some(&project_config), Some(&task_config))?;

    match cli.command {
        Command::Init { task } => init_task(&project_dir, &state_dir, config, &task).await,
        Command::Run {
            background,
            skip_review,
            skip_qa,
        } => run_orchestrator(&project_dir, &state_dir, config, skip_review, skip_qa, background).await,
        Command::Resume { background } => {
            run_orchestrator(&project_dir, &state_dir, config, false, false, background).await
        }
        Command::Status => show_status(&state_dir),
        Command::Logs { follow, lines } => show_logs(&state_dir, follow, lines),
        Command::Stop { force } => stop_daemon(&state_dir, force),
        Command::Reinit {
            task,
            keep_progress,
            force,
        } => reinit_task(&project_dir, &state_dir, config, task, keep_progress, force).await,
        Command::Merge => merge_worktree(&project_dir),
    }
}

fn session_runner() -> SessionRunner {
    let binary = std::env::var(AGENT_BINARY_ENV).unwrap_or_else(|_| DEFAULT_AGENT_BINARY.to_string());
    SessionRunner::new(binary)
}

async fn init_task(project_dir: &Path, state_dir: &Path, config: Config, task: &str) -> RasenResult<()> {
    let runner = session_runner();
    let shutdown = daemon::install_shutdown_handler()?;
    let mut loop_ = MainLoop::new(config, project_dir, state_dir, runner, shutdown);
    loop_.initialize(task).await?;
    std::fs::write(state_dir.join("task.txt"), task)?;
    println!("Initialized task: {task}");
    Ok(())
}

async fn run_orchestrator(
    project_dir: &Path,
    state_dir: &Path,
    mut config: Config,
    skip_review: bool,
    skip_qa: bool,
    background: bool,
) -> RasenResult<()> {
    if skip_review {
        config.review.enabled = false;
    }
    if skip_qa {
        config.qa.enabled = false;
    }

    let pid_file = daemon::default_pid_file(state_dir);
    if background {
        let log_file = daemon::default_log_file(state_dir);
        daemon::daemonize(&pid_file, &log_file, project_dir)?;
    } else {
        daemon::write_pid_file(&pid_file)?;
    }

    let shutdown = daemon::install_shutdown_handler()?;
    let runner = session_runner();
    let mut loop_ = MainLoop::new(config, project_dir, state_dir, runner, shutdown);

    let task_description = read_task_description(state_dir)?;
    let result = loop_.run(&task_description).await;
    daemon::remove_pid_file(&pid_file);

    match result {
        Ok(reason) => {
            info!(?reason, "orchestration loop finished");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

fn read_task_description(state_dir: &Path) -> RasenResult<String> {
    let path = state_dir.join("task.txt");
    std::fs::read_to_string(path).map_err(|_| RasenError::NoPlan)
}

async fn reinit_task(
    project_dir: &Path,
    state_dir: &Path,
    config: Config,
    task: Option<String>,
    keep_progress: bool,
    force: bool,
) -> RasenResult<()> {
    let pid_file = daemon::default_pid_file(state_dir);
    if !force {
        if let Some(pid) = daemon::read_pid_file(&pid_file) {
            if daemon::is_process_running(pid) {
                return Err(RasenError::Daemon(format!(
                    "orchestrator is running (PID {pid}); stop it first or pass --force"
                )));
            }
        }
    }

    if !keep_progress {
        let plan_path = state_dir.join("state.json");
        let _ = std::fs::remove_file(plan_path);
    }

    let Some(task) = task else {
        println!("Progress reset; no new task description given, plan will need `rasen init --task`.");
        return Ok(());
    };

    init_task(project_dir, state_dir, config, &task).await
}

fn show_status(state_dir: &Path) -> RasenResult<()> {
    let status_store = StatusStore::new(state_dir.join("status.json"));
    match status_store.load()? {
        Some(status) => {
            println!("phase: {}", status.current_phase);
            println!("status: {}", status.status);
            println!("iteration: {}", status.iteration);
            println!(
                "subtasks: {}/{} completed",
                status.completed_subtasks, status.total_subtasks
            );
            if let Some(id) = &status.subtask_id {
                println!("current subtask: {id}");
            }
            println!("commits: {}", status.total_commits);
        }
        None => println!("status: not started"),
    }

    let metrics_store = MetricsStore::new(state_dir);
    let aggregate = metrics_store.aggregate();
    println!(
        "sessions: {} ({} tokens)",
        aggregate.total_sessions, aggregate.total_tokens
    );
    Ok(())
}

fn show_logs(state_dir: &Path, follow: bool, lines: usize) -> RasenResult<()> {
    let log_file = daemon::default_log_file(state_dir);
    if !log_file.exists() {
        println!("no logs available yet at {}", log_file.display());
        return Ok(());
    }

    print_tail(&log_file, lines)?;

    if follow {
        let mut last_len = std::fs::metadata(&log_file)?.len();
        loop {
            std::thread::sleep(Duration::from_millis(500));
            let len = std::fs::metadata(&log_file)?.len();
            if len > last_len {
                let mut file = std::fs::File::open(&log_file)?;
                use std::io::{Read, Seek, SeekFrom};
                file.seek(SeekFrom::Start(last_len))?;
                let mut buf = String::new();
                file.read_to_string(&mut buf)?;
                print!("{buf}");
                last_len = len;
            }
        }
    }
    Ok(())
}

fn print_tail(path: &Path, lines: usize) -> RasenResult<()> {
    let content = std::fs::read_to_string(path)?;
    let all_lines: Vec<&str> = content.lines().collect();
    let start = all_lines.len().saturating_sub(lines);
    for line in &all_lines[start..] {
        println!("{line}");
    }
    Ok(())
}

fn stop_daemon(state_dir: &Path, force: bool) -> RasenResult<()> {
    let pid_file = daemon::default_pid_file(state_dir);
    let timeout = if force { Duration::from_secs(0) } else { Duration::from_secs(30) };
    let stopped = daemon::stop_daemon(&pid_file, timeout)?;
    if stopped {
        println!("orchestrator stopped");
    } else {
        println!("orchestrator was not running");
    }
    Ok(())
}

fn merge_worktree(project_dir: &Path) -> RasenResult<()> {
    let git = rasen::git::GitRepo::new(project_dir, "[rasen]");
    if git.has_uncommitted_changes()? {
        return Err(RasenError::Git(
            "working tree has uncommitted changes; commit or stash before merging".to_string(),
        ));
    }
    println!("worktree is clean and ready to merge");
    Ok(())
}
