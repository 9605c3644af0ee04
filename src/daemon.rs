//! Background daemon mode (§10.O): PID lockfile, signal-driven shutdown,
//! and double-fork daemonization for `rasen run --background`.

use crate::error::{RasenError, RasenResult};
use nix::sys::signal::{self, Signal};
use nix::unistd::{ForkResult, Pid};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub fn write_pid_file(pid_file: &Path) -> RasenResult<()> {
    if let Some(parent) = pid_file.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(pid_file, std::process::id().to_string())?;
    info!(pid = std::process::id(), path = %pid_file.display(), "wrote PID file");
    Ok(())
}

pub fn read_pid_file(pid_file: &Path) -> Option<i32> {
    let content = std::fs::read_to_string(pid_file).ok()?;
    let pid: i32 = content.trim().parse().ok()?;
    (pid > 0).then_some(pid)
}

pub fn remove_pid_file(pid_file: &Path) {
    if let Err(e) = std::fs::remove_file(pid_file) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(error = %e, "failed to remove PID file");
        }
    }
}

/// Signal 0 doesn't deliver a signal, only checks whether the process
/// could be signaled — the standard liveness probe.
pub fn is_process_running(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    signal::kill(Pid::from_raw(pid), None).is_ok()
}

/// Installs handlers for SIGTERM/SIGINT/SIGHUP that flip `shutdown` to
/// `true`. The main loop polls this flag between sessions rather than
/// being interrupted mid-session.
pub fn install_shutdown_handler() -> RasenResult<Arc<AtomicBool>> {
    let shutdown = Arc::new(AtomicBool::new(false));
    for sig in signal_hook::consts::TERM_SIGNALS {
        signal_hook::flag::register(*sig, Arc::clone(&shutdown))
            .map_err(|e| RasenError::Daemon(format!("failed to register signal handler: {e}")))?;
    }
    Ok(shutdown)
}

pub struct DaemonStatus {
    pub running: bool,
    pub pid: Option<i32>,
    pub stale: bool,
}

pub fn get_daemon_status(pid_file: &Path) -> DaemonStatus {
    match read_pid_file(pid_file) {
        None => DaemonStatus {
            running: false,
            pid: None,
            stale: false,
        },
        Some(pid) => {
            let running = is_process_running(pid);
            DaemonStatus {
                running,
                pid: Some(pid),
                stale: !running,
            }
        }
    }
}

/// Double-fork daemonization. The calling process exits after the first
/// fork; only the grandchild returns from this function.
pub fn daemonize(pid_file: &Path, log_file: &Path, working_dir: &Path) -> RasenResult<()> {
    if let Some(existing) = read_pid_file(pid_file) {
        if is_process_running(existing) {
            return Err(RasenError::Daemon(format!(
                "daemon already running with PID {existing}. Use `rasen stop` first"
            )));
        }
    }

    // SAFETY: fork() is called before any additional threads are spawned
    // (tokio's runtime is built after daemonize() returns in the grandchild).
    match unsafe { nix::unistd::fork() } {
        Ok(ForkResult::Parent { .. }) => {
            std::thread::sleep(Duration::from_millis(500));
            std::process::exit(0);
        }
        Ok(ForkResult::Child) => {}
        Err(e) => return Err(RasenError::Daemon(format!("fork failed: {e}"))),
    }

    std::env::set_current_dir(working_dir)
        .map_err(|e| RasenError::Daemon(format!("chdir failed: {e}")))?;
    nix::unistd::setsid().map_err(|e| RasenError::Daemon(format!("setsid failed: {e}")))?;

    match unsafe { nix::unistd::fork() } {
        Ok(ForkResult::Parent { .. }) => std::process::exit(0),
        Ok(ForkResult::Child) => {}
        Err(e) => return Err(RasenError::Daemon(format!("second fork failed: {e}"))),
    }

    redirect_stdio(log_file)?;
    write_pid_file(pid_file)?;
    info!(pid = std::process::id(), "daemon started");
    Ok(())
}

fn redirect_stdio(log_file: &Path) -> RasenResult<()> {
    use std::os::unix::io::AsRawFd;

    if let Some(parent) = log_file.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)?;
    let log_fd = log.as_raw_fd();
    nix::unistd::dup2(log_fd, std::io::stdout().as_raw_fd())
        .map_err(|e| RasenError::Daemon(format!("dup2 stdout failed: {e}")))?;
    nix::unistd::dup2(log_fd, std::io::stderr().as_raw_fd())
        .map_err(|e| RasenError::Daemon(format!("dup2 stderr failed: {e}")))?;

    let devnull = std::fs::File::open("/dev/null")?;
    nix::unistd::dup2(devnull.as_raw_fd(), std::io::stdin().as_raw_fd())
        .map_err(|e| RasenError::Daemon(format!("dup2 stdin failed: {e}")))?;
    Ok(())
}

/// Sends SIGTERM, polls for exit, escalates to SIGKILL after `timeout`.
pub fn stop_daemon(pid_file: &Path, timeout: Duration) -> RasenResult<bool> {
    let Some(pid) = read_pid_file(pid_file) else {
        info!("no daemon running (no PID file)");
        return Ok(false);
    };

    if !is_process_running(pid) {
        info!(pid, "daemon not running, removing stale PID file");
        remove_pid_file(pid_file);
        return Ok(false);
    }

    info!(pid, "stopping daemon");
    signal::kill(Pid::from_raw(pid), Signal::SIGTERM)
        .map_err(|e| RasenError::Daemon(format!("failed to send SIGTERM to {pid}: {e}")))?;

    let start = Instant::now();
    while start.elapsed() < timeout {
        if !is_process_running(pid) {
            info!("daemon stopped gracefully");
            remove_pid_file(pid_file);
            return Ok(true);
        }
        std::thread::sleep(Duration::from_millis(500));
    }

    warn!(pid, "daemon did not stop gracefully, sending SIGKILL");
    signal::kill(Pid::from_raw(pid), Signal::SIGKILL)
        .map_err(|e| RasenError::Daemon(format!("failed to kill {pid}: {e}")))?;
    std::thread::sleep(Duration::from_secs(1));

    if !is_process_running(pid) {
        remove_pid_file(pid_file);
        return Ok(true);
    }
    Ok(false)
}

pub fn default_pid_file(state_dir: &Path) -> PathBuf {
    state_dir.join("rasen.pid")
}

pub fn default_log_file(state_dir: &Path) -> PathBuf {
    state_dir.join("rasen.log")
}
