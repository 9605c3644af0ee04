//! Agent session runner (§4.H).
//!
//! Spawns the external coding assistant as a child process, writes the
//! prompt to its stdin, and drains stdout/stderr concurrently so neither
//! stream can block the child on a full pipe buffer while the other is
//! still being read.

use crate::error::{RasenError, RasenResult};
use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::time::timeout;

/// A source of agent sessions. The production implementation spawns a real
/// child process (`SessionRunner`); tests substitute a scripted fake so the
/// Main Loop and sub-loops can be exercised without an external LLM binary.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(
        &self,
        prompt: &str,
        cwd: &Path,
        timeout_duration: Duration,
        model: Option<&str>,
    ) -> RasenResult<SessionRunResult>;
}

#[derive(Debug, Clone)]
pub struct SessionRunResult {
    pub session_id: String,
    pub exit_code: Option<i32>,
    pub stdout_text: String,
    pub stderr_text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

pub struct SessionRunner {
    /// Path or name of the coding assistant binary.
    binary: String,
    /// Env var name prefix scanned for in shell init files (e.g. `"RASEN_"`).
    env_prefix: String,
    debug_log_dir: Option<std::path::PathBuf>,
}

impl SessionRunner {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            env_prefix: "RASEN_".to_string(),
            debug_log_dir: None,
        }
    }

    pub fn with_debug_log_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.debug_log_dir = Some(dir.as_ref().to_path_buf());
        self
    }
}

#[async_trait]
impl AgentRunner for SessionRunner {
    async fn run(
        &self,
        prompt: &str,
        cwd: &Path,
        timeout_duration: Duration,
        model: Option<&str>,
    ) -> RasenResult<SessionRunResult> {
        let session_id = uuid::Uuid::new_v4().to_string();

        let mut command = Command::new(&self.binary);
        command
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(model) = model {
            command.arg("--model").arg(model);
        }

        for (name, value) in scan_shell_env(&self.env_prefix) {
            command.env(name, value);
        }

        let mut child = command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RasenError::RunnerUnavailable(self.binary.clone())
            } else {
                RasenError::Session(format!("failed to spawn {}: {e}", self.binary))
            }
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(prompt.as_bytes()).await;
        }

        let raw_stdout = Arc::new(Mutex::new(String::new()));
        let raw_stderr = Arc::new(Mutex::new(String::new()));
        let mut handles = Vec::new();

        if let Some(stdout) = child.stdout.take() {
            let buffer = Arc::clone(&raw_stdout);
            handles.push(tokio::spawn(async move {
                capture_output(stdout, &buffer).await;
            }));
        }
        if let Some(stderr) = child.stderr.take() {
            let buffer = Arc::clone(&raw_stderr);
            handles.push(tokio::spawn(async move {
                capture_output(stderr, &buffer).await;
            }));
        }

        // Bound the wait on the child itself first: a hung child that keeps
        // its pipes open must not let the drain tasks block this function
        // forever ahead of the timeout.
        let wait_result = timeout(timeout_duration, child.wait()).await;

        let exit_status = match wait_result {
            Ok(status) => status.map_err(|e| RasenError::Session(e.to_string()))?,
            Err(_) => {
                let _ = child.kill().await;
                for handle in handles {
                    handle.abort();
                }
                return Err(RasenError::SessionTimeout {
                    session_id,
                    timeout_seconds: timeout_duration.as_secs(),
                });
            }
        };

        // The child has exited, so its stdout/stderr pipes are closed and
        // the drain tasks should reach EOF promptly. Bound the join anyway,
        // aborting any reader that is somehow still wedged, so it can never
        // leak past this call.
        for handle in handles {
            let abort = handle.abort_handle();
            if timeout(Duration::from_secs(5), handle).await.is_err() {
                abort.abort();
            }
        }

        let raw_stdout = raw_stdout.lock().unwrap().clone();
        let stderr_text = raw_stderr.lock().unwrap().clone();

        if let Some(dir) = &self.debug_log_dir {
            let _ = std::fs::create_dir_all(dir);
            let _ = std::fs::write(dir.join(format!("{session_id}.stdout.log")), &raw_stdout);
            let _ = std::fs::write(dir.join(format!("{session_id}.stderr.log")), &stderr_text);
        }

        let (stdout_text, input_tokens, output_tokens, total_tokens) = assemble_output(&raw_stdout);

        Ok(SessionRunResult {
            session_id,
            exit_code: exit_status.code(),
            stdout_text,
            stderr_text,
            input_tokens,
            output_tokens,
            total_tokens,
        })
    }
}

async fn capture_output<R>(reader: R, buffer: &Arc<Mutex<String>>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if let Ok(mut guard) = buffer.lock() {
            guard.push_str(&line);
            guard.push('\n');
        }
    }
}

/// Opportunistically parses each line of raw output as JSON, assembling the
/// textual transcript from `result`-typed lines and summing token usage
/// from `assistant`-typed `message.usage` records. Lines that are not JSON
/// (or that don't match the recognized envelope) are passed through as-is.
fn assemble_output(raw: &str) -> (String, u64, u64, u64) {
    let mut assembled = String::new();
    let mut saw_json = false;
    let mut input_tokens = 0u64;
    let mut output_tokens = 0u64;

    for line in raw.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        match serde_json::from_str::<Value>(trimmed) {
            Ok(value) => {
                saw_json = true;
                match value.get("type").and_then(Value::as_str) {
                    Some("assistant") => {
                        if let Some(usage) = value.pointer("/message/usage") {
                            let input = usage.get("input_tokens").and_then(Value::as_u64).unwrap_or(0);
                            let cache_creation = usage
                                .get("cache_creation_input_tokens")
                                .and_then(Value::as_u64)
                                .unwrap_or(0);
                            let cache_read = usage
                                .get("cache_read_input_tokens")
                                .and_then(Value::as_u64)
                                .unwrap_or(0);
                            input_tokens = input + cache_creation + cache_read;
                            output_tokens = usage.get("output_tokens").and_then(Value::as_u64).unwrap_or(0);
                        }
                    }
                    Some("result") => {
                        if let Some(result) = value.get("result").and_then(Value::as_str) {
                            assembled.push_str(result);
                            assembled.push('\n');
                        }
                    }
                    _ => {}
                }
            }
            Err(_) => {
                assembled.push_str(line);
                assembled.push('\n');
            }
        }
    }

    let text = if saw_json { assembled } else { raw.to_string() };
    let total = input_tokens + output_tokens;
    (text, input_tokens, output_tokens, total)
}

/// Scans common shell init files for `export NAME=value` lines whose name
/// starts with `prefix`, for merging into the child's environment. Does not
/// override values already set in the current process environment.
fn scan_shell_env(prefix: &str) -> Vec<(String, String)> {
    let Some(home) = dirs_home() else {
        return Vec::new();
    };

    let candidates = [".bashrc", ".zshrc", ".profile", ".bash_profile"];
    let mut found = Vec::new();

    for name in candidates {
        let path = home.join(name);
        let Ok(content) = std::fs::read_to_string(&path) else {
            continue;
        };
        for line in content.lines() {
            let line = line.trim();
            let Some(rest) = line.strip_prefix("export ") else {
                continue;
            };
            let Some((key, value)) = rest.split_once('=') else {
                continue;
            };
            let key = key.trim();
            if !key.starts_with(prefix) {
                continue;
            }
            if std::env::var(key).is_ok() {
                continue;
            }
            let value = value.trim().trim_matches('"').trim_matches('\'');
            found.push((key.to_string(), value.to_string()));
        }
    }

    found
}

fn dirs_home() -> Option<std::path::PathBuf> {
    std::env::var_os("HOME").map(std::path::PathBuf::from)
}
