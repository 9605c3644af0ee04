//! Git command wrapper (§10.P).
//!
//! Shells out to the system `git` binary. Retries transient failures
//! (index lock contention, a second git process) with exponential backoff.

use crate::error::{RasenError, RasenResult};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

const DEFAULT_MAX_RETRIES: u32 = 3;
const RETRY_BASE_DELAY_MS: u64 = 100;

#[derive(Debug, Clone)]
pub struct CommitInfo {
    pub hash: String,
    pub message: String,
}

pub struct GitRepo {
    working_dir: PathBuf,
    commit_prefix: String,
    max_retries: u32,
}

impl GitRepo {
    pub fn new(working_dir: impl AsRef<Path>, commit_prefix: impl Into<String>) -> Self {
        Self {
            working_dir: working_dir.as_ref().to_path_buf(),
            commit_prefix: commit_prefix.into(),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    fn run(&self, args: &[&str]) -> RasenResult<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.working_dir)
            .output()
            .map_err(|e| RasenError::git(format!("failed to execute git: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RasenError::git(format!("git {}: {}", args.join(" "), stderr.trim())));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn run_with_retry(&self, args: &[&str]) -> RasenResult<String> {
        let mut last_error = None;
        for attempt in 0..=self.max_retries {
            match self.run(args) {
                Ok(out) => return Ok(out),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let delay = RETRY_BASE_DELAY_MS * (1 << attempt);
                    std::thread::sleep(Duration::from_millis(delay));
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| RasenError::git("retries exhausted")))
    }

    pub fn current_commit(&self) -> RasenResult<String> {
        self.run(&["rev-parse", "--short", "HEAD"])
    }

    pub fn has_uncommitted_changes(&self) -> RasenResult<bool> {
        Ok(!self.run(&["status", "--porcelain"])?.is_empty())
    }

    pub fn recent_commits(&self, count: usize) -> RasenResult<Vec<CommitInfo>> {
        let output = self.run(&["log", "--format=%h|%s", &format!("-{count}")])?;
        Ok(output
            .lines()
            .filter_map(|line| {
                let (hash, message) = line.split_once('|')?;
                Some(CommitInfo {
                    hash: hash.to_string(),
                    message: message.to_string(),
                })
            })
            .collect())
    }

    /// Stages everything and commits with the configured prefix. Returns
    /// `Ok(None)` rather than erroring when there is nothing to commit, so
    /// callers can treat a no-op session uniformly.
    pub fn commit_all(&self, subtask_id: &str, summary: &str) -> RasenResult<Option<String>> {
        self.run_with_retry(&["add", "-A"])?;
        if !self.has_uncommitted_changes()? {
            return Ok(None);
        }
        let message = format!("{} {subtask_id}: {summary}", self.commit_prefix);
        self.run_with_retry(&["commit", "-m", &message])?;
        Ok(Some(self.current_commit()?))
    }

    pub fn rollback_soft(&self, commit_hash: &str) -> RasenResult<()> {
        self.run(&["cat-file", "-t", commit_hash])?;
        self.run_with_retry(&["reset", "--soft", commit_hash])?;
        Ok(())
    }

    pub fn commits_since(&self, since_commit: &str) -> RasenResult<usize> {
        let output = self.run(&["rev-list", "--count", &format!("{since_commit}..HEAD")])?;
        output
            .parse()
            .map_err(|_| RasenError::git("failed to parse commit count"))
    }

    /// Text diff of everything changed since `since_commit`, for injection
    /// into reviewer/QA prompts.
    pub fn diff_since(&self, since_commit: &str) -> RasenResult<String> {
        self.run(&["diff", since_commit, "HEAD"])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, GitRepo) {
        let dir = tempdir().unwrap();
        Command::new("git").args(["init"]).current_dir(dir.path()).output().unwrap();
        Command::new("git")
            .args(["config", "user.email", "test@test.com"])
            .current_dir(dir.path())
            .output()
            .unwrap();
        Command::new("git")
            .args(["config", "user.name", "Test"])
            .current_dir(dir.path())
            .output()
            .unwrap();
        std::fs::write(dir.path().join("README.md"), "init").unwrap();
        Command::new("git").args(["add", "."]).current_dir(dir.path()).output().unwrap();
        Command::new("git")
            .args(["commit", "-m", "initial"])
            .current_dir(dir.path())
            .output()
            .unwrap();
        let repo = GitRepo::new(dir.path(), "[rasen]");
        (dir, repo)
    }

    #[test]
    fn commit_all_returns_none_when_clean() {
        let (_dir, repo) = setup();
        assert!(repo.commit_all("t1", "nothing changed").unwrap().is_none());
    }

    #[test]
    fn commit_all_commits_and_prefixes_message() {
        let (dir, repo) = setup();
        std::fs::write(dir.path().join("feature.txt"), "content").unwrap();
        let hash = repo.commit_all("t1", "added feature").unwrap();
        assert!(hash.is_some());
        let commits = repo.recent_commits(1).unwrap();
        assert!(commits[0].message.starts_with("[rasen] t1:"));
    }

    #[test]
    fn commits_since_counts_new_commits() {
        let (dir, repo) = setup();
        let base = repo.current_commit().unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        repo.commit_all("t1", "a").unwrap();
        std::fs::write(dir.path().join("b.txt"), "b").unwrap();
        repo.commit_all("t1", "b").unwrap();
        assert_eq!(repo.commits_since(&base).unwrap(), 2);
    }

    #[test]
    fn diff_since_contains_changed_content() {
        let (dir, repo) = setup();
        let base = repo.current_commit().unwrap();
        std::fs::write(dir.path().join("feature.txt"), "new content").unwrap();
        repo.commit_all("t1", "added feature").unwrap();

        let diff = repo.diff_since(&base).unwrap();
        assert!(diff.contains("feature.txt"));
        assert!(diff.contains("new content"));
    }
}
