use rasen::config::Config;
use rasen::models::{ImplementationPlan, Subtask};
use rasen::store::PlanStore;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

pub struct Fixture {
    pub dir: TempDir,
}

impl Fixture {
    pub fn project_dir(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }

    pub fn state_dir(&self) -> PathBuf {
        self.dir.path().join(".rasen")
    }
}

pub fn setup() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let run = |args: &[&str]| {
        Command::new("git").args(args).current_dir(dir.path()).output().unwrap();
    };
    run(&["init"]);
    run(&["config", "user.email", "test@test.com"]);
    run(&["config", "user.name", "Test"]);
    std::fs::write(dir.path().join("README.md"), "init").unwrap();
    run(&["add", "."]);
    run(&["commit", "-m", "initial"]);

    std::fs::create_dir_all(dir.path().join(".rasen")).unwrap();
    Fixture { dir }
}

pub fn default_config() -> Config {
    let mut config = Config::load(None, None).unwrap();
    config.orchestrator.session_delay_seconds = 0;
    config.orchestrator.session_timeout_seconds = 30;
    config
}

pub fn seed_plan(state_dir: &Path, subtask_ids: &[&str]) {
    let mut plan = ImplementationPlan::new("test task");
    for id in subtask_ids {
        plan.subtasks.push(Subtask::new(*id, format!("implement {id}")));
    }
    PlanStore::new(state_dir).save(plan).unwrap();
}

pub fn commit_change(project_dir: &Path, file_name: &str, content: &str) {
    std::fs::write(project_dir.join(file_name), content).unwrap();
    Command::new("git")
        .args(["add", "-A"])
        .current_dir(project_dir)
        .output()
        .unwrap();
    Command::new("git")
        .args(["commit", "-m", "agent change"])
        .current_dir(project_dir)
        .output()
        .unwrap();
}
