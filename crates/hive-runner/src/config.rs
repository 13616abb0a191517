use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use hive_core::Sensitivity;
use hive_decompose::DecomposeSettings;
use hive_supervisor::{BehaviorSettings, SupervisorSettings};
use serde::{Deserialize, Serialize};

use crate::agent::AgentSpec;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub project: ProjectConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub decomposition: DecompositionConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub git: GitConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub id: String,
    pub trunk: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Relative paths resolve against the repo root.
    pub root: String,
    pub worktrees_root: String,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self { root: ".hive/workspaces".into(), worktrees_root: "~/.hive/worktrees".into() }
    }
}

/// External coding agent. `{max_turns}`, `{task_file}`, `{progress_file}` and `{task_dir}`
/// in `args` are substituted per task.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub program: String,
    pub args: Vec<String>,
    pub max_turns: u32,
    pub subtask_max_turns: u32,
    pub timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub max_output_bytes: usize,
    pub pause_grace_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            program: "claude".into(),
            args: vec![
                "-p".into(),
                "Read {task_file} and complete the task it describes.".into(),
                "--max-turns".into(),
                "{max_turns}".into(),
            ],
            max_turns: 20,
            subtask_max_turns: 10,
            timeout_secs: 600,
            poll_interval_ms: 2_000,
            max_output_bytes: 512_000,
            pause_grace_ms: 2_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    pub max_capability_workers: usize,
    pub max_execution_workers: usize,
    pub heartbeat_interval_secs: u64,
    pub stale_after_secs: u64,
    pub idle_poll_ms: u64,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            max_capability_workers: 2,
            max_execution_workers: 3,
            heartbeat_interval_secs: 30,
            stale_after_secs: 300,
            idle_poll_ms: 2_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DecompositionConfig {
    pub enabled: bool,
    pub complexity_threshold: u8,
    pub max_subtasks: usize,
    pub bulk_max_subtasks: usize,
    /// Without a reasoner only the heuristic estimate runs and nothing is split.
    pub use_reasoner: bool,
    /// Defaults to the agent program.
    pub reasoner_program: Option<String>,
    pub reasoner_args: Vec<String>,
    pub reasoner_timeout_secs: u64,
}

impl Default for DecompositionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            complexity_threshold: 7,
            max_subtasks: 6,
            bulk_max_subtasks: 8,
            use_reasoner: true,
            reasoner_program: None,
            reasoner_args: vec!["-p".into(), "{prompt}".into()],
            reasoner_timeout_secs: 120,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub sensitivity: Sensitivity,
    pub scan_interval_ms: u64,
    pub window_secs: u64,
    pub tick_interval_secs: u64,
    pub stuck_after_secs: u64,
    pub no_progress_after_secs: u64,
    pub repeated_error_threshold: u32,
    pub max_snapshot_file_bytes: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            sensitivity: Sensitivity::Medium,
            scan_interval_ms: 1_000,
            window_secs: 5,
            tick_interval_secs: 30,
            stuck_after_secs: 600,
            no_progress_after_secs: 300,
            repeated_error_threshold: 3,
            max_snapshot_file_bytes: 100 * 1024,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    /// Queue a merge of the worker branch when a worker drains its queue.
    pub auto_merge: bool,
    pub remove_worktree_after_merge: bool,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self { auto_merge: true, remove_worktree_after_merge: true }
    }
}

fn secs_ms(secs: u64) -> i64 {
    (secs as i64).saturating_mul(1_000)
}

impl Config {
    pub fn default_for_repo(project_id: &str) -> Self {
        Self {
            project: ProjectConfig { id: project_id.to_string(), trunk: "main".to_string() },
            workspace: WorkspaceConfig::default(),
            agent: AgentConfig::default(),
            workers: WorkersConfig::default(),
            decomposition: DecompositionConfig::default(),
            supervisor: SupervisorConfig::default(),
            git: GitConfig::default(),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let cfg: Config = toml::from_str(&s).with_context(|| format!("parse {}", path.display()))?;
        Ok(cfg)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        let s = toml::to_string_pretty(self).context("serialize config")?;
        std::fs::write(path, s).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    pub fn config_path(repo_root: &Path) -> PathBuf {
        repo_root.join(".hive").join("hive.toml")
    }

    pub fn db_path(repo_root: &Path) -> PathBuf {
        repo_root.join(".hive").join("hive.db")
    }

    fn resolve(repo_root: &Path, configured: &str) -> PathBuf {
        let expanded = PathBuf::from(shellexpand::tilde(configured).to_string());
        if expanded.is_absolute() {
            expanded
        } else {
            repo_root.join(expanded)
        }
    }

    pub fn workspace_root(&self, repo_root: &Path) -> PathBuf {
        Self::resolve(repo_root, &self.workspace.root)
    }

    /// Worktrees are namespaced by project so several repos can share the root.
    pub fn worktrees_root(&self, repo_root: &Path) -> PathBuf {
        Self::resolve(repo_root, &self.workspace.worktrees_root).join(&self.project.id)
    }

    pub fn stale_after_ms(&self) -> i64 {
        secs_ms(self.workers.stale_after_secs)
    }

    pub fn agent_spec(&self) -> AgentSpec {
        AgentSpec {
            program: self.agent.program.clone(),
            args: self.agent.args.clone(),
            timeout: Duration::from_secs(self.agent.timeout_secs),
            poll_interval: Duration::from_millis(self.agent.poll_interval_ms.max(10)),
            max_output_bytes: self.agent.max_output_bytes,
            grace: Duration::from_millis(self.agent.pause_grace_ms),
        }
    }

    pub fn decompose_settings(&self) -> DecomposeSettings {
        DecomposeSettings {
            enabled: self.decomposition.enabled,
            complexity_threshold: self.decomposition.complexity_threshold,
            max_subtasks: self.decomposition.max_subtasks,
            bulk_max_subtasks: self.decomposition.bulk_max_subtasks,
            stale_after_ms: self.stale_after_ms(),
        }
    }

    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            sensitivity: self.supervisor.sensitivity,
            scan_interval_ms: self.supervisor.scan_interval_ms,
            window_ms: secs_ms(self.supervisor.window_secs),
            max_snapshot_file_bytes: self.supervisor.max_snapshot_file_bytes,
            ..Default::default()
        }
    }

    pub fn behavior_settings(&self) -> BehaviorSettings {
        BehaviorSettings {
            stuck_after_ms: secs_ms(self.supervisor.stuck_after_secs),
            no_progress_after_ms: secs_ms(self.supervisor.no_progress_after_secs),
            repeated_error_threshold: self.supervisor.repeated_error_threshold,
        }
    }
}
