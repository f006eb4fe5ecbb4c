use std::{collections::HashMap, path::PathBuf, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Issue,
    Spec,
    Custom,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    #[serde(default)]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self { timeout: None, max_retries: 0, env: HashMap::new() }
    }
}

/// One unit of agent work. Priority 0 is the highest; equal priorities run
/// in submission order.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub id: Uuid,
    pub kind: TaskKind,
    pub entity_id: Option<String>,
    pub prompt: String,
    /// Command line for the agent subprocess; the prompt goes to stdin.
    pub agent_command: String,
    pub work_dir: PathBuf,
    pub priority: i64,
    pub dependencies: Vec<Uuid>,
    pub config: TaskConfig,
    pub created_at: DateTime<Utc>,
}

impl TaskSpec {
    pub fn new(
        kind: TaskKind,
        prompt: impl Into<String>,
        agent_command: impl Into<String>,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            entity_id: None,
            prompt: prompt.into(),
            agent_command: agent_command.into(),
            work_dir: work_dir.into(),
            priority: 0,
            dependencies: Vec::new(),
            config: TaskConfig::default(),
            created_at: Utc::now(),
        }
    }

    pub fn depends_on(mut self, task_id: Uuid) -> Self {
        self.dependencies.push(task_id);
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_config(mut self, config: TaskConfig) -> Self {
        self.config = config;
        self
    }
}

/// Terminal outcome; only the final attempt is recorded.
#[derive(Debug, Clone, Serialize)]
pub struct TaskResult {
    pub task_id: Uuid,
    pub success: bool,
    pub exit_code: Option<i64>,
    pub output: String,
    pub metadata: Value,
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineMetrics {
    pub max_concurrent: usize,
    pub currently_running: usize,
    pub available_slots: usize,
    pub queued: usize,
    pub completed: u64,
    pub failed: u64,
    pub avg_duration_ms: f64,
    pub success_rate: f64,
    pub throughput_per_min: f64,
    pub processes_spawned: u64,
    pub processes_active: usize,
}
