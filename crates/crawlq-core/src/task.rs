use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Strategy-specific key/value context carried by tasks, results and found URLs.
pub type Options = serde_json::Map<String, serde_json::Value>;

/// Bookkeeping status of a crawl task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            _ => Err(format!("Unknown task status: {}", s)),
        }
    }
}

/// One unit of crawl work, as carried on the message queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub url: String,
    #[serde(default)]
    pub plan: String,
    #[serde(default)]
    pub depth: u32,
    /// Inclusive depth ceiling for this crawl.
    #[serde(default)]
    pub max_depth: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_url: Option<String>,
    #[serde(default)]
    pub options: Options,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
}

impl Task {
    /// Create a root task at depth 0.
    pub fn new(url: impl Into<String>, plan: impl Into<String>, max_depth: u32) -> Self {
        let now = Utc::now();
        Self {
            url: url.into(),
            plan: plan.into(),
            depth: 0,
            max_depth,
            parent_url: None,
            options: Options::new(),
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
            retry_count: 0,
        }
    }

    pub fn with_option(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }

    /// Decode a queue message body into a task that is safe to dispatch.
    ///
    /// Bodies that are not JSON, lack a URL, or violate `depth <= max_depth`
    /// are reported as [`AppError::MalformedMessage`].
    pub fn from_message(body: &[u8]) -> Result<Self, AppError> {
        let task: Task = serde_json::from_slice(body)
            .map_err(|e| AppError::MalformedMessage(e.to_string()))?;

        if task.url.trim().is_empty() {
            return Err(AppError::MalformedMessage("task has an empty url".into()));
        }
        if task.depth > task.max_depth {
            return Err(AppError::MalformedMessage(format!(
                "task depth {} exceeds max_depth {}",
                task.depth, task.max_depth
            )));
        }

        Ok(task)
    }

    /// Serialize the task into a queue message body.
    pub fn to_message(&self) -> Result<Vec<u8>, AppError> {
        Ok(serde_json::to_vec(self)?)
    }
}
