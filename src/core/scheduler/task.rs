use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::warn;

use super::cron::{parse_schedule, parse_timezone};
use crate::core::queue::ValidationError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskAction {
    Message {
        agent: String,
        message: String,
    },
    Heartbeat {
        agent: String,
    },
    Command {
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<PathBuf>,
    },
}

impl TaskAction {
    pub fn kind(&self) -> &'static str {
        match self {
            TaskAction::Message { .. } => "message",
            TaskAction::Heartbeat { .. } => "heartbeat",
            TaskAction::Command { .. } => "command",
        }
    }
}

/// Where the result of a task should be delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyTo {
    pub channel: String,
    pub destination: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    #[serde(default)]
    pub name: String,
    pub schedule: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub action: TaskAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplyTo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    /// Fields this version does not know about, written back untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
    #[serde(skip)]
    pub path: PathBuf,
}

fn default_enabled() -> bool {
    true
}

fn require(field: &str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::new(field, "must not be empty"));
    }
    Ok(())
}

impl Task {
    pub fn validate(&self) -> Result<(), ValidationError> {
        require("name", &self.name)?;
        if let Err(e) = parse_schedule(&self.schedule) {
            return Err(ValidationError::new("schedule", e.to_string()));
        }
        if let Err(e) = parse_timezone(self.timezone.as_deref()) {
            return Err(ValidationError::new("timezone", e.to_string()));
        }
        match &self.action {
            TaskAction::Message { agent, message } => {
                require("action.agent", agent)?;
                require("action.message", message)?;
            }
            TaskAction::Heartbeat { agent } => require("action.agent", agent)?,
            TaskAction::Command { command, .. } => require("action.command", command)?,
        }
        if let Some(reply) = &self.reply_to {
            require("replyTo.channel", &reply.channel)?;
            require("replyTo.destination", &reply.destination)?;
        }
        Ok(())
    }

    pub fn tz(&self) -> Tz {
        parse_timezone(self.timezone.as_deref()).unwrap_or(Tz::UTC)
    }

    /// Rewrite the task file via temp file + rename.
    pub async fn persist(&self) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("Failed to write {:?}", tmp))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("Failed to replace {:?}", self.path))?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct LoadedTasks {
    pub tasks: Vec<Task>,
    pub error_count: usize,
}

async fn parse_task_file(path: &Path) -> Result<Task> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {:?}", path))?;
    let mut task: Task = serde_json::from_str(&raw)?;
    task.path = path.to_path_buf();
    if task.name.trim().is_empty()
        && let Some(stem) = path.file_stem()
    {
        task.name = stem.to_string_lossy().into_owned();
    }
    task.validate()?;
    Ok(task)
}

/// Read every `*.json` task file in `dir`, sorted by file name. Unreadable
/// or invalid files are logged and counted, never fatal.
pub async fn load_tasks(dir: &Path) -> Result<LoadedTasks> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(LoadedTasks::default()),
        Err(e) => return Err(e).with_context(|| format!("Failed to list tasks in {:?}", dir)),
    };

    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "json") && path.is_file() {
            paths.push(path);
        }
    }
    paths.sort();

    let mut loaded = LoadedTasks::default();
    for path in paths {
        match parse_task_file(&path).await {
            Ok(task) => loaded.tasks.push(task),
            Err(e) => {
                warn!("[scheduler] Skipping task file {:?}: {}", path, e);
                loaded.error_count += 1;
            }
        }
    }
    Ok(loaded)
}
