use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::core::heartbeat::ActiveHours;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid config field `{field}`: {reason}")]
    Invalid { field: String, reason: String },
}

fn invalid(field: impl Into<String>, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field: field.into(),
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Agent that receives messages with no explicit target.
    #[serde(default)]
    pub default_agent: Option<String>,

    #[serde(default)]
    pub queue_dir: Option<PathBuf>,

    #[serde(default)]
    pub tasks_dir: Option<PathBuf>,

    #[serde(default)]
    pub daemon: DaemonSettings,

    #[serde(default)]
    pub crash_guard: CrashGuardSettings,

    #[serde(default)]
    pub agents: Vec<AgentConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DaemonSettings {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_scheduler_interval_secs")]
    pub scheduler_interval_secs: u64,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    #[serde(default = "default_stream_throttle_ms")]
    pub stream_throttle_ms: u64,
    #[serde(default = "default_dedupe_ttl_secs")]
    pub dedupe_ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CrashGuardSettings {
    #[serde(default = "default_max_crashes")]
    pub max_crashes: usize,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub working_dir: PathBuf,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Appended on every run except right after a reset signal.
    #[serde(default)]
    pub continue_args: Vec<String>,
    #[serde(default = "default_true")]
    pub streaming: bool,
    #[serde(default)]
    pub channel: Option<ChannelConfig>,
    #[serde(default)]
    pub heartbeat: Option<HeartbeatConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Telegram,
    Discord,
}

impl ChannelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelKind::Telegram => "telegram",
            ChannelKind::Discord => "discord",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "telegram" => Some(ChannelKind::Telegram),
            "discord" => Some(ChannelKind::Discord),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    pub kind: ChannelKind,
    pub token: String,
    /// Sender ids allowed to talk to this agent. Empty means everyone.
    #[serde(default)]
    pub allowed_senders: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatConfig {
    pub interval_minutes: u64,
    #[serde(default = "default_heartbeat_prompt_file")]
    pub prompt_file: PathBuf,
    #[serde(default)]
    pub active_hours: Option<ActiveHours>,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_scheduler_interval_secs() -> u64 {
    30
}
fn default_shutdown_grace_secs() -> u64 {
    10
}
fn default_stream_throttle_ms() -> u64 {
    1500
}
fn default_dedupe_ttl_secs() -> u64 {
    600
}
fn default_max_crashes() -> usize {
    5
}
fn default_window_secs() -> u64 {
    300
}
fn default_true() -> bool {
    true
}
fn default_heartbeat_prompt_file() -> PathBuf {
    PathBuf::from("heartbeat.md")
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            scheduler_interval_secs: default_scheduler_interval_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            stream_throttle_ms: default_stream_throttle_ms(),
            dedupe_ttl_secs: default_dedupe_ttl_secs(),
        }
    }
}

impl Default for CrashGuardSettings {
    fn default() -> Self {
        Self {
            max_crashes: default_max_crashes(),
            window_secs: default_window_secs(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            default_agent: None,
            queue_dir: None,
            tasks_dir: None,
            daemon: DaemonSettings::default(),
            crash_guard: CrashGuardSettings::default(),
            agents: Vec::new(),
        }
    }
}

impl DaemonSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler_interval_secs)
    }
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
    pub fn stream_throttle(&self) -> Duration {
        Duration::from_millis(self.stream_throttle_ms)
    }
    pub fn dedupe_ttl(&self) -> Duration {
        Duration::from_secs(self.dedupe_ttl_secs)
    }
}

impl AgentConfig {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat
            .as_ref()
            .map(|h| Duration::from_secs(h.interval_minutes * 60))
    }

    pub fn heartbeat_prompt_path(&self) -> Option<PathBuf> {
        self.heartbeat.as_ref().map(|h| {
            if h.prompt_file.is_absolute() {
                h.prompt_file.clone()
            } else {
                self.working_dir.join(&h.prompt_file)
            }
        })
    }
}

impl Config {
    /// Load and validate `config.yaml`. A missing file yields the defaults.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            info!("No config found at {:?}, using defaults.", path);
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        let config = Self::from_yaml(&content).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })?;
        info!(
            "Loaded config: {} agent(s), default agent {:?}",
            config.agents.len(),
            config.default_agent_id()
        );
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            serde_yaml::from_str(content).map_err(|source| ConfigError::Parse {
                path: PathBuf::from("<inline>"),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.log_level.parse::<tracing::Level>().is_err() {
            return Err(invalid(
                "log_level",
                format!("unknown level '{}'", self.log_level),
            ));
        }
        if self.daemon.poll_interval_ms == 0 {
            return Err(invalid("daemon.poll_interval_ms", "must be greater than 0"));
        }
        if self.daemon.scheduler_interval_secs == 0 || self.daemon.scheduler_interval_secs > 60 {
            return Err(invalid(
                "daemon.scheduler_interval_secs",
                "must be between 1 and 60 so no cron minute is missed",
            ));
        }
        if self.crash_guard.max_crashes == 0 {
            return Err(invalid("crash_guard.max_crashes", "must be greater than 0"));
        }
        if self.crash_guard.window_secs == 0 {
            return Err(invalid("crash_guard.window_secs", "must be greater than 0"));
        }

        let mut seen = HashSet::new();
        for (i, agent) in self.agents.iter().enumerate() {
            let field = |name: &str| format!("agents[{}].{}", i, name);
            let id = agent.id.trim();
            if id.is_empty() {
                return Err(invalid(field("id"), "must not be empty"));
            }
            if !id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            {
                return Err(invalid(
                    field("id"),
                    "may only contain letters, digits, '-' and '_'",
                ));
            }
            if !seen.insert(id.to_string()) {
                return Err(invalid(field("id"), format!("duplicate agent id '{}'", id)));
            }
            if agent.command.trim().is_empty() {
                return Err(invalid(field("command"), "must not be empty"));
            }
            if let Some(channel) = &agent.channel
                && channel.token.trim().is_empty()
            {
                return Err(invalid(field("channel.token"), "must not be empty"));
            }
            if let Some(hb) = &agent.heartbeat {
                if hb.interval_minutes == 0 {
                    return Err(invalid(
                        field("heartbeat.interval_minutes"),
                        "must be greater than 0",
                    ));
                }
                if let Some(hours) = &hb.active_hours
                    && let Err(reason) = hours.validate()
                {
                    return Err(invalid(field("heartbeat.active_hours"), reason));
                }
            }
        }

        if let Some(default) = &self.default_agent
            && !seen.contains(default.as_str())
        {
            return Err(invalid(
                "default_agent",
                format!("no agent with id '{}'", default),
            ));
        }
        Ok(())
    }

    pub fn agent(&self, id: &str) -> Option<&AgentConfig> {
        self.agents.iter().find(|a| a.id == id)
    }

    /// Explicit default, otherwise the first configured agent.
    pub fn default_agent_id(&self) -> Option<&str> {
        self.default_agent
            .as_deref()
            .or_else(|| self.agents.first().map(|a| a.id.as_str()))
    }
}
