use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub provider: ProviderConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
}

/// OpenAI-compatible endpoint used by the structured extractor.
#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    pub api_key: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct StateConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Conversation sessions idle longer than this are purged.
    #[serde(default = "default_session_ttl_hours")]
    pub session_ttl_hours: u64,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            session_ttl_hours: default_session_ttl_hours(),
        }
    }
}

impl StateConfig {
    /// TTL in seconds, saturating so an absurd configured hour count
    /// cannot wrap into a negative cutoff.
    pub fn session_ttl_secs(&self) -> i64 {
        i64::try_from(self.session_ttl_hours)
            .unwrap_or(i64::MAX)
            .saturating_mul(3600)
    }
}

fn default_db_path() -> String {
    "tasknest.db".to_string()
}
fn default_session_ttl_hours() -> u64 {
    24
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    #[serde(default = "default_scheduler_enabled")]
    pub enabled: bool,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_scheduler_enabled(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

fn default_scheduler_enabled() -> bool {
    true
}
fn default_poll_interval_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    /// Turns without update intent before the reference to the last
    /// created task is dropped.
    #[serde(default = "default_last_task_retention_turns")]
    pub last_task_retention_turns: u32,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            last_task_retention_turns: default_last_task_retention_turns(),
        }
    }
}

fn default_last_task_retention_turns() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct NotifierConfig {
    #[serde(default)]
    pub kind: NotifierKind,
    /// Required when kind = "webhook".
    #[serde(default)]
    pub webhook_url: String,
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum NotifierKind {
    #[default]
    Log,
    Webhook,
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        if config.notifier.kind == NotifierKind::Webhook && config.notifier.webhook_url.is_empty() {
            anyhow::bail!("notifier.webhook_url is required when notifier.kind = \"webhook\"");
        }
        Ok(config)
    }
}
