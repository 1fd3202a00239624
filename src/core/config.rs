use anyhow::Result;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

pub const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub agents: AgentsConfig,

    #[serde(default)]
    pub skills: SkillsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_first_run_delay")]
    pub first_run_delay_secs: u64,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentsConfig {
    #[serde(default = "default_max_iterations")]
    pub default_max_iterations: usize,

    /// Turns kept per chat session.
    #[serde(default = "default_session_window")]
    pub session_window: usize,

    /// Prior turns forwarded to the model on each loop run.
    #[serde(default = "default_history_context")]
    pub history_context: usize,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SkillsConfig {
    /// Directory holding script skills. Defaults to `<data_dir>/skills`.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_poll_interval() -> u64 {
    30
}
fn default_first_run_delay() -> u64 {
    5
}
fn default_true() -> bool {
    true
}
fn default_max_iterations() -> usize {
    crate::core::store::DEFAULT_MAX_ITERATIONS
}
fn default_session_window() -> usize {
    40
}
fn default_history_context() -> usize {
    10
}
fn default_level() -> String {
    "info".to_string()
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            first_run_delay_secs: default_first_run_delay(),
            enabled: true,
        }
    }
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            default_max_iterations: default_max_iterations(),
            session_window: default_session_window(),
            history_context: default_history_context(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

impl AppConfig {
    pub async fn load<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let config_path = data_dir.as_ref().join(CONFIG_FILE);
        if !config_path.exists() {
            info!("No config.toml found, using defaults.");
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(&config_path).await?;
        let mut config: AppConfig = toml::from_str(&content)?;

        // Zero values would stall the poller or the loop.
        if config.scheduler.poll_interval_secs == 0 {
            config.scheduler.poll_interval_secs = default_poll_interval();
        }
        if config.agents.default_max_iterations == 0 {
            config.agents.default_max_iterations = default_max_iterations();
        }
        if config.agents.session_window == 0 {
            config.agents.session_window = default_session_window();
        }

        info!(
            "Loaded config: poll={}s, first_run={}s, scheduler={}, log={}",
            config.scheduler.poll_interval_secs,
            config.scheduler.first_run_delay_secs,
            config.scheduler.enabled,
            config.logging.level
        );
        Ok(config)
    }

    pub fn skills_dir(&self, data_dir: &Path) -> PathBuf {
        self.skills
            .dir
            .clone()
            .unwrap_or_else(|| data_dir.join("skills"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = AppConfig::default();
        assert_eq!(config.scheduler.poll_interval_secs, 30);
        assert_eq!(config.scheduler.first_run_delay_secs, 5);
        assert!(config.scheduler.enabled);
        assert_eq!(config.agents.default_max_iterations, 30);
        assert_eq!(config.agents.session_window, 40);
        assert_eq!(config.agents.history_context, 10);
        assert_eq!(config.logging.level, "info");
    }

    #[tokio::test]
    async fn load_missing_file_returns_default() {
        let tmp = tempfile::tempdir().unwrap();
        let config = AppConfig::load(tmp.path()).await.unwrap();
        assert!(config.scheduler.enabled);
        assert_eq!(
            config.skills_dir(tmp.path()),
            tmp.path().join("skills")
        );
    }

    #[tokio::test]
    async fn load_partial_file_keeps_other_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let content = r#"
[scheduler]
poll_interval_secs = 0
enabled = false

[skills]
dir = "/opt/skills"
"#;
        std::fs::write(tmp.path().join(CONFIG_FILE), content).unwrap();

        let config = AppConfig::load(tmp.path()).await.unwrap();
        assert_eq!(config.scheduler.poll_interval_secs, 30);
        assert!(!config.scheduler.enabled);
        assert_eq!(config.agents.session_window, 40);
        assert_eq!(config.skills_dir(tmp.path()), PathBuf::from("/opt/skills"));
    }
}
