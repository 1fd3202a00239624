use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::core::llm::{ProviderConfig, ProviderKind};

pub const DEFAULT_MAX_ITERATIONS: usize = 30;
pub const DEFAULT_SKILL: &str = "basic-tools";

const MINUTES_PER_DAY: i64 = 24 * 60;
const MINUTES_PER_WEEK: i64 = 7 * MINUTES_PER_DAY;
/// Longest accepted custom repeat interval: one leap year.
pub const MAX_REPEAT_MINUTES: i64 = 366 * MINUTES_PER_DAY;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    General,
    Pm,
    Developer,
    Tester,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::General, Role::Pm, Role::Developer, Role::Tester];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::General => "general",
            Role::Pm => "pm",
            Role::Developer => "developer",
            Role::Tester => "tester",
        }
    }

    pub fn from_name(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.as_str() == value.trim())
    }

    pub fn label(self) -> &'static str {
        match self {
            Role::General => "General",
            Role::Pm => "Project Manager",
            Role::Developer => "Developer",
            Role::Tester => "Tester",
        }
    }

    /// Identity prompt prepended to the agent's system prompt.
    pub fn identity_prompt(self) -> &'static str {
        match self {
            Role::General => "",
            Role::Pm => {
                "Your role is PROJECT MANAGER. You manage the project, break requirements down into sub-tasks, \
                 hand those tasks to agents with the right role, track progress and coordinate the team.\n\
                 When asked who you are, say you are the project manager responsible for planning, task \
                 assignment and progress tracking.\n\
                 Workflow: 1) on a new requirement, call list_agents to see who is on the team \
                 2) split the requirement into sub-tasks \
                 3) call create_task for each, using assignedRole to pick the role \
                 4) follow progress with list_tasks \
                 5) use send_message_to_agent when you need to talk to a teammate."
            }
            Role::Developer => {
                "Your role is DEVELOPER. You write code, implement features, fix bugs and optimise existing code.\n\
                 When asked who you are, say you are the developer responsible for code, features and bug fixes.\n\
                 Workflow: 1) analyse the task you received \
                 2) use your tools to write and run code \
                 3) when finished, call update_task to set the task status to done \
                 4) report problems or hand-offs to the project manager or tester with send_message_to_agent."
            }
            Role::Tester => {
                "Your role is TESTER. You test features, find and report bugs, verify fixes and guard quality.\n\
                 When asked who you are, say you are the tester responsible for testing and software quality.\n\
                 Workflow: 1) test the functionality described in the task \
                 2) when you find a bug, notify the developer with send_message_to_agent and file a fix task \
                 with create_task \
                 3) after verifying a fix, call update_task to mark the task done."
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Backlog,
    InProgress,
    RepeatQueue,
    Done,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Backlog,
        TaskStatus::InProgress,
        TaskStatus::RepeatQueue,
        TaskStatus::Done,
        TaskStatus::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Backlog => "backlog",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::RepeatQueue => "repeat_queue",
            TaskStatus::Done => "done",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_status(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == value.trim())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }

    pub fn from_name(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.as_str() == value.trim())
    }

    /// Dispatch rank, lower runs first.
    pub fn rank(self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Medium => 1,
            Priority::Low => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    #[default]
    Auto,
    Scheduled,
    Manual,
}

impl TriggerType {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerType::Auto => "auto",
            TriggerType::Scheduled => "scheduled",
            TriggerType::Manual => "manual",
        }
    }

    pub fn from_name(value: &str) -> Option<Self> {
        match value.trim() {
            "auto" => Some(TriggerType::Auto),
            "scheduled" => Some(TriggerType::Scheduled),
            "manual" => Some(TriggerType::Manual),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepeatMode {
    #[default]
    Daily,
    Weekly,
    Custom,
}

impl RepeatMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RepeatMode::Daily => "daily",
            RepeatMode::Weekly => "weekly",
            RepeatMode::Custom => "custom",
        }
    }

    pub fn from_name(value: &str) -> Option<Self> {
        match value.trim() {
            "daily" => Some(RepeatMode::Daily),
            "weekly" => Some(RepeatMode::Weekly),
            "custom" => Some(RepeatMode::Custom),
            _ => None,
        }
    }

    /// Interval in minutes. A custom interval that is missing or not
    /// positive falls back to daily; a longer one is capped at a year.
    pub fn interval_minutes(self, custom: Option<i64>) -> i64 {
        match self {
            RepeatMode::Daily => MINUTES_PER_DAY,
            RepeatMode::Weekly => MINUTES_PER_WEEK,
            RepeatMode::Custom => custom
                .filter(|m| *m > 0)
                .map(|m| m.min(MAX_REPEAT_MINUTES))
                .unwrap_or(MINUTES_PER_DAY),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillEntry {
    #[serde(default = "default_installed")]
    pub installed: bool,
    #[serde(default)]
    pub config: Map<String, Value>,
}

fn default_installed() -> bool {
    true
}

impl SkillEntry {
    pub fn installed() -> Self {
        Self {
            installed: true,
            config: Map::new(),
        }
    }

    pub fn with_config(config: Map<String, Value>) -> Self {
        Self {
            installed: true,
            config,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    pub id: String,
    pub name: String,
    pub role: Role,
    pub provider: ProviderConfig,
    /// Ordered by skill name; tool routing relies on this order.
    pub skills: BTreeMap<String, SkillEntry>,
    pub work_dir: String,
    pub max_iterations: usize,
    pub created_at: i64,
    pub updated_at: i64,
}

impl AgentRecord {
    pub fn installed_skills(&self) -> impl Iterator<Item = (&String, &SkillEntry)> {
        self.skills.iter().filter(|(_, entry)| entry.installed)
    }

    pub fn skill_config(&self, skill: &str) -> Map<String, Value> {
        self.skills
            .get(skill)
            .map(|e| e.config.clone())
            .unwrap_or_default()
    }
}

/// Input for creating an agent. Unset fields take the documented defaults.
#[derive(Debug, Clone, Default)]
pub struct NewAgent {
    pub name: Option<String>,
    pub role: Role,
    pub provider_kind: Option<ProviderKind>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub endpoint: Option<String>,
    pub skills: Option<BTreeMap<String, SkillEntry>>,
    pub work_dir: Option<String>,
    pub max_iterations: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct ProviderPatch {
    pub kind: Option<ProviderKind>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub endpoint: Option<String>,
}

/// Partial agent update. `provider` and `skills` merge into the stored values.
#[derive(Debug, Clone, Default)]
pub struct AgentUpdate {
    pub name: Option<String>,
    pub role: Option<Role>,
    pub provider: Option<ProviderPatch>,
    pub skills: Option<BTreeMap<String, SkillEntry>>,
    pub work_dir: Option<String>,
    pub max_iterations: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub id: String,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub priority: Priority,
    pub assigned_role: Role,
    pub assigned_agent_id: Option<String>,
    pub trigger_type: TriggerType,
    pub scheduled_at: Option<i64>,
    pub repeat: bool,
    pub repeat_mode: RepeatMode,
    pub repeat_interval: Option<i64>,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub next_run_at: Option<i64>,
    pub created_by: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl TaskRecord {
    pub fn interval_ms(&self) -> i64 {
        self.repeat_mode
            .interval_minutes(self.repeat_interval)
            .saturating_mul(60_000)
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub title: Option<String>,
    pub description: String,
    pub status: TaskStatus,
    pub priority: Priority,
    pub assigned_role: Role,
    pub assigned_agent_id: Option<String>,
    pub trigger_type: TriggerType,
    pub scheduled_at: Option<i64>,
    pub repeat: bool,
    pub repeat_mode: RepeatMode,
    pub repeat_interval: Option<i64>,
    pub created_by: Option<String>,
}

/// Partial task update. Timestamp fields use `Some(None)` to clear.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<TaskStatus>,
    pub priority: Option<Priority>,
    pub assigned_role: Option<Role>,
    pub assigned_agent_id: Option<Option<String>>,
    pub started_at: Option<Option<i64>>,
    pub completed_at: Option<Option<i64>>,
    pub next_run_at: Option<Option<i64>>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub assigned_role: Option<Role>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMessageRecord {
    pub from: String,
    pub message: String,
    pub timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_names_round_trip() {
        for status in TaskStatus::ALL {
            assert_eq!(TaskStatus::from_status(status.as_str()), Some(status));
        }
        assert_eq!(TaskStatus::from_status("archived"), None);
    }

    #[test]
    fn priority_rank_orders_high_first() {
        let mut ps = vec![Priority::Low, Priority::High, Priority::Medium];
        ps.sort_by_key(|p| p.rank());
        assert_eq!(ps, vec![Priority::High, Priority::Medium, Priority::Low]);
    }

    #[test]
    fn repeat_intervals() {
        assert_eq!(RepeatMode::Daily.interval_minutes(None), 1440);
        assert_eq!(RepeatMode::Weekly.interval_minutes(Some(5)), 10080);
        assert_eq!(RepeatMode::Custom.interval_minutes(Some(90)), 90);
        assert_eq!(RepeatMode::Custom.interval_minutes(Some(0)), 1440);
        assert_eq!(RepeatMode::Custom.interval_minutes(None), 1440);
        assert_eq!(
            RepeatMode::Custom.interval_minutes(Some(i64::MAX / 1000)),
            MAX_REPEAT_MINUTES
        );
    }

    #[test]
    fn huge_custom_interval_does_not_overflow() {
        let task = TaskRecord {
            id: "t".into(),
            title: "t".into(),
            description: String::new(),
            status: TaskStatus::Backlog,
            priority: Priority::Medium,
            assigned_role: Role::General,
            assigned_agent_id: None,
            trigger_type: TriggerType::Auto,
            scheduled_at: None,
            repeat: true,
            repeat_mode: RepeatMode::Custom,
            repeat_interval: Some(i64::MAX / 1000),
            started_at: None,
            completed_at: None,
            next_run_at: None,
            created_by: None,
            created_at: 0,
            updated_at: 0,
        };
        assert_eq!(task.interval_ms(), MAX_REPEAT_MINUTES * 60_000);
    }

    #[test]
    fn general_role_has_no_identity_prompt() {
        assert!(Role::General.identity_prompt().is_empty());
        assert!(Role::Pm.identity_prompt().contains("create_task"));
        assert!(Role::Developer.identity_prompt().contains("update_task"));
        assert!(Role::Tester.identity_prompt().contains("send_message_to_agent"));
    }

    #[test]
    fn skill_entry_defaults_to_installed() {
        let entry: SkillEntry = serde_json::from_str("{}").unwrap();
        assert!(entry.installed);
        assert!(entry.config.is_empty());
    }
}
