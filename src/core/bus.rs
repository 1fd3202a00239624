use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::sync::{Arc, LazyLock, OnceLock, Weak};
use tracing::{info, warn};

use crate::core::scheduler::next_run_after;
use crate::core::store::{
    AgentRecord, NewTask, Priority, Role, Store, TaskFilter, TaskStatus, TaskUpdate, now_ms,
};
use crate::skills::ToolSpec;

static COLLABORATION_TOOLS: LazyLock<Vec<ToolSpec>> = LazyLock::new(|| {
    vec![
        ToolSpec::new(
            "send_message_to_agent",
            &["agentId", "message"],
            "Send a message to another agent for collaboration. The target agent will process your message asynchronously.",
        ),
        ToolSpec::new(
            "create_task",
            &["title", "description", "priority", "assignedRole"],
            "Create a task on the board. priority is low/medium/high; assignedRole is general/pm/developer/tester.",
        ),
        ToolSpec::new(
            "update_task",
            &["taskId", "status"],
            "Update a task's status. Status can be: backlog, in_progress, done.",
        ),
        ToolSpec::new(
            "list_tasks",
            &["status?", "assignedRole?"],
            "List all tasks. Optionally filter by status or assignedRole.",
        ),
        ToolSpec::new(
            "list_agents",
            &[],
            "List all available agents with their IDs, names, and roles.",
        ),
    ]
});

pub fn collaboration_tools() -> &'static [ToolSpec] {
    &COLLABORATION_TOOLS
}

pub fn is_collaboration_tool(name: &str) -> bool {
    COLLABORATION_TOOLS.iter().any(|t| t.name == name)
}

/// Entry point the bus uses to wake another agent.
#[async_trait]
pub trait LoopEntry: Send + Sync {
    async fn run_message(&self, agent: AgentRecord, prompt: String) -> Result<String>;
}

/// Cross-agent tools shared by every agent loop.
pub struct CollaborationBus {
    store: Store,
    entry: OnceLock<Weak<dyn LoopEntry>>,
}

fn arg<'a>(args: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    args.get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

impl CollaborationBus {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            entry: OnceLock::new(),
        }
    }

    pub(crate) fn store(&self) -> &Store {
        &self.store
    }

    /// Bind the loop entry. Only the first call takes effect.
    pub fn set_loop_entry(&self, entry: Weak<dyn LoopEntry>) {
        if self.entry.set(entry).is_err() {
            warn!("Collaboration loop entry already set; ignoring");
        }
    }

    /// Run a collaboration tool on behalf of `caller_id`. Store failures are
    /// reported as error text so the calling loop can keep going.
    pub async fn execute(&self, tool: &str, args: &Map<String, Value>, caller_id: &str) -> String {
        match self.dispatch(tool, args, caller_id).await {
            Ok(text) => text,
            Err(e) => format!("Error: {}", e),
        }
    }

    async fn dispatch(
        &self,
        tool: &str,
        args: &Map<String, Value>,
        caller_id: &str,
    ) -> Result<String> {
        match tool {
            "list_agents" => {
                let list: Vec<Value> = self
                    .store
                    .list_agents()
                    .await?
                    .into_iter()
                    .map(|a| {
                        json!({
                            "id": a.id,
                            "name": a.name,
                            "role": a.role.as_str(),
                            "roleLabel": a.role.label(),
                        })
                    })
                    .collect();
                Ok(serde_json::to_string_pretty(&list)?)
            }
            "list_tasks" => {
                let mut filter = TaskFilter::default();
                if let Some(s) = arg(args, "status") {
                    let Some(status) = TaskStatus::from_status(s) else {
                        return Ok(format!("Error: invalid status \"{}\".", s));
                    };
                    filter.status = Some(status);
                }
                if let Some(r) = arg(args, "assignedRole") {
                    let Some(role) = Role::from_name(r) else {
                        return Ok(format!("Error: invalid role \"{}\".", r));
                    };
                    filter.assigned_role = Some(role);
                }
                let list: Vec<Value> = self
                    .store
                    .list_tasks(&filter)
                    .await?
                    .into_iter()
                    .map(|t| {
                        json!({
                            "id": t.id,
                            "title": t.title,
                            "description": t.description,
                            "status": t.status.as_str(),
                            "priority": t.priority.as_str(),
                            "assignedRole": t.assigned_role.as_str(),
                            "assignedAgentId": t.assigned_agent_id,
                        })
                    })
                    .collect();
                Ok(serde_json::to_string_pretty(&list)?)
            }
            "create_task" => {
                let task = self
                    .store
                    .create_task(NewTask {
                        title: Some(arg(args, "title").unwrap_or("Untitled").to_string()),
                        description: arg(args, "description").unwrap_or("").to_string(),
                        priority: arg(args, "priority")
                            .and_then(Priority::from_name)
                            .unwrap_or_default(),
                        assigned_role: arg(args, "assignedRole")
                            .and_then(Role::from_name)
                            .unwrap_or_default(),
                        assigned_agent_id: arg(args, "assignedAgentId").map(str::to_string),
                        created_by: Some(caller_id.to_string()),
                        ..NewTask::default()
                    })
                    .await?;
                Ok(format!(
                    "Task created: {} (id: {}, role: {}, priority: {})",
                    task.title,
                    task.id,
                    task.assigned_role.as_str(),
                    task.priority.as_str()
                ))
            }
            "update_task" => self.update_task(args).await,
            "send_message_to_agent" => self.send_message(args, caller_id).await,
            _ => Ok(format!("Error: Unknown collaboration tool \"{}\".", tool)),
        }
    }

    /// Agents may move a task between backlog, in_progress and done. A
    /// repeating task marked done goes back to the repeat queue instead.
    async fn update_task(&self, args: &Map<String, Value>) -> Result<String> {
        let Some(task_id) = arg(args, "taskId") else {
            return Ok("Error: taskId is required.".to_string());
        };
        let status = match arg(args, "status") {
            Some(s) => match TaskStatus::from_status(s) {
                Some(
                    status @ (TaskStatus::Backlog | TaskStatus::InProgress | TaskStatus::Done),
                ) => Some(status),
                _ => return Ok(format!("Error: invalid status \"{}\".", s)),
            },
            None => None,
        };
        let Some(task) = self.store.get_task(task_id).await? else {
            return Ok(format!("Error: Task \"{}\" not found.", task_id));
        };

        let mut update = TaskUpdate {
            title: arg(args, "title").map(str::to_string),
            description: arg(args, "description").map(str::to_string),
            priority: arg(args, "priority").and_then(Priority::from_name),
            assigned_role: arg(args, "assignedRole").and_then(Role::from_name),
            ..TaskUpdate::default()
        };
        match status {
            Some(TaskStatus::Done) => {
                let now = now_ms();
                update.completed_at = Some(Some(now));
                if task.repeat {
                    let next = next_run_after(task.scheduled_at, now, task.interval_ms());
                    update.status = Some(TaskStatus::RepeatQueue);
                    update.next_run_at = Some(Some(next));
                } else {
                    update.status = Some(TaskStatus::Done);
                }
            }
            other => update.status = other,
        }

        match self.store.update_task(task_id, update).await? {
            Some(task) => Ok(format!(
                "Task updated: {} → status: {}",
                task.title,
                task.status.as_str()
            )),
            None => Ok(format!("Error: Task \"{}\" not found.", task_id)),
        }
    }

    async fn send_message(&self, args: &Map<String, Value>, caller_id: &str) -> Result<String> {
        let Some(target_id) = arg(args, "agentId") else {
            return Ok("Error: agentId is required.".to_string());
        };
        let Some(message) = arg(args, "message") else {
            return Ok("Error: message is required.".to_string());
        };
        let Some(target) = self.store.get_agent(target_id).await? else {
            return Ok(format!("Error: Agent \"{}\" not found.", target_id));
        };

        self.store.push_agent_message(target_id, caller_id, message).await?;

        let sender = self.store.get_agent(caller_id).await?;
        let (sender_name, sender_role) = match &sender {
            Some(a) => (a.name.as_str(), a.role.as_str()),
            None => (caller_id, Role::General.as_str()),
        };
        let prompt = format!(
            "[Message from agent \"{}\" (role: {})]: {}",
            sender_name, sender_role, message
        );

        let reply = format!(
            "Message sent to agent \"{}\" ({}). They will process it asynchronously.",
            target.name,
            target.role.as_str()
        );

        // The target runs on its own task; the caller never waits for it.
        match self.entry.get().and_then(Weak::upgrade) {
            Some(entry) => spawn_delivery(entry, target, prompt),
            None => warn!("No loop entry bound; message to {} stored only", target_id),
        }
        Ok(reply)
    }
}

fn spawn_delivery(entry: Arc<dyn LoopEntry>, target: AgentRecord, prompt: String) {
    tokio::spawn(async move {
        let name = target.name.clone();
        match entry.run_message(target, prompt).await {
            Ok(_) => info!("[{}] Processed collaboration message", name),
            Err(e) => warn!("Collaboration message to {} failed: {}", name, e),
        }
    });
}
