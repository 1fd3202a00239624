use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};

use crate::core::brain::ProgressEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub task_id: String,
    pub agent_id: String,
    pub agent_name: String,
    pub step: usize,
    pub current_tool: Option<String>,
    pub status: ExecutionStatus,
    pub started_at: i64,
}

#[derive(Default)]
struct Bookkeeping {
    busy: HashSet<String>,
    dispatched: HashSet<String>,
    executions: HashMap<String, ExecutionRecord>,
    cancel_flags: HashSet<String>,
}

/// Dispatch bookkeeping shared by the scheduler and the agent loops it starts.
///
/// Every method takes the lock once and never awaits, so each multi-step
/// update is seen whole by other ticks.
#[derive(Default)]
pub struct SchedulerState {
    inner: Mutex<Bookkeeping>,
}

impl SchedulerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_busy(&self, agent_id: &str) -> bool {
        self.inner.lock().busy.contains(agent_id)
    }

    pub fn busy_agents(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.lock().busy.iter().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_dispatched(&self, task_id: &str) -> bool {
        self.inner.lock().dispatched.contains(task_id)
    }

    pub fn is_cancelled(&self, agent_id: &str) -> bool {
        self.inner.lock().cancel_flags.contains(agent_id)
    }

    pub fn request_cancel(&self, agent_id: &str) {
        self.inner.lock().cancel_flags.insert(agent_id.to_string());
    }

    /// Free for new work: not busy and not still winding down a cancelled run.
    pub fn is_available(&self, agent_id: &str) -> bool {
        let b = self.inner.lock();
        !b.busy.contains(agent_id) && !b.cancel_flags.contains(agent_id)
    }

    pub fn execution(&self, task_id: &str) -> Option<ExecutionRecord> {
        self.inner.lock().executions.get(task_id).cloned()
    }

    pub fn executions(&self) -> Vec<ExecutionRecord> {
        let mut list: Vec<ExecutionRecord> =
            self.inner.lock().executions.values().cloned().collect();
        list.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.task_id.cmp(&b.task_id))
        });
        list
    }

    /// Mark the task dispatched, the agent busy and open a running record.
    /// Returns false when either side was already taken.
    pub(crate) fn claim(&self, task_id: &str, agent_id: &str, agent_name: &str, now: i64) -> bool {
        let mut b = self.inner.lock();
        if b.dispatched.contains(task_id)
            || b.busy.contains(agent_id)
            || b.cancel_flags.contains(agent_id)
        {
            return false;
        }
        b.dispatched.insert(task_id.to_string());
        b.busy.insert(agent_id.to_string());
        b.executions.insert(
            task_id.to_string(),
            ExecutionRecord {
                task_id: task_id.to_string(),
                agent_id: agent_id.to_string(),
                agent_name: agent_name.to_string(),
                step: 1,
                current_tool: None,
                status: ExecutionStatus::Running,
                started_at: now,
            },
        );
        true
    }

    /// Undo a claim whose dispatch never started.
    pub(crate) fn release(&self, task_id: &str, agent_id: &str) {
        let mut b = self.inner.lock();
        b.dispatched.remove(task_id);
        b.busy.remove(agent_id);
        b.executions.remove(task_id);
    }

    pub(crate) fn record_progress(&self, task_id: &str, event: &ProgressEvent) {
        let mut b = self.inner.lock();
        let Some(record) = b.executions.get_mut(task_id) else {
            return;
        };
        if record.status != ExecutionStatus::Running {
            return;
        }
        match event {
            ProgressEvent::Iteration { step, .. } => record.step = *step,
            ProgressEvent::ToolCall { name, .. } => record.current_tool = Some(name.clone()),
            ProgressEvent::ToolResult { .. } => record.current_tool = None,
            _ => {}
        }
    }

    /// Settle a finished run. Returns true when the agent was cancelled while
    /// it ran, in which case the record is left alone. A run that stopped
    /// itself on a cancel seen elsewhere settles as `Cancelled` and its record
    /// is dropped.
    pub(crate) fn settle(&self, task_id: &str, agent_id: &str, outcome: ExecutionStatus) -> bool {
        let mut b = self.inner.lock();
        let cancelled = b.cancel_flags.remove(agent_id);
        b.busy.remove(agent_id);
        b.dispatched.remove(task_id);
        if cancelled {
            return true;
        }
        let owned = b
            .executions
            .get(task_id)
            .is_some_and(|r| r.agent_id == agent_id);
        if !owned {
            return false;
        }
        if outcome == ExecutionStatus::Cancelled {
            b.executions.remove(task_id);
        } else if let Some(record) = b.executions.get_mut(task_id) {
            record.status = outcome;
            record.current_tool = None;
        }
        false
    }

    /// Cancel a running execution: flag its agent, drop the record and free
    /// the dispatch slots now. Returns the agent id when something was running.
    pub(crate) fn cancel(&self, task_id: &str) -> Option<String> {
        let mut b = self.inner.lock();
        let record = b.executions.remove(task_id)?;
        b.dispatched.remove(task_id);
        if record.status != ExecutionStatus::Running {
            return None;
        }
        b.busy.remove(&record.agent_id);
        b.cancel_flags.insert(record.agent_id.clone());
        Some(record.agent_id)
    }

    /// Drop completed and failed records.
    pub(crate) fn prune_terminal(&self) -> usize {
        let mut b = self.inner.lock();
        let before = b.executions.len();
        b.executions
            .retain(|_, r| r.status == ExecutionStatus::Running);
        before - b.executions.len()
    }
}
