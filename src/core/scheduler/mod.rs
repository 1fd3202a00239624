mod state;

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::core::brain::{AgentLoop, LoopRequest, Observer, ProgressEvent};
use crate::core::config::SchedulerConfig;
use crate::core::lifecycle::LifecycleManager;
use crate::core::store::{
    AgentRecord, Store, TaskRecord, TaskStatus, TaskUpdate, TriggerType, now_ms,
};

pub use state::{ExecutionRecord, ExecutionStatus, SchedulerState};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Repeat tasks moved back to the backlog.
    pub promoted: Vec<String>,
    /// `(task_id, agent_id)` pairs started this tick.
    pub dispatched: Vec<(String, String)>,
    /// Ready tasks with no free agent.
    pub skipped: Vec<String>,
}

/// First run strictly after `now`, stepping whole intervals from the
/// scheduled time (or from `now` when the task has none).
/// Saturates at `i64::MAX` instead of wrapping.
pub fn next_run_after(scheduled_at: Option<i64>, now: i64, interval_ms: i64) -> i64 {
    let interval = interval_ms.max(1);
    let base = scheduled_at.unwrap_or(now);
    if base > now {
        return base.saturating_add(interval);
    }
    let steps = now.saturating_sub(base) / interval + 1;
    base.saturating_add(steps.saturating_mul(interval))
}

pub fn task_prompt(task: &TaskRecord) -> String {
    format!(
        "[Task] {}\n\n{}\n\n(Task ID: {}. When finished, summarise the result.)",
        task.title, task.description, task.id
    )
}

fn is_ready(task: &TaskRecord, now: i64) -> bool {
    match task.trigger_type {
        TriggerType::Manual => false,
        TriggerType::Scheduled => task.scheduled_at.is_none_or(|at| at <= now),
        TriggerType::Auto => true,
    }
}

/// Keeps the execution record in step with the loop while forwarding events.
struct TrackingObserver {
    state: Arc<SchedulerState>,
    task_id: String,
    inner: Arc<dyn Observer>,
}

impl Observer for TrackingObserver {
    fn emit(&self, agent_id: &str, event: &ProgressEvent) {
        self.state.record_progress(&self.task_id, event);
        self.inner.emit(agent_id, event);
    }
}

/// Polls the task board and hands ready tasks to idle agents.
#[derive(Clone)]
pub struct Scheduler {
    store: Store,
    state: Arc<SchedulerState>,
    agent_loop: Arc<AgentLoop>,
    observer: Arc<dyn Observer>,
    tick_lock: Arc<Mutex<()>>,
}

impl Scheduler {
    pub fn new(
        store: Store,
        state: Arc<SchedulerState>,
        agent_loop: Arc<AgentLoop>,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Self {
            store,
            state,
            agent_loop,
            observer,
            tick_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn state(&self) -> &Arc<SchedulerState> {
        &self.state
    }

    pub async fn tick(&self) -> Result<TickReport> {
        self.tick_at(now_ms()).await
    }

    pub async fn tick_at(&self, now: i64) -> Result<TickReport> {
        let _guard = self.tick_lock.lock().await;
        let mut report = TickReport::default();

        self.state.prune_terminal();
        self.drop_withdrawn().await?;

        for task in self.store.tasks_with_status(TaskStatus::RepeatQueue).await? {
            if task.next_run_at.is_some_and(|at| at <= now) {
                let update = TaskUpdate {
                    status: Some(TaskStatus::Backlog),
                    started_at: Some(None),
                    completed_at: Some(None),
                    ..TaskUpdate::default()
                };
                self.store.update_task(&task.id, update).await?;
                info!("Repeat task \"{}\" back in backlog", task.title);
                report.promoted.push(task.id);
            }
        }

        let mut ready: Vec<TaskRecord> = self
            .store
            .tasks_with_status(TaskStatus::Backlog)
            .await?
            .into_iter()
            .filter(|t| is_ready(t, now) && !self.state.is_dispatched(&t.id))
            .collect();
        // Stable: creation order is kept within a priority.
        ready.sort_by_key(|t| t.priority.rank());
        if ready.is_empty() {
            return Ok(report);
        }

        let agents = self.store.list_agents().await?;
        for task in ready {
            let Some(agent) = self.pick_agent(&task, &agents) else {
                report.skipped.push(task.id);
                continue;
            };
            if !self.state.claim(&task.id, &agent.id, &agent.name, now) {
                report.skipped.push(task.id);
                continue;
            }

            let update = TaskUpdate {
                status: Some(TaskStatus::InProgress),
                assigned_agent_id: Some(Some(agent.id.clone())),
                started_at: Some(Some(now)),
                completed_at: Some(None),
                ..TaskUpdate::default()
            };
            let claimed = self
                .store
                .update_task_if(&task.id, TaskStatus::Backlog, update)
                .await;
            let task = match claimed {
                Ok(Some(task)) => task,
                Ok(None) => {
                    info!("Task {} left the backlog before dispatch", task.id);
                    self.state.release(&task.id, &agent.id);
                    report.skipped.push(task.id);
                    continue;
                }
                Err(e) => {
                    self.state.release(&task.id, &agent.id);
                    return Err(e);
                }
            };

            info!("[{}] Dispatched task \"{}\" ({})", agent.name, task.title, task.id);
            report.dispatched.push((task.id.clone(), agent.id.clone()));
            let scheduler = self.clone();
            let agent = agent.clone();
            tokio::spawn(async move { scheduler.run_task(task, agent).await });
        }

        Ok(report)
    }

    /// Free the slots of running executions whose task was cancelled or
    /// deleted through another handle on the store.
    async fn drop_withdrawn(&self) -> Result<()> {
        for record in self.state.executions() {
            if record.status != ExecutionStatus::Running {
                continue;
            }
            let withdrawn = match self.store.get_task(&record.task_id).await? {
                Some(task) => task.status == TaskStatus::Cancelled,
                None => true,
            };
            if withdrawn && let Some(agent_id) = self.state.cancel(&record.task_id) {
                info!(
                    "Task {} was withdrawn; stopping agent {}",
                    record.task_id, agent_id
                );
            }
        }
        Ok(())
    }

    fn pick_agent<'a>(
        &self,
        task: &TaskRecord,
        agents: &'a [AgentRecord],
    ) -> Option<&'a AgentRecord> {
        if let Some(id) = &task.assigned_agent_id {
            let agent = agents.iter().find(|a| &a.id == id);
            if agent.is_none() {
                warn!("Task {} is assigned to missing agent {}", task.id, id);
            }
            return agent.filter(|a| self.state.is_available(&a.id));
        }
        agents
            .iter()
            .find(|a| a.role == task.assigned_role && self.state.is_available(&a.id))
    }

    async fn run_task(&self, task: TaskRecord, agent: AgentRecord) {
        let observer = TrackingObserver {
            state: self.state.clone(),
            task_id: task.id.clone(),
            inner: self.observer.clone(),
        };
        let request = LoopRequest::new(agent.clone(), task_prompt(&task)).for_task(&task.id);
        let result = self.agent_loop.run(request, &observer).await;

        let outcome = match &result {
            Ok(o) if o.aborted => ExecutionStatus::Cancelled,
            Ok(_) => ExecutionStatus::Completed,
            Err(_) => ExecutionStatus::Failed,
        };
        let cancelled = self.state.settle(&task.id, &agent.id, outcome);
        if cancelled || outcome == ExecutionStatus::Cancelled {
            info!("[{}] Task {} was cancelled; leaving it as is", agent.name, task.id);
            return;
        }

        match result {
            Ok(run) => match self.complete(&task, now_ms()).await {
                Ok(true) => info!(
                    "[{}] Task \"{}\" finished after {} iteration(s)",
                    agent.name, task.title, run.iterations
                ),
                Ok(false) => info!(
                    "[{}] Task {} is no longer in progress; not completing it",
                    agent.name, task.id
                ),
                Err(e) => error!("[{}] Failed to complete task {}: {}", agent.name, task.id, e),
            },
            Err(e) => {
                error!("[{}] Task {} failed: {}", agent.name, task.id, e);
            }
        }
    }

    /// Finish a run. Writes only while the row is still in progress; returns
    /// false when it was cancelled, deleted or moved meanwhile.
    async fn complete(&self, task: &TaskRecord, now: i64) -> Result<bool> {
        let update = if task.repeat {
            let next = next_run_after(task.scheduled_at, now, task.interval_ms());
            TaskUpdate {
                status: Some(TaskStatus::RepeatQueue),
                completed_at: Some(Some(now)),
                next_run_at: Some(Some(next)),
                ..TaskUpdate::default()
            }
        } else {
            TaskUpdate {
                status: Some(TaskStatus::Done),
                completed_at: Some(Some(now)),
                ..TaskUpdate::default()
            }
        };
        let applied = self
            .store
            .update_task_if(&task.id, TaskStatus::InProgress, update)
            .await?;
        Ok(applied.is_some())
    }

    /// Cancel a task. A running execution is flagged and its bookkeeping is
    /// dropped at once; the loop stops at its next iteration boundary.
    /// Another process sharing the store sees the cancelled row on its next
    /// tick and inside the loop's own cancel check.
    pub async fn cancel_task(&self, task_id: &str) -> Result<bool> {
        let _guard = self.tick_lock.lock().await;
        self.cancel_locked(task_id).await
    }

    async fn cancel_locked(&self, task_id: &str) -> Result<bool> {
        let Some(task) = self.store.get_task(task_id).await? else {
            return Ok(false);
        };
        if let Some(agent_id) = self.state.cancel(task_id) {
            info!("Cancellation requested for agent {} (task {})", agent_id, task_id);
        }
        if task.status != TaskStatus::Done {
            self.store
                .update_task(task_id, TaskUpdate::status(TaskStatus::Cancelled))
                .await?;
        }
        Ok(true)
    }

    pub async fn delete_task(&self, task_id: &str) -> Result<bool> {
        let _guard = self.tick_lock.lock().await;
        if !self.cancel_locked(task_id).await? {
            return Ok(false);
        }
        self.store.delete_task(task_id).await
    }

    /// Register the repeating poll job and a one-shot first run.
    pub async fn install(
        &self,
        lifecycle: &LifecycleManager,
        config: &SchedulerConfig,
    ) -> Result<()> {
        let every = Duration::from_secs(config.poll_interval_secs.max(1));
        let first = Duration::from_secs(config.first_run_delay_secs);

        let scheduler = self.clone();
        let job = tokio_cron_scheduler::Job::new_repeated_async(every, move |_uuid, _l| {
            let scheduler = scheduler.clone();
            Box::pin(async move {
                scheduler.poll().await;
            })
        })?;
        lifecycle.scheduler.add(job).await?;

        let scheduler = self.clone();
        let job = tokio_cron_scheduler::Job::new_one_shot_async(first, move |_uuid, _l| {
            let scheduler = scheduler.clone();
            Box::pin(async move {
                scheduler.poll().await;
            })
        })?;
        lifecycle.scheduler.add(job).await?;

        info!(
            "Task poller installed (every {}s, first run in {}s)",
            every.as_secs(),
            first.as_secs()
        );
        Ok(())
    }

    async fn poll(&self) {
        match self.tick().await {
            Ok(report) if !report.dispatched.is_empty() || !report.promoted.is_empty() => info!(
                "Scheduler tick: {} promoted, {} dispatched, {} waiting",
                report.promoted.len(),
                report.dispatched.len(),
                report.skipped.len()
            ),
            Ok(_) => {}
            Err(e) => error!("Scheduler tick failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests;
