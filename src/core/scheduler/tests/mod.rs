mod dispatch;

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::core::brain::{AgentLoop, NoopObserver};
use crate::core::bus::CollaborationBus;
use crate::core::llm::{ChatMessage, ChatOutput, LlmProvider, ProviderConfig, ProviderError};
use crate::core::scheduler::{Scheduler, SchedulerState};
use crate::core::store::{
    AgentRecord, NewAgent, NewTask, Priority, Role, Store, TaskRecord, TaskStatus,
};
use crate::skills::{SkillManager, SkillRegistry};

/// Provider that answers only when a permit is available.
pub(super) struct Gate {
    permits: Semaphore,
    calls: AtomicUsize,
    fail: bool,
}

impl Gate {
    pub(super) fn open() -> Self {
        Self {
            permits: Semaphore::new(1024),
            calls: AtomicUsize::new(0),
            fail: false,
        }
    }

    pub(super) fn closed() -> Self {
        Self {
            permits: Semaphore::new(0),
            ..Self::open()
        }
    }

    pub(super) fn failing() -> Self {
        Self {
            fail: true,
            ..Self::open()
        }
    }

    pub(super) fn release(&self, n: usize) {
        self.permits.add_permits(n);
    }

    pub(super) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmProvider for Gate {
    async fn chat(
        &self,
        _: &[ChatMessage],
        _: &ProviderConfig,
    ) -> Result<ChatOutput, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(permit) = self.permits.acquire().await {
            permit.forget();
        }
        if self.fail {
            return Err(ProviderError::Http {
                provider: "gate".into(),
                status: 500,
                body: "down".into(),
            });
        }
        Ok(ChatOutput::text("Done."))
    }
}

pub(super) struct Fixture {
    pub store: Store,
    pub scheduler: Scheduler,
    pub gate: Arc<Gate>,
}

/// A scheduler with its own bookkeeping over `store`, as a second process
/// opening the same database would have.
pub(super) fn scheduler_on(store: &Store, gate: Arc<Gate>) -> Scheduler {
    let state = Arc::new(SchedulerState::new());
    let skills: Arc<dyn SkillRegistry> = Arc::new(SkillManager::new());
    let bus = Arc::new(CollaborationBus::new(store.clone()));
    let agent_loop = Arc::new(AgentLoop::new(gate, skills, bus, state.clone()));
    Scheduler::new(store.clone(), state, agent_loop, Arc::new(NoopObserver))
}

pub(super) fn fixture(gate: Gate) -> Fixture {
    let store = Store::open_in_memory().unwrap();
    let gate = Arc::new(gate);
    let scheduler = scheduler_on(&store, gate.clone());
    Fixture {
        store,
        scheduler,
        gate,
    }
}

pub(super) async fn add_agent(store: &Store, name: &str, role: Role) -> AgentRecord {
    store
        .create_agent(NewAgent {
            name: Some(name.to_string()),
            role,
            ..NewAgent::default()
        })
        .await
        .unwrap()
}

pub(super) async fn add_task(
    store: &Store,
    title: &str,
    role: Role,
    priority: Priority,
) -> TaskRecord {
    store
        .create_task(NewTask {
            title: Some(title.to_string()),
            assigned_role: role,
            priority,
            ..NewTask::default()
        })
        .await
        .unwrap()
}

pub(super) async fn wait_until<F: Fn() -> bool>(check: F) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

pub(super) async fn wait_for_status(store: &Store, id: &str, status: TaskStatus) -> TaskRecord {
    for _ in 0..200 {
        let task = store.get_task(id).await.unwrap().unwrap();
        if task.status == status {
            return task;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {} never reached {:?}", id, status);
}

pub(super) async fn status_of(store: &Store, id: &str) -> TaskStatus {
    store.get_task(id).await.unwrap().unwrap().status
}
