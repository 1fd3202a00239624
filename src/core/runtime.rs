use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::sync::{Arc, Weak};
use tracing::{error, info, warn};

use crate::core::brain::{AgentLoop, LoopOutcome, LoopRequest, Observer};
use crate::core::bus::{CollaborationBus, LoopEntry};
use crate::core::config::AppConfig;
use crate::core::lifecycle::LifecycleComponent;
use crate::core::llm::LlmProvider;
use crate::core::scheduler::{Scheduler, SchedulerState};
use crate::core::session::SessionStore;
use crate::core::store::{AgentRecord, Store};
use crate::skills::{ChannelHandler, SkillKind, SkillRegistry, ToolContext};

const AUTO_START_KEY: &str = "autoStart";

/// Composition root: owns the loop, the scheduler and per-agent sessions.
pub struct Runtime {
    store: Store,
    skills: Arc<dyn SkillRegistry>,
    sessions: SessionStore,
    agent_loop: Arc<AgentLoop>,
    scheduler: Scheduler,
    observer: Arc<dyn Observer>,
}

fn error_outcome(e: anyhow::Error) -> LoopOutcome {
    LoopOutcome {
        output: format!("Agent error: {}", e),
        trace: Vec::new(),
        aborted: false,
        iterations: 0,
    }
}

fn tool_context(agent: &AgentRecord, skill: &str) -> ToolContext {
    ToolContext {
        agent_id: agent.id.clone(),
        agent_name: agent.name.clone(),
        work_dir: agent.work_dir.clone().into(),
        config: agent.skill_config(skill),
    }
}

impl Runtime {
    pub fn new(
        store: Store,
        skills: Arc<dyn SkillRegistry>,
        provider: Arc<dyn LlmProvider>,
        observer: Arc<dyn Observer>,
        config: &AppConfig,
    ) -> Arc<Self> {
        let state = Arc::new(SchedulerState::new());
        let bus = Arc::new(CollaborationBus::new(store.clone()));
        let agent_loop = Arc::new(
            AgentLoop::new(provider, skills.clone(), bus.clone(), state.clone())
                .with_history_context(config.agents.history_context),
        );
        let scheduler = Scheduler::new(store.clone(), state, agent_loop.clone(), observer.clone());

        let runtime = Arc::new(Self {
            store,
            skills,
            sessions: SessionStore::new(config.agents.session_window),
            agent_loop,
            scheduler,
            observer,
        });
        let entry: Weak<Runtime> = Arc::downgrade(&runtime);
        bus.set_loop_entry(entry);
        runtime
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn skills(&self) -> &Arc<dyn SkillRegistry> {
        &self.skills
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    async fn agent(&self, agent_id: &str) -> Result<AgentRecord> {
        self.store
            .get_agent(agent_id)
            .await?
            .ok_or_else(|| anyhow!("agent \"{}\" not found", agent_id))
    }

    async fn converse(
        &self,
        agent_id: &str,
        chat_id: Option<&str>,
        prompt: &str,
    ) -> Result<LoopOutcome> {
        let agent = self.agent(agent_id).await?;
        let history = self.sessions.history(agent_id, chat_id);
        let request = LoopRequest::new(agent, prompt).with_history(history);
        let outcome = self.agent_loop.run(request, self.observer.as_ref()).await?;
        self.sessions
            .push_exchange(agent_id, chat_id, prompt, &outcome.output);
        Ok(outcome)
    }

    /// One turn of direct conversation. Failures come back as an
    /// `Agent error: ...` reply.
    pub async fn chat(&self, agent_id: &str, prompt: &str) -> LoopOutcome {
        match self.converse(agent_id, None, prompt).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Chat with agent {} failed: {}", agent_id, e);
                error_outcome(e)
            }
        }
    }

    pub async fn channel_message(&self, agent_id: &str, chat_id: &str, text: &str) -> String {
        match self.converse(agent_id, Some(chat_id), text).await {
            Ok(outcome) => outcome.output,
            Err(e) => {
                error!("Channel message for agent {} failed: {}", agent_id, e);
                error_outcome(e).output
            }
        }
    }

    pub fn clear_session(&self, agent_id: &str) {
        self.sessions.clear(agent_id, None);
    }

    fn service_skills(&self, agent: &AgentRecord) -> Vec<String> {
        agent
            .installed_skills()
            .filter(|(name, _)| {
                self.skills
                    .manifest(name)
                    .is_some_and(|m| m.kind == SkillKind::Service)
            })
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Start the agent's service skills that are configured to auto-start.
    /// Returns the skills that are running afterwards.
    pub async fn start_services(self: &Arc<Self>, agent_id: &str) -> Result<Vec<String>> {
        let agent = self.agent(agent_id).await?;
        let host: Arc<dyn ChannelHandler> = self.clone();
        let mut started = Vec::new();

        for skill in self.service_skills(&agent) {
            let ctx = tool_context(&agent, &skill);
            if !ctx.config_bool(AUTO_START_KEY) {
                continue;
            }
            let Some(code) = self.skills.load_code(&skill) else {
                warn!("[{}] Service skill '{}' has no code", agent.name, skill);
                continue;
            };
            match code.start_service(&ctx, host.clone()).await {
                Ok(true) => started.push(skill),
                Ok(false) => warn!("[{}] Service '{}' did not start", agent.name, skill),
                Err(e) => error!("[{}] Service '{}' failed to start: {}", agent.name, skill, e),
            }
        }
        Ok(started)
    }

    pub async fn stop_services(&self, agent_id: &str) -> Result<()> {
        let agent = self.agent(agent_id).await?;
        for skill in self.service_skills(&agent) {
            if let Some(code) = self.skills.load_code(&skill)
                && code.is_running(agent_id)
            {
                code.stop_service(agent_id).await?;
                info!("[{}] Stopped service '{}'", agent.name, skill);
            }
        }
        Ok(())
    }

    pub async fn start_all_services(self: &Arc<Self>) -> Result<usize> {
        let mut count = 0;
        for agent in self.store.list_agents().await? {
            count += self.start_services(&agent.id).await?.len();
        }
        Ok(count)
    }

    pub async fn stop_all_services(&self) -> Result<()> {
        for agent in self.store.list_agents().await? {
            if let Err(e) = self.stop_services(&agent.id).await {
                warn!("[{}] Failed to stop services: {}", agent.name, e);
            }
        }
        Ok(())
    }

    /// Delete the agent together with its sessions and running services.
    pub async fn remove_agent(&self, agent_id: &str) -> Result<bool> {
        if self.store.get_agent(agent_id).await?.is_some() {
            self.stop_services(agent_id).await?;
        }
        self.sessions.remove_agent(agent_id);
        self.store.delete_agent(agent_id).await
    }
}

#[async_trait]
impl LoopEntry for Runtime {
    async fn run_message(&self, agent: AgentRecord, prompt: String) -> Result<String> {
        info!("[{}] Handling collaboration message", agent.name);
        let outcome = self
            .agent_loop
            .run(LoopRequest::new(agent, prompt), self.observer.as_ref())
            .await?;
        Ok(outcome.output)
    }
}

#[async_trait]
impl ChannelHandler for Runtime {
    async fn handle_message(&self, agent_id: &str, chat_id: &str, text: &str) -> String {
        self.channel_message(agent_id, chat_id, text).await
    }

    fn clear_chat(&self, agent_id: &str, chat_id: &str) {
        self.sessions.clear(agent_id, Some(chat_id));
    }

    fn chat_len(&self, agent_id: &str, chat_id: &str) -> usize {
        self.sessions.len(agent_id, Some(chat_id))
    }

    async fn agent_summary(&self, agent_id: &str) -> Option<(String, String)> {
        match self.store.get_agent(agent_id).await {
            Ok(Some(agent)) => {
                let label = agent.provider.clone().with_defaults().label();
                Some((agent.name, label))
            }
            _ => None,
        }
    }
}

/// Starts auto-start service skills with the daemon and stops them on shutdown.
pub struct ServicesComponent {
    runtime: Arc<Runtime>,
}

impl ServicesComponent {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self { runtime }
    }
}

#[async_trait]
impl LifecycleComponent for ServicesComponent {
    async fn on_start(&mut self) -> Result<()> {
        let count = self.runtime.start_all_services().await?;
        info!("{} service(s) started", count);
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        self.runtime.stop_all_services().await
    }
}
