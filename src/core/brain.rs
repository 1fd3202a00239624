use anyhow::Result;
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::core::bus::{CollaborationBus, collaboration_tools, is_collaboration_tool};
use crate::core::llm::{ChatMessage, ImageData, LlmProvider, ProviderConfig, has_images};
use crate::core::parser::{mentions_tool_call, parse_tool_call};
use crate::core::router::{LIST_SKILLS_TOOL, ToolRouter, list_skills_spec};
use crate::core::scheduler::SchedulerState;
use crate::core::store::{AgentRecord, TaskStatus};
use crate::core::workflow::{Workflow, ai_match, parse_workflow, workflow_block};
use crate::skills::{PendingAction, SkillRegistry, ToolOutput};

pub const DEFAULT_HISTORY_CONTEXT: usize = 10;
pub const CANCELLED_OUTPUT: &str = "Task cancelled.";

const RESULT_PREVIEW_CHARS: usize = 300;
const PARSE_ERROR_PREVIEW_CHARS: usize = 200;

const CORRECTIVE_PROMPT: &str = "Your tool call JSON was malformed and could not be parsed. Please output ONLY a valid JSON object in this exact format, with NO extra text before or after:\n{\"tool_call\":{\"name\":\"tool_name\",\"args\":{\"arg1\":\"value1\"}}}\nMake sure all strings are properly escaped and the JSON is on a single line.";
const FORCE_FINAL_PROMPT: &str =
    "Please provide your final answer now based on all information gathered.";

const TOOL_RULES: &str = "Rules:\n\
1. If you need real-time or local information, you MUST use a tool. Do NOT guess or make up answers.\n\
2. To use a tool, respond with ONLY a single raw JSON object, nothing else:\n   \
{\"tool_call\":{\"name\":\"tool_name\",\"args\":{\"arg1\":\"value1\"}}}\n\
3. After receiving a tool result, decide if you need another tool or can answer.\n\
4. When you have enough information, respond with a plain text answer (NOT JSON).\n\
5. Always answer in the same language as the user's question.\n\n";

/// Progress reported while a loop runs.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Phase { message: String },
    Skill { name: String, description: String },
    Iteration { step: usize, max: usize },
    ToolCall { name: String, args: Value },
    ToolResult { name: String, result: String },
    Done,
    Aborted,
}

/// Receives progress events. Implementations must not block or panic.
pub trait Observer: Send + Sync {
    fn emit(&self, agent_id: &str, event: &ProgressEvent);
}

pub struct NoopObserver;

impl Observer for NoopObserver {
    fn emit(&self, _agent_id: &str, _event: &ProgressEvent) {}
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentProgress {
    pub agent_id: String,
    #[serde(flatten)]
    pub event: ProgressEvent,
}

/// Forwards events into a broadcast channel; a send with no receivers is dropped.
pub struct ChannelObserver {
    tx: broadcast::Sender<AgentProgress>,
}

impl ChannelObserver {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentProgress> {
        self.tx.subscribe()
    }
}

impl Observer for ChannelObserver {
    fn emit(&self, agent_id: &str, event: &ProgressEvent) {
        let _ = self.tx.send(AgentProgress {
            agent_id: agent_id.to_string(),
            event: event.clone(),
        });
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceEntry {
    pub tool: String,
    pub args: Value,
}

impl TraceEntry {
    fn new(tool: impl Into<String>, args: Value) -> Self {
        Self {
            tool: tool.into(),
            args,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoopRequest {
    pub agent: AgentRecord,
    pub prompt: String,
    pub history: Vec<ChatMessage>,
    pub images: Vec<ImageData>,
    /// Board task this run works on; its row is re-read at every iteration.
    pub task_id: Option<String>,
}

impl LoopRequest {
    pub fn new(agent: AgentRecord, prompt: impl Into<String>) -> Self {
        Self {
            agent,
            prompt: prompt.into(),
            history: Vec::new(),
            images: Vec::new(),
            task_id: None,
        }
    }

    pub fn for_task(mut self, task_id: &str) -> Self {
        self.task_id = Some(task_id.to_string());
        self
    }

    pub fn with_history(mut self, history: Vec<ChatMessage>) -> Self {
        self.history = history;
        self
    }

    pub fn with_images(mut self, images: Vec<ImageData>) -> Self {
        self.images = images;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoopOutcome {
    pub output: String,
    pub trace: Vec<TraceEntry>,
    pub aborted: bool,
    /// Provider calls made while iterating, the forced final answer included.
    pub iterations: usize,
}

fn preview(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

fn strip_images(messages: &mut [ChatMessage]) {
    for message in messages.iter_mut().filter(|m| !m.images.is_empty()) {
        let count = message.images.len();
        message.images.clear();
        message.content.push_str(&format!(
            "\n\n[Note: {} image(s) were attached but the model could not process them; continue using the text only.]",
            count
        ));
    }
}

/// The last `limit` turns, starting on a user turn.
fn history_slice(history: &[ChatMessage], limit: usize) -> Vec<ChatMessage> {
    let start = history.len().saturating_sub(limit);
    let mut slice = &history[start..];
    if slice.first().is_some_and(|m| m.role != "user") {
        slice = &slice[1..];
    }
    slice
        .iter()
        .map(|m| ChatMessage {
            role: m.role.clone(),
            content: m.content.clone(),
            images: Vec::new(),
        })
        .collect()
}

fn build_system_prompt(agent: &AgentRecord, router: &ToolRouter) -> String {
    let mut prompt = String::new();

    let identity = agent.role.identity_prompt();
    if !identity.is_empty() {
        prompt.push_str(identity);
        prompt.push_str("\n\n");
    }

    prompt.push_str("You are a helpful AI assistant with access to the following tools:\n\n");
    for tool in collaboration_tools() {
        prompt.push_str(&tool.catalogue_line());
        prompt.push('\n');
    }
    prompt.push_str(&list_skills_spec().catalogue_line());
    prompt.push('\n');
    for route in router.routes() {
        prompt.push_str(&route.tool.catalogue_line());
        prompt.push('\n');
    }

    if !router.prompt_rules().is_empty() {
        prompt.push_str("\nSkill notes:\n");
        for rule in router.prompt_rules() {
            prompt.push_str("- ");
            prompt.push_str(rule);
            prompt.push('\n');
        }
    }

    prompt.push('\n');
    prompt.push_str(TOOL_RULES);
    prompt
}

/// Drives one agent through a prompt: match a workflow, then call the
/// provider and tools until a plain-text answer comes back or the
/// iteration budget runs out.
pub struct AgentLoop {
    provider: Arc<dyn LlmProvider>,
    skills: Arc<dyn SkillRegistry>,
    bus: Arc<CollaborationBus>,
    state: Arc<SchedulerState>,
    history_context: usize,
}

impl AgentLoop {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        skills: Arc<dyn SkillRegistry>,
        bus: Arc<CollaborationBus>,
        state: Arc<SchedulerState>,
    ) -> Self {
        Self {
            provider,
            skills,
            bus,
            state,
            history_context: DEFAULT_HISTORY_CONTEXT,
        }
    }

    pub fn with_history_context(mut self, turns: usize) -> Self {
        self.history_context = turns;
        self
    }

    async fn call_provider(
        &self,
        messages: &mut [ChatMessage],
        config: &ProviderConfig,
        agent_name: &str,
    ) -> Result<String> {
        let output = match self.provider.chat(messages, config).await {
            Ok(output) => output,
            Err(e) if has_images(messages) => {
                warn!(
                    "[{}] Provider failed with image input ({}), retrying text-only",
                    agent_name, e
                );
                strip_images(messages);
                self.provider.chat(messages, config).await?
            }
            Err(e) => return Err(e.into()),
        };
        if let Some(reasoning) = &output.reasoning {
            debug!("[{}] reasoning: {} chars", agent_name, reasoning.len());
        }
        Ok(output.content)
    }

    fn load_workflows(&self, router: &ToolRouter) -> Vec<Workflow> {
        router
            .workflow_skills()
            .iter()
            .filter_map(|name| {
                let text = self.skills.workflow_text(name)?;
                let mut workflow = parse_workflow(&text, name);
                if workflow.keywords.is_empty() {
                    if let Some(manifest) = self.skills.manifest(name) {
                        workflow.keywords = manifest
                            .match_keywords
                            .iter()
                            .map(|k| k.to_lowercase())
                            .collect();
                        if workflow.description.is_empty() {
                            workflow.description = manifest.description;
                        }
                    }
                }
                Some(workflow)
            })
            .collect()
    }

    /// Cancel flag from this process, or the task row cancelled or deleted
    /// by anyone sharing the store.
    async fn should_stop(&self, agent: &AgentRecord, task_id: Option<&str>) -> bool {
        if self.state.is_cancelled(&agent.id) {
            return true;
        }
        let Some(task_id) = task_id else {
            return false;
        };
        match self.bus.store().get_task(task_id).await {
            Ok(Some(task)) => task.status == TaskStatus::Cancelled,
            Ok(None) => true,
            Err(e) => {
                warn!("[{}] Could not re-read task {}: {}", agent.name, task_id, e);
                false
            }
        }
    }

    fn cancelled(
        &self,
        agent: &AgentRecord,
        observer: &dyn Observer,
        mut trace: Vec<TraceEntry>,
        iterations: usize,
    ) -> LoopOutcome {
        info!("[{}] Cancellation observed, stopping loop", agent.name);
        trace.push(TraceEntry::new("(cancelled)", json!({})));
        observer.emit(&agent.id, &ProgressEvent::Aborted);
        LoopOutcome {
            output: CANCELLED_OUTPUT.to_string(),
            trace,
            aborted: true,
            iterations,
        }
    }

    pub async fn run(&self, request: LoopRequest, observer: &dyn Observer) -> Result<LoopOutcome> {
        let LoopRequest {
            agent,
            prompt,
            history,
            images,
            task_id,
        } = request;
        let config = agent.provider.clone().with_defaults();
        let router = ToolRouter::build(&agent, self.skills.clone());
        let mut trace = Vec::new();

        info!("[{}] Loop started ({})", agent.name, config.label());

        // Workflow matching
        observer.emit(
            &agent.id,
            &ProgressEvent::Phase {
                message: "Matching skills...".to_string(),
            },
        );
        let workflows = self.load_workflows(&router);
        let (matched, _) = ai_match(&prompt, &workflows, self.provider.as_ref(), &config).await;

        let mut system_content = build_system_prompt(&agent, &router);
        match matched {
            Some(workflow) => {
                observer.emit(
                    &agent.id,
                    &ProgressEvent::Skill {
                        name: workflow.name.clone(),
                        description: workflow.description.clone(),
                    },
                );
                trace.push(TraceEntry::new(
                    "(skill matched by AI)",
                    json!({ "name": workflow.name, "description": workflow.description }),
                ));
                system_content.push_str(&workflow_block(workflow, &prompt));
            }
            None => {
                observer.emit(
                    &agent.id,
                    &ProgressEvent::Phase {
                        message: "No skill matched, using general agent mode".to_string(),
                    },
                );
                system_content.push_str(&prompt);
            }
        }

        let mut messages = history_slice(&history, self.history_context);
        messages.push(ChatMessage::user(system_content).with_images(images));

        // The forced final answer takes the last slot of the budget.
        let max = agent.max_iterations.max(1);
        let mut pending: Option<(String, PendingAction)> = None;

        for step in 1..max {
            if self.should_stop(&agent, task_id.as_deref()).await {
                return Ok(self.cancelled(&agent, observer, trace, step - 1));
            }
            observer.emit(&agent.id, &ProgressEvent::Iteration { step, max });
            debug!("[{}] iteration {}/{}", agent.name, step, max);

            let content = self.call_provider(&mut messages, &config, &agent.name).await?;
            let call = parse_tool_call(&content);

            if call.is_none() {
                if let Some((skill, action)) = pending.take() {
                    observer.emit(
                        &agent.id,
                        &ProgressEvent::ToolCall {
                            name: action.tool_name().to_string(),
                            args: action.args(),
                        },
                    );
                    let result = router.complete_pending(&skill, &action, &content).await;
                    observer.emit(
                        &agent.id,
                        &ProgressEvent::ToolResult {
                            name: action.tool_name().to_string(),
                            result: preview(&result, RESULT_PREVIEW_CHARS),
                        },
                    );
                    trace.push(TraceEntry::new(action.trace_label(), action.args()));
                    messages.push(ChatMessage::assistant(content));
                    messages.push(ChatMessage::user(format!(
                        "{}\n\nNow provide your final answer to the user in plain text.",
                        result
                    )));
                    continue;
                }
            }

            let Some(call) = call else {
                if mentions_tool_call(&content) {
                    warn!("[{}] Malformed tool call, asking for strict JSON", agent.name);
                    trace.push(TraceEntry::new(
                        "(parse_error)",
                        json!({ "raw": preview(&content, PARSE_ERROR_PREVIEW_CHARS) }),
                    ));
                    messages.push(ChatMessage::assistant(content));
                    messages.push(ChatMessage::user(CORRECTIVE_PROMPT));
                    continue;
                }
                info!("[{}] Final answer after {} iteration(s)", agent.name, step);
                observer.emit(&agent.id, &ProgressEvent::Done);
                return Ok(LoopOutcome {
                    output: content,
                    trace,
                    aborted: false,
                    iterations: step,
                });
            };

            let args_value = Value::Object(call.args.clone());
            trace.push(TraceEntry::new(call.name.clone(), args_value.clone()));
            observer.emit(
                &agent.id,
                &ProgressEvent::ToolCall {
                    name: call.name.clone(),
                    args: args_value,
                },
            );
            info!("[{}] Tool call: {}", agent.name, call.name);

            let (skill, output) = if is_collaboration_tool(&call.name) {
                let text = self.bus.execute(&call.name, &call.args, &agent.id).await;
                (None, ToolOutput::Text(text))
            } else if call.name == LIST_SKILLS_TOOL {
                (None, ToolOutput::Text(router.describe_skills()))
            } else {
                router.execute(&call.name, &call.args).await
            };

            let (result, result_images) = match output {
                ToolOutput::Pending(action) => {
                    messages.push(ChatMessage::assistant(content));
                    messages.push(ChatMessage::user(action.request_prompt()));
                    pending = skill.map(|skill| (skill, action));
                    continue;
                }
                ToolOutput::Text(text) => (text, Vec::new()),
                ToolOutput::Media { text, images } => (text, images),
            };

            observer.emit(
                &agent.id,
                &ProgressEvent::ToolResult {
                    name: call.name.clone(),
                    result: preview(&result, RESULT_PREVIEW_CHARS),
                },
            );
            messages.push(ChatMessage::assistant(content));
            messages.push(
                ChatMessage::user(format!(
                    "Tool \"{}\" returned:\n{}\n\nBased on this result, either use another tool or provide your final answer in plain text.",
                    call.name, result
                ))
                .with_images(result_images),
            );
        }

        if self.should_stop(&agent, task_id.as_deref()).await {
            return Ok(self.cancelled(&agent, observer, trace, max - 1));
        }
        info!("[{}] Iteration budget reached, forcing final answer", agent.name);
        observer.emit(&agent.id, &ProgressEvent::Iteration { step: max, max });
        messages.push(ChatMessage::user(FORCE_FINAL_PROMPT));
        let output = self.call_provider(&mut messages, &config, &agent.name).await?;
        observer.emit(&agent.id, &ProgressEvent::Done);
        Ok(LoopOutcome {
            output,
            trace,
            aborted: false,
            iterations: max,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::llm::{ChatOutput, ProviderError};
    use crate::core::store::{Role, SkillEntry, Store};
    use crate::skills::{SkillCode, SkillManager, SkillManifest, ToolContext, ToolSpec};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::Map;
    use std::collections::{BTreeMap, VecDeque};

    /// Replays canned replies and records every request.
    struct Scripted {
        replies: Mutex<VecDeque<Result<String, ()>>>,
        fallback: Option<String>,
        seen: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl Scripted {
        fn new(replies: &[&str]) -> Self {
            Self {
                replies: Mutex::new(replies.iter().map(|r| Ok(r.to_string())).collect()),
                fallback: None,
                seen: Mutex::new(Vec::new()),
            }
        }

        fn always(reply: &str) -> Self {
            Self {
                replies: Mutex::new(VecDeque::new()),
                fallback: Some(reply.to_string()),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> usize {
            self.seen.lock().len()
        }
    }

    #[async_trait]
    impl LlmProvider for Scripted {
        async fn chat(
            &self,
            messages: &[ChatMessage],
            _: &ProviderConfig,
        ) -> Result<ChatOutput, ProviderError> {
            self.seen.lock().push(messages.to_vec());
            let next = self.replies.lock().pop_front();
            match next {
                Some(Ok(text)) => Ok(ChatOutput::text(text)),
                Some(Err(())) => Err(ProviderError::Decode {
                    provider: "scripted".into(),
                    message: "rejected".into(),
                }),
                None => Ok(ChatOutput::text(self.fallback.clone().unwrap_or_default())),
            }
        }
    }

    struct Counter;

    #[async_trait]
    impl SkillCode for Counter {
        async fn execute_tool(
            &self,
            tool: &str,
            args: &Map<String, Value>,
            _: &ToolContext,
        ) -> Result<ToolOutput> {
            Ok(ToolOutput::from_text(
                match tool {
                    "draft" => crate::skills::WEBPAGE_PENDING.to_string(),
                    _ => format!("ok {}", args.len()),
                },
                args,
            ))
        }

        async fn complete_pending(
            &self,
            _: &PendingAction,
            payload: &str,
            _: &ToolContext,
        ) -> Result<String> {
            Ok(format!("saved {} bytes", payload.len()))
        }
    }

    fn registry() -> Arc<dyn SkillRegistry> {
        let mut manager = SkillManager::new();
        let mut manifest = SkillManifest::parse("name = \"counter\"").unwrap();
        manifest.tools = vec![
            ToolSpec::new("count", &["x"], "counts"),
            ToolSpec::new("draft", &["title"], "drafts"),
        ];
        manager.register(manifest, Some(Arc::new(Counter)), None);
        Arc::new(manager)
    }

    fn agent(max_iterations: usize) -> AgentRecord {
        let mut skills = BTreeMap::new();
        skills.insert("counter".to_string(), SkillEntry::installed());
        AgentRecord {
            id: "agent-1".into(),
            name: "dev".into(),
            role: Role::Developer,
            provider: ProviderConfig::default(),
            skills,
            work_dir: ".".into(),
            max_iterations,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn agent_loop(provider: Arc<Scripted>, state: Arc<SchedulerState>) -> AgentLoop {
        let store = Store::open_in_memory().unwrap();
        AgentLoop::new(
            provider,
            registry(),
            Arc::new(CollaborationBus::new(store)),
            state,
        )
    }

    const COUNT_CALL: &str = r#"{"tool_call":{"name":"count","args":{"x":1}}}"#;

    #[tokio::test]
    async fn plain_text_finishes_in_one_iteration() {
        let provider = Arc::new(Scripted::always("All done."));
        let lp = agent_loop(provider.clone(), Arc::default());
        let out = lp.run(LoopRequest::new(agent(30), "hi"), &NoopObserver).await.unwrap();
        assert_eq!(out.output, "All done.");
        assert_eq!(out.iterations, 1);
        assert!(out.trace.is_empty());
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn endless_tool_calls_hit_the_budget() {
        let provider = Arc::new(Scripted::always(COUNT_CALL));
        let lp = agent_loop(provider.clone(), Arc::default());
        let out = lp.run(LoopRequest::new(agent(4), "loop"), &NoopObserver).await.unwrap();
        assert_eq!(provider.calls(), 4);
        assert_eq!(out.iterations, 4);
        assert_eq!(out.trace.len(), 3);
        assert_eq!(out.output, COUNT_CALL);

        let last = provider.seen.lock().last().cloned().unwrap();
        assert_eq!(last.last().unwrap().content, FORCE_FINAL_PROMPT);
    }

    #[tokio::test]
    async fn tool_result_is_fed_back() {
        let provider = Arc::new(Scripted::new(&[COUNT_CALL, "Counted."]));
        let lp = agent_loop(provider.clone(), Arc::default());
        let out = lp.run(LoopRequest::new(agent(10), "count"), &NoopObserver).await.unwrap();
        assert_eq!(out.output, "Counted.");
        assert_eq!(out.trace, vec![TraceEntry::new("count", json!({"x": 1}))]);

        let second = provider.seen.lock()[1].clone();
        assert_eq!(
            second.last().unwrap().content,
            "Tool \"count\" returned:\nok 1\n\nBased on this result, either use another tool or provide your final answer in plain text."
        );
    }

    #[tokio::test]
    async fn malformed_call_gets_corrective_turn() {
        let provider = Arc::new(Scripted::new(&["tool_call oops", "fine"]));
        let lp = agent_loop(provider.clone(), Arc::default());
        let out = lp.run(LoopRequest::new(agent(10), "x"), &NoopObserver).await.unwrap();
        assert_eq!(out.output, "fine");
        assert_eq!(out.iterations, 2);
        assert_eq!(out.trace[0].tool, "(parse_error)");
        let second = provider.seen.lock()[1].clone();
        assert_eq!(second.last().unwrap().content, CORRECTIVE_PROMPT);
    }

    #[tokio::test]
    async fn pending_action_consumes_next_reply() {
        let provider = Arc::new(Scripted::new(&[
            r#"{"tool_call":{"name":"draft","args":{"title":"Home"}}}"#,
            "<html></html>",
            "Page ready.",
        ]));
        let lp = agent_loop(provider.clone(), Arc::default());
        let out = lp.run(LoopRequest::new(agent(10), "make a page"), &NoopObserver).await.unwrap();
        assert_eq!(out.output, "Page ready.");
        let tools: Vec<&str> = out.trace.iter().map(|t| t.tool.as_str()).collect();
        assert_eq!(tools, vec!["draft", "create_webpage (saved)"]);

        let seen = provider.seen.lock().clone();
        assert!(seen[1].last().unwrap().content.starts_with("Webpage \"Home\" is ready"));
        assert_eq!(
            seen[2].last().unwrap().content,
            "saved 13 bytes\n\nNow provide your final answer to the user in plain text."
        );
    }

    #[tokio::test]
    async fn image_failure_retries_without_images() {
        let provider = Arc::new(Scripted {
            replies: Mutex::new(VecDeque::from(vec![Err(()), Ok("I see text.".to_string())])),
            fallback: None,
            seen: Mutex::new(Vec::new()),
        });
        let lp = agent_loop(provider.clone(), Arc::default());
        let image = ImageData {
            base64: "AAAA".into(),
            media_type: "image/png".into(),
        };
        let request = LoopRequest::new(agent(5), "what is this").with_images(vec![image]);
        let out = lp.run(request, &NoopObserver).await.unwrap();
        assert_eq!(out.output, "I see text.");

        let retry = provider.seen.lock()[1].clone();
        assert!(!has_images(&retry));
        assert!(retry.last().unwrap().content.ends_with(
            "[Note: 1 image(s) were attached but the model could not process them; continue using the text only.]"
        ));
    }

    #[tokio::test]
    async fn provider_error_without_images_propagates() {
        let provider = Arc::new(Scripted {
            replies: Mutex::new(VecDeque::from(vec![Err(())])),
            fallback: None,
            seen: Mutex::new(Vec::new()),
        });
        let lp = agent_loop(provider.clone(), Arc::default());
        assert!(lp.run(LoopRequest::new(agent(5), "x"), &NoopObserver).await.is_err());
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn cancel_flag_aborts_before_calling_provider() {
        let provider = Arc::new(Scripted::always("never"));
        let state = Arc::new(SchedulerState::default());
        state.request_cancel("agent-1");
        let lp = agent_loop(provider.clone(), state);
        let out = lp.run(LoopRequest::new(agent(5), "x"), &NoopObserver).await.unwrap();
        assert!(out.aborted);
        assert_eq!(out.output, CANCELLED_OUTPUT);
        assert_eq!(out.trace.last().unwrap().tool, "(cancelled)");
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn cancelled_task_row_stops_the_loop() {
        use crate::core::store::{NewTask, TaskUpdate};

        let store = Store::open_in_memory().unwrap();
        let task = store.create_task(NewTask::default()).await.unwrap();
        store
            .update_task(&task.id, TaskUpdate::status(TaskStatus::Cancelled))
            .await
            .unwrap();
        let provider = Arc::new(Scripted::always(COUNT_CALL));
        let lp = AgentLoop::new(
            provider.clone(),
            registry(),
            Arc::new(CollaborationBus::new(store.clone())),
            Arc::default(),
        );

        let request = LoopRequest::new(agent(5), "x").for_task(&task.id);
        let out = lp.run(request, &NoopObserver).await.unwrap();
        assert!(out.aborted);
        assert_eq!(provider.calls(), 0);

        store.delete_task(&task.id).await.unwrap();
        let request = LoopRequest::new(agent(5), "x").for_task(&task.id);
        assert!(lp.run(request, &NoopObserver).await.unwrap().aborted);
    }

    #[tokio::test]
    async fn list_skills_is_answered_by_the_loop() {
        let provider = Arc::new(Scripted::new(&[
            r#"{"tool_call":{"name":"list_skills","args":{}}}"#,
            "You have the counter skill.",
        ]));
        let lp = agent_loop(provider.clone(), Arc::default());
        let request = LoopRequest::new(agent(5), "what can you do");
        let out = lp.run(request, &NoopObserver).await.unwrap();
        assert_eq!(out.output, "You have the counter skill.");
        assert_eq!(out.trace[0].tool, "list_skills");

        let second = provider.seen.lock()[1].clone();
        let fed_back = &second.last().unwrap().content;
        assert!(fed_back.starts_with("Tool \"list_skills\" returned:\n- counter: "));
        assert!(fed_back.contains("Tools: count, draft"));
    }

    #[test]
    fn history_slice_starts_on_user_turn() {
        let history: Vec<ChatMessage> = (0..13)
            .map(|i| {
                if i % 2 == 0 {
                    ChatMessage::user(format!("u{}", i))
                } else {
                    ChatMessage::assistant(format!("a{}", i))
                }
            })
            .collect();
        let slice = history_slice(&history, 10);
        assert_eq!(slice.len(), 9);
        assert_eq!(slice[0].content, "u4");
        assert!(history_slice(&[], 10).is_empty());
    }

    #[test]
    fn system_prompt_lists_collaboration_tools_first() {
        let a = agent(5);
        let router = ToolRouter::build(&a, registry());
        let prompt = build_system_prompt(&a, &router);
        assert!(prompt.starts_with("Your role is DEVELOPER."));
        let collab = prompt.find("- send_message_to_agent(agentId, message)").unwrap();
        let skill = prompt.find("- count(x): counts").unwrap();
        assert!(collab < skill);
        assert!(prompt.contains("- list_skills(): Lists the skills installed"));
        assert!(prompt.ends_with(TOOL_RULES));
    }

    #[test]
    fn channel_observer_forwards_events() {
        let observer = ChannelObserver::new(8);
        let mut rx = observer.subscribe();
        observer.emit("a", &ProgressEvent::Iteration { step: 1, max: 3 });
        let got = rx.try_recv().unwrap();
        assert_eq!(got.agent_id, "a");
        assert_eq!(got.event, ProgressEvent::Iteration { step: 1, max: 3 });
        // No receivers left: must not panic.
        drop(rx);
        observer.emit("a", &ProgressEvent::Done);
    }
}
