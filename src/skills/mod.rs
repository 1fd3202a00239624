pub mod builtins;
pub mod script_executor;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{info, warn};

use crate::core::llm::ImageData;
use script_executor::ScriptSkill;

pub const WEBPAGE_PENDING: &str = "__WEBPAGE_PENDING__";
pub const EMAIL_PENDING: &str = "__EMAIL_PENDING__";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkillKind {
    #[default]
    Tools,
    Workflow,
    Service,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Argument names in display order; a trailing `?` marks optional ones.
    #[serde(default)]
    pub args: Vec<String>,
}

impl ToolSpec {
    pub fn new(name: &str, args: &[&str], description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// One catalogue line, `- name(a, b): description`.
    pub fn catalogue_line(&self) -> String {
        format!(
            "- {}({}): {}",
            self.name,
            self.args.join(", "),
            self.description
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillManifest {
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub kind: SkillKind,
    #[serde(default)]
    pub tools: Vec<ToolSpec>,
    #[serde(default)]
    pub prompt_rules: Vec<String>,
    #[serde(default)]
    pub match_keywords: Vec<String>,
    #[serde(default)]
    pub config_schema: Map<String, Value>,

    // Script run for directory skills (defaults to run.sh)
    #[serde(default = "default_entrypoint")]
    pub entrypoint: String,

    // Injected at load time
    #[serde(skip)]
    pub skill_dir: PathBuf,
}

fn default_entrypoint() -> String {
    "run.sh".to_string()
}

impl SkillManifest {
    pub fn parse(content: &str) -> Result<Self> {
        let manifest: SkillManifest = toml::from_str(content)?;
        if manifest.name.trim().is_empty() {
            return Err(anyhow::anyhow!("Skill manifest is missing a name"));
        }
        Ok(manifest)
    }

    pub fn has_tools(&self) -> bool {
        !self.tools.is_empty()
    }

    pub fn label(&self) -> &str {
        if self.display_name.is_empty() {
            &self.name
        } else {
            &self.display_name
        }
    }
}

/// What a tool invocation knows about its caller.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub agent_id: String,
    pub agent_name: String,
    pub work_dir: PathBuf,
    /// The agent's per-skill config for the skill being called.
    pub config: Map<String, Value>,
}

impl ToolContext {
    pub fn with_config(&self, config: Map<String, Value>) -> Self {
        Self {
            config,
            ..self.clone()
        }
    }

    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config
            .get(key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
    }

    pub fn config_u64(&self, key: &str) -> Option<u64> {
        match self.config.get(key)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn config_bool(&self, key: &str) -> bool {
        match self.config.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s == "true",
            _ => false,
        }
    }
}

/// A tool call whose side effect needs the model's next free-form reply.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingAction {
    Webpage { title: String },
    Email { to: String, subject: String },
}

impl PendingAction {
    /// Map a sentinel result string to the pending action it stands for.
    pub fn from_sentinel(text: &str, args: &Map<String, Value>) -> Option<Self> {
        let arg = |key: &str| {
            args.get(key)
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        match text.trim() {
            WEBPAGE_PENDING => Some(PendingAction::Webpage {
                title: arg("title").unwrap_or_else(|| "page".to_string()),
            }),
            EMAIL_PENDING => Some(PendingAction::Email {
                to: arg("to").or_else(|| arg("recipient")).unwrap_or_default(),
                subject: arg("subject").unwrap_or_else(|| "(no subject)".to_string()),
            }),
            _ => None,
        }
    }

    pub fn tool_name(&self) -> &'static str {
        match self {
            PendingAction::Webpage { .. } => "create_webpage",
            PendingAction::Email { .. } => "send_email",
        }
    }

    pub fn trace_label(&self) -> &'static str {
        match self {
            PendingAction::Webpage { .. } => "create_webpage (saved)",
            PendingAction::Email { .. } => "send_email (sent)",
        }
    }

    pub fn args(&self) -> Value {
        match self {
            PendingAction::Webpage { title } => serde_json::json!({ "title": title }),
            PendingAction::Email { to, subject } => {
                serde_json::json!({ "to": to, "subject": subject })
            }
        }
    }

    /// Instruction asking the model for the deferred content.
    pub fn request_prompt(&self) -> String {
        match self {
            PendingAction::Webpage { title } => format!(
                "Webpage \"{}\" is ready to be created. Now output ONLY the complete HTML code starting with <!DOCTYPE html>. Do NOT wrap it in JSON or code fences. Output raw HTML only.",
                title
            ),
            PendingAction::Email { to, subject } => format!(
                "Email to \"{}\" with subject \"{}\" is ready. Now output ONLY the email body text. Do NOT wrap it in JSON or code fences. Output plain text only.",
                to, subject
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutput {
    Text(String),
    Media { text: String, images: Vec<ImageData> },
    Pending(PendingAction),
}

impl ToolOutput {
    /// Wrap a plain result, recognising the pending sentinels.
    pub fn from_text(text: String, args: &Map<String, Value>) -> Self {
        match PendingAction::from_sentinel(&text, args) {
            Some(action) => ToolOutput::Pending(action),
            None => ToolOutput::Text(text),
        }
    }

    pub fn error(message: impl std::fmt::Display) -> Self {
        ToolOutput::Text(format!("Error: {}", message))
    }
}

/// Host side of a messaging-channel service: routes inbound chat text into
/// the agent loop and exposes per-chat session state.
#[async_trait]
pub trait ChannelHandler: Send + Sync {
    async fn handle_message(&self, agent_id: &str, chat_id: &str, text: &str) -> String;
    fn clear_chat(&self, agent_id: &str, chat_id: &str);
    fn chat_len(&self, agent_id: &str, chat_id: &str) -> usize;
    /// Agent name and provider label.
    async fn agent_summary(&self, agent_id: &str) -> Option<(String, String)>;
}

#[async_trait]
pub trait SkillCode: Send + Sync {
    async fn execute_tool(
        &self,
        tool: &str,
        args: &Map<String, Value>,
        ctx: &ToolContext,
    ) -> Result<ToolOutput>;

    /// Perform the deferred side effect of a pending action with the model's payload.
    async fn complete_pending(
        &self,
        action: &PendingAction,
        payload: &str,
        ctx: &ToolContext,
    ) -> Result<String> {
        builtins::complete_pending(action, payload, ctx).await
    }

    async fn start_service(
        &self,
        _ctx: &ToolContext,
        _host: Arc<dyn ChannelHandler>,
    ) -> Result<bool> {
        Ok(false)
    }

    async fn stop_service(&self, _agent_id: &str) -> Result<()> {
        Ok(())
    }

    fn is_running(&self, _agent_id: &str) -> bool {
        false
    }
}

pub trait SkillRegistry: Send + Sync {
    fn manifest(&self, name: &str) -> Option<SkillManifest>;
    fn load_code(&self, name: &str) -> Option<Arc<dyn SkillCode>>;
    fn workflow_text(&self, name: &str) -> Option<String>;
    fn list(&self) -> Vec<SkillManifest>;
}

struct LoadedSkill {
    manifest: SkillManifest,
    code: Option<Arc<dyn SkillCode>>,
    workflow: Option<String>,
}

/// Builtin skills plus whatever a skills directory provides.
pub struct SkillManager {
    skills: BTreeMap<String, LoadedSkill>,
}

impl Default for SkillManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SkillManager {
    pub fn new() -> Self {
        Self {
            skills: BTreeMap::new(),
        }
    }

    pub fn with_builtins() -> Result<Self> {
        let mut manager = Self::new();
        for (manifest, code) in builtins::all()? {
            manager.register(manifest, Some(code), None);
        }
        Ok(manager)
    }

    pub fn register(
        &mut self,
        manifest: SkillManifest,
        code: Option<Arc<dyn SkillCode>>,
        workflow: Option<String>,
    ) {
        info!("Registering skill: {}", manifest.name);
        self.skills.insert(
            manifest.name.clone(),
            LoadedSkill {
                manifest,
                code,
                workflow,
            },
        );
    }

    /// Load every `<dir>/<skill>/manifest.toml`. Builtin names are not
    /// overridden. Returns the number of skills registered.
    pub async fn load_skills_from_dir<P: AsRef<Path>>(&mut self, dir_path: P) -> Result<usize> {
        let path = dir_path.as_ref();
        if !path.is_dir() {
            warn!("Skills directory not found at {:?}", path);
            return Ok(0);
        }

        let mut loaded = 0;
        let mut entries = fs::read_dir(path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let skill_dir = entry.path();
            let manifest_path = skill_dir.join("manifest.toml");
            if !skill_dir.is_dir() || !manifest_path.exists() {
                continue;
            }

            let contents = match fs::read_to_string(&manifest_path).await {
                Ok(c) => c,
                Err(e) => {
                    warn!("Failed to read manifest at {:?}: {}", manifest_path, e);
                    continue;
                }
            };
            let mut manifest = match SkillManifest::parse(&contents) {
                Ok(m) => m,
                Err(e) => {
                    warn!("Failed to parse manifest at {:?}: {}", manifest_path, e);
                    continue;
                }
            };
            if builtins::is_builtin(&manifest.name) {
                warn!("Skipping {:?}: '{}' is a builtin skill", skill_dir, manifest.name);
                continue;
            }
            manifest.skill_dir = skill_dir.clone();

            let workflow = if manifest.kind == SkillKind::Workflow {
                match fs::read_to_string(skill_dir.join("workflow.md")).await {
                    Ok(text) => Some(text),
                    Err(e) => {
                        warn!(
                            "Workflow skill '{}' has no readable workflow.md: {}",
                            manifest.name, e
                        );
                        continue;
                    }
                }
            } else {
                None
            };

            let code: Option<Arc<dyn SkillCode>> =
                if manifest.has_tools() && skill_dir.join(&manifest.entrypoint).exists() {
                    Some(Arc::new(ScriptSkill::new(manifest.clone())))
                } else {
                    None
                };

            self.register(manifest, code, workflow);
            loaded += 1;
        }
        info!("Loaded {} skills from {:?}", loaded, path);
        Ok(loaded)
    }
}

impl SkillRegistry for SkillManager {
    fn manifest(&self, name: &str) -> Option<SkillManifest> {
        self.skills.get(name).map(|s| s.manifest.clone())
    }

    fn load_code(&self, name: &str) -> Option<Arc<dyn SkillCode>> {
        self.skills.get(name).and_then(|s| s.code.clone())
    }

    fn workflow_text(&self, name: &str) -> Option<String> {
        self.skills.get(name).and_then(|s| s.workflow.clone())
    }

    fn list(&self) -> Vec<SkillManifest> {
        self.skills.values().map(|s| s.manifest.clone()).collect()
    }
}
