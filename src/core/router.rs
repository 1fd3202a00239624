use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::core::bus::is_collaboration_tool;
use crate::core::store::AgentRecord;
use crate::skills::{
    PendingAction, SkillKind, SkillManifest, SkillRegistry, ToolContext, ToolOutput, ToolSpec,
};

pub const COLLABORATION_OWNER: &str = "collaboration";
pub const LOOP_OWNER: &str = "agent loop";
pub const LIST_SKILLS_TOOL: &str = "list_skills";

/// Answered by the loop itself from the router's view of the agent.
pub fn list_skills_spec() -> ToolSpec {
    ToolSpec::new(
        LIST_SKILLS_TOOL,
        &[],
        "Lists the skills installed on this agent with their tools or keywords.",
    )
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolRoute {
    pub skill: String,
    pub tool: ToolSpec,
}

/// A tool name declared by more than one source; `kept` owns the name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCollision {
    pub tool: String,
    pub kept: String,
    pub dropped: String,
}

/// Routing table for one agent's installed skills.
pub struct ToolRouter {
    registry: Arc<dyn SkillRegistry>,
    routes: Vec<ToolRoute>,
    index: HashMap<String, usize>,
    collisions: Vec<ToolCollision>,
    prompt_rules: Vec<String>,
    workflow_skills: Vec<String>,
    skills: Vec<String>,
    base_ctx: ToolContext,
    skill_configs: HashMap<String, Map<String, Value>>,
}

impl ToolRouter {
    /// Skills are visited in ascending name order; the first to declare a
    /// tool keeps it. Collaboration tool names are reserved.
    pub fn build(agent: &AgentRecord, registry: Arc<dyn SkillRegistry>) -> Self {
        let mut router = Self {
            registry: registry.clone(),
            routes: Vec::new(),
            index: HashMap::new(),
            collisions: Vec::new(),
            prompt_rules: Vec::new(),
            workflow_skills: Vec::new(),
            skills: Vec::new(),
            base_ctx: ToolContext {
                agent_id: agent.id.clone(),
                agent_name: agent.name.clone(),
                work_dir: agent.work_dir.clone().into(),
                config: Map::new(),
            },
            skill_configs: HashMap::new(),
        };

        for (skill_name, entry) in agent.installed_skills() {
            let Some(manifest) = registry.manifest(skill_name) else {
                debug!("[{}] Installed skill '{}' is not available", agent.name, skill_name);
                continue;
            };
            router.skills.push(skill_name.clone());
            router
                .skill_configs
                .insert(skill_name.clone(), entry.config.clone());
            router.prompt_rules.extend(manifest.prompt_rules.iter().cloned());
            if manifest.kind == SkillKind::Workflow {
                router.workflow_skills.push(skill_name.clone());
            }
            if manifest.has_tools() {
                router.add_tools(&agent.name, &manifest);
            }
        }
        router
    }

    fn add_tools(&mut self, agent_name: &str, manifest: &SkillManifest) {
        for tool in &manifest.tools {
            let kept = if is_collaboration_tool(&tool.name) {
                Some(COLLABORATION_OWNER.to_string())
            } else if tool.name == LIST_SKILLS_TOOL {
                Some(LOOP_OWNER.to_string())
            } else {
                self.index
                    .get(&tool.name)
                    .map(|&i| self.routes[i].skill.clone())
            };
            if let Some(kept) = kept {
                warn!(
                    "[{}] Tool '{}' from skill '{}' ignored; already provided by '{}'",
                    agent_name, tool.name, manifest.name, kept
                );
                self.collisions.push(ToolCollision {
                    tool: tool.name.clone(),
                    kept,
                    dropped: manifest.name.clone(),
                });
                continue;
            }
            self.index.insert(tool.name.clone(), self.routes.len());
            self.routes.push(ToolRoute {
                skill: manifest.name.clone(),
                tool: tool.clone(),
            });
        }
    }

    pub fn routes(&self) -> &[ToolRoute] {
        &self.routes
    }

    pub fn collisions(&self) -> &[ToolCollision] {
        &self.collisions
    }

    pub fn prompt_rules(&self) -> &[String] {
        &self.prompt_rules
    }

    pub fn workflow_skills(&self) -> &[String] {
        &self.workflow_skills
    }

    /// Text for `list_skills`: every available installed skill, in name order.
    pub fn describe_skills(&self) -> String {
        let blocks: Vec<String> = self
            .skills
            .iter()
            .filter_map(|name| self.registry.manifest(name))
            .map(|manifest| {
                let mut block = format!("- {}: {}", manifest.name, manifest.description);
                if manifest.has_tools() {
                    let tools: Vec<&str> = manifest.tools.iter().map(|t| t.name.as_str()).collect();
                    block.push_str(&format!("\n  Tools: {}", tools.join(", ")));
                }
                if !manifest.match_keywords.is_empty() {
                    block.push_str(&format!(
                        "\n  Keywords: {}",
                        manifest.match_keywords.join(", ")
                    ));
                }
                block
            })
            .collect();
        if blocks.is_empty() {
            "No skills installed.".to_string()
        } else {
            blocks.join("\n\n")
        }
    }

    pub fn resolve(&self, tool: &str) -> Option<&ToolRoute> {
        self.index.get(tool).map(|&i| &self.routes[i])
    }

    fn context_for(&self, skill: &str) -> ToolContext {
        self.base_ctx
            .with_config(self.skill_configs.get(skill).cloned().unwrap_or_default())
    }

    /// Run a routed tool. Failures come back as `Error: ...` text.
    pub async fn execute(
        &self,
        tool: &str,
        args: &Map<String, Value>,
    ) -> (Option<String>, ToolOutput) {
        let Some(route) = self.resolve(tool) else {
            let available: Vec<&str> = self.routes.iter().map(|r| r.tool.name.as_str()).collect();
            return (
                None,
                ToolOutput::error(format!(
                    "Unknown tool \"{}\". Available tools: {}",
                    tool,
                    if available.is_empty() {
                        "(none)".to_string()
                    } else {
                        available.join(", ")
                    }
                )),
            );
        };
        let skill = route.skill.clone();
        let Some(code) = self.registry.load_code(&skill) else {
            return (
                Some(skill.clone()),
                ToolOutput::error(format!("skill \"{}\" has no executable code.", skill)),
            );
        };

        let ctx = self.context_for(&skill);
        let output = match code.execute_tool(tool, args, &ctx).await {
            Ok(output) => output,
            Err(e) => ToolOutput::error(e),
        };
        (Some(skill), output)
    }

    /// Finish a pending action through the skill that started it.
    pub async fn complete_pending(
        &self,
        skill: &str,
        action: &PendingAction,
        payload: &str,
    ) -> String {
        let ctx = self.context_for(skill);
        let result = match self.registry.load_code(skill) {
            Some(code) => code.complete_pending(action, payload, &ctx).await,
            None => crate::skills::builtins::complete_pending(action, payload, &ctx).await,
        };
        result.unwrap_or_else(|e| format!("Error: {}", e))
    }
}
