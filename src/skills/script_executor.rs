use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::platform::{NativePlatform, Platform};
use crate::skills::{SkillCode, SkillManifest, ToolContext, ToolOutput};

const DEFAULT_SCRIPT_TIMEOUT_MS: u64 = 30_000;

/// Directory skill backed by a shell script.
///
/// The script receives the tool name as its first argument and the JSON
/// args object on stdin. It runs in the agent's workDir with the skill's
/// config exposed as `TASKCREW_SKILL_CONFIG`. Stdout is the tool result; the
/// pending sentinels are honoured.
pub struct ScriptSkill {
    manifest: SkillManifest,
}

impl ScriptSkill {
    pub fn new(manifest: SkillManifest) -> Self {
        Self { manifest }
    }
}

#[async_trait]
impl SkillCode for ScriptSkill {
    async fn execute_tool(
        &self,
        tool: &str,
        args: &Map<String, Value>,
        ctx: &ToolContext,
    ) -> Result<ToolOutput> {
        if !self.manifest.tools.iter().any(|t| t.name == tool) {
            return Ok(ToolOutput::error(format!(
                "Unknown tool \"{}\" in {} skill.",
                tool, self.manifest.name
            )));
        }

        let script_path = self.manifest.skill_dir.join(&self.manifest.entrypoint);
        if !script_path.exists() {
            return Err(anyhow::anyhow!(
                "Skill entrypoint not found at {:?}",
                script_path
            ));
        }
        info!(
            "[{}] Running script skill [{}] tool {}",
            ctx.agent_name, self.manifest.name, tool
        );

        let mut cmd = NativePlatform::shell_command_async(&script_path);
        cmd.arg(tool);
        if ctx.work_dir.is_dir() {
            cmd.current_dir(&ctx.work_dir);
        } else {
            cmd.current_dir(&self.manifest.skill_dir);
        }
        cmd.env("TASKCREW_AGENT_ID", &ctx.agent_id);
        cmd.env("TASKCREW_AGENT_NAME", &ctx.agent_name);
        cmd.env("TASKCREW_SKILL_DIR", &self.manifest.skill_dir);
        cmd.env(
            "TASKCREW_SKILL_CONFIG",
            serde_json::to_string(&ctx.config)?,
        );
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            let args_json = serde_json::to_string(args)?;
            let _ = stdin.write_all(args_json.as_bytes()).await;
            drop(stdin);
        }

        let timeout_ms = ctx
            .config_u64("timeout")
            .unwrap_or(DEFAULT_SCRIPT_TIMEOUT_MS);
        let output =
            match tokio::time::timeout(Duration::from_millis(timeout_ms), child.wait_with_output())
                .await
            {
                Ok(result) => result?,
                Err(_) => {
                    return Ok(ToolOutput::error(format!(
                        "{} timed out after {}ms",
                        tool, timeout_ms
                    )));
                }
            };

        if !output.status.success() {
            let err = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            return Err(anyhow::anyhow!(
                "Skill script failed: {} {}",
                err.trim(),
                stdout.trim()
            ));
        }

        let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(ToolOutput::from_text(text, args))
    }
}
