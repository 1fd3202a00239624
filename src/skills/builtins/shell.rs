use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::process::Stdio;
use std::time::Duration;
use tracing::info;

use crate::platform::{NativePlatform, Platform};
use crate::skills::{SkillCode, ToolContext, ToolOutput};

const DEFAULT_TIMEOUT_MS: u64 = 10_000;

pub struct ShellSkill;

#[async_trait]
impl SkillCode for ShellSkill {
    async fn execute_tool(
        &self,
        tool: &str,
        args: &Map<String, Value>,
        ctx: &ToolContext,
    ) -> Result<ToolOutput> {
        if tool != "run_shell_command" {
            return Ok(ToolOutput::error(format!(
                "Unknown tool \"{}\" in shell skill.",
                tool
            )));
        }
        let command = args.get("command").and_then(|v| v.as_str()).unwrap_or("");
        if command.trim().is_empty() {
            return Ok(ToolOutput::error(
                "run_shell_command requires a 'command' argument.",
            ));
        }

        let timeout_ms = ctx.config_u64("timeout").unwrap_or(DEFAULT_TIMEOUT_MS);
        info!("[{}] $ {}", ctx.agent_name, command);

        let mut cmd = NativePlatform::shell_inline(command);
        if ctx.work_dir.is_dir() {
            cmd.current_dir(&ctx.work_dir);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => return Ok(ToolOutput::error(e)),
        };
        let output =
            match tokio::time::timeout(Duration::from_millis(timeout_ms), child.wait_with_output())
                .await
            {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => return Ok(ToolOutput::error(e)),
                Err(_) => {
                    return Ok(ToolOutput::error(format!(
                        "command timed out after {}s",
                        timeout_ms as f64 / 1000.0
                    )));
                }
            };

        let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        let combined = combined.trim();
        Ok(ToolOutput::Text(if combined.is_empty() {
            "(no output)".to_string()
        } else {
            combined.to_string()
        }))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn command(cmd: &str) -> Map<String, Value> {
        let mut args = Map::new();
        args.insert("command".into(), Value::from(cmd));
        args
    }

    fn ctx_in(dir: &std::path::Path) -> ToolContext {
        ToolContext {
            work_dir: dir.to_path_buf(),
            ..ToolContext::default()
        }
    }

    #[tokio::test]
    async fn runs_in_work_dir_and_merges_streams() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("marker.txt"), "x").unwrap();
        let out = ShellSkill
            .execute_tool("run_shell_command", &command("ls; echo oops 1>&2"), &ctx_in(tmp.path()))
            .await
            .unwrap();
        assert_eq!(out, ToolOutput::Text("marker.txt\noops".into()));
    }

    #[tokio::test]
    async fn silent_command_reports_no_output() {
        let tmp = tempfile::tempdir().unwrap();
        let out = ShellSkill
            .execute_tool("run_shell_command", &command("true"), &ctx_in(tmp.path()))
            .await
            .unwrap();
        assert_eq!(out, ToolOutput::Text("(no output)".into()));
    }

    #[tokio::test]
    async fn timeout_comes_from_config() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = Map::new();
        config.insert("timeout".into(), Value::from(100));
        let ctx = ctx_in(tmp.path()).with_config(config);
        let out = ShellSkill
            .execute_tool("run_shell_command", &command("sleep 5"), &ctx)
            .await
            .unwrap();
        assert_eq!(out, ToolOutput::Text("Error: command timed out after 0.1s".into()));
    }

    #[tokio::test]
    async fn missing_command_is_a_tool_error() {
        let out = ShellSkill
            .execute_tool("run_shell_command", &Map::new(), &ToolContext::default())
            .await
            .unwrap();
        assert!(matches!(out, ToolOutput::Text(t) if t.starts_with("Error:")));
    }
}
