use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::info;

use super::safe_file_stem;
use crate::skills::{PendingAction, SkillCode, ToolContext, ToolOutput};

const DEFAULT_FROM: &str = "taskcrew@localhost";

pub struct EmailSkill;

fn render_message(from: &str, to: &str, subject: &str, body: &str) -> String {
    format!(
        "From: {}\r\nTo: {}\r\nSubject: {}\r\nDate: {}\r\nMIME-Version: 1.0\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n{}\r\n",
        from,
        to,
        subject,
        chrono::Local::now().to_rfc2822(),
        body.trim().replace('\n', "\r\n")
    )
}

/// Write the composed message as an `.eml` file into `<workDir>/outbox/`.
pub async fn write_outbox(
    to: &str,
    subject: &str,
    body: &str,
    ctx: &ToolContext,
) -> Result<String> {
    if to.trim().is_empty() {
        return Ok("Error: send_email requires a 'to' argument.".to_string());
    }
    let dir = ctx.work_dir.join("outbox");
    tokio::fs::create_dir_all(&dir).await?;

    let from = ctx.config_str("from").unwrap_or(DEFAULT_FROM);
    let path = dir.join(format!(
        "{}_{}.eml",
        chrono::Utc::now().timestamp_millis(),
        safe_file_stem(subject, 40)
    ));
    tokio::fs::write(&path, render_message(from, to, subject, body)).await?;
    info!("[{}] Queued email to {} at {:?}", ctx.agent_name, to, path);

    Ok(format!(
        "Email to {} queued in outbox.\nFile: {}",
        to,
        path.display()
    ))
}

#[async_trait]
impl SkillCode for EmailSkill {
    async fn execute_tool(
        &self,
        tool: &str,
        args: &Map<String, Value>,
        _ctx: &ToolContext,
    ) -> Result<ToolOutput> {
        if tool != "send_email" {
            return Ok(ToolOutput::error(format!(
                "Unknown tool \"{}\" in email skill.",
                tool
            )));
        }
        let arg = |key: &str| {
            args.get(key)
                .and_then(|v| v.as_str())
                .map(str::trim)
                .filter(|s| !s.is_empty())
        };
        let Some(to) = arg("to").or_else(|| arg("recipient")) else {
            return Ok(ToolOutput::error("send_email requires a 'to' argument."));
        };
        Ok(ToolOutput::Pending(PendingAction::Email {
            to: to.to_string(),
            subject: arg("subject").unwrap_or("(no subject)").to_string(),
        }))
    }
}
