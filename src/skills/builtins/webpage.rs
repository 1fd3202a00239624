use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;
use tracing::{info, warn};

use super::safe_file_stem;
use crate::skills::{PendingAction, SkillCode, ToolContext, ToolOutput};

static FENCE_START_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^```(?:html)?\s*").unwrap());
static FENCE_END_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"```\s*$").unwrap());

pub struct WebpageSkill;

pub(crate) fn strip_html_fences(html: &str) -> String {
    let trimmed = html.trim();
    let without_start = FENCE_START_RE.replace(trimmed, "");
    FENCE_END_RE.replace(&without_start, "").trim().to_string()
}

/// Write the generated page to `<workDir>/pages/` and optionally open it.
pub async fn save_webpage(title: &str, html: &str, ctx: &ToolContext) -> Result<String> {
    let dir = ctx.work_dir.join("pages");
    tokio::fs::create_dir_all(&dir).await?;

    let file_name = format!(
        "{}_{}.html",
        safe_file_stem(title, 50),
        chrono::Utc::now().timestamp_millis()
    );
    let path = dir.join(file_name);
    tokio::fs::write(&path, strip_html_fences(html)).await?;
    info!("[{}] Saved webpage {:?}", ctx.agent_name, path);

    if !ctx.config_bool("open") {
        return Ok(format!("Webpage saved.\nFile: {}", path.display()));
    }
    let target = path.clone();
    match tokio::task::spawn_blocking(move || open::that(target)).await? {
        Ok(()) => Ok(format!(
            "Webpage created and opened in browser.\nFile: {}",
            path.display()
        )),
        Err(e) => {
            warn!("Failed to open {:?}: {}", path, e);
            Ok(format!(
                "Webpage saved but failed to open.\nFile: {}",
                path.display()
            ))
        }
    }
}

#[async_trait]
impl SkillCode for WebpageSkill {
    async fn execute_tool(
        &self,
        tool: &str,
        args: &Map<String, Value>,
        _ctx: &ToolContext,
    ) -> Result<ToolOutput> {
        if tool != "create_webpage" {
            return Ok(ToolOutput::error(format!(
                "Unknown tool \"{}\" in webpage skill.",
                tool
            )));
        }
        let title = args
            .get("title")
            .and_then(|v| v.as_str())
            .filter(|t| !t.trim().is_empty())
            .unwrap_or("page");
        Ok(ToolOutput::Pending(PendingAction::Webpage {
            title: title.to_string(),
        }))
    }
}
