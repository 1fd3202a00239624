use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::process::Stdio;
use tracing::warn;

use crate::platform::{NativePlatform, Platform};
use crate::skills::{SkillCode, ToolContext, ToolOutput};

pub struct BasicTools;

fn str_arg<'a>(args: &'a Map<String, Value>, keys: &[&str]) -> &'a str {
    keys.iter()
        .find_map(|k| args.get(*k).and_then(|v| v.as_str()))
        .map(str::trim)
        .unwrap_or("")
}

pub(crate) fn normalize_url(url: &str) -> String {
    let url = url.trim();
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("https://{}", url)
    }
}

#[async_trait]
impl SkillCode for BasicTools {
    async fn execute_tool(
        &self,
        tool: &str,
        args: &Map<String, Value>,
        _ctx: &ToolContext,
    ) -> Result<ToolOutput> {
        match tool {
            "get_current_time" => Ok(ToolOutput::Text(
                chrono::Local::now()
                    .format("%Y-%m-%d %H:%M:%S (UTC%:z)")
                    .to_string(),
            )),
            "open_url" => {
                let url = str_arg(args, &["url"]);
                if url.is_empty() {
                    return Ok(ToolOutput::error("open_url requires a 'url' argument."));
                }
                let target = normalize_url(url);
                let opener_target = target.clone();
                match tokio::task::spawn_blocking(move || open::that(opener_target)).await? {
                    Ok(()) => Ok(ToolOutput::Text(format!(
                        "Opened {} in default browser.",
                        target
                    ))),
                    Err(e) => {
                        warn!("Failed to open {}: {}", target, e);
                        Ok(ToolOutput::error(format!("could not open {}: {}", target, e)))
                    }
                }
            }
            "open_application" => {
                let name = str_arg(args, &["name", "app"]);
                if name.is_empty() {
                    return Ok(ToolOutput::error(
                        "open_application requires a 'name' argument.",
                    ));
                }
                let mut cmd = NativePlatform::launch_application(name);
                cmd.stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null());
                // Left running after the tool returns.
                match cmd.spawn() {
                    Ok(_) => Ok(ToolOutput::Text(format!("Opened {}.", name))),
                    Err(e) => {
                        warn!("Failed to launch {}: {}", name, e);
                        Ok(ToolOutput::error(format!("could not open {}: {}", name, e)))
                    }
                }
            }
            _ => Ok(ToolOutput::error(format!(
                "Unknown tool \"{}\" in basic-tools skill.",
                tool
            ))),
        }
    }
}
