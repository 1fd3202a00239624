use anyhow::{Result, bail};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::skills::{SkillCode, ToolContext, ToolOutput};

const BRAVE_ENDPOINT: &str = "https://api.search.brave.com/res/v1/web/search";
pub const MAX_RESULTS: usize = 8;

#[derive(Deserialize, Default)]
struct BraveResponse {
    #[serde(default)]
    web: Option<BraveWeb>,
}

#[derive(Deserialize, Default)]
struct BraveWeb {
    #[serde(default)]
    results: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
}

/// Brave web search. Needs `braveApiKey` in the agent's skill config;
/// `endpoint` overrides the API URL.
pub struct WebSearchSkill {
    client: Client,
}

impl Default for WebSearchSkill {
    fn default() -> Self {
        Self {
            client: Client::new(),
        }
    }
}

fn format_hits(hits: &[SearchHit]) -> String {
    hits.iter()
        .take(MAX_RESULTS)
        .enumerate()
        .map(|(i, hit)| format!("[{}] {}\n{}", i + 1, hit.title, hit.description))
        .collect::<Vec<_>>()
        .join("\n\n")
}

impl WebSearchSkill {
    async fn search(&self, endpoint: &str, api_key: &str, query: &str) -> Result<Vec<SearchHit>> {
        let count = MAX_RESULTS.to_string();
        let res = self
            .client
            .get(endpoint)
            .query(&[("q", query), ("count", count.as_str())])
            .header("X-Subscription-Token", api_key)
            .header("Accept", "application/json")
            .send()
            .await?;

        let status = res.status();
        if !status.is_success() {
            bail!("Brave Search API error: {}", status.as_u16());
        }
        let body: BraveResponse = res.json().await?;
        Ok(body.web.unwrap_or_default().results)
    }
}

#[async_trait]
impl SkillCode for WebSearchSkill {
    async fn execute_tool(
        &self,
        tool: &str,
        args: &Map<String, Value>,
        ctx: &ToolContext,
    ) -> Result<ToolOutput> {
        if tool != "web_search" {
            return Ok(ToolOutput::error(format!(
                "Unknown tool \"{}\" in web-search skill.",
                tool
            )));
        }

        let query = args
            .get("query")
            .or_else(|| args.get("q"))
            .and_then(|v| v.as_str())
            .map(str::trim)
            .unwrap_or("");
        if query.is_empty() {
            return Ok(ToolOutput::error("web_search requires a 'query' argument."));
        }
        let Some(api_key) = ctx.config_str("braveApiKey") else {
            return Ok(ToolOutput::error(
                "Brave API key not configured. Set braveApiKey in the web-search skill config.",
            ));
        };
        let endpoint = ctx.config_str("endpoint").unwrap_or(BRAVE_ENDPOINT);

        debug!("[{}] web_search: {}", ctx.agent_name, query);
        match self.search(endpoint, api_key, query).await {
            Ok(hits) if hits.is_empty() => Ok(ToolOutput::Text("No results found.".to_string())),
            Ok(hits) => Ok(ToolOutput::Text(format_hits(&hits))),
            Err(e) => {
                warn!("[{}] web_search failed: {}", ctx.agent_name, e);
                Ok(ToolOutput::Text(format!("Search error: {}", e)))
            }
        }
    }
}
