use regex::Regex;
use std::sync::LazyLock;
use tracing::{debug, info, warn};

use crate::core::llm::{ChatMessage, LlmProvider, ProviderConfig};

static TITLE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^#\s+(.+)$").unwrap());
static MATCH_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^-\s*match:\s*(.+)").unwrap());
static DESCRIPTION_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^-\s*description:\s*(.+)").unwrap());
static INDEX_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+)").unwrap());

const MIN_KEYWORD_HITS: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workflow {
    pub name: String,
    pub description: String,
    pub keywords: Vec<String>,
    pub steps: String,
}

/// Text between `header` and the next `## ` heading (or the end).
fn section<'a>(text: &'a str, header: &str) -> Option<&'a str> {
    let start = text.find(header)? + header.len();
    let body = &text[start..];
    let end = body.find("\n## ").unwrap_or(body.len());
    Some(&body[..end])
}

/// Parse a `workflow.md`: `# Title`, a `## Meta` list with `- match:` and
/// `- description:` lines, and a `## Steps` section.
pub fn parse_workflow(text: &str, fallback_name: &str) -> Workflow {
    let name = TITLE_RE
        .captures(text)
        .map(|c| c[1].trim().to_string())
        .unwrap_or_else(|| fallback_name.to_string());

    let mut keywords = Vec::new();
    let mut description = String::new();
    if let Some(meta) = section(text, "## Meta\n") {
        for line in meta.trim().lines() {
            let line = line.trim();
            if let Some(c) = MATCH_LINE_RE.captures(line) {
                keywords = c[1]
                    .split(',')
                    .map(|k| k.trim().to_lowercase())
                    .filter(|k| !k.is_empty())
                    .collect();
            }
            if let Some(c) = DESCRIPTION_LINE_RE.captures(line) {
                description = c[1].trim().to_string();
            }
        }
    }

    // Steps run to the end of the file.
    let steps = text
        .find("## Steps\n")
        .map(|i| text[i + "## Steps\n".len()..].trim().to_string())
        .unwrap_or_default();

    Workflow {
        name,
        description,
        keywords,
        steps,
    }
}

/// Best keyword-overlap match; needs at least two hits and the earliest
/// workflow wins ties.
pub fn keyword_match<'a>(prompt: &str, workflows: &'a [Workflow]) -> Option<&'a Workflow> {
    let lower = prompt.to_lowercase();
    let mut best: Option<&Workflow> = None;
    let mut best_score = 0;
    for workflow in workflows {
        let hits = workflow
            .keywords
            .iter()
            .filter(|k| lower.contains(k.as_str()))
            .count();
        if hits >= MIN_KEYWORD_HITS && hits > best_score {
            best_score = hits;
            best = Some(workflow);
        }
    }
    best
}

fn match_prompt(prompt: &str, workflows: &[Workflow]) -> String {
    let summaries: Vec<String> = workflows
        .iter()
        .enumerate()
        .map(|(i, w)| format!("[{}] {} — {}", i, w.name, w.description))
        .collect();
    format!(
        "You are a skill-matching assistant. The user wants to perform a task. Below is a list of available automation skills with brief descriptions.\n\n\
         Your job: Decide which skill (if any) is the best match for the user's task. If a skill is clearly relevant, respond with ONLY its index number (e.g. \"0\" or \"2\"). If no skill is relevant, respond with ONLY the word \"none\".\n\n\
         Do NOT explain. Do NOT output anything other than the index number or \"none\".\n\n\
         Available skills:\n{}\n\nUser task: {}\n\nYour answer:",
        summaries.join("\n"),
        prompt
    )
}

/// Interpret the matcher's reply against `count` candidates.
pub fn read_match_answer(answer: &str, count: usize) -> Option<usize> {
    let answer = answer.trim().to_lowercase();
    if answer.contains("none") {
        return None;
    }
    let idx: usize = INDEX_RE.captures(&answer)?[1].parse().ok()?;
    (idx < count).then_some(idx)
}

/// Ask the model to pick a workflow, falling back to keyword matching when
/// the model declines or the call fails.
pub async fn ai_match<'a>(
    prompt: &str,
    workflows: &'a [Workflow],
    provider: &dyn LlmProvider,
    config: &ProviderConfig,
) -> (Option<&'a Workflow>, bool) {
    if workflows.is_empty() {
        return (None, false);
    }

    let request = [ChatMessage::user(match_prompt(prompt, workflows))];
    match provider.chat(&request, config).await {
        Ok(output) => {
            debug!("Skill matching response: {:?}", output.content.trim());
            if let Some(idx) = read_match_answer(&output.content, workflows.len()) {
                info!("AI matched workflow [{}] {}", idx, workflows[idx].name);
                return (Some(&workflows[idx]), true);
            }
        }
        Err(e) => {
            warn!("AI skill matching failed: {}, falling back to keyword matching", e);
        }
    }

    let fallback = keyword_match(prompt, workflows);
    if let Some(w) = fallback {
        info!("Keyword fallback matched workflow: {}", w.name);
    }
    (fallback, false)
}

/// The prompt block that pins the agent to a workflow.
pub fn workflow_block(workflow: &Workflow, prompt: &str) -> String {
    format!(
        "\n\n=== SKILL WORKFLOW: {} ===\n{}\n\nYou MUST follow these steps in order. Do NOT skip steps or invent your own steps. Follow the skill workflow precisely:\n\n{}\n\n=== END SKILL WORKFLOW ===\n\nUser request: {}",
        workflow.name, workflow.description, workflow.steps, prompt
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::llm::{ChatOutput, ProviderError};
    use async_trait::async_trait;

    const DEPLOY: &str = "# Deploy Site\n\n## Meta\n- match: deploy, site, release\n- description: Ship the static site\n\n## Steps\n1. Build\n2. Upload\n";

    fn workflows() -> Vec<Workflow> {
        vec![
            parse_workflow(DEPLOY, "deploy"),
            Workflow {
                name: "Report".into(),
                description: "Weekly report".into(),
                keywords: vec!["report".into(), "weekly".into()],
                steps: "1. Collect".into(),
            },
        ]
    }

    struct Answer(Result<&'static str, ()>);

    #[async_trait]
    impl LlmProvider for Answer {
        async fn chat(
            &self,
            _: &[ChatMessage],
            _: &ProviderConfig,
        ) -> Result<ChatOutput, ProviderError> {
            match self.0 {
                Ok(text) => Ok(ChatOutput::text(text)),
                Err(()) => Err(ProviderError::MissingApiKey("test".into())),
            }
        }
    }

    #[test]
    fn parses_markdown_workflow() {
        let w = parse_workflow(DEPLOY, "deploy");
        assert_eq!(w.name, "Deploy Site");
        assert_eq!(w.description, "Ship the static site");
        assert_eq!(w.keywords, vec!["deploy", "site", "release"]);
        assert_eq!(w.steps, "1. Build\n2. Upload");
    }

    #[test]
    fn missing_sections_fall_back() {
        let w = parse_workflow("just text", "plain");
        assert_eq!(w.name, "plain");
        assert!(w.keywords.is_empty());
        assert!(w.steps.is_empty());
    }

    #[test]
    fn keyword_match_needs_two_hits() {
        let ws = workflows();
        assert!(keyword_match("deploy it", &ws).is_none());
        assert_eq!(keyword_match("Deploy the SITE", &ws).unwrap().name, "Deploy Site");
        assert_eq!(keyword_match("weekly report", &ws).unwrap().name, "Report");
    }

    #[test]
    fn match_answers() {
        assert_eq!(read_match_answer(" 1 ", 2), Some(1));
        assert_eq!(read_match_answer("Index: 0.", 2), Some(0));
        assert_eq!(read_match_answer("None", 2), None);
        assert_eq!(read_match_answer("7", 2), None);
        assert_eq!(read_match_answer("no idea", 2), None);
    }

    #[tokio::test]
    async fn ai_match_uses_answer_then_keywords() {
        let ws = workflows();
        let config = ProviderConfig::default();

        let (hit, by_ai) = ai_match("anything", &ws, &Answer(Ok("1")), &config).await;
        assert_eq!(hit.unwrap().name, "Report");
        assert!(by_ai);

        let (hit, by_ai) = ai_match("deploy the site", &ws, &Answer(Ok("none")), &config).await;
        assert_eq!(hit.unwrap().name, "Deploy Site");
        assert!(!by_ai);

        let (hit, _) = ai_match("deploy the site", &ws, &Answer(Err(())), &config).await;
        assert_eq!(hit.unwrap().name, "Deploy Site");
    }

    #[test]
    fn block_format() {
        let ws = workflows();
        let block = workflow_block(&ws[0], "go");
        assert!(
            block.starts_with("\n\n=== SKILL WORKFLOW: Deploy Site ===\nShip the static site\n\n")
        );
        assert!(block.ends_with("=== END SKILL WORKFLOW ===\n\nUser request: go"));
    }
}
