mod basic_tools;
mod email;
mod shell;
pub mod telegram;
mod web_search;
mod webpage;

use anyhow::Result;
use std::sync::Arc;

use crate::skills::{PendingAction, SkillCode, SkillManifest, ToolContext};

const MANIFESTS: &[(&str, &str)] = &[
    ("basic-tools", include_str!("manifests/basic-tools.toml")),
    ("email", include_str!("manifests/email.toml")),
    ("shell", include_str!("manifests/shell.toml")),
    ("telegram", include_str!("manifests/telegram.toml")),
    ("web-search", include_str!("manifests/web-search.toml")),
    ("webpage", include_str!("manifests/webpage.toml")),
];

pub fn is_builtin(name: &str) -> bool {
    MANIFESTS.iter().any(|(n, _)| *n == name)
}

fn code_for(name: &str) -> Option<Arc<dyn SkillCode>> {
    let code: Arc<dyn SkillCode> = match name {
        "basic-tools" => Arc::new(basic_tools::BasicTools),
        "email" => Arc::new(email::EmailSkill),
        "shell" => Arc::new(shell::ShellSkill),
        "telegram" => Arc::new(telegram::TelegramSkill::default()),
        "web-search" => Arc::new(web_search::WebSearchSkill::default()),
        "webpage" => Arc::new(webpage::WebpageSkill),
        _ => return None,
    };
    Some(code)
}

/// Every compiled-in skill with its code.
pub fn all() -> Result<Vec<(SkillManifest, Arc<dyn SkillCode>)>> {
    let mut skills = Vec::with_capacity(MANIFESTS.len());
    for (name, content) in MANIFESTS {
        let manifest = SkillManifest::parse(content)
            .map_err(|e| anyhow::anyhow!("Builtin manifest '{}' is invalid: {}", name, e))?;
        let code = code_for(name)
            .ok_or_else(|| anyhow::anyhow!("No code for builtin skill '{}'", name))?;
        skills.push((manifest, code));
    }
    Ok(skills)
}

/// Standard completion for the two pending actions, shared by every skill
/// that emits a pending sentinel.
pub async fn complete_pending(
    action: &PendingAction,
    payload: &str,
    ctx: &ToolContext,
) -> Result<String> {
    match action {
        PendingAction::Webpage { title } => webpage::save_webpage(title, payload, ctx).await,
        PendingAction::Email { to, subject } => {
            email::write_outbox(to, subject, payload, ctx).await
        }
    }
}

/// Replace anything outside `[A-Za-z0-9_-]` and cap the length.
pub(crate) fn safe_file_stem(value: &str, max: usize) -> String {
    let stem: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .take(max)
        .collect();
    if stem.is_empty() {
        "untitled".to_string()
    } else {
        stem
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_manifest_parses_and_has_code() {
        let skills = all().unwrap();
        assert_eq!(skills.len(), MANIFESTS.len());
        for (manifest, _) in &skills {
            assert!(is_builtin(&manifest.name));
            assert!(manifest.has_tools());
        }
    }

    #[test]
    fn safe_stem() {
        assert_eq!(safe_file_stem("My Page!", 50), "My_Page_");
        assert_eq!(safe_file_stem("abcdef", 3), "abc");
        assert_eq!(safe_file_stem("", 10), "untitled");
    }
}
