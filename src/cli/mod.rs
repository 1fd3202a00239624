mod agent_cmd;
mod chat;
mod daemon;
mod task_cmd;

use anyhow::{Result, anyhow};
use console::style;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::core::brain::Observer;
use crate::core::config::AppConfig;
use crate::core::llm::HttpProvider;
use crate::core::runtime::Runtime;
use crate::core::store::Store;
use crate::core::terminal::{self, GuideSection, print_error};
use crate::platform::{NativePlatform, Platform};
use crate::skills::{SkillManager, SkillRegistry};

fn print_help() {
    terminal::print_banner();

    GuideSection::new("Agents")
        .command("agent add --name <name>", "Create an agent")
        .command("agent list", "List agents with their provider and skills")
        .command("agent remove <id>", "Delete an agent")
        .command("agent skill install|uninstall <id> <skill>", "Manage an agent's skills")
        .command("agent skill config <id> <skill> key=value..", "Merge skill settings")
        .print();

    GuideSection::new("Tasks")
        .command("task add --title <title>", "Put a task on the board")
        .command("task list [--status <status>]", "Show the board, newest first")
        .command("task cancel <id>", "Cancel a task, stopping its agent")
        .command("task delete <id>", "Cancel and remove a task")
        .print();

    GuideSection::new("Run")
        .command("chat --agent <id> --prompt <text>", "One-shot conversation with an agent")
        .command("skills", "List available skills and their tools")
        .command("run", "Start the scheduler and service skills in the foreground")
        .print();

    println!(
        "\n {} {} <command> [subcommand]\n",
        style("Usage:").bold(),
        style("taskcrew").green()
    );
}

/// `--flag value` pairs and bare positionals following a subcommand.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ParsedArgs {
    pub flags: HashMap<String, String>,
    pub positional: Vec<String>,
}

impl ParsedArgs {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.flags
            .get(key)
            .map(|v| v.as_str())
            .filter(|v| !v.is_empty())
    }

    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key)
            .ok_or_else(|| anyhow!("--{} is required", key))
    }

    pub fn positional(&self, index: usize) -> Option<&str> {
        self.positional.get(index).map(|s| s.as_str())
    }
}

fn flag_name(arg: &str) -> Option<&str> {
    match arg {
        "-a" => Some("agent"),
        "-p" => Some("prompt"),
        "-s" => Some("status"),
        _ => arg.strip_prefix("--").filter(|name| !name.is_empty()),
    }
}

pub(crate) fn parse_flags(args: &[String], start: usize) -> ParsedArgs {
    let mut parsed = ParsedArgs::default();
    let mut i = start;
    while i < args.len() {
        match flag_name(&args[i]) {
            Some(name) => {
                if i + 1 < args.len() && flag_name(&args[i + 1]).is_none() {
                    parsed.flags.insert(name.to_string(), args[i + 1].clone());
                    i += 2;
                } else {
                    parsed.flags.insert(name.to_string(), String::new());
                    i += 1;
                }
            }
            None => {
                parsed.positional.push(args[i].clone());
                i += 1;
            }
        }
    }
    parsed
}

/// Data directory, config and store shared by every command.
pub(crate) struct Workspace {
    pub data_dir: PathBuf,
    pub config: AppConfig,
    pub store: Store,
}

impl Workspace {
    pub async fn open() -> Result<Self> {
        let data_dir = NativePlatform::data_dir();
        let config = AppConfig::load(&data_dir).await?;
        let store = Store::open(&data_dir).await?;
        store.seed_default_agent().await?;
        Ok(Self {
            data_dir,
            config,
            store,
        })
    }

    pub async fn skills(&self) -> Result<Arc<dyn SkillRegistry>> {
        let mut manager = SkillManager::with_builtins()?;
        manager
            .load_skills_from_dir(self.config.skills_dir(&self.data_dir))
            .await?;
        Ok(Arc::new(manager))
    }

    pub async fn runtime(&self, observer: Arc<dyn Observer>) -> Result<Arc<Runtime>> {
        let skills = self.skills().await?;
        Ok(Runtime::new(
            self.store.clone(),
            skills,
            Arc::new(HttpProvider::new()),
            observer,
            &self.config,
        ))
    }
}

async fn list_skills() -> Result<()> {
    let workspace = Workspace::open().await?;
    let skills = workspace.skills().await?;
    for manifest in skills.list() {
        let mut section = GuideSection::new(manifest.label())
            .status("Name", &manifest.name)
            .status("Kind", &format!("{:?}", manifest.kind).to_lowercase());
        if !manifest.description.is_empty() {
            section = section.text(&manifest.description);
        }
        for tool in &manifest.tools {
            section = section.command(&tool.name, &tool.description);
        }
        section.print();
    }
    Ok(())
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let cmd = args.get(1).map(|s| s.as_str()).unwrap_or("");

    match cmd {
        "agent" => agent_cmd::run_agent_command(&args).await,
        "task" => task_cmd::run_task_command(&args).await,
        "chat" => chat::run_chat(&parse_flags(&args, 2)).await,
        "skills" => list_skills().await,
        "run" => daemon::run_daemon().await,
        "" | "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        other => {
            print_error(&format!("Unknown command '{}'", other));
            print_help();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parse_flags_reads_pairs_and_positionals() {
        let args = argv(&["taskcrew", "task", "cancel", "t-1", "--status", "done"]);
        let parsed = parse_flags(&args, 3);
        assert_eq!(parsed.positional(0), Some("t-1"));
        assert_eq!(parsed.get("status"), Some("done"));
        assert_eq!(parsed.positional(1), None);
    }

    #[test]
    fn parse_flags_maps_short_aliases() {
        let args = argv(&["taskcrew", "chat", "-a", "dev", "-p", "hello there"]);
        let parsed = parse_flags(&args, 2);
        assert_eq!(parsed.get("agent"), Some("dev"));
        assert_eq!(parsed.get("prompt"), Some("hello there"));
    }

    #[test]
    fn flag_without_value_is_empty() {
        let args = argv(&["taskcrew", "task", "add", "--title", "--priority", "high"]);
        let parsed = parse_flags(&args, 3);
        assert_eq!(parsed.get("title"), None);
        assert!(parsed.flags.contains_key("title"));
        assert_eq!(parsed.get("priority"), Some("high"));
        assert!(parsed.require("title").is_err());
    }
}
