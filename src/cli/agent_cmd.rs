use anyhow::{Result, bail};
use console::style;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::{ParsedArgs, Workspace, parse_flags};
use crate::core::brain::NoopObserver;
use crate::core::llm::ProviderKind;
use crate::core::store::{AgentRecord, NewAgent, Role, SkillEntry};
use crate::core::terminal::{GuideSection, print_error, print_info, print_success, print_warn};

fn parse_role(value: Option<&str>) -> Result<Role> {
    match value {
        None => Ok(Role::default()),
        Some(name) => match Role::from_name(name) {
            Some(role) => Ok(role),
            None => bail!(
                "Unknown role '{}'. Expected one of: general, pm, developer, tester",
                name
            ),
        },
    }
}

/// `a,b` into an installed-skills map. Empty names are ignored.
fn parse_skill_list(value: &str) -> BTreeMap<String, SkillEntry> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| (s.to_string(), SkillEntry::installed()))
        .collect()
}

/// `key=value` pairs into a config map. Values that parse as JSON keep
/// their type; anything else is a string.
fn parse_config_pairs(pairs: &[String]) -> Result<Map<String, Value>> {
    let mut config = Map::new();
    for pair in pairs {
        let Some((key, raw)) = pair.split_once('=') else {
            bail!("Expected key=value, got '{}'", pair);
        };
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        config.insert(key.trim().to_string(), value);
    }
    Ok(config)
}

fn print_agent(agent: &AgentRecord) {
    let skills: Vec<&str> = agent.installed_skills().map(|(name, _)| name.as_str()).collect();
    GuideSection::new(&agent.name)
        .status("ID", &format!("{}", style(&agent.id).dim()))
        .status("Role", agent.role.label())
        .status("Provider", &agent.provider.label())
        .status("Skills", &skills.join(", "))
        .status("Max iterations", &agent.max_iterations.to_string())
        .status("Work dir", &agent.work_dir)
        .print();
}

async fn add_agent(workspace: &Workspace, flags: &ParsedArgs) -> Result<()> {
    let provider_kind = flags.get("provider").map(ProviderKind::parse).transpose()?;
    let max_iterations = match flags.get("max-iterations") {
        Some(raw) => raw.parse::<usize>()?,
        None => workspace.config.agents.default_max_iterations,
    };
    let skills = flags.get("skills").map(parse_skill_list);

    if let Some(skills) = &skills {
        let registry = workspace.skills().await?;
        for name in skills.keys() {
            if registry.manifest(name).is_none() {
                print_warn(&format!("Skill '{}' is not available; installing it anyway.", name));
            }
        }
    }

    let agent = workspace
        .store
        .create_agent(NewAgent {
            name: Some(flags.require("name")?.to_string()),
            role: parse_role(flags.get("role"))?,
            provider_kind,
            api_key: flags.get("api-key").map(str::to_string),
            model: flags.get("model").map(str::to_string),
            endpoint: flags.get("endpoint").map(str::to_string),
            skills,
            work_dir: flags.get("workdir").map(str::to_string),
            max_iterations: Some(max_iterations),
        })
        .await?;

    if agent.provider.kind.requires_api_key() && agent.provider.api_key.is_empty() {
        print_warn(&format!(
            "{} needs an API key; set one with --api-key.",
            agent.provider.kind.display_name()
        ));
    }
    print_success(&format!("Agent '{}' created.", agent.name));
    print_agent(&agent);
    Ok(())
}

async fn run_skill_command(workspace: &Workspace, flags: &ParsedArgs) -> Result<()> {
    let action = flags.positional(0).unwrap_or("");
    let (Some(agent_id), Some(skill)) = (flags.positional(1), flags.positional(2)) else {
        print_error("Usage: taskcrew agent skill install|uninstall|config <agent-id> <skill>");
        return Ok(());
    };

    let updated = match action {
        "install" => {
            if workspace.skills().await?.manifest(skill).is_none() {
                print_error(&format!("Skill '{}' is not available.", skill));
                return Ok(());
            }
            workspace.store.install_skill(agent_id, skill, Map::new()).await?
        }
        "uninstall" => workspace.store.uninstall_skill(agent_id, skill).await?,
        "config" => {
            let config = parse_config_pairs(&flags.positional[3..])?;
            workspace
                .store
                .update_skill_config(agent_id, skill, config)
                .await?
        }
        other => {
            print_error(&format!("Unknown skill action '{}'", other));
            return Ok(());
        }
    };

    match updated {
        Some(agent) => {
            print_success(&format!(
                "Skill '{}' {} for '{}'.",
                skill,
                action_done(action),
                agent.name
            ));
        }
        None => print_error(&format!(
            "No agent '{}' (or skill '{}' not installed).",
            agent_id, skill
        )),
    }
    Ok(())
}

fn action_done(action: &str) -> &'static str {
    match action {
        "install" => "installed",
        "uninstall" => "uninstalled",
        _ => "updated",
    }
}

pub async fn run_agent_command(args: &[String]) -> Result<()> {
    let sub_cmd = if args.len() > 2 { args[2].as_str() } else { "" };
    let flags = parse_flags(args, 3);
    let workspace = Workspace::open().await?;

    match sub_cmd {
        "add" => add_agent(&workspace, &flags).await?,
        "list" => {
            let agents = workspace.store.list_agents().await?;
            if agents.is_empty() {
                print_info("No agents yet. Create one with 'taskcrew agent add --name <name>'.");
            }
            for agent in &agents {
                print_agent(agent);
            }
        }
        "remove" | "delete" => {
            let Some(id) = flags.positional(0) else {
                print_error("Usage: taskcrew agent remove <agent-id>");
                return Ok(());
            };
            let runtime = workspace.runtime(Arc::new(NoopObserver)).await?;
            if runtime.remove_agent(id).await? {
                print_success(&format!("Agent '{}' removed.", id));
            } else {
                print_error(&format!("No agent '{}'.", id));
            }
        }
        "skill" => run_skill_command(&workspace, &flags).await?,
        _ => {
            println!("{}", style("Usage: taskcrew agent <command>").bold());
            println!("  • add --name <name> [--role R] [--provider P] [--model M] [--api-key K]");
            println!("        [--endpoint E] [--workdir D] [--max-iterations N] [--skills a,b]");
            println!("  • list");
            println!("  • remove <agent-id>");
            println!("  • skill install|uninstall <agent-id> <skill>");
            println!("  • skill config <agent-id> <skill> key=value ...");
        }
    }
    Ok(())
}
