use anyhow::{Result, anyhow, bail};
use chrono::{DateTime, Local, TimeZone};
use console::style;
use std::sync::Arc;

use super::{ParsedArgs, Workspace, parse_flags};
use crate::core::brain::NoopObserver;
use crate::core::store::{
    MAX_REPEAT_MINUTES, NewTask, Priority, RepeatMode, Role, TaskFilter, TaskRecord, TaskStatus,
    TriggerType,
};
use crate::core::terminal::{GuideSection, print_error, print_info, print_success};

/// `daily`, `weekly` or a number of minutes.
fn parse_repeat(value: &str) -> Result<(RepeatMode, Option<i64>)> {
    if let Some(mode) = RepeatMode::from_name(value) {
        return Ok((mode, None));
    }
    match value.trim().parse::<i64>() {
        Ok(minutes) if (1..=MAX_REPEAT_MINUTES).contains(&minutes) => {
            Ok((RepeatMode::Custom, Some(minutes)))
        }
        _ => bail!(
            "--repeat expects daily, weekly or a number of minutes between 1 and {}",
            MAX_REPEAT_MINUTES
        ),
    }
}

fn parse_at(value: &str) -> Result<i64> {
    let at = DateTime::parse_from_rfc3339(value.trim())
        .map_err(|e| anyhow!("--at expects an RFC 3339 time ({})", e))?;
    Ok(at.timestamp_millis())
}

fn format_ms(ms: Option<i64>) -> String {
    match ms.and_then(|ms| Local.timestamp_millis_opt(ms).single()) {
        Some(at) => at.format("%Y-%m-%d %H:%M").to_string(),
        None => "-".to_string(),
    }
}

pub(crate) fn new_task_from_flags(flags: &ParsedArgs) -> Result<NewTask> {
    let scheduled_at = flags.get("at").map(parse_at).transpose()?;
    let trigger_type = match flags.get("trigger") {
        Some(name) => TriggerType::from_name(name).ok_or_else(|| {
            anyhow!("Unknown trigger '{}'. Expected auto, scheduled or manual", name)
        })?,
        None if scheduled_at.is_some() => TriggerType::Scheduled,
        None => TriggerType::Auto,
    };
    let priority = match flags.get("priority") {
        Some(name) => Priority::from_name(name)
            .ok_or_else(|| anyhow!("Unknown priority '{}'. Expected high, medium or low", name))?,
        None => Priority::default(),
    };
    let assigned_role = match flags.get("role") {
        Some(name) => Role::from_name(name).ok_or_else(|| anyhow!("Unknown role '{}'", name))?,
        None => Role::default(),
    };
    let (repeat, repeat_mode, repeat_interval) = match flags.get("repeat") {
        Some(value) => {
            let (mode, interval) = parse_repeat(value)?;
            (true, mode, interval)
        }
        None => (false, RepeatMode::default(), None),
    };

    Ok(NewTask {
        title: Some(flags.require("title")?.to_string()),
        description: flags.get("description").unwrap_or_default().to_string(),
        priority,
        assigned_role,
        assigned_agent_id: flags.get("agent").map(str::to_string),
        trigger_type,
        scheduled_at,
        repeat,
        repeat_mode,
        repeat_interval,
        ..NewTask::default()
    })
}

fn print_task(task: &TaskRecord) {
    let status = match task.status {
        TaskStatus::Done => style(task.status.as_str()).green(),
        TaskStatus::InProgress => style(task.status.as_str()).cyan(),
        TaskStatus::Cancelled => style(task.status.as_str()).red(),
        _ => style(task.status.as_str()).yellow(),
    };
    let mut section = GuideSection::new(&task.title)
        .status("ID", &format!("{}", style(&task.id).dim()))
        .status("Status", &format!("{}", status))
        .status("Priority", task.priority.as_str())
        .status("Role", task.assigned_role.as_str())
        .status("Trigger", task.trigger_type.as_str());
    if let Some(agent) = &task.assigned_agent_id {
        section = section.status("Agent", agent);
    }
    if task.scheduled_at.is_some() {
        section = section.status("Scheduled", &format_ms(task.scheduled_at));
    }
    if task.repeat {
        section = section
            .status("Repeat", &format!("every {} min", task.interval_ms() / 60_000))
            .status("Next run", &format_ms(task.next_run_at));
    }
    if !task.description.is_empty() {
        section = section.text(&task.description);
    }
    section.print();
}

pub async fn run_task_command(args: &[String]) -> Result<()> {
    let sub_cmd = if args.len() > 2 { args[2].as_str() } else { "" };
    let flags = parse_flags(args, 3);
    let workspace = Workspace::open().await?;

    match sub_cmd {
        "add" => {
            let task = workspace.store.create_task(new_task_from_flags(&flags)?).await?;
            print_success(&format!("Task '{}' added to the {}.", task.title, task.status.as_str()));
            print_task(&task);
        }
        "list" => {
            let status = match flags.get("status") {
                Some(name) => Some(
                    TaskStatus::from_status(name)
                        .ok_or_else(|| anyhow!("Unknown status '{}'", name))?,
                ),
                None => None,
            };
            let tasks = workspace
                .store
                .list_tasks(&TaskFilter {
                    status,
                    ..TaskFilter::default()
                })
                .await?;
            if tasks.is_empty() {
                print_info("The task board is empty.");
            }
            for task in &tasks {
                print_task(task);
            }
        }
        "cancel" | "delete" => {
            let Some(id) = flags.positional(0) else {
                print_error(&format!("Usage: taskcrew task {} <task-id>", sub_cmd));
                return Ok(());
            };
            let runtime = workspace.runtime(Arc::new(NoopObserver)).await?;
            let found = if sub_cmd == "cancel" {
                runtime.scheduler().cancel_task(id).await?
            } else {
                runtime.scheduler().delete_task(id).await?
            };
            if found {
                let done = if sub_cmd == "cancel" { "cancelled" } else { "deleted" };
                print_success(&format!("Task '{}' {}.", id, done));
            } else {
                print_error(&format!("No task '{}'.", id));
            }
        }
        _ => {
            println!("{}", style("Usage: taskcrew task <command>").bold());
            println!("  • add --title <title> [--description D] [--priority high|medium|low]");
            println!("        [--role R] [--agent ID] [--trigger auto|scheduled|manual]");
            println!("        [--at RFC3339] [--repeat daily|weekly|<minutes>]");
            println!("  • list [--status backlog|in_progress|repeat_queue|done|cancelled]");
            println!("  • cancel <task-id>");
            println!("  • delete <task-id>");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags(items: &[&str]) -> ParsedArgs {
        let args: Vec<String> = items.iter().map(|s| s.to_string()).collect();
        parse_flags(&args, 0)
    }

    #[test]
    fn repeat_accepts_names_and_minutes() {
        assert_eq!(parse_repeat("weekly").unwrap(), (RepeatMode::Weekly, None));
        assert_eq!(parse_repeat("90").unwrap(), (RepeatMode::Custom, Some(90)));
        assert!(parse_repeat("0").is_err());
        assert!(parse_repeat("hourly").is_err());
    }

    #[test]
    fn repeat_minutes_are_bounded() {
        let max = MAX_REPEAT_MINUTES.to_string();
        assert_eq!(
            parse_repeat(&max).unwrap(),
            (RepeatMode::Custom, Some(MAX_REPEAT_MINUTES))
        );
        let too_long = (MAX_REPEAT_MINUTES + 1).to_string();
        assert!(parse_repeat(&too_long).is_err());
        assert!(parse_repeat(&(i64::MAX / 1000).to_string()).is_err());
    }

    #[test]
    fn at_without_trigger_means_scheduled() {
        let task = new_task_from_flags(&flags(&[
            "--title",
            "Nightly report",
            "--at",
            "2026-01-02T03:04:05Z",
            "--repeat",
            "daily",
        ]))
        .unwrap();
        assert_eq!(task.trigger_type, TriggerType::Scheduled);
        assert_eq!(task.scheduled_at, Some(1_767_323_045_000));
        assert!(task.repeat);
        assert_eq!(task.repeat_mode, RepeatMode::Daily);
    }

    #[test]
    fn task_flags_are_validated() {
        assert!(new_task_from_flags(&flags(&["--description", "no title"])).is_err());
        assert!(new_task_from_flags(&flags(&["--title", "x", "--priority", "urgent"])).is_err());
        assert!(new_task_from_flags(&flags(&["--title", "x", "--at", "tomorrow"])).is_err());

        let task = new_task_from_flags(&flags(&[
            "--title", "Fix login", "--priority", "high", "--role", "developer",
        ]))
        .unwrap();
        assert_eq!(task.priority, Priority::High);
        assert_eq!(task.assigned_role, Role::Developer);
        assert_eq!(task.trigger_type, TriggerType::Auto);
        assert!(!task.repeat);
    }
}
