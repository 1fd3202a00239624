use anyhow::Result;
use console::style;
use std::sync::Arc;

use super::{ParsedArgs, Workspace};
use crate::core::brain::{Observer, ProgressEvent};
use crate::core::terminal::{print_error, print_step, print_tool, print_warn};

/// Prints loop progress as it happens.
struct TerminalObserver;

impl Observer for TerminalObserver {
    fn emit(&self, _agent_id: &str, event: &ProgressEvent) {
        match event {
            ProgressEvent::Phase { message } => println!("  {}", style(message).dim()),
            ProgressEvent::Skill { name, .. } => print_step(&format!("Using skill {}", name)),
            ProgressEvent::ToolCall { name, args } => print_tool(name, &args.to_string()),
            ProgressEvent::Aborted => print_warn("Stopped."),
            _ => {}
        }
    }
}

pub async fn run_chat(flags: &ParsedArgs) -> Result<()> {
    let (Some(agent_id), Some(prompt)) = (flags.get("agent"), flags.get("prompt")) else {
        print_error("Usage: taskcrew chat --agent <agent-id> --prompt <text>");
        return Ok(());
    };

    let workspace = Workspace::open().await?;
    let runtime = workspace.runtime(Arc::new(TerminalObserver)).await?;
    let outcome = runtime.chat(agent_id, prompt).await;

    if !outcome.trace.is_empty() {
        println!("\n{}", style("Trace").bold());
        for (i, entry) in outcome.trace.iter().enumerate() {
            println!("  {}. {} {}", i + 1, style(&entry.tool).magenta(), style(&entry.args).dim());
        }
    }
    println!("\n{}\n", outcome.output);
    Ok(())
}
