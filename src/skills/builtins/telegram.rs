use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::types::ChatAction;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::skills::{ChannelHandler, SkillCode, ToolContext, ToolOutput};

pub const MAX_MESSAGE_CHARS: usize = 4000;
const PLACEHOLDER_TOKEN: &str = "YOUR_BOT_TOKEN_HERE";
const NOT_RUNNING: &str = "Telegram bot is not running for this agent. Start the service first.";
const NO_CHATS: &str = "No active chat sessions. A user must message the bot first.";

struct BotHandle {
    bot: Bot,
    cancel: CancellationToken,
    chats: Arc<Mutex<BTreeSet<i64>>>,
    host: Arc<dyn ChannelHandler>,
}

/// Per-agent Telegram bots.
#[derive(Default)]
pub struct TelegramSkill {
    bots: Arc<Mutex<HashMap<String, BotHandle>>>,
}

/// Split a reply into Telegram-sized chunks, cutting at a newline when one
/// falls in the last 70% of the window.
pub fn split_message(text: &str, max: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut rest = text;
    while rest.chars().count() > max {
        let limit = rest
            .char_indices()
            .nth(max)
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        let window = &rest[..limit];
        let cut = match window.rfind('\n') {
            Some(i) if window[..i].chars().count() >= max * 3 / 10 => i,
            _ => limit,
        };
        chunks.push(rest[..cut].to_string());
        rest = rest[cut..].trim_start();
    }
    if !rest.is_empty() {
        chunks.push(rest.to_string());
    }
    chunks
}

async fn send_long(bot: &Bot, chat_id: ChatId, text: &str) -> Result<()> {
    for chunk in split_message(text, MAX_MESSAGE_CHARS) {
        bot.send_message(chat_id, chunk).await?;
    }
    Ok(())
}

async fn handle_update(
    bot: &Bot,
    msg: &Message,
    agent_id: &str,
    host: &Arc<dyn ChannelHandler>,
    chats: &Arc<Mutex<BTreeSet<i64>>>,
) -> Result<()> {
    let Some(text) = msg.text().map(str::trim).filter(|t| !t.is_empty()) else {
        return Ok(());
    };
    let chat_id = msg.chat.id;
    let chat_key = chat_id.0.to_string();
    chats.lock().insert(chat_id.0);

    let (name, model) = host
        .agent_summary(agent_id)
        .await
        .unwrap_or_else(|| (agent_id.to_string(), "unknown".to_string()));

    match text {
        "/start" => {
            let reply = format!(
                "{} agent connected.\n\nSend a message to ask a question; the agent can use its installed skills.\n\nCommands:\n/clear - clear conversation history\n/model - show the current model\n/status - show status",
                name
            );
            bot.send_message(chat_id, reply).await?;
        }
        "/clear" => {
            host.clear_chat(agent_id, &chat_key);
            bot.send_message(chat_id, "Conversation history cleared.").await?;
        }
        "/model" => {
            bot.send_message(chat_id, format!("Current model: {}", model))
                .await?;
        }
        "/status" => {
            let reply = format!(
                "Status: running\nCurrent model: {}\nHistory: {} messages",
                model,
                host.chat_len(agent_id, &chat_key)
            );
            bot.send_message(chat_id, reply).await?;
        }
        _ => {
            let _ = bot.send_chat_action(chat_id, ChatAction::Typing).await;
            let reply = host.handle_message(agent_id, &chat_key, text).await;
            let reply = if reply.trim().is_empty() {
                "(no reply)".to_string()
            } else {
                reply
            };
            send_long(bot, chat_id, &reply).await?;
        }
    }
    Ok(())
}

type BotParts = (Bot, Arc<Mutex<BTreeSet<i64>>>, Arc<dyn ChannelHandler>);

impl TelegramSkill {
    fn handle_parts(&self, agent_id: &str) -> Option<BotParts> {
        self.bots
            .lock()
            .get(agent_id)
            .map(|h| (h.bot.clone(), h.chats.clone(), h.host.clone()))
    }
}

#[async_trait]
impl SkillCode for TelegramSkill {
    async fn execute_tool(
        &self,
        tool: &str,
        args: &Map<String, Value>,
        ctx: &ToolContext,
    ) -> Result<ToolOutput> {
        match tool {
            "telegram_list_chats" => {
                let Some((_, chats, host)) = self.handle_parts(&ctx.agent_id) else {
                    return Ok(ToolOutput::Text(NOT_RUNNING.to_string()));
                };
                let ids: Vec<i64> = chats.lock().iter().copied().collect();
                if ids.is_empty() {
                    return Ok(ToolOutput::Text(NO_CHATS.to_string()));
                }
                let list: Vec<Value> = ids
                    .into_iter()
                    .map(|id| {
                        let key = id.to_string();
                        serde_json::json!({
                            "chatId": key,
                            "messages": host.chat_len(&ctx.agent_id, &key),
                        })
                    })
                    .collect();
                Ok(ToolOutput::Text(serde_json::to_string_pretty(&list)?))
            }
            "telegram_send" => {
                let Some((bot, chats, _)) = self.handle_parts(&ctx.agent_id) else {
                    return Ok(ToolOutput::Text(NOT_RUNNING.to_string()));
                };
                let message = args.get("message").and_then(|v| v.as_str()).unwrap_or("");
                if message.trim().is_empty() {
                    return Ok(ToolOutput::error("message is required."));
                }

                let target = match args.get("chatId") {
                    Some(Value::Number(n)) => n.as_i64(),
                    Some(Value::String(s)) if !s.trim().is_empty() => match s.trim().parse() {
                        Ok(id) => Some(id),
                        Err(_) => {
                            return Ok(ToolOutput::error(format!("invalid chatId \"{}\".", s)));
                        }
                    },
                    _ => None,
                };

                if let Some(id) = target {
                    if let Err(e) = send_long(&bot, ChatId(id), message).await {
                        return Ok(ToolOutput::error(format!("sending to chat {}: {}", id, e)));
                    }
                    return Ok(ToolOutput::Text("Message sent to 1 chat(s).".to_string()));
                }

                let ids: Vec<i64> = chats.lock().iter().copied().collect();
                if ids.is_empty() {
                    return Ok(ToolOutput::Text(NO_CHATS.to_string()));
                }
                let mut sent = 0;
                for id in ids {
                    match send_long(&bot, ChatId(id), message).await {
                        Ok(()) => sent += 1,
                        Err(e) => warn!("Telegram send error for chat {}: {}", id, e),
                    }
                }
                Ok(ToolOutput::Text(format!("Message sent to {} chat(s).", sent)))
            }
            _ => Ok(ToolOutput::error(format!(
                "Unknown tool \"{}\" in telegram skill.",
                tool
            ))),
        }
    }

    async fn start_service(
        &self,
        ctx: &ToolContext,
        host: Arc<dyn ChannelHandler>,
    ) -> Result<bool> {
        let token = ctx.config_str("token").unwrap_or("");
        if token.is_empty() || token == PLACEHOLDER_TOKEN {
            warn!("[{}] Telegram bot: missing or placeholder token.", ctx.agent_name);
            return Ok(false);
        }
        if self.is_running(&ctx.agent_id) {
            info!("[{}] Telegram bot already running.", ctx.agent_name);
            return Ok(true);
        }

        let bot = Bot::new(token);
        match bot.get_me().await {
            Ok(me) => info!(
                "[{}] Telegram token valid: @{}",
                ctx.agent_name,
                me.username()
            ),
            Err(e) => {
                error!("[{}] Failed to start Telegram bot: {}", ctx.agent_name, e);
                return Ok(false);
            }
        }

        let cancel = CancellationToken::new();
        let chats = Arc::new(Mutex::new(BTreeSet::new()));
        self.bots.lock().insert(
            ctx.agent_id.clone(),
            BotHandle {
                bot: bot.clone(),
                cancel: cancel.clone(),
                chats: chats.clone(),
                host: host.clone(),
            },
        );

        let agent_id = ctx.agent_id.clone();
        let agent_name = ctx.agent_name.clone();
        let bots = self.bots.clone();
        tokio::spawn(async move {
            let handler_agent = agent_id.clone();
            let repl = teloxide::repl(bot, move |bot: Bot, msg: Message| {
                let agent_id = handler_agent.clone();
                let host = host.clone();
                let chats = chats.clone();
                async move {
                    if let Err(e) = handle_update(&bot, &msg, &agent_id, &host, &chats).await {
                        error!("[{}] Telegram handler error: {}", agent_id, e);
                    }
                    respond(())
                }
            });
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = repl => {
                    // Polling ended on its own; drop the stale handle.
                    bots.lock().remove(&agent_id);
                }
            }
            info!("[{}] Telegram bot stopped.", agent_name);
        });

        info!("[{}] Telegram bot started.", ctx.agent_name);
        Ok(true)
    }

    async fn stop_service(&self, agent_id: &str) -> Result<()> {
        if let Some(handle) = self.bots.lock().remove(agent_id) {
            handle.cancel.cancel();
        }
        Ok(())
    }

    fn is_running(&self, agent_id: &str) -> bool {
        self.bots.lock().contains_key(agent_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_messages_are_one_chunk() {
        assert_eq!(split_message("hello", 10), vec!["hello".to_string()]);
        assert!(split_message("", 10).is_empty());
    }

    #[test]
    fn prefers_newline_boundaries() {
        let text = "aaaaaaa\nbbbbbbbbbb";
        assert_eq!(split_message(text, 10), vec!["aaaaaaa", "bbbbbbbbbb"]);
    }

    #[test]
    fn hard_cuts_when_newline_is_too_early() {
        let text = "a\nbbbbbbbbbbbbbbb";
        let chunks = split_message(text, 10);
        assert_eq!(chunks[0], "a\nbbbbbbbb");
        assert_eq!(chunks[1], "bbbbbbb");
    }

    #[test]
    fn splits_on_char_boundaries() {
        let text = "é".repeat(25);
        let chunks = split_message(&text, 10);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.chars().count() <= 10));
    }

    #[tokio::test]
    async fn tools_report_when_bot_is_not_running() {
        let skill = TelegramSkill::default();
        let out = skill
            .execute_tool("telegram_list_chats", &Map::new(), &ToolContext::default())
            .await
            .unwrap();
        assert_eq!(out, ToolOutput::Text(NOT_RUNNING.to_string()));
        assert!(!skill.is_running("a1"));
    }
}
