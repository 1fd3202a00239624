use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

use crate::core::llm::ChatMessage;

pub const DEFAULT_SESSION_WINDOW: usize = 40;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum SessionKey {
    Agent(String),
    Chat(String, String),
}

/// In-memory conversation history, one sliding window per agent and per
/// (agent, external chat).
pub struct SessionStore {
    window: usize,
    sessions: Mutex<HashMap<SessionKey, VecDeque<ChatMessage>>>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_WINDOW)
    }
}

impl SessionStore {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn key(agent_id: &str, chat_id: Option<&str>) -> SessionKey {
        match chat_id {
            Some(chat) => SessionKey::Chat(agent_id.to_string(), chat.to_string()),
            None => SessionKey::Agent(agent_id.to_string()),
        }
    }

    pub fn history(&self, agent_id: &str, chat_id: Option<&str>) -> Vec<ChatMessage> {
        self.sessions
            .lock()
            .get(&Self::key(agent_id, chat_id))
            .map(|turns| turns.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Append one exchange, dropping the oldest turns past the window.
    pub fn push_exchange(
        &self,
        agent_id: &str,
        chat_id: Option<&str>,
        user: &str,
        assistant: &str,
    ) {
        let mut sessions = self.sessions.lock();
        let turns = sessions.entry(Self::key(agent_id, chat_id)).or_default();
        turns.push_back(ChatMessage::user(user));
        turns.push_back(ChatMessage::assistant(assistant));
        while turns.len() > self.window {
            turns.pop_front();
        }
    }

    pub fn clear(&self, agent_id: &str, chat_id: Option<&str>) {
        self.sessions.lock().remove(&Self::key(agent_id, chat_id));
    }

    pub fn len(&self, agent_id: &str, chat_id: Option<&str>) -> usize {
        self.sessions
            .lock()
            .get(&Self::key(agent_id, chat_id))
            .map_or(0, VecDeque::len)
    }

    /// Drop every session the agent owns, chats included.
    pub fn remove_agent(&self, agent_id: &str) {
        self.sessions.lock().retain(|key, _| match key {
            SessionKey::Agent(id) | SessionKey::Chat(id, _) => id != agent_id,
        });
    }
}
