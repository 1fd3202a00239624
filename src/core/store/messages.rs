use anyhow::Result;
use rusqlite::params;

use super::types::AgentMessageRecord;
use super::{Store, now_ms};

impl Store {
    /// Append to the target agent's inbound log.
    pub async fn push_agent_message(&self, target: &str, from: &str, message: &str) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO agent_messages (target_agent_id, from_agent_id, message, timestamp) VALUES (?1, ?2, ?3, ?4)",
            params![target, from, message, now_ms()],
        )?;
        Ok(())
    }

    /// Return and clear every pending message for `agent_id`, oldest first.
    pub async fn pop_agent_messages(&self, agent_id: &str) -> Result<Vec<AgentMessageRecord>> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        let results = {
            let mut stmt = tx.prepare(
                "SELECT from_agent_id, message, timestamp FROM agent_messages
                 WHERE target_agent_id = ?1 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map(params![agent_id], |row| {
                Ok(AgentMessageRecord {
                    from: row.get(0)?,
                    message: row.get(1)?,
                    timestamp: row.get(2)?,
                })
            })?;
            let mut results = Vec::new();
            for row in rows {
                results.push(row?);
            }
            results
        };
        tx.execute(
            "DELETE FROM agent_messages WHERE target_agent_id = ?1",
            params![agent_id],
        )?;
        tx.commit()?;
        Ok(results)
    }

    pub async fn count_agent_messages(&self, agent_id: &str) -> Result<usize> {
        let db = self.db.lock().await;
        let count: i64 = db.query_row(
            "SELECT COUNT(*) FROM agent_messages WHERE target_agent_id = ?1",
            params![agent_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}
