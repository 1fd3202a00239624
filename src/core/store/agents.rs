use anyhow::Result;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::info;

use super::types::{
    AgentRecord, AgentUpdate, DEFAULT_MAX_ITERATIONS, DEFAULT_SKILL, NewAgent, Role, SkillEntry,
};
use super::{Store, enum_column, json_column, now_ms};
use crate::core::llm::ProviderConfig;

const AGENT_COLUMNS: &str =
    "id, name, role, provider_json, skills_json, work_dir, max_iterations, created_at, updated_at";

fn agent_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentRecord> {
    let max_iterations: i64 = row.get(6)?;
    Ok(AgentRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        role: enum_column(row, 2, Role::from_name)?,
        provider: json_column(row, 3)?,
        skills: json_column(row, 4)?,
        work_dir: row.get(5)?,
        max_iterations: max_iterations.max(1) as usize,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn load_agent(db: &Connection, id: &str) -> Result<Option<AgentRecord>> {
    let sql = format!("SELECT {} FROM agents WHERE id = ?1", AGENT_COLUMNS);
    Ok(db
        .query_row(&sql, params![id], agent_from_row)
        .optional()?)
}

fn save_agent(db: &Connection, agent: &AgentRecord) -> Result<()> {
    db.execute(
        "INSERT INTO agents (id, name, role, provider_json, skills_json, work_dir, max_iterations, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            role = excluded.role,
            provider_json = excluded.provider_json,
            skills_json = excluded.skills_json,
            work_dir = excluded.work_dir,
            max_iterations = excluded.max_iterations,
            updated_at = excluded.updated_at",
        params![
            agent.id,
            agent.name,
            agent.role.as_str(),
            serde_json::to_string(&agent.provider)?,
            serde_json::to_string(&agent.skills)?,
            agent.work_dir,
            agent.max_iterations as i64,
            agent.created_at,
            agent.updated_at,
        ],
    )?;
    Ok(())
}

pub fn default_work_dir() -> String {
    dirs::home_dir()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| ".".to_string())
}

impl Store {
    pub async fn create_agent(&self, input: NewAgent) -> Result<AgentRecord> {
        let now = now_ms();
        let provider = ProviderConfig {
            kind: input.provider_kind.unwrap_or_default(),
            api_key: input.api_key.unwrap_or_default(),
            model: input.model.unwrap_or_default(),
            endpoint: input.endpoint.unwrap_or_default(),
        }
        .with_defaults();

        let agent = AgentRecord {
            id: uuid::Uuid::new_v4().to_string(),
            name: input
                .name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| "New Agent".to_string()),
            role: input.role,
            provider,
            skills: input.skills.unwrap_or_else(|| {
                BTreeMap::from([(DEFAULT_SKILL.to_string(), SkillEntry::installed())])
            }),
            work_dir: input.work_dir.unwrap_or_else(default_work_dir),
            max_iterations: input
                .max_iterations
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_MAX_ITERATIONS),
            created_at: now,
            updated_at: now,
        };

        let db = self.db.lock().await;
        save_agent(&db, &agent)?;
        info!("Created agent [{}] {} ({})", agent.name, agent.id, agent.role.as_str());
        Ok(agent)
    }

    pub async fn get_agent(&self, id: &str) -> Result<Option<AgentRecord>> {
        let db = self.db.lock().await;
        load_agent(&db, id)
    }

    /// All agents in creation order.
    pub async fn list_agents(&self) -> Result<Vec<AgentRecord>> {
        let db = self.db.lock().await;
        let sql = format!(
            "SELECT {} FROM agents ORDER BY created_at ASC, rowid ASC",
            AGENT_COLUMNS
        );
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map([], agent_from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub async fn update_agent(&self, id: &str, update: AgentUpdate) -> Result<Option<AgentRecord>> {
        let db = self.db.lock().await;
        let Some(mut agent) = load_agent(&db, id)? else {
            return Ok(None);
        };

        if let Some(name) = update.name {
            agent.name = name;
        }
        if let Some(role) = update.role {
            agent.role = role;
        }
        if let Some(patch) = update.provider {
            if let Some(kind) = patch.kind {
                agent.provider.kind = kind;
            }
            if let Some(key) = patch.api_key {
                agent.provider.api_key = key;
            }
            if let Some(model) = patch.model {
                agent.provider.model = model;
            }
            if let Some(endpoint) = patch.endpoint {
                agent.provider.endpoint = endpoint;
            }
            agent.provider = agent.provider.with_defaults();
        }
        if let Some(skills) = update.skills {
            agent.skills.extend(skills);
        }
        if let Some(dir) = update.work_dir {
            agent.work_dir = dir;
        }
        if let Some(max) = update.max_iterations.filter(|n| *n > 0) {
            agent.max_iterations = max;
        }
        agent.updated_at = now_ms();

        save_agent(&db, &agent)?;
        Ok(Some(agent))
    }

    pub async fn delete_agent(&self, id: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute("DELETE FROM agents WHERE id = ?1", params![id])?;
        db.execute(
            "DELETE FROM agent_messages WHERE target_agent_id = ?1",
            params![id],
        )?;
        Ok(rows > 0)
    }

    pub async fn install_skill(
        &self,
        agent_id: &str,
        skill: &str,
        config: Map<String, Value>,
    ) -> Result<Option<AgentRecord>> {
        self.modify_skills(agent_id, |skills| {
            skills.insert(skill.to_string(), SkillEntry::with_config(config));
            true
        })
        .await
    }

    pub async fn uninstall_skill(
        &self,
        agent_id: &str,
        skill: &str,
    ) -> Result<Option<AgentRecord>> {
        self.modify_skills(agent_id, |skills| {
            skills.remove(skill);
            true
        })
        .await
    }

    /// Merge keys into an installed skill's config. `None` when the agent or
    /// skill is missing.
    pub async fn update_skill_config(
        &self,
        agent_id: &str,
        skill: &str,
        config: Map<String, Value>,
    ) -> Result<Option<AgentRecord>> {
        self.modify_skills(agent_id, |skills| match skills.get_mut(skill) {
            Some(entry) => {
                entry.config.extend(config);
                true
            }
            None => false,
        })
        .await
    }

    async fn modify_skills<F>(&self, agent_id: &str, apply: F) -> Result<Option<AgentRecord>>
    where
        F: FnOnce(&mut BTreeMap<String, SkillEntry>) -> bool,
    {
        let db = self.db.lock().await;
        let Some(mut agent) = load_agent(&db, agent_id)? else {
            return Ok(None);
        };
        if !apply(&mut agent.skills) {
            return Ok(None);
        }
        agent.updated_at = now_ms();
        save_agent(&db, &agent)?;
        Ok(Some(agent))
    }

    /// Create the starter agent when the store holds none.
    pub async fn seed_default_agent(&self) -> Result<Option<AgentRecord>> {
        let count: i64 = {
            let db = self.db.lock().await;
            db.query_row("SELECT COUNT(*) FROM agents", [], |row| row.get(0))?
        };
        if count > 0 {
            return Ok(None);
        }

        let skills = ["basic-tools", "shell", "webpage"]
            .into_iter()
            .map(|s| (s.to_string(), SkillEntry::installed()))
            .collect();
        let agent = self
            .create_agent(NewAgent {
                name: Some("Default Agent".to_string()),
                skills: Some(skills),
                ..NewAgent::default()
            })
            .await?;
        Ok(Some(agent))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::llm::ProviderKind;
    use crate::core::store::types::ProviderPatch;

    #[tokio::test]
    async fn create_agent_applies_defaults() {
        let store = Store::open_in_memory().unwrap();
        let agent = store.create_agent(NewAgent::default()).await.unwrap();
        assert_eq!(agent.name, "New Agent");
        assert_eq!(agent.role, Role::General);
        assert_eq!(agent.max_iterations, 30);
        assert_eq!(agent.provider.kind, ProviderKind::Minimax);
        assert_eq!(agent.provider.model, "MiniMax-M2.5");
        assert!(agent.skills.contains_key("basic-tools"));

        let loaded = store.get_agent(&agent.id).await.unwrap().unwrap();
        assert_eq!(loaded, agent);
    }

    #[tokio::test]
    async fn update_agent_merges_provider_and_skills() {
        let store = Store::open_in_memory().unwrap();
        let agent = store
            .create_agent(NewAgent {
                api_key: Some("k1".into()),
                ..NewAgent::default()
            })
            .await
            .unwrap();

        let updated = store
            .update_agent(
                &agent.id,
                AgentUpdate {
                    role: Some(Role::Tester),
                    provider: Some(ProviderPatch {
                        model: Some("MiniMax-Text".into()),
                        ..ProviderPatch::default()
                    }),
                    skills: Some(BTreeMap::from([("shell".to_string(), SkillEntry::installed())])),
                    ..AgentUpdate::default()
                },
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(updated.role, Role::Tester);
        assert_eq!(updated.provider.api_key, "k1");
        assert_eq!(updated.provider.model, "MiniMax-Text");
        assert!(updated.skills.contains_key("basic-tools"));
        assert!(updated.skills.contains_key("shell"));
    }

    #[tokio::test]
    async fn skill_config_merge_requires_installed_skill() {
        let store = Store::open_in_memory().unwrap();
        let agent = store.create_agent(NewAgent::default()).await.unwrap();

        let mut cfg = Map::new();
        cfg.insert("timeout".into(), Value::from(5000));
        assert!(
            store
                .update_skill_config(&agent.id, "shell", cfg.clone())
                .await
                .unwrap()
                .is_none()
        );

        store.install_skill(&agent.id, "shell", Map::new()).await.unwrap();
        let updated = store
            .update_skill_config(&agent.id, "shell", cfg)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.skill_config("shell")["timeout"], 5000);

        let removed = store.uninstall_skill(&agent.id, "shell").await.unwrap().unwrap();
        assert!(!removed.skills.contains_key("shell"));
    }

    #[tokio::test]
    async fn seed_only_runs_on_empty_store() {
        let store = Store::open_in_memory().unwrap();
        let seeded = store.seed_default_agent().await.unwrap().unwrap();
        assert_eq!(seeded.name, "Default Agent");
        assert!(seeded.skills.contains_key("shell"));
        assert!(store.seed_default_agent().await.unwrap().is_none());
        assert_eq!(store.list_agents().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_agent_reports_presence() {
        let store = Store::open_in_memory().unwrap();
        let agent = store.create_agent(NewAgent::default()).await.unwrap();
        assert!(store.delete_agent(&agent.id).await.unwrap());
        assert!(!store.delete_agent(&agent.id).await.unwrap());
    }
}
