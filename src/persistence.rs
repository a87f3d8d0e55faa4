//! Save / Load
//!
//! A [`NarrativeSnapshot`] captures an actor's quests, task ledger and facts.
//! Snapshots are stored as MessagePack blobs in SQLite, one row per actor.

use std::collections::BTreeMap;
use std::future::Future;

use serde::{Deserialize, Serialize};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tracing::info;

use crate::error::Result;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SavedQuest {
    pub quest_id: String,
    pub current_state: String,
    /// Branch id -> task progress in task order
    pub branches: BTreeMap<String, Vec<u32>>,
    pub reached_states: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NarrativeSnapshot {
    pub quests: Vec<SavedQuest>,
    pub tasks: BTreeMap<String, u32>,
    #[serde(default)]
    pub facts: BTreeMap<String, i64>,
}

impl NarrativeSnapshot {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// Where snapshots live between sessions
pub trait SnapshotStore: Send + Sync {
    fn save_snapshot(
        &self,
        actor: &str,
        snapshot: &NarrativeSnapshot,
    ) -> impl Future<Output = Result<()>> + Send;

    fn load_snapshot(
        &self,
        actor: &str,
    ) -> impl Future<Output = Result<Option<NarrativeSnapshot>>> + Send;

    /// Returns true when there was something to delete
    fn delete_snapshot(&self, actor: &str) -> impl Future<Output = Result<bool>> + Send;
}

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self> {
        Self::connect(database_url, 5).await
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        Self::migrate(&pool).await?;
        info!("Connected to narrative database");

        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS narrative_snapshots (
                actor_id TEXT PRIMARY KEY,
                snapshot BLOB NOT NULL,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(pool)
        .await?;
        Ok(())
    }
}

impl SnapshotStore for Database {
    async fn save_snapshot(&self, actor: &str, snapshot: &NarrativeSnapshot) -> Result<()> {
        let bytes = snapshot.to_bytes()?;
        sqlx::query(
            r#"
            INSERT INTO narrative_snapshots (actor_id, snapshot, updated_at)
            VALUES (?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(actor_id) DO UPDATE SET
                snapshot = excluded.snapshot,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(actor)
        .bind(bytes)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_snapshot(&self, actor: &str) -> Result<Option<NarrativeSnapshot>> {
        let row = sqlx::query("SELECT snapshot FROM narrative_snapshots WHERE actor_id = ?")
            .bind(actor)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let bytes: Vec<u8> = row.get("snapshot");
                Ok(Some(NarrativeSnapshot::from_bytes(&bytes)?))
            }
            None => Ok(None),
        }
    }

    async fn delete_snapshot(&self, actor: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM narrative_snapshots WHERE actor_id = ?")
            .bind(actor)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> NarrativeSnapshot {
        let mut branches = BTreeMap::new();
        branches.insert("talk".to_string(), vec![1, 0]);
        NarrativeSnapshot {
            quests: vec![SavedQuest {
                quest_id: "guard_intro".to_string(),
                current_state: "find_guard".to_string(),
                branches,
                reached_states: vec!["find_guard".to_string()],
            }],
            tasks: BTreeMap::from([("talk_guard".to_string(), 1)]),
            facts: BTreeMap::from([("guard_intro_stage".to_string(), 2)]),
        }
    }

    #[tokio::test]
    async fn test_database_save_load_delete() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("narrative.db").display());
        let db = Database::new(&url).await.unwrap();

        assert_eq!(db.load_snapshot("rhea").await.unwrap(), None);

        db.save_snapshot("rhea", &sample()).await.unwrap();
        assert_eq!(db.load_snapshot("rhea").await.unwrap(), Some(sample()));

        // Saving again replaces the row
        db.save_snapshot("rhea", &NarrativeSnapshot::default()).await.unwrap();
        assert_eq!(
            db.load_snapshot("rhea").await.unwrap(),
            Some(NarrativeSnapshot::default())
        );

        assert!(db.delete_snapshot("rhea").await.unwrap());
        assert!(!db.delete_snapshot("rhea").await.unwrap());
    }

    #[test]
    fn test_snapshot_without_facts_loads() {
        #[derive(Serialize)]
        struct Older {
            quests: Vec<SavedQuest>,
            tasks: BTreeMap<String, u32>,
        }
        let bytes = rmp_serde::to_vec_named(&Older {
            quests: Vec::new(),
            tasks: BTreeMap::from([("talk_guard".to_string(), 2)]),
        })
        .unwrap();

        let snapshot = NarrativeSnapshot::from_bytes(&bytes).unwrap();
        assert_eq!(snapshot.tasks["talk_guard"], 2);
        assert!(snapshot.facts.is_empty());
    }

    #[test]
    fn test_corrupt_snapshot_is_an_error() {
        assert!(NarrativeSnapshot::from_bytes(&[0xc1, 0x00]).is_err());
    }
}
