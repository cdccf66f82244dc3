use crate::api::models::Conversation;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use rusqlite::{params, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

fn db_path() -> Option<PathBuf> {
    let proj = ProjectDirs::from("com", "example", "Murmur")?;
    Some(proj.data_dir().join("cache.sqlite"))
}

fn ensure_dir(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

// Sidebar summaries cached so the conversation list renders before the API answers.
pub struct ConversationCache {
    conn: Mutex<Connection>,
}

impl ConversationCache {
    pub fn open(path: &Path) -> Result<Self> {
        ensure_dir(path)?;
        Self::init(Connection::open(path)?)
    }

    pub fn open_default() -> Result<Self> {
        let path = db_path().ok_or_else(|| Error::Config("no data dir".into()))?;
        Self::open(&path)
    }

    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                participant1_id TEXT NOT NULL,
                participant2_id TEXT NOT NULL,
                counterpart_id TEXT,
                created_at TEXT NOT NULL,
                last_message TEXT
            );
            "#,
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn upsert(&self, conversations: &[Conversation]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = conn.transaction()?;
        for c in conversations {
            tx.execute(
                r#"
                INSERT INTO conversations (id, participant1_id, participant2_id, counterpart_id, created_at, last_message)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(id) DO UPDATE SET
                    participant1_id=excluded.participant1_id,
                    participant2_id=excluded.participant2_id,
                    counterpart_id=excluded.counterpart_id,
                    created_at=excluded.created_at,
                    last_message=excluded.last_message
                "#,
                params![
                    c.id,
                    c.participant1_id,
                    c.participant2_id,
                    c.counterpart_id,
                    c.created_at,
                    c.last_message
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load(&self, limit: Option<usize>) -> Result<Vec<Conversation>> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stmt = conn.prepare(
            "SELECT id, participant1_id, participant2_id, counterpart_id, created_at, last_message
             FROM conversations ORDER BY created_at DESC, id ASC LIMIT ?1",
        )?;
        let lim = limit.unwrap_or(500) as i64;
        let rows = stmt.query_map(params![lim], |row| {
            Ok(Conversation {
                id: row.get(0)?,
                participant1_id: row.get(1)?,
                participant2_id: row.get(2)?,
                counterpart_id: row.get(3)?,
                created_at: row.get::<_, DateTime<Utc>>(4)?,
                last_message: row.get(5)?,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }
}
