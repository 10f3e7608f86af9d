use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::task;

use crate::models::StoredFile;

/// Local persistent storage: a key/value table standing in for the browser's
/// local storage, plus the file side table.
#[derive(Debug, Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>> {
    conn.lock().map_err(|_| anyhow!("Database connection mutex poisoned"))
}

impl Database {
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create data directory: {}", parent.display()))?;
        }

        let path = path.to_path_buf();
        let conn = task::spawn_blocking(move || {
            let conn = Connection::open(&path)
                .with_context(|| format!("Failed to open database at {}", path.display()))?;
            conn.execute_batch("PRAGMA journal_mode=WAL;")?;
            Ok::<_, anyhow::Error>(conn)
        })
        .await??;

        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;

        Ok(db)
    }

    /// Create an in-memory database (used for testing and as placeholder)
    pub fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = lock(&self.conn)?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER NOT NULL
            );",
        )?;

        let version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if version < 1 {
            conn.execute_batch(
                "CREATE TABLE kv (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                );

                INSERT INTO schema_version (version) VALUES (1);",
            )?;
        }

        if version < 2 {
            conn.execute_batch(
                "CREATE TABLE files (
                    conversation_id TEXT NOT NULL,
                    file_id TEXT NOT NULL,
                    filename TEXT NOT NULL,
                    mime_type TEXT NOT NULL,
                    size BIGINT NOT NULL,
                    data BLOB NOT NULL,
                    created_at TEXT NOT NULL,
                    PRIMARY KEY (conversation_id, file_id)
                );
                CREATE INDEX idx_files_conversation ON files(conversation_id);

                UPDATE schema_version SET version = 2;",
            )?;
        }

        Ok(())
    }

    // --- Key/value storage ---

    pub async fn get_value(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.clone();
        let key = key.to_string();
        task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            let result: Option<String> = conn
                .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                    row.get(0)
                })
                .optional()?;
            Ok(result)
        })
        .await?
    }

    pub async fn set_value(&self, key: &str, value: &str) -> Result<()> {
        self.set_values(vec![(key.to_string(), value.to_string())])
            .await
    }

    /// Write several keys in one transaction: either all land or none do.
    pub async fn set_values(&self, entries: Vec<(String, String)>) -> Result<()> {
        let conn = self.conn.clone();
        task::spawn_blocking(move || {
            let mut conn = lock(&conn)?;
            let tx = conn.transaction()?;
            for (key, value) in &entries {
                tx.execute(
                    "INSERT INTO kv (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = ?2",
                    params![key, value],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await?
    }

    pub async fn remove_values(&self, keys: &[&str]) -> Result<()> {
        let conn = self.conn.clone();
        let keys: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        task::spawn_blocking(move || {
            let mut conn = lock(&conn)?;
            let tx = conn.transaction()?;
            for key in &keys {
                tx.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
            }
            tx.commit()?;
            Ok(())
        })
        .await?
    }

    // --- File store ---

    pub async fn upsert_file(&self, file: &StoredFile) -> Result<()> {
        let conn = self.conn.clone();
        let file = file.clone();
        task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            conn.execute(
                "INSERT INTO files (conversation_id, file_id, filename, mime_type, size, data, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(conversation_id, file_id) DO UPDATE SET
                    filename = ?3, mime_type = ?4, size = ?5, data = ?6",
                params![
                    file.conversation_id,
                    file.file_id,
                    file.filename,
                    file.mime_type,
                    file.size as i64,
                    file.data,
                    file.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await?
    }

    pub async fn get_file(&self, conversation_id: &str, file_id: &str) -> Result<Option<StoredFile>> {
        let conn = self.conn.clone();
        let conversation_id = conversation_id.to_string();
        let file_id = file_id.to_string();
        task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            let mut stmt = conn.prepare(
                "SELECT conversation_id, file_id, filename, mime_type, size, data, created_at
                 FROM files WHERE conversation_id = ?1 AND file_id = ?2",
            )?;
            let result = stmt
                .query_row(params![conversation_id, file_id], |row| {
                    Ok(Self::row_to_file(row))
                })
                .optional()?;
            match result {
                Some(Ok(file)) => Ok(Some(file)),
                Some(Err(e)) => Err(e),
                None => Ok(None),
            }
        })
        .await?
    }

    pub async fn list_files(&self, conversation_id: &str) -> Result<Vec<StoredFile>> {
        let conn = self.conn.clone();
        let conversation_id = conversation_id.to_string();
        task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            let mut stmt = conn.prepare(
                "SELECT conversation_id, file_id, filename, mime_type, size, data, created_at
                 FROM files WHERE conversation_id = ?1 ORDER BY created_at ASC",
            )?;
            let files = stmt
                .query_map(params![conversation_id], |row| Ok(Self::row_to_file(row)))?
                .collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .collect::<Result<Vec<_>, _>>()?;
            Ok(files)
        })
        .await?
    }

    pub async fn delete_files(&self, conversation_id: &str) -> Result<usize> {
        let conn = self.conn.clone();
        let conversation_id = conversation_id.to_string();
        task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            let removed = conn.execute(
                "DELETE FROM files WHERE conversation_id = ?1",
                params![conversation_id],
            )?;
            Ok(removed)
        })
        .await?
    }

    pub async fn delete_all_files(&self) -> Result<()> {
        let conn = self.conn.clone();
        task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            conn.execute("DELETE FROM files", [])?;
            Ok(())
        })
        .await?
    }

    // --- Row helpers ---

    fn row_to_file(row: &rusqlite::Row) -> Result<StoredFile> {
        let size: i64 = row.get(4)?;
        let created_str: String = row.get(6)?;

        Ok(StoredFile {
            conversation_id: row.get(0)?,
            file_id: row.get(1)?,
            filename: row.get(2)?,
            mime_type: row.get(3)?,
            size: size.max(0) as u64,
            data: row.get(5)?,
            created_at: DateTime::parse_from_rfc3339(&created_str)?.with_timezone(&Utc),
        })
    }
}
