//! Relational side of diary entries: one pointer row per document.

use anyhow::Result;
use parking_lot::Mutex;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiaryPointer {
    pub id: i64,
    pub account_id: i64,
    pub document_id: String,
    pub mood: Option<String>,
    pub created_at: i64,
}

pub trait DiaryIndex: Send + Sync {
    /// Returns the new pointer id.
    fn insert(
        &self,
        account_id: i64,
        document_id: &str,
        mood: Option<&str>,
        created_at: i64,
    ) -> Result<i64>;

    /// Newest first.
    fn list(&self, account_id: i64, limit: usize) -> Result<Vec<DiaryPointer>>;
}

pub struct SqliteDiaryIndex {
    conn: Mutex<rusqlite::Connection>,
}

impl SqliteDiaryIndex {
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = rusqlite::Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(rusqlite::Connection::open_in_memory()?)
    }

    fn init(conn: rusqlite::Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS diary_entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id INTEGER NOT NULL,
                document_id TEXT NOT NULL UNIQUE,
                mood TEXT,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_diary_account ON diary_entries(account_id, created_at);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl DiaryIndex for SqliteDiaryIndex {
    fn insert(
        &self,
        account_id: i64,
        document_id: &str,
        mood: Option<&str>,
        created_at: i64,
    ) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO diary_entries (account_id, document_id, mood, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![account_id, document_id, mood, created_at],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn list(&self, account_id: i64, limit: usize) -> Result<Vec<DiaryPointer>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, account_id, document_id, mood, created_at
             FROM diary_entries WHERE account_id = ?1
             ORDER BY created_at DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(rusqlite::params![account_id, limit as i64], |row| {
                Ok(DiaryPointer {
                    id: row.get(0)?,
                    account_id: row.get(1)?,
                    document_id: row.get(2)?,
                    mood: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
