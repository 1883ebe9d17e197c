use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::auth::{TokenRecord, TokenStore};
use crate::corpus::{Corpus, CorpusStore, CorpusSummary};
use crate::errors::StoreError;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub password_hash: String,
    pub is_active: bool,
    pub created_at: String,
}

/// SQLite-backed store for accounts, bearer tokens and corpora.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn new(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;

        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                is_active BOOLEAN NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tokens (
                token TEXT PRIMARY KEY,
                user_id INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                is_active BOOLEAN NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                FOREIGN KEY(user_id) REFERENCES users(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_tokens_user ON tokens(user_id);
            CREATE INDEX IF NOT EXISTS idx_tokens_expires_at ON tokens(expires_at);

            CREATE TABLE IF NOT EXISTS corpora (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                text TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_corpora_name ON corpora(name);
        "#,
        )?;

        Ok(Database {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    // === Users ===

    /// Returns the new user id, or `None` when the username is taken.
    pub fn create_user(&self, username: &str, password_hash: &str) -> Result<Option<i64>> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO users (username, password_hash, is_active, created_at)
             VALUES (?1, ?2, 1, ?3)",
            params![username, password_hash, Utc::now().to_rfc3339()],
        )?;

        if inserted == 0 {
            return Ok(None);
        }
        Ok(Some(conn.last_insert_rowid()))
    }

    pub fn get_user(&self, username: &str) -> Result<Option<User>> {
        let conn = self.conn()?;
        let user = conn
            .query_row(
                "SELECT id, username, password_hash, is_active, created_at
                 FROM users WHERE username = ?1",
                params![username],
                |row| {
                    Ok(User {
                        id: row.get(0)?,
                        username: row.get(1)?,
                        password_hash: row.get(2)?,
                        is_active: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(user)
    }

    pub fn set_user_active(&self, user_id: i64, is_active: bool) -> Result<()> {
        self.conn()?.execute(
            "UPDATE users SET is_active = ?1 WHERE id = ?2",
            params![is_active, user_id],
        )?;
        Ok(())
    }

    // === Tokens ===

    pub fn create_token(&self, token: &str, user_id: i64, expires_at: DateTime<Utc>) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO tokens (token, user_id, expires_at, is_active, created_at)
             VALUES (?1, ?2, ?3, 1, ?4)",
            params![token, user_id, expires_at.timestamp(), Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Marks a token inactive. Returns whether a token was found.
    pub fn revoke_token(&self, token: &str) -> Result<bool> {
        let updated = self.conn()?.execute(
            "UPDATE tokens SET is_active = 0 WHERE token = ?1",
            params![token],
        )?;
        Ok(updated > 0)
    }

    /// Deletes tokens that can no longer authenticate anyone.
    pub fn purge_stale_tokens(&self, now: DateTime<Utc>) -> Result<usize> {
        let deleted = self.conn()?.execute(
            "DELETE FROM tokens WHERE expires_at < ?1 OR is_active = 0",
            params![now.timestamp()],
        )?;
        Ok(deleted)
    }

    // === Corpora ===

    pub fn create_corpus(&self, name: &str, text: &str) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO corpora (name, text, created_at) VALUES (?1, ?2, ?3)",
            params![name, text, Utc::now().to_rfc3339()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_corpus(&self, id: i64) -> Result<Option<Corpus>> {
        let conn = self.conn()?;
        let corpus = conn
            .query_row(
                "SELECT id, name, text FROM corpora WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Corpus {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        text: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(corpus)
    }

    pub fn list_corpora(&self) -> Result<Vec<CorpusSummary>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id, name FROM corpora ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok(CorpusSummary {
                id: row.get(0)?,
                name: row.get(1)?,
            })
        })?;

        let mut corpora = Vec::new();
        for row in rows {
            corpora.push(row?);
        }
        Ok(corpora)
    }
}

impl TokenStore for Database {
    fn find_token(&self, token: &str) -> Result<Option<TokenRecord>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT t.token, t.user_id, t.expires_at, t.is_active, u.is_active
                 FROM tokens t JOIN users u ON u.id = t.user_id
                 WHERE t.token = ?1",
                params![token],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, bool>(3)?,
                        row.get::<_, bool>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((token, user_id, expires_at, is_active, user_active)) = row else {
            return Ok(None);
        };
        let expires_at = Utc
            .timestamp_opt(expires_at, 0)
            .single()
            .ok_or_else(|| StoreError::Corrupt(format!("token expiry {}", expires_at)))?;

        Ok(Some(TokenRecord {
            token,
            user_id,
            expires_at,
            is_active,
            user_active,
        }))
    }
}

impl CorpusStore for Database {
    fn fetch_corpus(&self, corpus_id: i64) -> Result<Option<Corpus>> {
        self.get_corpus(corpus_id)
    }
}
