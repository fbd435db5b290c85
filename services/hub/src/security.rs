//! App token store.
//!
//! Each app is issued an opaque token on first connect; subsequent connects
//! present it back.  Tokens are persisted in `security/tokens.sqlite` with
//! creation and last-use timestamps.

use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use hub_protocol::App;
use rand::RngCore;
use rusqlite::{params, Connection};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

pub struct TokenStore {
    conn: Mutex<Connection>,
}

impl TokenStore {
    pub fn open(security_dir: &Path) -> Result<Self, SecurityError> {
        let conn = Connection::open(security_dir.join("tokens.sqlite"))?;
        Self::init(conn)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, SecurityError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, SecurityError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tokens (
                identifier TEXT,
                token TEXT,
                created_at INTEGER,
                last_used_at INTEGER
            )",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Mints and persists a fresh token for the app.
    pub fn mint(&self, app: &App) -> Result<String, SecurityError> {
        let mut raw = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut raw);
        let token = hex::encode(raw);
        let now = Utc::now().timestamp();
        let conn = self.conn.lock().expect("token store poisoned");
        conn.execute(
            "INSERT INTO tokens (identifier, token, created_at, last_used_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![app.key(), token, now, now],
        )?;
        Ok(token)
    }

    /// True when the token was issued to this app; refreshes last_used_at.
    pub fn validate(&self, app: &App, token: &str) -> Result<bool, SecurityError> {
        let conn = self.conn.lock().expect("token store poisoned");
        let updated = conn.execute(
            "UPDATE tokens SET last_used_at = ?1 WHERE identifier = ?2 AND token = ?3",
            params![Utc::now().timestamp(), app.key(), token],
        )?;
        Ok(updated > 0)
    }
}
