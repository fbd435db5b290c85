//! Embedded sqlite store backing one table.
//!
//! Schema: `(id INTEGER PRIMARY KEY AUTOINCREMENT, key TEXT UNIQUE, value
//! BLOB)`.  The autoincrement `id` preserves insertion order across
//! restarts; updates keep the existing row id so an updated item does not
//! move in fetch order.

use std::path::Path;

use hub_protocol::packets::table::TableItems;
use rusqlite::{params, params_from_iter, Connection};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("cursor {0:?} not found")]
    CursorNotFound(String),
}

pub struct TableAdapter {
    conn: Connection,
}

impl TableAdapter {
    pub fn open(path: &Path) -> Result<Self, AdapterError> {
        let conn = Connection::open(path.with_extension("db"))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, AdapterError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, AdapterError> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS data (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                key TEXT UNIQUE,
                value BLOB
            )",
        )?;
        Ok(Self { conn })
    }

    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>, AdapterError> {
        let mut stmt = self.conn.prepare("SELECT value FROM data WHERE key = ?1")?;
        let mut rows = stmt.query_map(params![key], |row| row.get::<_, Vec<u8>>(0))?;
        Ok(rows.next().transpose()?)
    }

    /// Requested items that exist, in insertion order.
    pub fn get_many(&self, keys: &[String]) -> Result<TableItems, AdapterError> {
        if keys.is_empty() {
            return Ok(TableItems::new());
        }
        let placeholders = vec!["?"; keys.len()].join(",");
        let sql =
            format!("SELECT key, value FROM data WHERE key IN ({placeholders}) ORDER BY id");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(keys.iter()), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;
        let mut items = TableItems::new();
        for row in rows {
            let (key, value) = row?;
            items.insert(key, value);
        }
        Ok(items)
    }

    /// Upserts a batch in one transaction.  Existing keys keep their row id.
    pub fn set_many(&mut self, items: &TableItems) -> Result<(), AdapterError> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO data (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            )?;
            for (key, value) in items {
                stmt.execute(params![key, value])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn remove_many(&self, keys: &[String]) -> Result<(), AdapterError> {
        if keys.is_empty() {
            return Ok(());
        }
        let placeholders = vec!["?"; keys.len()].join(",");
        let sql = format!("DELETE FROM data WHERE key IN ({placeholders})");
        self.conn.execute(&sql, params_from_iter(keys.iter()))?;
        Ok(())
    }

    pub fn clear(&self) -> Result<(), AdapterError> {
        self.conn.execute("DELETE FROM data", [])?;
        Ok(())
    }

    pub fn fetch_all(&self) -> Result<TableItems, AdapterError> {
        let mut stmt = self.conn.prepare("SELECT key, value FROM data ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;
        let mut items = TableItems::new();
        for row in rows {
            let (key, value) = row?;
            items.insert(key, value);
        }
        Ok(items)
    }

    /// Windowed fetch around an optional cursor key.
    ///
    /// `before` selects up to N rows at or before the cursor (descending),
    /// `after` up to N rows at or after it (ascending); an absent cursor
    /// means the end or the start respectively.  When both windows are
    /// present the union is returned in descending-id order.  With neither,
    /// this is a full ascending scan.
    pub fn fetch(
        &self,
        before: Option<u32>,
        after: Option<u32>,
        cursor: Option<&str>,
    ) -> Result<TableItems, AdapterError> {
        let cursor_id: Option<i64> = match cursor {
            None => None,
            Some(key) => {
                let mut stmt = self.conn.prepare("SELECT id FROM data WHERE key = ?1")?;
                let mut rows = stmt.query_map(params![key], |row| row.get::<_, i64>(0))?;
                match rows.next().transpose()? {
                    Some(id) => Some(id),
                    None => return Err(AdapterError::CursorNotFound(key.to_owned())),
                }
            }
        };
        if before.is_none() && after.is_none() {
            return self.fetch_all();
        }

        let mut rows_by_id: Vec<(i64, String, Vec<u8>)> = Vec::new();
        let mut collect = |sql: &str, params: &[&dyn rusqlite::ToSql]| -> Result<(), AdapterError> {
            let mut stmt = self.conn.prepare(sql)?;
            let mapped = stmt.query_map(params, |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                ))
            })?;
            for row in mapped {
                let row = row?;
                if !rows_by_id.iter().any(|(id, _, _)| *id == row.0) {
                    rows_by_id.push(row);
                }
            }
            Ok(())
        };

        if let Some(limit) = before {
            match cursor_id {
                None => collect(
                    "SELECT id, key, value FROM data ORDER BY id DESC LIMIT ?1",
                    &[&limit],
                )?,
                Some(cursor_id) => collect(
                    "SELECT id, key, value FROM data WHERE id <= ?1 ORDER BY id DESC LIMIT ?2",
                    &[&cursor_id, &limit],
                )?,
            }
        }
        if let Some(limit) = after {
            match cursor_id {
                None => collect(
                    "SELECT id, key, value FROM data ORDER BY id LIMIT ?1",
                    &[&limit],
                )?,
                Some(cursor_id) => collect(
                    "SELECT id, key, value FROM data WHERE id >= ?1 ORDER BY id LIMIT ?2",
                    &[&cursor_id, &limit],
                )?,
            }
        }

        rows_by_id.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(rows_by_id
            .into_iter()
            .map(|(_, key, value)| (key, value))
            .collect())
    }

    pub fn size(&self) -> Result<u64, AdapterError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM data", [], |row| row.get(0))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}
