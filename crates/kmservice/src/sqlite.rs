// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! SQLite archive backend
//!
//! Thread-safe via an internal mutex (a SQLite `Connection` is not `Sync`).
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE datagrams (
//!     service_id   INTEGER NOT NULL,
//!     tag          TEXT NOT NULL,
//!     title        TEXT NOT NULL,
//!     key          INTEGER NOT NULL,
//!     body         TEXT NOT NULL,
//!     timestamp_ms INTEGER NOT NULL,
//!     PRIMARY KEY (service_id, tag)
//! );
//! ```

use crate::protocol::MessageKind;
use crate::store::{DataGramStore, StoredDataGram};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a file-backed archive
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database at {}", path.display()))?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory archive (for testing)
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to create in-memory SQLite database")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS datagrams (
                service_id INTEGER NOT NULL,
                tag TEXT NOT NULL,
                title TEXT NOT NULL,
                key INTEGER NOT NULL,
                body TEXT NOT NULL,
                timestamp_ms INTEGER NOT NULL,
                PRIMARY KEY (service_id, tag)
            )",
            [],
        )?;


        Ok(())
    }

    fn row_to_gram(row: &rusqlite::Row) -> rusqlite::Result<StoredDataGram> {
        let title: String = row.get(2)?;
        let title: MessageKind = title
            .parse()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;

        let body: String = row.get(4)?;
        let body = serde_json::from_str(&body)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?;

        let millis: i64 = row.get(5)?;
        let time_stamp = DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or_default();

        Ok(StoredDataGram {
            service_id: row.get(0)?,
            tag: row.get(1)?,
            title,
            key: row.get(3)?,
            body,
            time_stamp,
        })
    }
}

impl DataGramStore for SqliteStore {
    fn record(&self, gram: &StoredDataGram) -> Result<()> {
        let body = serde_json::to_string(&gram.body)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO datagrams (service_id, tag, title, key, body, timestamp_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                gram.service_id,
                gram.tag,
                gram.title.as_str(),
                gram.key,
                body,
                gram.time_stamp.timestamp_millis(),
            ],
        )?;

        Ok(())
    }

    fn lookup(&self, service_id: i64, tag: &str) -> Result<Option<StoredDataGram>> {
        let conn = self.conn.lock();
        let gram = conn
            .query_row(
                "SELECT service_id, tag, title, key, body, timestamp_ms
                 FROM datagrams
                 WHERE service_id = ?1 AND tag = ?2",
                params![service_id, tag],
                Self::row_to_gram,
            )
            .optional()?;

        Ok(gram)
    }

    fn count(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM datagrams", [], |row| row.get(0))?;

        Ok(count as usize)
    }
}
