// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Datagram archive abstraction
//!
//! Every envelope a sender tracks is recorded here first, keyed by
//! `(ServiceId, Tag)`. The archive is consulted when an exception names a tag
//! the sender no longer remembers. Archive failures never affect delivery.

use crate::protocol::{DataGram, MessageKind, RawDataGram};
use anyhow::Result;
use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::num::NonZeroUsize;
use tracing::warn;

/// Envelopes a [`MemoryStore`] keeps before evicting the least recent.
pub const DEFAULT_MEMORY_CAPACITY: usize = 10_000;

/// An archived envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDataGram {
    pub service_id: i64,
    pub tag: String,
    pub title: MessageKind,
    pub key: i64,
    pub body: Value,
    pub time_stamp: DateTime<Utc>,
}

impl StoredDataGram {
    pub fn from_raw(raw: &RawDataGram) -> Self {
        Self {
            service_id: raw.service_id,
            tag: raw.tag.clone(),
            title: raw.data.title,
            key: raw.data.key,
            body: raw.data.body.clone(),
            time_stamp: raw.data.time_stamp,
        }
    }

    pub fn from_gram(gram: &DataGram) -> Result<Self> {
        Ok(Self::from_raw(&gram.to_raw()?))
    }
}

/// Archive store trait
///
/// # Implementations
///
/// - `MemoryStore` -- process-local and bounded, used when no file path is set
/// - `SqliteStore` -- file-backed
pub trait DataGramStore: Send + Sync {
    /// Record an envelope. Recording the same `(service_id, tag)` twice keeps
    /// the latest copy.
    fn record(&self, gram: &StoredDataGram) -> Result<()>;

    /// Look up an envelope by sender and tag
    fn lookup(&self, service_id: i64, tag: &str) -> Result<Option<StoredDataGram>>;

    /// Total number of archived envelopes
    fn count(&self) -> Result<usize>;
}

/// Record `gram`, logging instead of failing.
pub fn archive(store: &dyn DataGramStore, gram: &DataGram) {
    let stored = match StoredDataGram::from_gram(gram) {
        Ok(stored) => stored,
        Err(e) => {
            warn!(tag = %gram.tag, "Failed to serialize envelope for archive: {}", e);
            return;
        }
    };
    if let Err(e) = store.record(&stored) {
        warn!(tag = %gram.tag, "Failed to archive envelope: {:#}", e);
    }
}

/// In-memory archive holding the most recent envelopes.
///
/// Once full, recording evicts the least recently recorded or looked-up
/// envelope.
pub struct MemoryStore {
    grams: Mutex<LruCache<(i64, String), StoredDataGram>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_capacity(NonZeroUsize::new(DEFAULT_MEMORY_CAPACITY).unwrap_or(NonZeroUsize::MIN))
    }

    pub fn with_capacity(capacity: NonZeroUsize) -> Self {
        Self {
            grams: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.grams.lock().cap().get()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DataGramStore for MemoryStore {
    fn record(&self, gram: &StoredDataGram) -> Result<()> {
        self.grams
            .lock()
            .put((gram.service_id, gram.tag.clone()), gram.clone());
        Ok(())
    }

    fn lookup(&self, service_id: i64, tag: &str) -> Result<Option<StoredDataGram>> {
        Ok(self
            .grams
            .lock()
            .get(&(service_id, tag.to_string()))
            .cloned())
    }

    fn count(&self) -> Result<usize> {
        Ok(self.grams.lock().len())
    }
}
