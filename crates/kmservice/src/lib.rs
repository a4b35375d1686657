// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! kmservice core
//!
//! Shared building blocks of the kmservice registry and data-synchronization
//! fabric: wire protocol, framing, tags, the pending/resend engine and the
//! datagram archive.
//!
//! # Architecture
//!
//! ```text
//! Center (kmservice-center)            Peer (kmservice-peer)
//! +-- per-connection session           +-- session (reader, worker, sweeper)
//! |   +-- PendingSet<DataGram>         |   +-- PendingSet<DataGram>
//! |   +-- FrameReader / Outbound       |   +-- FrameReader / Outbound
//! +-- SharedStore (per-key locks)      +-- Link fields
//!                                          +-- PendingSet<LinkGram>
//! ```
//!
//! Every tracked frame is resent byte-for-byte until the receiver answers with
//! `CONFIRM(tag)`, or dropped after the resend ceiling.

pub mod codec;
pub mod config;
pub mod connection;
pub mod pending;
pub mod protocol;
pub mod shutdown;
pub mod sqlite;
pub mod store;
pub mod tag;

pub use codec::CodecError;
pub use config::{ConfigError, PeerConfig};
pub use connection::{ConnectionError, Frame, FrameReader, FrameWriter, Outbound};
pub use pending::{PendingSet, ResendPolicy};
pub use protocol::{
    Api, ApiList, ConnApply, DataGram, ExceptionKind, LinkApply, LinkGram, LinkInfo, LinkType,
    MessageKind, Payload, RawDataGram, SubscriptionGrant, UpdateRequest, CENTER_SERVICE_ID,
};
pub use shutdown::{Shutdown, ShutdownSignal};
pub use sqlite::SqliteStore;
pub use store::{DataGramStore, MemoryStore, StoredDataGram};
pub use tag::new_tag;

use std::path::Path;
use std::sync::Arc;

/// Open the archive at `path`, or an in-memory one when no path is given.
pub fn open_archive(path: Option<&Path>) -> anyhow::Result<Arc<dyn DataGramStore>> {
    Ok(match path {
        Some(path) => Arc::new(SqliteStore::new(path)?),
        None => Arc::new(MemoryStore::new()),
    })
}
