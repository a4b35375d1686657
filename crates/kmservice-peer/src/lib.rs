// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! kmservice peer
//!
//! Client side of the kmservice fabric: a [`Peer`] keeps one authenticated
//! session with the center, caches the values it pulls or is pushed, and
//! tracks every request until the center confirms it. Peers can also open
//! [`Link`] tunnels to each other once the center has introduced them.
//!
//! # Example
//!
//! ```no_run
//! use kmservice::PeerConfig;
//! use kmservice_peer::Peer;
//! use serde_json::json;
//!
//! # async fn run() -> Result<(), kmservice_peer::PeerError> {
//! let peer = Peer::connect(PeerConfig::new("127.0.0.1", 8888, 1, "token-1")).await?;
//! peer.update(42, None, json!("v1")).await?;
//! peer.get(42).await?;
//! # Ok(())
//! # }
//! ```

pub mod link;
pub mod peer;

pub use link::{Link, LinkConfig, LinkError, LinkField, LinkListener};
pub use peer::{
    Peer, PeerBuilder, PeerError, PeerLocalState, SessionState, UpdateCallback, UpdateStatus,
};
