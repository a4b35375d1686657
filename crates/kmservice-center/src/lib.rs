// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! kmservice center
//!
//! The hub every peer dials: authenticates services against the directory,
//! keeps one pooled connection per service, owns the shared key/value store
//! with its per-key write locks, fans updates out to subscribers and brokers
//! link endpoints.

pub mod config;
pub mod directory;
pub mod server;
pub mod store;

pub use config::{CenterConfig, ConfigError};
pub use directory::{Access, Directory, DirectorySeed, MicroService, Subscription};
pub use server::{Center, CenterState, Liveness, ServerError};
pub use store::{KeyGuard, LockError, SharedStore};
