// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connection pool and service liveness.
//!
//! Each authenticated service owns at most one pooled connection. Liveness
//! moves `Active -> Pending -> Stop`: a service silent for one liveness window
//! is demoted to `Pending`, silent for another is set to `Stop` and its
//! connection evicted. Any inbound frame promotes it back to `Active`.

use kmservice::{DataGram, Outbound, PendingSet, Shutdown};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Liveness state of a registered service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Liveness {
    Stop,
    Pending,
    Active,
}

/// Handle to a pooled connection.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    pub service_id: i64,
    /// Distinguishes successive connections of the same service.
    pub conn_id: u64,
    pub peer_addr: SocketAddr,
    pub outbound: Outbound,
    /// Center-originated envelopes awaiting the peer's CONFIRM.
    pub pending: Arc<PendingSet<DataGram>>,
    pub shutdown: Shutdown,
    pub last_seen: Instant,
}

impl SessionHandle {
    pub fn new(
        service_id: i64,
        conn_id: u64,
        peer_addr: SocketAddr,
        outbound: Outbound,
        pending: Arc<PendingSet<DataGram>>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            service_id,
            conn_id,
            peer_addr,
            outbound,
            pending,
            shutdown,
            last_seen: Instant::now(),
        }
    }
}

/// Pool admission errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("connection pool is full ({max} services)")]
    Full { max: usize },
}

/// Registry of pooled connections.
pub struct ServiceRegistry {
    sessions: HashMap<i64, SessionHandle>,
    liveness: HashMap<i64, Liveness>,
    max_pool_size: usize,
}

impl ServiceRegistry {
    pub fn new(max_pool_size: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            liveness: HashMap::new(),
            max_pool_size,
        }
    }

    /// Pool a connection and mark its service `Active`.
    ///
    /// A service reconnecting replaces its previous connection, which is
    /// returned so the caller can close it.
    pub fn register(&mut self, handle: SessionHandle) -> Result<Option<SessionHandle>, PoolError> {
        let service_id = handle.service_id;
        if !self.sessions.contains_key(&service_id) && self.sessions.len() >= self.max_pool_size {
            return Err(PoolError::Full {
                max: self.max_pool_size,
            });
        }
        self.liveness.insert(service_id, Liveness::Active);
        Ok(self.sessions.insert(service_id, handle))
    }

    /// Remove a connection if it is still the pooled one for its service.
    pub fn unregister(&mut self, service_id: i64, conn_id: u64) -> Option<SessionHandle> {
        match self.sessions.get(&service_id) {
            Some(handle) if handle.conn_id == conn_id => {
                self.liveness.insert(service_id, Liveness::Stop);
                self.sessions.remove(&service_id)
            }
            _ => None,
        }
    }

    /// Record inbound traffic from a service.
    pub fn touch(&mut self, service_id: i64) {
        self.touch_at(service_id, Instant::now());
    }

    pub fn touch_at(&mut self, service_id: i64, now: Instant) {
        if let Some(handle) = self.sessions.get_mut(&service_id) {
            handle.last_seen = now;
            self.liveness.insert(service_id, Liveness::Active);
        }
    }

    /// Demote silent services and evict those already `Pending`.
    ///
    /// Returns the evicted connections; their sessions are still running and
    /// must be shut down by the caller.
    pub fn sweep_liveness(&mut self, now: Instant, window: Duration) -> Vec<SessionHandle> {
        let mut evicted = Vec::new();

        for (service_id, handle) in &self.sessions {
            if now.saturating_duration_since(handle.last_seen) <= window {
                continue;
            }
            let state = self.liveness.entry(*service_id).or_insert(Liveness::Active);
            match *state {
                Liveness::Active => *state = Liveness::Pending,
                Liveness::Pending | Liveness::Stop => {
                    *state = Liveness::Stop;
                    evicted.push(*service_id);
                }
            }
        }

        evicted
            .into_iter()
            .filter_map(|service_id| self.sessions.remove(&service_id))
            .collect()
    }

    /// Liveness of a service; unknown services are `Stop`.
    pub fn liveness(&self, service_id: i64) -> Liveness {
        self.liveness
            .get(&service_id)
            .copied()
            .unwrap_or(Liveness::Stop)
    }

    pub fn session(&self, service_id: i64) -> Option<SessionHandle> {
        self.sessions.get(&service_id).cloned()
    }

    pub fn sessions(&self) -> Vec<SessionHandle> {
        self.sessions.values().cloned().collect()
    }

    pub fn is_connected(&self, service_id: i64) -> bool {
        self.sessions.contains_key(&service_id)
    }

    pub fn connection_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn max_pool_size(&self) -> usize {
        self.max_pool_size
    }
}
