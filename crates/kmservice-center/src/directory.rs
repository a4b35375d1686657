// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Service directory.
//!
//! Holds the registered [`MicroService`] records and the subscription ACLs.
//! Both tables live behind `ArcSwap` snapshots: connection handlers read them
//! lock-free and an admin surface replaces a whole table atomically.

use arc_swap::ArcSwap;
use kmservice::{Api, SubscriptionGrant};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// A registered service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MicroService {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub root_path: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub start_command: String,
    #[serde(rename = "APIs", default)]
    pub apis: Vec<Api>,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub owner_email: Vec<String>,
    pub token: String,
}

/// A named shared key and who may read or write it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub id: i64,
    pub key: String,
    #[serde(default)]
    pub subscribers: Vec<i64>,
    #[serde(default)]
    pub writers: Vec<i64>,
    #[serde(default)]
    pub description: String,
}

impl Subscription {
    pub fn can_read(&self, service_id: i64) -> bool {
        self.subscribers.contains(&service_id)
    }

    pub fn can_write(&self, service_id: i64) -> bool {
        self.writers.contains(&service_id)
    }
}

/// Outcome of an access check on a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Granted,
    /// The key has a subscription but the service is not listed.
    Denied,
    /// No subscription exists for the key.
    NoSubscription,
}

/// Directory seed file contents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectorySeed {
    #[serde(default)]
    pub services: Vec<MicroService>,
    #[serde(default)]
    pub subscriptions: Vec<Subscription>,
    /// Initial shared values by subscription id
    #[serde(default)]
    pub data: HashMap<i64, Value>,
}

impl DirectorySeed {
    /// Load a seed from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, DirectoryError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Connect refusal reasons.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("service {0} is not registered")]
    UnknownService(i64),

    #[error("token mismatch for service {0}")]
    TokenMismatch(i64),
}

/// Directory loading errors.
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Registered services and subscription ACLs.
pub struct Directory {
    services: ArcSwap<HashMap<i64, MicroService>>,
    subscriptions: ArcSwap<HashMap<i64, Subscription>>,
}

impl Directory {
    pub fn new(services: Vec<MicroService>, subscriptions: Vec<Subscription>) -> Self {
        Self {
            services: ArcSwap::from_pointee(index_services(services)),
            subscriptions: ArcSwap::from_pointee(index_subscriptions(subscriptions)),
        }
    }

    pub fn from_seed(seed: &DirectorySeed) -> Self {
        Self::new(seed.services.clone(), seed.subscriptions.clone())
    }

    /// Check a connect request.
    pub fn authenticate(&self, service_id: i64, token: &str) -> Result<(), AuthError> {
        let services = self.services.load();
        let service = services
            .get(&service_id)
            .ok_or(AuthError::UnknownService(service_id))?;
        if service.token != token {
            return Err(AuthError::TokenMismatch(service_id));
        }
        Ok(())
    }

    pub fn service(&self, service_id: i64) -> Option<MicroService> {
        self.services.load().get(&service_id).cloned()
    }

    /// API descriptors of a service, `None` if it is not registered.
    pub fn apis_of(&self, service_id: i64) -> Option<Vec<Api>> {
        self.services.load().get(&service_id).map(|s| s.apis.clone())
    }

    pub fn subscription(&self, key: i64) -> Option<Subscription> {
        self.subscriptions.load().get(&key).cloned()
    }

    pub fn read_access(&self, service_id: i64, key: i64) -> Access {
        self.access(key, |s| s.can_read(service_id))
    }

    pub fn write_access(&self, service_id: i64, key: i64) -> Access {
        self.access(key, |s| s.can_write(service_id))
    }

    fn access(&self, key: i64, allowed: impl FnOnce(&Subscription) -> bool) -> Access {
        match self.subscriptions.load().get(&key) {
            None => Access::NoSubscription,
            Some(s) if allowed(s) => Access::Granted,
            Some(_) => Access::Denied,
        }
    }

    /// Services to notify when `key` changes.
    pub fn subscribers_of(&self, key: i64) -> Vec<i64> {
        self.subscriptions
            .load()
            .get(&key)
            .map(|s| s.subscribers.clone())
            .unwrap_or_default()
    }

    /// Every subscription `service_id` may read or write, ordered by id.
    pub fn grants_for(&self, service_id: i64) -> Vec<SubscriptionGrant> {
        let subscriptions = self.subscriptions.load();
        let mut grants: Vec<_> = subscriptions
            .values()
            .filter_map(|s| {
                let read = s.can_read(service_id);
                let write = s.can_write(service_id);
                (read || write).then(|| SubscriptionGrant {
                    id: s.id,
                    key: s.key.clone(),
                    read,
                    write,
                })
            })
            .collect();
        grants.sort_by_key(|g| g.id);
        grants
    }

    /// Replace the whole service table.
    pub fn replace_services(&self, services: Vec<MicroService>) {
        self.services.store(Arc::new(index_services(services)));
    }

    /// Replace the whole ACL table.
    pub fn replace_subscriptions(&self, subscriptions: Vec<Subscription>) {
        self.subscriptions
            .store(Arc::new(index_subscriptions(subscriptions)));
    }

    pub fn service_count(&self) -> usize {
        self.services.load().len()
    }
}

fn index_services(services: Vec<MicroService>) -> HashMap<i64, MicroService> {
    services.into_iter().map(|s| (s.id, s)).collect()
}

fn index_subscriptions(subscriptions: Vec<Subscription>) -> HashMap<i64, Subscription> {
    subscriptions.into_iter().map(|s| (s.id, s)).collect()
}
