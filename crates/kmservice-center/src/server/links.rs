// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Link pool: where each published link listener can be reached.

use kmservice::LinkInfo;
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct LinkPool {
    links: RwLock<HashMap<String, LinkInfo>>,
}

impl LinkPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a link, replacing any earlier one under the same key.
    pub fn submit(&self, info: LinkInfo) -> Option<LinkInfo> {
        self.links.write().insert(info.key.clone(), info)
    }

    pub fn find(&self, key: &str) -> Option<LinkInfo> {
        self.links.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.links.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.read().is_empty()
    }
}
