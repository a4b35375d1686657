// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Message tags.
//!
//! A tag is 20 random upper-case letters, a dash, and the sender's service
//! id, e.g. `QHZKMWPRTAXOBNDEFYLC-7`. The sender id suffix keeps tags of
//! different services apart without coordination.

/// Number of random letters in a tag.
pub const TAG_LETTERS: usize = 20;

/// Generate a tag for `sender_id`.
pub fn new_tag(sender_id: i64) -> String {
    let mut tag = String::with_capacity(TAG_LETTERS + 21);
    for _ in 0..TAG_LETTERS {
        tag.push(char::from(fastrand::u8(b'A'..=b'Z')));
    }
    tag.push('-');
    tag.push_str(&sender_id.to_string());
    tag
}
