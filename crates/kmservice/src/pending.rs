// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Pending/resend engine.
//!
//! Every tracked message stays in a [`PendingSet`] until the receiver sends a
//! `CONFIRM` for its tag. A periodic sweep retransmits the exact bytes of
//! entries older than the resend threshold and drops entries that have been
//! resent more than `max_resends` times.
//!
//! The set is generic over the message it remembers so the same engine backs
//! center/peer envelopes and link frames. One set per owner (session or link
//! field); sets never share entries.

use crate::connection::{Frame, Outbound};
use crate::shutdown::ShutdownSignal;
use crate::tag::new_tag;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Default sweep interval.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
/// Default age after which an unacknowledged message is resent.
pub const DEFAULT_RESEND_AFTER: Duration = Duration::from_secs(5 * 60);
/// Default resend ceiling.
pub const DEFAULT_MAX_RESENDS: u32 = 10;

/// Timing and ceiling for the resend sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResendPolicy {
    pub sweep_interval: Duration,
    pub resend_after: Duration,
    pub max_resends: u32,
}

impl Default for ResendPolicy {
    fn default() -> Self {
        Self {
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            resend_after: DEFAULT_RESEND_AFTER,
            max_resends: DEFAULT_MAX_RESENDS,
        }
    }
}

/// A message awaiting acknowledgment.
#[derive(Debug, Clone)]
pub struct PendingEntry<M> {
    pub sent_at: Instant,
    pub resend_count: u32,
    pub message: M,
    frame: Frame,
}

impl<M> PendingEntry<M> {
    /// The bytes originally written, resent verbatim.
    pub fn frame(&self) -> &Frame {
        &self.frame
    }
}

/// Outcome of one sweep.
#[derive(Debug)]
pub struct SweepReport<M> {
    /// Frames to retransmit, by tag.
    pub resend: Vec<(String, Frame)>,
    /// Entries removed after exceeding the ceiling.
    pub dropped: Vec<(String, PendingEntry<M>)>,
}

/// Messages sent but not yet acknowledged.
#[derive(Debug)]
pub struct PendingSet<M> {
    entries: Mutex<HashMap<String, PendingEntry<M>>>,
}

impl<M> PendingSet<M> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Start tracking a message right after it was written.
    ///
    /// Returns `false` and leaves the existing entry untouched if the tag is
    /// already tracked.
    pub fn track(&self, tag: impl Into<String>, message: M, frame: Frame) -> bool {
        self.track_at(tag, message, frame, Instant::now())
    }

    /// [`track`](Self::track) with an explicit send time.
    pub fn track_at(&self, tag: impl Into<String>, message: M, frame: Frame, sent_at: Instant) -> bool {
        use std::collections::hash_map::Entry;

        match self.entries.lock().entry(tag.into()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(PendingEntry {
                    sent_at,
                    resend_count: 0,
                    message,
                    frame,
                });
                true
            }
        }
    }

    /// Stop tracking `tag`. Unknown or already acknowledged tags are a no-op.
    pub fn acknowledge(&self, tag: &str) -> Option<M> {
        self.entries.lock().remove(tag).map(|entry| entry.message)
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.entries.lock().contains_key(tag)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Resend count of a tracked tag.
    pub fn resend_count(&self, tag: &str) -> Option<u32> {
        self.entries.lock().get(tag).map(|entry| entry.resend_count)
    }

    /// A new tag for `sender_id` that is not currently tracked here.
    pub fn fresh_tag(&self, sender_id: i64) -> String {
        let entries = self.entries.lock();
        loop {
            let tag = new_tag(sender_id);
            if !entries.contains_key(&tag) {
                return tag;
            }
        }
    }

    /// Drop every entry, e.g. when the owning connection goes away.
    pub fn clear(&self) -> usize {
        let mut entries = self.entries.lock();
        let n = entries.len();
        entries.clear();
        n
    }

    pub fn sweep(&self, policy: &ResendPolicy) -> SweepReport<M> {
        self.sweep_at(Instant::now(), policy)
    }

    /// Sweep as if the current time were `now`.
    pub fn sweep_at(&self, now: Instant, policy: &ResendPolicy) -> SweepReport<M> {
        let mut entries = self.entries.lock();
        let mut resend = Vec::new();
        let mut exhausted = Vec::new();

        for (tag, entry) in entries.iter_mut() {
            if entry.resend_count > policy.max_resends {
                exhausted.push(tag.clone());
            } else if now.saturating_duration_since(entry.sent_at) > policy.resend_after {
                entry.resend_count += 1;
                resend.push((tag.clone(), entry.frame.clone()));
            }
        }

        let dropped = exhausted
            .into_iter()
            .filter_map(|tag| entries.remove(&tag).map(|entry| (tag, entry)))
            .collect();

        SweepReport { resend, dropped }
    }
}

impl<M> Default for PendingSet<M> {
    fn default() -> Self {
        Self::new()
    }
}

/// Run the periodic sweep for `pending` until `shutdown` fires.
///
/// Resent frames go out through `outbound`; exhausted entries are logged and
/// forgotten. `owner` only labels log lines.
pub fn spawn_sweeper<M>(
    pending: Arc<PendingSet<M>>,
    policy: ResendPolicy,
    outbound: Outbound,
    mut shutdown: ShutdownSignal,
    owner: String,
) -> JoinHandle<()>
where
    M: Debug + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(policy.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = pending.sweep(&policy);

                    for (tag, entry) in report.dropped {
                        error!(
                            owner = %owner,
                            tag = %tag,
                            resends = entry.resend_count,
                            "Message sent too many times, dropping: {:?}",
                            entry.message
                        );
                    }

                    for (tag, frame) in report.resend {
                        debug!(owner = %owner, tag = %tag, "Resending unacknowledged message");
                        if let Err(e) = outbound.send(frame).await {
                            warn!(owner = %owner, tag = %tag, "Resend failed: {}", e);
                        }
                    }
                }
                _ = shutdown.recv() => {
                    debug!(owner = %owner, "Sweeper shutting down");
                    break;
                }
            }
        }
    })
}
