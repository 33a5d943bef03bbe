// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Periodic retransmission of unacknowledged QoS 1/2 messages.
//!
//! The sweep itself is invoked from [`crate::cluster::health::HealthTicker`]
//! rather than running as its own task: the original source's global
//! ticker never actually looped over sessions to drive this, only a
//! per-session hook existed. Since pending tables and the transport are
//! owned exclusively by a session's own task, the ticker can't mutate
//! them directly — instead it broadcasts a tick that every `Session`
//! reacts to by sweeping its own tables.

use std::collections::HashMap;

use codec::PacketId;

use crate::session::pending::PendingMessage;

/// Default interval between retry sweeps, in seconds.
pub const DEFAULT_RETRY_INTERVAL_SECS: u64 = 10;

/// Default number of retransmissions before a pending message is dropped.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy)]
pub struct RetryScheduler {
    retry_interval_ms: u64,
    max_retries: u32,
}

impl RetryScheduler {
    #[must_use]
    pub const fn new(retry_interval_secs: u64, max_retries: u32) -> Self {
        Self {
            retry_interval_ms: retry_interval_secs * 1000,
            max_retries,
        }
    }
}

impl Default for RetryScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_INTERVAL_SECS, DEFAULT_MAX_RETRIES)
    }
}

impl RetryScheduler {
    /// Inspects `pending` and returns the entries that must be
    /// retransmitted with the DUP flag set, having already bumped their
    /// `retry_count` and refreshed `sent_at_ms`. Entries whose
    /// `retry_count` has reached `max_retries` are dropped from `pending`
    /// and not returned (retry exhaustion: drop the message, leave the
    /// session connected).
    pub fn sweep(&self, pending: &mut HashMap<PacketId, PendingMessage>, now_ms: u64) -> Vec<(PacketId, PendingMessage)> {
        let mut due = Vec::new();
        let mut expired = Vec::new();

        for (packet_id, message) in pending.iter() {
            if now_ms.saturating_sub(message.sent_at_ms) < self.retry_interval_ms {
                continue;
            }
            if message.retry_count >= self.max_retries {
                expired.push(*packet_id);
            } else {
                due.push(*packet_id);
            }
        }

        for packet_id in expired {
            pending.remove(&packet_id);
        }

        let mut retransmit = Vec::with_capacity(due.len());
        for packet_id in due {
            if let Some(message) = pending.get_mut(&packet_id) {
                message.retry_count += 1;
                message.sent_at_ms = now_ms;
                retransmit.push((packet_id, message.clone()));
            }
        }
        retransmit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::QoS;

    fn pending_at(sent_at_ms: u64, retry_count: u32) -> PendingMessage {
        let mut message = PendingMessage::new("t".to_string(), b"v".to_vec(), QoS::AtLeastOnce, false, sent_at_ms);
        message.retry_count = retry_count;
        message
    }

    #[test]
    fn test_entries_younger_than_interval_are_left_alone() {
        let scheduler = RetryScheduler::new(10, 3);
        let mut pending = HashMap::new();
        pending.insert(PacketId::new(1), pending_at(1000, 0));
        let retransmit = scheduler.sweep(&mut pending, 5000);
        assert!(retransmit.is_empty());
        assert!(pending.contains_key(&PacketId::new(1)));
    }

    #[test]
    fn test_due_entry_is_retransmitted_with_bumped_retry_count() {
        let scheduler = RetryScheduler::new(10, 3);
        let mut pending = HashMap::new();
        pending.insert(PacketId::new(1), pending_at(0, 0));
        let retransmit = scheduler.sweep(&mut pending, 11_000);
        assert_eq!(retransmit.len(), 1);
        assert_eq!(retransmit[0].1.retry_count, 1);
        assert_eq!(pending[&PacketId::new(1)].retry_count, 1);
    }

    #[test]
    fn test_exhausted_entry_is_dropped_not_retransmitted() {
        let scheduler = RetryScheduler::new(10, 3);
        let mut pending = HashMap::new();
        pending.insert(PacketId::new(1), pending_at(0, 3));
        let retransmit = scheduler.sweep(&mut pending, 11_000);
        assert!(retransmit.is_empty());
        assert!(!pending.contains_key(&PacketId::new(1)));
    }
}
