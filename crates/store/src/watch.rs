/*
 * SPDX-FileCopyrightText: 2024 Loriot Project <dev@loriot.email>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use ahash::AHashSet;
use dashmap::DashMap;
use tokio::sync::broadcast;

/// Something another connection did to a mailbox that open sessions may
/// need to report.
#[derive(Debug, Clone)]
pub enum MailboxEvent {
    Expunged { uids: Vec<u32> },
    Appended,
    FlagsChanged { uids: Vec<u32> },
}

/// Per-mailbox broadcast channels connecting writers (STORE, EXPUNGE, mail
/// injection) to the sessions holding the mailbox open.
pub struct MailboxWatches {
    channels: DashMap<u32, broadcast::Sender<MailboxEvent>, ahash::RandomState>,
}

impl MailboxWatches {
    pub fn new() -> Self {
        MailboxWatches {
            channels: DashMap::with_hasher(ahash::RandomState::new()),
        }
    }

    pub fn subscribe(&self, mailbox_id: u32) -> broadcast::Receiver<MailboxEvent> {
        self.channels
            .entry(mailbox_id)
            .or_insert_with(|| broadcast::channel(128).0)
            .subscribe()
    }

    pub fn publish(&self, mailbox_id: u32, event: MailboxEvent) {
        if let Some(channel) = self.channels.get(&mailbox_id) {
            // Send fails when no session holds the mailbox open; fine.
            let _ = channel.send(event);
        }
    }
}

impl Default for MailboxWatches {
    fn default() -> Self {
        MailboxWatches::new()
    }
}

/// Tracks, per mailbox, the highest UID any session has claimed as
/// \Recent. A message is recent for exactly one session.
pub struct RecentTracker {
    watermarks: DashMap<u32, u32, ahash::RandomState>,
}

impl RecentTracker {
    pub fn new() -> Self {
        RecentTracker {
            watermarks: DashMap::with_hasher(ahash::RandomState::new()),
        }
    }

    /// Claims all UIDs above the current watermark and returns them.
    pub fn claim(&self, mailbox_id: u32, uids: &[u32]) -> AHashSet<u32> {
        let max = uids.iter().copied().max().unwrap_or(0);
        let mut entry = self.watermarks.entry(mailbox_id).or_insert(0);
        let watermark = *entry;
        if max > watermark {
            *entry = max;
        }
        uids.iter()
            .copied()
            .filter(|uid| *uid > watermark)
            .collect()
    }
}

impl Default for RecentTracker {
    fn default() -> Self {
        RecentTracker::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recent_is_claimed_once() {
        let tracker = RecentTracker::new();
        let first = tracker.claim(1, &[1, 2, 3]);
        assert_eq!(first.len(), 3);
        let second = tracker.claim(1, &[1, 2, 3]);
        assert!(second.is_empty());
        let third = tracker.claim(1, &[2, 3, 4, 5]);
        assert_eq!(third, AHashSet::from_iter([4, 5]));
        // Another mailbox has its own watermark.
        assert_eq!(tracker.claim(2, &[1]).len(), 1);
    }

    #[tokio::test]
    async fn watch_roundtrip() {
        let watches = MailboxWatches::new();
        let mut rx = watches.subscribe(9);
        watches.publish(9, MailboxEvent::Appended);
        match rx.recv().await.unwrap() {
            MailboxEvent::Appended => (),
            other => panic!("unexpected event {:?}", other),
        }
        // Publishing to a mailbox nobody watches is a no-op.
        watches.publish(10, MailboxEvent::Appended);
    }
}
