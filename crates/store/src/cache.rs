/*
 * SPDX-FileCopyrightText: 2024 Loriot Project <dev@loriot.email>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::model::MessageData;

/// Process-wide message cache keyed by (mailbox id, uid). Entries hold the
/// facets fetched so far; content facets are immutable once loaded, while
/// flags and annotations are invalidated when the mailbox modseq moves.
pub struct MessageCache {
    entries: DashMap<(u32, u32), CacheEntry, ahash::RandomState>,
    capacity: usize,
    tick: AtomicU64,
}

struct CacheEntry {
    data: Arc<Mutex<MessageData>>,
    last_used: u64,
}

impl MessageCache {
    pub fn new(capacity: usize) -> Self {
        MessageCache {
            entries: DashMap::with_hasher(ahash::RandomState::new()),
            capacity,
            tick: AtomicU64::new(0),
        }
    }

    pub fn find(&self, mailbox_id: u32, uid: u32) -> Option<Arc<Mutex<MessageData>>> {
        let tick = self.tick.fetch_add(1, Ordering::Relaxed);
        self.entries.get_mut(&(mailbox_id, uid)).map(|mut entry| {
            entry.last_used = tick;
            entry.data.clone()
        })
    }

    /// Returns the cached entry, creating an empty one on miss.
    pub fn entry(&self, mailbox_id: u32, uid: u32, message_id: u32) -> Arc<Mutex<MessageData>> {
        let tick = self.tick.fetch_add(1, Ordering::Relaxed);
        let data = self
            .entries
            .entry((mailbox_id, uid))
            .or_insert_with(|| CacheEntry {
                data: Arc::new(Mutex::new(MessageData {
                    message_id,
                    ..Default::default()
                })),
                last_used: tick,
            })
            .data
            .clone();
        if self.entries.len() > self.capacity {
            self.evict();
        }
        data
    }

    pub fn remove(&self, mailbox_id: u32, uid: u32) {
        self.entries.remove(&(mailbox_id, uid));
    }

    pub fn remove_mailbox(&self, mailbox_id: u32) {
        self.entries.retain(|(mailbox, _), _| *mailbox != mailbox_id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops the least recently used tenth of the cache. Entries still
    /// referenced elsewhere stay alive through their Arc.
    fn evict(&self) {
        let mut ages = self
            .entries
            .iter()
            .map(|entry| entry.last_used)
            .collect::<Vec<_>>();
        ages.sort_unstable();
        let cutoff = ages[ages.len() / 10];
        self.entries.retain(|_, entry| entry.last_used > cutoff);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_roundtrip_and_eviction() {
        let cache = MessageCache::new(20);
        for uid in 1..=10u32 {
            let entry = cache.entry(1, uid, uid + 100);
            entry.lock().flags = Some(vec!["\\Seen".into()]);
        }
        assert!(cache.find(1, 5).is_some());
        assert!(cache.find(1, 11).is_none());
        assert_eq!(cache.find(1, 3).unwrap().lock().message_id, 103);

        for uid in 11..=40u32 {
            cache.entry(1, uid, uid + 100);
        }
        assert!(cache.len() <= 40);

        cache.remove_mailbox(1);
        assert!(cache.is_empty());
    }
}
