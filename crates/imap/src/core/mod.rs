/*
 * SPDX-FileCopyrightText: 2024 Loriot Project <dev@loriot.email>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::sync::Arc;
use std::time::Duration;

use ahash::AHashSet;
use parking_lot::Mutex;
use store::cache::MessageCache;
use store::users::User;
use store::Store;

pub mod command;
pub mod session;

/// Server-wide IMAP state: configuration, the store handle, the message
/// cache and the cross-session notification plumbing. One per process,
/// shared by every connection.
pub struct Imap {
    pub config: ImapConfig,
    pub store: Store,
    pub cache: MessageCache,
    pub watches: Arc<store::watch::MailboxWatches>,
    pub recent: store::watch::RecentTracker,
}

pub struct ImapConfig {
    pub hostname: String,
    pub timeout_preauth: Duration,
    pub timeout_auth: Duration,
    pub timeout_idle: Duration,
    pub literal_size_limit: usize,
    /// Bytes tolerated before authentication; more gets a BYE.
    pub preauth_input_limit: usize,
}

impl ImapConfig {
    pub fn from(hostname: &str, section: &common::config::ImapSection) -> Self {
        ImapConfig {
            hostname: hostname.to_string(),
            timeout_preauth: Duration::from_secs(section.timeout_preauth),
            timeout_auth: Duration::from_secs(section.timeout_auth),
            timeout_idle: Duration::from_secs(section.timeout_idle),
            literal_size_limit: section.literal_size_limit,
            preauth_input_limit: 32 * 1024,
        }
    }
}

impl Imap {
    pub fn new(
        config: ImapConfig,
        store: Store,
        cache_size: usize,
        watches: Arc<store::watch::MailboxWatches>,
    ) -> Self {
        Imap {
            config,
            store,
            cache: MessageCache::new(cache_size),
            watches,
            recent: store::watch::RecentTracker::new(),
        }
    }

    pub fn capabilities(&self, is_tls: bool) -> String {
        let mut caps = String::from(
            "IMAP4rev1 LITERAL+ ENABLE ID IDLE UIDPLUS CONDSTORE QRESYNC BINARY ANNOTATE-EXPERIMENT-1 NOTIFY",
        );
        if !is_tls {
            caps.push_str(" STARTTLS");
        }
        caps.push_str(" AUTH=PLAIN");
        caps
    }

    pub fn greeting(&self, is_tls: bool) -> Vec<u8> {
        format!(
            "* OK [CAPABILITY {}] {} Loriot IMAP Server\r\n",
            self.capabilities(is_tls),
            self.config.hostname
        )
        .into_bytes()
    }
}

/// Client peculiarities worked around at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientBug {
    /// Chokes on unsolicited responses outside commands.
    NoUnsolicitedResponses = 0,
    /// Sits behind an aggressive NAT gateway; needs keepalive traffic.
    Nat = 1,
}

/// State of an open SELECT/EXAMINE.
pub struct SelectedMailbox {
    pub id: u32,
    pub name: String,
    pub uid_validity: u32,
    pub read_only: bool,
    pub condstore: bool,
    pub view: Mutex<MailboxView>,
}

/// The session's UID-to-MSN window onto a mailbox. `uids` is ascending;
/// the MSN of uids[i] is i + 1. Expunges observed in the database stay in
/// the view until the scheduler allows their disclosure.
#[derive(Debug, Default)]
pub struct MailboxView {
    pub uids: Vec<u32>,
    pub recent: AHashSet<u32>,
    pub expunged_pending: Vec<u32>,
    pub highest_modseq: u64,
}

impl MailboxView {
    pub fn exists(&self) -> u32 {
        self.uids.len() as u32
    }

    pub fn msn_of(&self, uid: u32) -> Option<u32> {
        self.uids
            .binary_search(&uid)
            .ok()
            .map(|index| index as u32 + 1)
    }

    pub fn uid_of(&self, msn: u32) -> Option<u32> {
        if msn == 0 {
            return None;
        }
        self.uids.get(msn as usize - 1).copied()
    }

    pub fn max_uid(&self) -> u32 {
        self.uids.last().copied().unwrap_or(0)
    }

    /// Removes a UID from the view, returning the MSN it had. Used at
    /// EXPUNGE disclosure time; MSNs of later messages shift down.
    pub fn remove(&mut self, uid: u32) -> Option<u32> {
        match self.uids.binary_search(&uid) {
            Ok(index) => {
                self.uids.remove(index);
                self.recent.remove(&uid);
                Some(index as u32 + 1)
            }
            Err(_) => None,
        }
    }

    pub fn append(&mut self, uid: u32) {
        if self.uids.last().copied().unwrap_or(0) < uid {
            self.uids.push(uid);
        }
    }

    pub fn is_expunged_pending(&self, uid: u32) -> bool {
        self.expunged_pending.contains(&uid)
    }
}

#[derive(Clone)]
pub struct SessionUser {
    pub user: User,
    pub has_inbox: bool,
}

pub enum SessionState {
    NotAuthenticated {
        auth_failures: u32,
    },
    Authenticated {
        user: SessionUser,
    },
    Selected {
        user: SessionUser,
        mailbox: Arc<SelectedMailbox>,
    },
}

impl SessionState {
    pub fn user(&self) -> Option<&SessionUser> {
        match self {
            SessionState::Authenticated { user } | SessionState::Selected { user, .. } => {
                Some(user)
            }
            SessionState::NotAuthenticated { .. } => None,
        }
    }

    pub fn mailbox(&self) -> Option<&Arc<SelectedMailbox>> {
        match self {
            SessionState::Selected { mailbox, .. } => Some(mailbox),
            _ => None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.user().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_msn_mapping() {
        let mut view = MailboxView {
            uids: vec![3, 7, 9, 40],
            ..Default::default()
        };
        assert_eq!(view.exists(), 4);
        assert_eq!(view.msn_of(3), Some(1));
        assert_eq!(view.msn_of(40), Some(4));
        assert_eq!(view.msn_of(8), None);
        assert_eq!(view.uid_of(2), Some(7));
        assert_eq!(view.uid_of(0), None);
        assert_eq!(view.uid_of(5), None);

        // Expunging UID 7 shifts everything after it down.
        assert_eq!(view.remove(7), Some(2));
        assert_eq!(view.msn_of(9), Some(2));
        assert_eq!(view.remove(7), None);

        view.append(41);
        assert_eq!(view.max_uid(), 41);
        view.append(10); // stale, ignored
        assert_eq!(view.max_uid(), 41);
    }
}
