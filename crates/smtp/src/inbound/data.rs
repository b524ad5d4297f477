/*
 * SPDX-FileCopyrightText: 2024 Loriot Project <dev@loriot.email>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::process;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{TimeZone, Utc};
use common::listener::SessionStream;
use store::inject::{Injection, RemoteDelivery};
use store::watch::MailboxEvent;

use super::{Disposition, Session};

static TRANSACTION_COUNTER: AtomicU64 = AtomicU64::new(1);

impl<T: SessionStream> Session<T> {
    /// An ESMTP transaction id: unix time, pid and a process counter.
    pub fn transaction_id(&mut self) -> String {
        if let Some(id) = &self.data.transaction_id {
            return id.clone();
        }
        let id = format!(
            "{}-{}-{}",
            store::now(),
            process::id(),
            TRANSACTION_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        self.data.transaction_id = Some(id.clone());
        id
    }

    /// Commits the received message: content rows once, one mailbox row per
    /// local recipient, one spooled delivery covering the remote ones. The
    /// returned reply line is written once for SMTP and once per recipient
    /// for LMTP; an empty reply closes the connection.
    pub async fn queue_message(&mut self) -> String {
        let transaction_id = self.transaction_id();

        // Stamp a Received header in front of the payload.
        let now = store::now();
        let date = Utc
            .timestamp_opt(now, 0)
            .single()
            .unwrap_or_default()
            .format("%a, %d %b %Y %H:%M:%S +0000");
        let with = match (self.dialect, self.stream.is_tls()) {
            (super::Dialect::Lmtp, _) => "LMTP",
            (_, true) => "ESMTPS",
            (_, false) => "ESMTP",
        };
        let mut raw = format!(
            "Received: from {} by {} with {} id {}; {}\r\n",
            self.data.helo_domain, self.core.config.hostname, with, transaction_id, date
        )
        .into_bytes();
        raw.append(&mut self.data.message);

        // Split recipients: local mailbox copies and remote relays. A
        // message with remote recipients also lands in the outgoing spool
        // mailbox, which the deliveries row points at.
        let mut local_mailboxes = Vec::new();
        let mut remote_recipients = Vec::new();
        for recipient in &self.data.rcpt_to {
            match &recipient.disposition {
                Disposition::Local { mailboxes } => {
                    for mailbox in mailboxes {
                        if !local_mailboxes.contains(mailbox) {
                            local_mailboxes.push(*mailbox);
                        }
                    }
                }
                Disposition::Remote => {
                    remote_recipients.push((
                        recipient.address.localpart.clone(),
                        recipient.address.domain.clone(),
                    ));
                }
            }
        }

        let remote = if !remote_recipients.is_empty() {
            let spool_mailbox = match self
                .core
                .store
                .create_mailbox(store::SPOOL_MAILBOX, None)
                .await
            {
                Ok(mailbox) => mailbox.id,
                Err(err) => {
                    tracing::warn!(parent: &self.span, event = "error", reason = %err,
                        "Spool mailbox unavailable.");
                    return "451 4.3.0 Temporary server error.\r\n".to_string();
                }
            };
            local_mailboxes.insert(0, spool_mailbox);
            let sender = self
                .data
                .mail_from
                .as_ref()
                .map(|from| (from.localpart.clone(), from.domain.clone()))
                .unwrap_or_default();
            Some(RemoteDelivery {
                sender,
                recipients: remote_recipients,
                expires_at: now + self.core.config.expiry,
                deliver_after: None,
            })
        } else {
            None
        };

        let injection = Injection {
            raw,
            internal_date: now,
            flags: Vec::new(),
            local_mailboxes: local_mailboxes.clone(),
            remote,
        };

        match self.core.store.inject(injection).await {
            Ok(result) => {
                tracing::info!(parent: &self.span, context = "data", event = "queued",
                    id = transaction_id.as_str(), message = result.message_id,
                    local = result.mailbox_uids.len(),
                    spooled = result.delivery_id.is_some(),
                    "Message accepted.");
                for (mailbox_id, _) in &result.mailbox_uids {
                    self.core.watches.publish(*mailbox_id, MailboxEvent::Appended);
                }
                format!("250 2.0.0 Message queued as {}.\r\n", transaction_id)
            }
            Err(err) => {
                tracing::warn!(parent: &self.span, context = "data", event = "error",
                    reason = %err, "Failed to queue message.");
                "451 4.3.0 Temporary server error.\r\n".to_string()
            }
        }
    }
}
