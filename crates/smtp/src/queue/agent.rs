/*
 * SPDX-FileCopyrightText: 2024 Loriot Project <dev@loriot.email>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::sync::Arc;
use std::time::Duration;

use store::inject::{Injection, RemoteDelivery};
use store::model::RecipientAction;
use store::Store;
use tokio::sync::mpsc;

use crate::outbound::client::{DeliveryRecipientState, DeliverySet};
use crate::outbound::ClientPool;
use crate::queue::SpoolHalt;
use crate::SmtpCore;

/// Owns one delivery attempt for one spooled message: lock the delivery
/// rows, drive the SMTP client, spool a bounce where recipients ended
/// badly, record the outcome, commit. A failed commit halts the spool --
/// resending without a record risks duplicates.
pub struct DeliveryAgent {
    core: Arc<SmtpCore>,
    pool: Arc<ClientPool>,
    halt: SpoolHalt,
    mailbox_id: u32,
    uid: u32,
    done_tx: mpsc::Sender<(u32, u32)>,
}

impl DeliveryAgent {
    pub fn new(
        core: Arc<SmtpCore>,
        pool: Arc<ClientPool>,
        halt: SpoolHalt,
        mailbox_id: u32,
        uid: u32,
        done_tx: mpsc::Sender<(u32, u32)>,
    ) -> Self {
        DeliveryAgent {
            core,
            pool,
            halt,
            mailbox_id,
            uid,
            done_tx,
        }
    }

    pub fn spawn(self, start_delay: Duration) {
        tokio::spawn(async move {
            if !start_delay.is_zero() {
                tokio::time::sleep(start_delay).await;
            }
            let key = (self.mailbox_id, self.uid);
            let done_tx = self.done_tx.clone();
            self.run().await;
            let _ = done_tx.send(key).await;
        });
    }

    async fn run(self) {
        let span = tracing::info_span!(
            "delivery",
            mailbox = self.mailbox_id,
            uid = self.uid,
        );
        tracing::debug!(parent: &span, event = "attempt",
            "Starting delivery attempt.");

        let client = match self.core.store.begin().await {
            Ok(client) => client,
            Err(err) => {
                tracing::warn!(parent: &span, event = "error", reason = %err,
                    "Could not open a delivery transaction.");
                return;
            }
        };

        match self.attempt(&client, &span).await {
            Ok(()) => {
                if let Err(err) = Store::commit(client).await {
                    // The outcome of a possibly-successful transmission is
                    // now unrecorded; stop the spool before it loops.
                    tracing::error!(parent: &span, event = "error", reason = %err,
                        "Delivery attempt failed due to database error.");
                    self.halt.shutdown();
                }
            }
            Err(err) => {
                tracing::warn!(parent: &span, event = "error", reason = %err,
                    "Delivery attempt failed.");
                let _ = Store::rollback(client).await;
            }
        }
    }

    async fn attempt(
        &self,
        client: &deadpool_postgres::Client,
        span: &tracing::Span,
    ) -> store::Result<()> {
        let deliveries = Store::load_deliveries(
            client,
            self.mailbox_id,
            self.uid,
            self.core.config.retry_hold,
        )
        .await?;

        // Message facets needed on the wire: the raw text, plus headers for
        // the bounce report.
        let uid_map = self
            .core
            .store
            .uid_map(self.mailbox_id, &[self.uid])
            .await?;
        let message_id = uid_map.get(&self.uid).map(|(id, _)| *id);

        for delivery in &deliveries {
            if !delivery.can_retry {
                continue;
            }

            let sender = Store::sender_address(client, delivery.sender_id).await?;
            let raw = match message_id {
                Some(message_id) => self
                    .core
                    .store
                    .fetch_raw(&[message_id])
                    .await?
                    .remove(&message_id)
                    .unwrap_or_default(),
                None => Vec::new(),
            };

            let mut set = DeliverySet {
                needs_utf8: raw_needs_utf8(&sender, &delivery.recipients),
                sender: sender.clone(),
                recipients: delivery
                    .recipients
                    .iter()
                    .map(|recipient| DeliveryRecipientState {
                        address_id: recipient.address_id,
                        address: recipient.address(),
                        action: recipient.action,
                        status: recipient.status.clone(),
                    })
                    .collect(),
                message: raw,
            };

            if delivery.expired {
                // Out of retry budget: the remaining recipients fail with a
                // synthesised status and the delivery closes.
                for recipient in &mut set.recipients {
                    if recipient.action == RecipientAction::Unknown {
                        recipient.action = RecipientAction::Failed;
                        recipient.status = "5.4.7".to_string();
                    }
                }
            } else {
                for recipient in &set.recipients {
                    if recipient.action == RecipientAction::Unknown {
                        tracing::debug!(parent: span, event = "relay",
                            recipient = recipient.address.as_str(),
                            "Attempting delivery.");
                    }
                }
                match self.pool.provide().await {
                    Ok(mut smtp) => {
                        smtp.send(&mut set).await;
                        self.pool.recycle(smtp);
                    }
                    Err(err) => {
                        tracing::debug!(parent: span, event = "connect-failed",
                            reason = %err, "Smarthost unreachable.");
                        set.finish("4.4.1");
                    }
                }
            }

            // A notification goes out unless every recipient ended up
            // relayed: failures get a bounce, undecided and delayed
            // recipients a delay warning. Only when the original sender is
            // not the null sender.
            let all_ok = set
                .recipients
                .iter()
                .all(|recipient| recipient.action == RecipientAction::Relayed);
            if !all_ok && !sender.0.is_empty() {
                self.inject_bounce(span, &sender, &set).await?;
            }

            let outcomes = set
                .recipients
                .iter()
                .map(|recipient| {
                    (
                        recipient.address_id,
                        recipient.action,
                        recipient.status.clone(),
                    )
                })
                .collect::<Vec<_>>();
            let handled = outcomes
                .iter()
                .filter(|(_, action, _)| *action != RecipientAction::Unknown)
                .count();
            tracing::debug!(parent: span, event = "handled",
                recipients = handled,
                queued = outcomes.len() - handled,
                "Recipients handled.");
            Store::record_delivery_attempt(client, delivery.id, &outcomes).await?;
        }

        Ok(())
    }

    /// Builds and spools the status notification for an attempt that did
    /// not relay everywhere, addressed to the original sender from the
    /// null sender.
    async fn inject_bounce(
        &self,
        span: &tracing::Span,
        sender: &(String, String),
        set: &DeliverySet,
    ) -> store::Result<()> {
        let spool_mailbox = self
            .core
            .store
            .create_mailbox(store::SPOOL_MAILBOX, None)
            .await?;
        let bounce = super::dsn::build_bounce(
            &self.core.config.hostname,
            &format!("{}@{}", sender.0, sender.1),
            set,
        );
        let result = self
            .core
            .store
            .inject(Injection {
                raw: bounce,
                internal_date: store::now(),
                flags: Vec::new(),
                local_mailboxes: vec![spool_mailbox.id],
                remote: Some(RemoteDelivery {
                    sender: (String::new(), String::new()),
                    recipients: vec![(sender.0.clone(), sender.1.clone())],
                    expires_at: store::now() + self.core.config.expiry,
                    deliver_after: None,
                }),
            })
            .await?;
        tracing::info!(parent: span, event = "bounce",
            message = result.message_id,
            sender = format!("{}@{}", sender.0, sender.1).as_str(),
            "Bounce spooled.");
        Ok(())
    }
}

fn raw_needs_utf8(
    sender: &(String, String),
    recipients: &[store::model::DeliveryRecipient],
) -> bool {
    !sender.0.is_ascii()
        || !sender.1.is_ascii()
        || recipients
            .iter()
            .any(|recipient| !recipient.localpart.is_ascii() || !recipient.domain.is_ascii())
}
