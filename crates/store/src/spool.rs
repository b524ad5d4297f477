/*
 * SPDX-FileCopyrightText: 2024 Loriot Project <dev@loriot.email>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use futures_util::stream;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_postgres::{AsyncMessage, NoTls};

use crate::model::{DeliveryRecipient, DeliveryRow, RecipientAction};
use crate::{now, Result, Store};

/// One runnable or scheduled spool entry: the message is identified by its
/// (mailbox, uid) spool copy, and `delay` is seconds until it is due (zero
/// or negative means due now).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpoolItem {
    pub mailbox_id: u32,
    pub uid: u32,
    pub delay: i64,
}

impl Store {
    /// At boot, pushes expiry forward one spool interval for deliveries that
    /// still have undecided recipients, so a restart never mass-expires the
    /// queue.
    pub async fn refresh_spool_expiry(&self, interval_secs: i64) -> Result<u64> {
        let client = self.client().await?;
        let threshold = now() + interval_secs;
        Ok(client
            .execute(
                "UPDATE deliveries SET expires_at = $1
                 WHERE expires_at < $1 AND id IN
                    (SELECT delivery FROM delivery_recipients
                     WHERE action = $2 OR action = $3)",
                &[
                    &threshold,
                    &(RecipientAction::Unknown as i32),
                    &(RecipientAction::Delayed as i32),
                ],
            )
            .await?)
    }

    /// The queue-run query: one row per spooled message with undecided or
    /// delayed recipients, with the number of seconds until its next
    /// attempt. Messages whose agents are still working are excluded.
    pub async fn spool_due(
        &self,
        exclude: &[(u32, u32)],
        retry_secs: i64,
    ) -> Result<Vec<SpoolItem>> {
        let client = self.client().await?;
        let now = now();
        let ex_mailboxes: Vec<i32> = exclude.iter().map(|(mb, _)| *mb as i32).collect();
        let ex_uids: Vec<i32> = exclude.iter().map(|(_, uid)| *uid as i32).collect();
        let rows = client
            .query(
                "SELECT d.mailbox, d.uid,
                        min(coalesce(dr.last_attempt + $1, d.deliver_after, $2)) - $2 AS delay
                 FROM deliveries d
                 JOIN delivery_recipients dr ON (d.id = dr.delivery)
                 WHERE (dr.action = $3 OR dr.action = $4)
                   AND NOT EXISTS (SELECT 1 FROM unnest($5::int4[], $6::int4[]) AS ex(mb, u)
                                   WHERE ex.mb = d.mailbox AND ex.u = d.uid)
                 GROUP BY d.mailbox, d.uid
                 ORDER BY delay",
                &[
                    &retry_secs,
                    &now,
                    &(RecipientAction::Unknown as i32),
                    &(RecipientAction::Delayed as i32),
                    &ex_mailboxes,
                    &ex_uids,
                ],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| SpoolItem {
                mailbox_id: row.get::<_, i32>(0) as u32,
                uid: row.get::<_, i32>(1) as u32,
                delay: row.get(2),
            })
            .collect())
    }

    /// Locks and loads all deliveries for one spooled message, with their
    /// recipients. `retry_hold_secs` governs the per-delivery retry hold
    /// (an attempt within the hold window marks the row not retriable).
    pub async fn load_deliveries(
        client: &deadpool_postgres::Client,
        mailbox_id: u32,
        uid: u32,
        retry_hold_secs: i64,
    ) -> Result<Vec<DeliveryRow>> {
        let now = now();
        let rows = client
            .query(
                "SELECT id, sender,
                        (expires_at IS NOT NULL AND expires_at < $3) AS expired,
                        (tried_at IS NULL OR tried_at + $4 < $3) AS can_retry
                 FROM deliveries WHERE mailbox = $1 AND uid = $2 FOR UPDATE",
                &[
                    &(mailbox_id as i32),
                    &(uid as i32),
                    &now,
                    &retry_hold_secs,
                ],
            )
            .await?;

        let mut deliveries = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: i32 = row.get(0);
            let recipient_rows = client
                .query(
                    "SELECT dr.recipient, a.name, a.localpart, a.domain,
                            dr.action, dr.status, dr.last_attempt
                     FROM delivery_recipients dr
                     JOIN addresses a ON (dr.recipient = a.id)
                     WHERE dr.delivery = $1",
                    &[&id],
                )
                .await?;
            deliveries.push(DeliveryRow {
                id: id as u32,
                sender_id: row.get::<_, i32>(1) as u32,
                expired: row.get(2),
                can_retry: row.get(3),
                recipients: recipient_rows
                    .iter()
                    .map(|r| DeliveryRecipient {
                        address_id: r.get::<_, i32>(0) as u32,
                        name: r.get(1),
                        localpart: r.get(2),
                        domain: r.get(3),
                        action: RecipientAction::from_i32(r.get(4)),
                        status: r.get(5),
                        last_attempt: r.get(6),
                    })
                    .collect(),
            });
        }
        Ok(deliveries)
    }

    pub async fn sender_address(
        client: &deadpool_postgres::Client,
        address_id: u32,
    ) -> Result<(String, String)> {
        let row = client
            .query_one(
                "SELECT localpart, domain FROM addresses WHERE id = $1",
                &[&(address_id as i32)],
            )
            .await?;
        Ok((row.get(0), row.get(1)))
    }

    /// Records the outcome of one delivery attempt. Recipients still in the
    /// Unknown state keep their row untouched.
    pub async fn record_delivery_attempt(
        client: &deadpool_postgres::Client,
        delivery_id: u32,
        outcomes: &[(u32, RecipientAction, String)],
    ) -> Result<()> {
        let now = now();
        client
            .execute(
                "UPDATE deliveries SET tried_at = $1 WHERE id = $2",
                &[&now, &(delivery_id as i32)],
            )
            .await?;
        for (recipient, action, status) in outcomes {
            if *action == RecipientAction::Unknown {
                continue;
            }
            client
                .execute(
                    "UPDATE delivery_recipients
                     SET action = $1, status = $2, last_attempt = $3
                     WHERE delivery = $4 AND recipient = $5",
                    &[
                        &(*action as i32),
                        status,
                        &now,
                        &(delivery_id as i32),
                        &(*recipient as i32),
                    ],
                )
                .await?;
        }
        Ok(())
    }

    /// Spawns a dedicated connection that LISTENs on the deliveries channel
    /// and forwards a unit on every notification. The task ends when the
    /// receiver is dropped or the connection dies.
    pub fn spawn_deliveries_listener(&self, tx: mpsc::Sender<()>) {
        let conn_string = self.conn_string();
        tokio::spawn(async move {
            let (client, mut connection) =
                match tokio_postgres::connect(&conn_string, NoTls).await {
                    Ok(conn) => conn,
                    Err(err) => {
                        tracing::warn!(
                            context = "spool",
                            event = "listen-error",
                            reason = %err,
                            "Failed to open the notification connection."
                        );
                        return;
                    }
                };

            // The connection must be driven for the LISTEN to complete and
            // for notifications to flow, so it gets its own task.
            let forward = tx.clone();
            let driver = tokio::spawn(async move {
                let mut messages = stream::poll_fn(move |cx| connection.poll_message(cx));
                while let Some(message) = messages.next().await {
                    match message {
                        Ok(AsyncMessage::Notification(_)) => {
                            if forward.send(()).await.is_err() {
                                break;
                            }
                        }
                        Ok(_) => (),
                        Err(err) => {
                            tracing::warn!(
                                context = "spool",
                                event = "listen-error",
                                reason = %err,
                                "Notification connection lost."
                            );
                            break;
                        }
                    }
                }
            });

            if let Err(err) = client
                .batch_execute(&format!("LISTEN {}", crate::DELIVERIES_CHANNEL))
                .await
            {
                tracing::warn!(
                    context = "spool",
                    event = "listen-error",
                    reason = %err,
                    "LISTEN failed."
                );
                driver.abort();
                return;
            }

            // Hold the client (and with it the connection) until the spool
            // manager goes away.
            tx.closed().await;
            driver.abort();
            drop(client);
        });
    }
}
