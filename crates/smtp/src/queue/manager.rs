/*
 * SPDX-FileCopyrightText: 2024 Loriot Project <dev@loriot.email>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::sync::Arc;
use std::time::Duration;

use ahash::AHashSet;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::outbound::ClientPool;
use crate::queue::agent::DeliveryAgent;
use crate::queue::SpoolHalt;
use crate::SmtpCore;

/// Seconds between consecutive agent starts, to avoid a thundering herd on
/// the smarthost after a queue refill.
const AGENT_STAGGER_SECS: u64 = 5;

async fn recv_opt(rx: &mut Option<mpsc::Receiver<()>>) -> Option<()> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Periodically drains the deliveries table through delivery agents. One
/// instance per process; wakes on the earliest of a database notification,
/// the maximum spool interval, or the computed next retry time.
pub struct SpoolManager {
    core: Arc<SmtpCore>,
    pool: Arc<ClientPool>,
    halt: SpoolHalt,
    notify_rx: Option<mpsc::Receiver<()>>,
    agent_done_tx: mpsc::Sender<(u32, u32)>,
    agent_done_rx: mpsc::Receiver<(u32, u32)>,
    working: AHashSet<(u32, u32)>,
}

impl SpoolManager {
    pub fn new(core: Arc<SmtpCore>, halt: SpoolHalt) -> Self {
        let (notify_tx, notify_rx) = mpsc::channel(16);
        core.store.spawn_deliveries_listener(notify_tx);
        let pool = Arc::new(ClientPool::new(
            core.config.hostname.clone(),
            (
                core.config.smarthost_address.clone(),
                core.config.smarthost_port,
            ),
        ));
        let (agent_done_tx, agent_done_rx) = mpsc::channel(16);
        SpoolManager {
            core,
            pool,
            halt,
            notify_rx: Some(notify_rx),
            agent_done_tx,
            agent_done_rx,
            working: AHashSet::new(),
        }
    }

    pub fn spawn(self) {
        tokio::spawn(async move {
            self.run().await;
        });
    }

    async fn run(mut self) {
        // A restart must not mass-expire messages that were waiting.
        match self
            .core
            .store
            .refresh_spool_expiry(self.core.config.spool_interval)
            .await
        {
            Ok(0) => (),
            Ok(refreshed) => {
                tracing::debug!(context = "spool", event = "expiry-refresh",
                    deliveries = refreshed, "Extended expiry of queued mail.");
            }
            Err(err) => {
                tracing::warn!(context = "spool", event = "error", reason = %err,
                    "Failed to refresh spool expiry.");
            }
        }

        let mut next_wake = Instant::now();
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(next_wake) => (),
                notified = recv_opt(&mut self.notify_rx) => {
                    if notified.is_none() {
                        // Notification channel gone; keep running on the
                        // timer alone.
                        self.notify_rx = None;
                    } else {
                        tracing::debug!(context = "spool", event = "notify",
                            "New message added to spool.");
                    }
                }
                done = self.agent_done_rx.recv() => {
                    if let Some(key) = done {
                        self.working.remove(&key);
                    }
                    // An agent finishing may unblock its message for the
                    // next run; fall through to a queue run.
                }
            }

            if self.halt.is_halted() {
                tracing::debug!(context = "spool", event = "stopped",
                    "Spool manager stopping.");
                break;
            }

            next_wake = Instant::now()
                + Duration::from_secs(self.core.config.spool_interval as u64);

            tracing::debug!(context = "spool", event = "run", "Starting queue run.");
            let exclude = self.working.iter().copied().collect::<Vec<_>>();
            let due = match self
                .core
                .store
                .spool_due(&exclude, self.core.config.spool_interval)
                .await
            {
                Ok(due) => due,
                Err(err) => {
                    tracing::warn!(context = "spool", event = "error", reason = %err,
                        "Queue run query failed.");
                    continue;
                }
            };

            let mut stagger = 0u64;
            let mut soonest: Option<i64> = None;
            for item in due {
                let key = (item.mailbox_id, item.uid);
                if item.delay <= 0 {
                    if self.working.insert(key) {
                        let agent = DeliveryAgent::new(
                            self.core.clone(),
                            self.pool.clone(),
                            self.halt.clone(),
                            item.mailbox_id,
                            item.uid,
                            self.agent_done_tx.clone(),
                        );
                        agent.spawn(Duration::from_secs(stagger * AGENT_STAGGER_SECS));
                        stagger += 1;
                    }
                } else {
                    soonest = Some(match soonest {
                        Some(soonest) => soonest.min(item.delay),
                        None => item.delay,
                    });
                }
            }
            if let Some(delay) = soonest {
                tracing::debug!(context = "spool", event = "scheduled",
                    seconds = delay, "Will process the queue again.");
                let delayed = Instant::now() + Duration::from_secs(delay.max(1) as u64);
                if delayed < next_wake {
                    next_wake = delayed;
                }
            }
        }
    }
}
