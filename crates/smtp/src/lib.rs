/*
 * SPDX-FileCopyrightText: 2024 Loriot Project <dev@loriot.email>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::sync::Arc;

use store::watch::MailboxWatches;
use store::Store;

pub mod inbound;
pub mod outbound;
pub mod queue;

/// Server-wide SMTP state shared by the inbound listeners and the spool.
pub struct SmtpCore {
    pub config: SmtpConfig,
    pub store: Store,
    pub watches: Arc<MailboxWatches>,
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub hostname: String,
    pub max_message_size: usize,
    pub smarthost_address: String,
    pub smarthost_port: u16,
    /// Maximum period between queue runs, seconds.
    pub spool_interval: i64,
    /// Hold between attempts of one delivery, seconds.
    pub retry_hold: i64,
    /// Overall retry budget for a spooled message, seconds.
    pub expiry: i64,
}

impl SmtpConfig {
    pub fn from(
        hostname: &str,
        smtp: &common::config::SmtpSection,
        queue: &common::config::QueueSection,
    ) -> Self {
        SmtpConfig {
            hostname: hostname.to_string(),
            max_message_size: smtp.max_message_size,
            smarthost_address: smtp.smarthost_address.clone(),
            smarthost_port: smtp.smarthost_port,
            spool_interval: queue.spool_interval as i64,
            retry_hold: queue.retry_hold as i64,
            expiry: queue.expiry as i64,
        }
    }
}
