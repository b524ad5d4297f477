/*
 * SPDX-FileCopyrightText: 2024 Loriot Project <dev@loriot.email>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use parking_lot::Mutex;

use crate::outbound::client::SmtpClient;

pub mod client;

/// Process-wide pool of ready smarthost connections. `provide` hands out an
/// idle client or dials a new one; clients that finish a transaction in the
/// reusable state go back in.
pub struct ClientPool {
    hostname: String,
    smarthost: (String, u16),
    idle: Mutex<Vec<SmtpClient>>,
}

impl ClientPool {
    pub fn new(hostname: String, smarthost: (String, u16)) -> Self {
        ClientPool {
            hostname,
            smarthost,
            idle: Mutex::new(Vec::new()),
        }
    }

    pub async fn provide(&self) -> std::io::Result<SmtpClient> {
        loop {
            let candidate = self.idle.lock().pop();
            match candidate {
                Some(client) if client.is_ready() => return Ok(client),
                Some(_) => continue,
                None => break,
            }
        }
        SmtpClient::connect(
            &self.smarthost.0,
            self.smarthost.1,
            self.hostname.clone(),
        )
        .await
    }

    pub fn recycle(&self, client: SmtpClient) {
        if client.is_ready() {
            self.idle.lock().push(client);
        }
    }
}
