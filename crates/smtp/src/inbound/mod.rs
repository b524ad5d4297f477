/*
 * SPDX-FileCopyrightText: 2024 Loriot Project <dev@loriot.email>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::sync::Arc;

use common::config::Protocol;
use common::listener::{SessionData as ListenerSession, SessionManager, SessionStream};
use smtp_proto::request::receiver::{
    BdatReceiver, DataReceiver, DummyDataReceiver, LineReceiver, RequestReceiver,
};
use store::users::User;

use crate::SmtpCore;

pub mod data;
pub mod session;

/// SMTP speaks three dialects over the same machine; LMTP replaces EHLO
/// with LHLO and answers DATA once per recipient, Submission requires
/// authentication before MAIL FROM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Smtp,
    Submit,
    Lmtp,
}

impl Dialect {
    pub fn from_protocol(protocol: Protocol) -> Dialect {
        match protocol {
            Protocol::Lmtp => Dialect::Lmtp,
            Protocol::Submission => Dialect::Submit,
            _ => Dialect::Smtp,
        }
    }

    pub fn banner_word(&self) -> &'static str {
        match self {
            Dialect::Smtp => "ESMTP",
            Dialect::Submit => "SMTP Submission",
            Dialect::Lmtp => "LMTP",
        }
    }
}

/// Input states of the inbound machine: command lines, DATA payload, BDAT
/// chunks, a SASL exchange, or draining an oversized payload.
pub enum State {
    Request(RequestReceiver),
    Data(DataReceiver),
    Bdat(BdatReceiver),
    Sasl(LineReceiver<SaslState>),
    DataTooLarge(DummyDataReceiver),
    None,
}

impl Default for State {
    fn default() -> Self {
        State::Request(RequestReceiver::default())
    }
}

pub struct SaslState {
    pub mechanism: u64,
}

/// What happens to one accepted recipient: delivery into local mailboxes,
/// or a spooled relay to the smarthost. Derived per RCPT from the alias
/// table (the Sieve evaluation seam).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Local { mailboxes: Vec<u32> },
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionAddress {
    pub address: String,
    pub localpart: String,
    pub domain: String,
}

impl SessionAddress {
    pub fn parse(address: &str) -> Option<SessionAddress> {
        let address = address.trim();
        if address.is_empty() {
            return None;
        }
        let (localpart, domain) = address.split_once('@')?;
        if localpart.is_empty() || domain.is_empty() {
            return None;
        }
        Some(SessionAddress {
            address: address.to_string(),
            localpart: localpart.to_string(),
            domain: domain.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub address: SessionAddress,
    pub disposition: Disposition,
}

#[derive(Default)]
pub struct TransactionData {
    pub helo_domain: String,
    pub mail_from: Option<SessionAddress>,
    /// Null reverse-path (`MAIL FROM:<>`) is legal and distinct from no
    /// MAIL FROM at all.
    pub null_sender: bool,
    pub rcpt_to: Vec<Recipient>,
    pub message: Vec<u8>,
    pub authenticated: Option<User>,
    pub transaction_id: Option<String>,
}

pub struct Session<T: SessionStream> {
    pub core: Arc<SmtpCore>,
    pub instance: Arc<common::listener::ServerInstance>,
    pub stream: T,
    pub dialect: Dialect,
    pub state: State,
    pub data: TransactionData,
    pub session_id: u64,
    pub span: tracing::Span,
}

#[derive(Clone)]
pub struct SmtpSessionManager {
    pub core: Arc<SmtpCore>,
}

impl SmtpSessionManager {
    pub fn new(core: Arc<SmtpCore>) -> Self {
        SmtpSessionManager { core }
    }
}

impl SessionManager for SmtpSessionManager {
    fn spawn<T: SessionStream>(&self, session: ListenerSession<T>) {
        let core = self.core.clone();
        tokio::spawn(async move {
            let remote = session
                .remote_addr
                .map(|addr| addr.to_string())
                .unwrap_or_else(|| "local".to_string());
            let span = tracing::info_span!(
                "smtp",
                listener = session.instance.id.as_str(),
                remote = remote.as_str(),
                session = session.session_id,
            );
            let dialect = Dialect::from_protocol(session.instance.protocol);
            if session.instance.tls_implicit {
                match session.instance.tls_accept(session.stream).await {
                    Ok(stream) => {
                        Session {
                            core,
                            instance: session.instance,
                            stream,
                            dialect,
                            state: State::default(),
                            data: TransactionData::default(),
                            session_id: session.session_id,
                            span,
                        }
                        .run()
                        .await;
                    }
                    Err(err) => {
                        tracing::debug!(parent: &span, event = "error", reason = %err,
                            "TLS handshake failed.");
                    }
                }
            } else {
                Session {
                    core,
                    instance: session.instance,
                    stream: session.stream,
                    dialect,
                    state: State::default(),
                    data: TransactionData::default(),
                    session_id: session.session_id,
                    span,
                }
                .run()
                .await;
            }
        });
    }

    fn shutdown(&self) {}
}
