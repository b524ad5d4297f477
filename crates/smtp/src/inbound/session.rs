/*
 * SPDX-FileCopyrightText: 2024 Loriot Project <dev@loriot.email>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use common::listener::SessionStream;
use smtp_proto::request::receiver::{
    BdatReceiver, DataReceiver, DummyDataReceiver, LineReceiver, MAX_LINE_LENGTH,
};
use smtp_proto::{
    EhloResponse, Request, AUTH_PLAIN, EXT_8BIT_MIME, EXT_BINARY_MIME, EXT_CHUNKING,
    EXT_ENHANCED_STATUS_CODES, EXT_PIPELINING, EXT_SIZE, EXT_SMTP_UTF8, EXT_START_TLS,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{Dialect, Recipient, SaslState, Session, SessionAddress, State};

const IDLE_TIMEOUT_SECS: u64 = 1800;

impl<T: SessionStream> Session<T> {
    pub async fn run(mut self) {
        let banner = format!(
            "220 {} {} Loriot\r\n",
            self.core.config.hostname,
            self.dialect.banner_word()
        );
        if self.write(banner.as_bytes()).await.is_err() {
            return;
        }

        let mut buf = vec![0u8; 8192];
        let mut shutdown_rx = self.instance.shutdown_rx.clone();
        loop {
            tokio::select! {
                read = tokio::time::timeout(
                    std::time::Duration::from_secs(IDLE_TIMEOUT_SECS),
                    self.stream.read(&mut buf),
                ) => {
                    match read {
                        Ok(Ok(0)) => {
                            tracing::debug!(parent: &self.span, event = "close",
                                "Connection closed by client.");
                            break;
                        }
                        Ok(Ok(bytes_read)) => {
                            if self.ingest(&buf[..bytes_read]).await.is_err() {
                                break;
                            }
                        }
                        Ok(Err(err)) => {
                            tracing::debug!(parent: &self.span, event = "error",
                                reason = %err, "Connection error.");
                            break;
                        }
                        Err(_) => {
                            tracing::debug!(parent: &self.span, event = "timeout",
                                "Idle timeout.");
                            let _ = self.write(b"421 4.4.2 Tempus fugit\r\n").await;
                            break;
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    let _ = self.write(b"421 4.3.0 Server shutdown\r\n").await;
                    break;
                }
            }
        }
    }

    pub async fn ingest(&mut self, bytes: &[u8]) -> Result<(), ()> {
        let mut iter = bytes.iter();
        let mut state = std::mem::replace(&mut self.state, State::None);

        'outer: loop {
            match &mut state {
                State::Request(receiver) => loop {
                    match receiver.ingest(&mut iter, bytes) {
                        Ok(request) => match request {
                            Request::Ehlo { host } => {
                                if self.dialect != Dialect::Lmtp {
                                    self.handle_ehlo(host).await?;
                                } else {
                                    self.write(b"500 5.5.1 Invalid command.\r\n").await?;
                                }
                            }
                            Request::Lhlo { host } => {
                                if self.dialect == Dialect::Lmtp {
                                    self.handle_ehlo(host).await?;
                                } else {
                                    self.write(b"502 5.5.1 Invalid command.\r\n").await?;
                                }
                            }
                            Request::Helo { host } => {
                                if self.dialect != Dialect::Lmtp {
                                    self.data.helo_domain = host;
                                    let reply = format!(
                                        "250 {} you are {}\r\n",
                                        self.core.config.hostname, self.data.helo_domain
                                    );
                                    self.write(reply.as_bytes()).await?;
                                } else {
                                    self.write(b"500 5.5.1 Invalid command.\r\n").await?;
                                }
                            }
                            Request::Mail { from } => {
                                self.handle_mail_from(from.address).await?;
                            }
                            Request::Rcpt { to } => {
                                self.handle_rcpt_to(to.address).await?;
                            }
                            Request::Data => {
                                if self.can_send_data().await? {
                                    self.write(
                                        b"354 Start mail input; end with <CRLF>.<CRLF>\r\n",
                                    )
                                    .await?;
                                    self.data.message = Vec::with_capacity(1024);
                                    state = State::Data(DataReceiver::new());
                                    continue 'outer;
                                }
                            }
                            Request::Bdat {
                                chunk_size,
                                is_last,
                            } => {
                                state = if chunk_size + self.data.message.len()
                                    < self.core.config.max_message_size
                                {
                                    self.data.message.reserve(chunk_size);
                                    State::Bdat(BdatReceiver::new(chunk_size, is_last))
                                } else {
                                    // Chunk is too large, swallow and reject.
                                    State::DataTooLarge(DummyDataReceiver::new_bdat(
                                        chunk_size,
                                    ))
                                };
                                continue 'outer;
                            }
                            Request::Auth {
                                mechanism,
                                initial_response,
                            } => {
                                if self.data.authenticated.is_some() {
                                    self.write(b"503 5.5.1 Already authenticated.\r\n")
                                        .await?;
                                } else if mechanism & AUTH_PLAIN == 0 {
                                    self.write(
                                        b"554 5.7.8 Authentication mechanism not supported.\r\n",
                                    )
                                    .await?;
                                } else if !initial_response.is_empty() {
                                    self.handle_sasl_plain(initial_response.as_bytes())
                                        .await?;
                                } else {
                                    self.write(b"334 \r\n").await?;
                                    state = State::Sasl(LineReceiver::new(SaslState {
                                        mechanism,
                                    }));
                                    continue 'outer;
                                }
                            }
                            Request::Noop { .. } => {
                                self.write(b"250 2.0.0 OK\r\n").await?;
                            }
                            Request::Rset => {
                                self.reset();
                                self.write(b"250 2.0.0 OK\r\n").await?;
                            }
                            Request::Quit => {
                                self.write(b"221 2.0.0 Bye.\r\n").await?;
                                return Err(());
                            }
                            Request::StartTls => {
                                // STARTTLS negotiation itself is the
                                // listener's concern; this machine only
                                // refuses it where it cannot apply.
                                self.write(b"502 5.7.0 TLS not available.\r\n").await?;
                            }
                            Request::Vrfy { .. } | Request::Expn { .. } => {
                                self.write(b"252 2.5.1 Cannot verify.\r\n").await?;
                            }
                            Request::Help { .. } => {
                                self.write(b"250 2.0.0 Help is on the way.\r\n").await?;
                            }
                            Request::Etrn { .. } | Request::Atrn { .. } | Request::Burl { .. } => {
                                self.write(b"502 5.5.1 Command not implemented.\r\n")
                                    .await?;
                            }
                        },
                        Err(err) => match err {
                            smtp_proto::Error::NeedsMoreData { .. } => break 'outer,
                            smtp_proto::Error::UnknownCommand
                            | smtp_proto::Error::InvalidResponse { .. } => {
                                self.write(b"500 5.5.1 Invalid command.\r\n").await?;
                            }
                            smtp_proto::Error::InvalidSenderAddress => {
                                self.write(b"501 5.1.8 Bad sender's system address.\r\n")
                                    .await?;
                            }
                            smtp_proto::Error::InvalidRecipientAddress => {
                                self.write(
                                    b"501 5.1.3 Bad destination mailbox address syntax.\r\n",
                                )
                                .await?;
                            }
                            smtp_proto::Error::SyntaxError { syntax } => {
                                let reply = format!(
                                    "501 5.5.2 Syntax error, expected: {}\r\n",
                                    syntax
                                );
                                self.write(reply.as_bytes()).await?;
                            }
                            smtp_proto::Error::InvalidParameter { param } => {
                                let reply =
                                    format!("501 5.5.4 Invalid parameter {:?}.\r\n", param);
                                self.write(reply.as_bytes()).await?;
                            }
                            smtp_proto::Error::UnsupportedParameter { param } => {
                                let reply = format!(
                                    "504 5.5.4 Unsupported parameter {:?}.\r\n",
                                    param
                                );
                                self.write(reply.as_bytes()).await?;
                            }
                            smtp_proto::Error::ResponseTooLong => {
                                // Command lines are capped at 4096 octets;
                                // an overlong line ends the connection.
                                self.write(
                                    b"500 5.5.2 Line too long (legal maximum is 998 bytes)\r\n",
                                )
                                .await?;
                                return Err(());
                            }
                        },
                    }
                },
                State::Data(receiver) => {
                    if self.data.message.len() + bytes.len() < self.core.config.max_message_size
                    {
                        if receiver.ingest(&mut iter, &mut self.data.message) {
                            let num_rcpts = self.data.rcpt_to.len();
                            let reply = self.queue_message().await;
                            if reply.is_empty() {
                                return Err(());
                            }
                            if self.dialect == Dialect::Lmtp {
                                // LMTP answers once per accepted recipient.
                                for _ in 0..num_rcpts {
                                    self.write(reply.as_bytes()).await?;
                                }
                            } else {
                                self.write(reply.as_bytes()).await?;
                            }
                            self.reset();
                            state = State::default();
                        } else {
                            break 'outer;
                        }
                    } else {
                        state = State::DataTooLarge(DummyDataReceiver::new_data(receiver));
                    }
                }
                State::Bdat(receiver) => {
                    if receiver.ingest(&mut iter, &mut self.data.message) {
                        if self.can_send_data().await? {
                            if receiver.is_last {
                                let num_rcpts = self.data.rcpt_to.len();
                                let reply = self.queue_message().await;
                                if reply.is_empty() {
                                    return Err(());
                                }
                                if self.dialect == Dialect::Lmtp {
                                    for _ in 0..num_rcpts {
                                        self.write(reply.as_bytes()).await?;
                                    }
                                } else {
                                    self.write(reply.as_bytes()).await?;
                                }
                                self.reset();
                            } else {
                                self.write(b"250 2.6.0 Chunk accepted.\r\n").await?;
                            }
                        } else {
                            self.data.message = Vec::with_capacity(0);
                        }
                        state = State::default();
                    } else {
                        break 'outer;
                    }
                }
                State::Sasl(receiver) => {
                    if receiver.ingest(&mut iter) {
                        if receiver.buf.len() < MAX_LINE_LENGTH {
                            let response = std::mem::take(&mut receiver.buf);
                            self.handle_sasl_plain(&response).await?;
                        } else {
                            self.write(
                                b"500 5.5.6 Authentication Exchange line is too long.\r\n",
                            )
                            .await?;
                        }
                        state = State::default();
                    } else {
                        break 'outer;
                    }
                }
                State::DataTooLarge(receiver) => {
                    if receiver.ingest(&mut iter) {
                        tracing::debug!(parent: &self.span, context = "data",
                            event = "too-large", "Message is too large.");
                        self.data.message = Vec::with_capacity(0);
                        self.write(b"552 5.3.4 Message too big for system.\r\n").await?;
                        state = State::default();
                    } else {
                        break 'outer;
                    }
                }
                State::None => unreachable!(),
            }
        }
        self.state = state;

        Ok(())
    }

    async fn handle_ehlo(&mut self, host: String) -> Result<(), ()> {
        if self.data.mail_from.is_some() {
            self.reset();
        }
        self.data.helo_domain = host;

        let mut response = EhloResponse::new(self.core.config.hostname.as_str());
        response.capabilities = EXT_ENHANCED_STATUS_CODES
            | EXT_8BIT_MIME
            | EXT_BINARY_MIME
            | EXT_SMTP_UTF8
            | EXT_PIPELINING
            | EXT_CHUNKING;
        if !self.stream.is_tls() && self.instance.tls_acceptor.is_some() {
            response.capabilities |= EXT_START_TLS;
        }
        if self.dialect == Dialect::Submit && self.data.authenticated.is_none() {
            response.auth_mechanisms = AUTH_PLAIN;
        }
        response.size = self.core.config.max_message_size;
        if response.size > 0 {
            response.capabilities |= EXT_SIZE;
        }

        let mut buf = Vec::with_capacity(128);
        response.write(&mut buf).ok();
        self.write(&buf).await
    }

    async fn handle_mail_from(&mut self, from: String) -> Result<(), ()> {
        if self.data.helo_domain.is_empty() {
            return self
                .write(b"503 5.5.1 Polite people say EHLO first.\r\n")
                .await;
        }
        if self.data.mail_from.is_some() || self.data.null_sender {
            return self
                .write(b"503 5.5.1 Multiple MAIL commands not allowed.\r\n")
                .await;
        }
        if self.dialect == Dialect::Submit && self.data.authenticated.is_none() {
            return self
                .write(b"530 5.7.0 Authentication required.\r\n")
                .await;
        }
        if from.is_empty() {
            self.data.null_sender = true;
            return self.write(b"250 2.1.0 OK\r\n").await;
        }
        match SessionAddress::parse(&from) {
            Some(address) => {
                tracing::debug!(parent: &self.span, context = "mail-from",
                    event = "accepted", sender = address.address.as_str());
                self.data.mail_from = Some(address);
                self.write(b"250 2.1.0 OK\r\n").await
            }
            None => {
                self.write(b"501 5.1.8 Bad sender's system address.\r\n")
                    .await
            }
        }
    }

    async fn handle_rcpt_to(&mut self, to: String) -> Result<(), ()> {
        if self.data.mail_from.is_none() && !self.data.null_sender {
            return self.write(b"503 5.5.1 MAIL is required first.\r\n").await;
        }
        let address = match SessionAddress::parse(&to) {
            Some(address) => address,
            None => {
                return self
                    .write(b"501 5.1.3 Bad destination mailbox address syntax.\r\n")
                    .await;
            }
        };
        if self
            .data
            .rcpt_to
            .iter()
            .any(|rcpt| rcpt.address.address.eq_ignore_ascii_case(&address.address))
        {
            return self.write(b"250 2.1.5 Duplicate recipient, OK\r\n").await;
        }

        // Per-recipient disposition: the Sieve evaluation seam. Local
        // aliases deliver into mailboxes; everything else is relayed for
        // authenticated submitters and rejected otherwise.
        match self
            .core
            .store
            .resolve_address(&address.localpart, &address.domain)
            .await
        {
            Ok(mailboxes) if !mailboxes.is_empty() => {
                tracing::debug!(parent: &self.span, context = "rcpt",
                    event = "local", recipient = address.address.as_str());
                self.data.rcpt_to.push(Recipient {
                    address,
                    disposition: super::Disposition::Local { mailboxes },
                });
                self.write(b"250 2.1.5 OK\r\n").await
            }
            Ok(_) => {
                if self.data.authenticated.is_some() {
                    tracing::debug!(parent: &self.span, context = "rcpt",
                        event = "relay", recipient = address.address.as_str());
                    self.data.rcpt_to.push(Recipient {
                        address,
                        disposition: super::Disposition::Remote,
                    });
                    self.write(b"250 2.1.5 OK\r\n").await
                } else {
                    tracing::debug!(parent: &self.span, context = "rcpt",
                        event = "reject", recipient = address.address.as_str());
                    self.write(b"550 5.1.1 No such user here.\r\n").await
                }
            }
            Err(err) => {
                tracing::warn!(parent: &self.span, event = "error", reason = %err,
                    "Recipient lookup failed.");
                self.write(b"451 4.3.0 Temporary server error.\r\n").await
            }
        }
    }

    async fn handle_sasl_plain(&mut self, response: &[u8]) -> Result<(), ()> {
        let mut response = response.to_vec();
        while response
            .last()
            .map_or(false, |ch| *ch == b'\r' || *ch == b'\n')
        {
            response.pop();
        }
        if response == b"*" {
            return self.write(b"501 5.5.4 Authentication aborted.\r\n").await;
        }
        let decoded = match STANDARD.decode(&response) {
            Ok(decoded) => decoded,
            Err(_) => {
                return self
                    .write(b"501 5.5.2 Invalid base64 in SASL response.\r\n")
                    .await;
            }
        };
        let mut fields = decoded.split(|&ch| ch == 0);
        let _authzid = fields.next().unwrap_or_default();
        let authcid = String::from_utf8_lossy(fields.next().unwrap_or_default()).into_owned();
        let password = String::from_utf8_lossy(fields.next().unwrap_or_default()).into_owned();

        match self.core.store.authenticate(&authcid, &password).await {
            Ok(Some(user)) => {
                tracing::info!(parent: &self.span, event = "authenticated",
                    login = user.login.as_str(), "Authentication successful.");
                self.data.authenticated = Some(user);
                self.write(b"235 2.7.0 Authentication succeeded.\r\n").await
            }
            Ok(None) => {
                tracing::debug!(parent: &self.span, event = "auth-failed",
                    login = authcid.as_str(), "Authentication failed.");
                self.write(b"535 5.7.8 Authentication credentials invalid.\r\n")
                    .await
            }
            Err(err) => {
                tracing::warn!(parent: &self.span, event = "error", reason = %err,
                    "Authentication lookup failed.");
                self.write(b"454 4.7.0 Temporary authentication failure.\r\n")
                    .await
            }
        }
    }

    async fn can_send_data(&mut self) -> Result<bool, ()> {
        if self.data.rcpt_to.is_empty() {
            self.write(b"503 5.5.1 RCPT is required first.\r\n").await?;
            Ok(false)
        } else {
            Ok(true)
        }
    }

    pub fn reset(&mut self) {
        self.data.mail_from = None;
        self.data.null_sender = false;
        self.data.rcpt_to.clear();
        self.data.message = Vec::with_capacity(0);
        self.data.transaction_id = None;
    }

    #[inline(always)]
    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), ()> {
        let err = match self.stream.write_all(bytes).await {
            Ok(_) => match self.stream.flush().await {
                Ok(_) => {
                    tracing::trace!(parent: &self.span, event = "write",
                        data = std::str::from_utf8(bytes).unwrap_or_default(),
                        size = bytes.len());
                    return Ok(());
                }
                Err(err) => err,
            },
            Err(err) => err,
        };
        tracing::trace!(parent: &self.span, event = "error",
            "Failed to write to stream: {:?}", err);
        Err(())
    }
}
