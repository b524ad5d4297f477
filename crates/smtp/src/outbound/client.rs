/*
 * SPDX-FileCopyrightText: 2024 Loriot Project <dev@loriot.email>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::time::Duration;

use smtp_proto::{EXT_ENHANCED_STATUS_CODES, EXT_SIZE, EXT_SMTP_UTF8};
use store::model::RecipientAction;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::time::Instant;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Invalid,
    Connected,
    Banner,
    Hello,
    MailFrom,
    RcptTo,
    Data,
    Body,
    Rset,
    Quit,
}

/// One delivery handed to the client: the envelope with per-recipient
/// outcome slots, and the message octets.
#[derive(Debug)]
pub struct DeliverySet {
    /// Empty localpart and domain is the null sender.
    pub sender: (String, String),
    pub recipients: Vec<DeliveryRecipientState>,
    pub message: Vec<u8>,
    pub needs_utf8: bool,
}

#[derive(Debug, Clone)]
pub struct DeliveryRecipientState {
    pub address_id: u32,
    pub address: String,
    pub action: RecipientAction,
    pub status: String,
}

impl DeliverySet {
    pub fn pending(&self) -> bool {
        self.recipients
            .iter()
            .any(|recipient| recipient.action == RecipientAction::Unknown)
    }

    pub fn all_failed(&self) -> bool {
        self.recipients
            .iter()
            .all(|recipient| recipient.action == RecipientAction::Failed)
    }

    /// Marks every still-undecided recipient Delayed with the given status.
    pub fn finish(&mut self, status: &str) {
        for recipient in &mut self.recipients {
            if recipient.action == RecipientAction::Unknown {
                recipient.action = RecipientAction::Delayed;
                recipient.status = status.to_string();
            }
        }
    }
}

pub struct SmtpClient {
    stream: BufStream<TcpStream>,
    state: ClientState,
    hostname: String,
    capabilities: u64,
    size_limit: usize,
    peer: String,
}

struct Reply {
    code: u16,
    enhanced: Option<String>,
    lines: Vec<String>,
}

impl SmtpClient {
    /// Connects, reads the banner and says EHLO, recording the extensions
    /// the smarthost offers. The client ends up idle and reusable.
    pub async fn connect(host: &str, port: u16, hostname: String) -> std::io::Result<Self> {
        let stream = tokio::time::timeout(
            COMMAND_TIMEOUT,
            TcpStream::connect((host, port)),
        )
        .await
        .map_err(|_| std::io::Error::other("connection timed out"))??;
        let mut client = SmtpClient {
            stream: BufStream::new(stream),
            state: ClientState::Connected,
            hostname,
            capabilities: 0,
            size_limit: 0,
            peer: format!("{}:{}", host, port),
        };

        let banner = client.read_reply(ClientState::Connected).await?;
        if banner.code / 100 != 2 {
            client.state = ClientState::Invalid;
            return Err(std::io::Error::other(format!(
                "unexpected banner: {}",
                banner.lines.last().cloned().unwrap_or_default()
            )));
        }
        client.state = ClientState::Banner;

        let ehlo = format!("EHLO {}\r\n", client.hostname);
        client.send_command(&ehlo).await?;
        client.state = ClientState::Hello;
        let reply = client.read_reply(ClientState::Hello).await?;
        if reply.code / 100 != 2 {
            client.state = ClientState::Invalid;
            return Err(std::io::Error::other("EHLO rejected"));
        }
        client.record_extensions(&reply.lines);
        client.state = ClientState::Rset;
        tracing::debug!(context = "smtp-client", event = "connected",
            peer = client.peer.as_str(),
            size = client.size_limit,
            utf8 = client.capabilities & EXT_SMTP_UTF8 as u64 != 0,
            "Connected to smarthost.");
        Ok(client)
    }

    pub fn is_ready(&self) -> bool {
        self.state == ClientState::Rset
    }

    /// The smarthost's SIZE limit, zero when not announced.
    pub fn size_limit(&self) -> usize {
        self.size_limit
    }

    /// Drives one delivery. Recipient outcomes are written into the set;
    /// recipients still Unknown afterwards were not decided by the server
    /// and stay queued.
    pub async fn send(&mut self, delivery: &mut DeliverySet) {
        if !self.is_ready() {
            delivery.finish("4.3.0");
            return;
        }
        self.state = ClientState::Hello;
        if let Err(status) = self.send_inner(delivery).await {
            delivery.finish(&status);
            self.state = ClientState::Invalid;
        }
    }

    async fn send_inner(&mut self, delivery: &mut DeliverySet) -> Result<(), String> {
        // MAIL FROM, with SIZE and SMTPUTF8 where the server offers them.
        let body = dot_stuff(&delivery.message);
        let mut mail_from = String::from("MAIL FROM:<");
        if !delivery.sender.0.is_empty() || !delivery.sender.1.is_empty() {
            mail_from.push_str(&delivery.sender.0);
            mail_from.push('@');
            mail_from.push_str(&delivery.sender.1);
        }
        mail_from.push('>');
        if delivery.needs_utf8 && self.capabilities & EXT_SMTP_UTF8 as u64 != 0 {
            mail_from.push_str(" SMTPUTF8");
        }
        if self.capabilities & EXT_SIZE as u64 != 0 {
            mail_from.push_str(&format!(" SIZE={}", body.len()));
        }
        mail_from.push_str("\r\n");

        self.state = ClientState::MailFrom;
        self.send_command(&mail_from)
            .await
            .map_err(|_| "4.4.2".to_string())?;
        let reply = self
            .read_reply(ClientState::MailFrom)
            .await
            .map_err(|_| "4.4.2".to_string())?;
        if reply.code / 100 != 2 {
            self.handle_failure(delivery, &reply, None);
            if reply.code == 421 {
                return Err(self.close_after_421());
            }
            self.rset().await;
            return Ok(());
        }

        // One RCPT TO per undecided recipient; failures are per-recipient.
        self.state = ClientState::RcptTo;
        let mut accepted = Vec::new();
        for index in 0..delivery.recipients.len() {
            if delivery.recipients[index].action != RecipientAction::Unknown {
                continue;
            }
            let command = format!("RCPT TO:<{}>\r\n", delivery.recipients[index].address);
            self.send_command(&command)
                .await
                .map_err(|_| "4.4.2".to_string())?;
            let reply = self
                .read_reply(ClientState::RcptTo)
                .await
                .map_err(|_| "4.4.2".to_string())?;
            match reply.code / 100 {
                2 => accepted.push(index),
                _ => {
                    self.handle_failure(delivery, &reply, Some(index));
                    if reply.code == 421 {
                        return Err(self.close_after_421());
                    }
                }
            }
        }

        if accepted.is_empty() {
            self.rset().await;
            return Ok(());
        }

        // DATA and the dot-stuffed body, with write-progress monitoring.
        self.state = ClientState::Data;
        self.send_command("DATA\r\n")
            .await
            .map_err(|_| "4.4.2".to_string())?;
        let reply = self
            .read_reply(ClientState::Data)
            .await
            .map_err(|_| "4.4.2".to_string())?;
        if reply.code / 100 != 3 {
            self.handle_failure(delivery, &reply, None);
            if reply.code == 421 {
                return Err(self.close_after_421());
            }
            self.rset().await;
            return Ok(());
        }

        self.state = ClientState::Body;
        write_with_progress(&mut self.stream, &body, COMMAND_TIMEOUT).await?;

        let reply = self
            .read_reply(ClientState::Body)
            .await
            .map_err(|_| "4.4.2".to_string())?;
        if reply.code / 100 == 2 {
            for index in accepted {
                let recipient = &mut delivery.recipients[index];
                recipient.action = RecipientAction::Relayed;
                recipient.status = reply
                    .enhanced
                    .clone()
                    .unwrap_or_else(|| "2.0.0".to_string());
                tracing::info!(context = "smtp-client", event = "relayed",
                    recipient = recipient.address.as_str(), peer = self.peer.as_str(),
                    "Message relayed.");
            }
        } else {
            self.handle_failure(delivery, &reply, None);
            if reply.code == 421 {
                return Err(self.close_after_421());
            }
        }

        self.rset().await;
        Ok(())
    }

    async fn rset(&mut self) {
        self.state = ClientState::Rset;
        if self.send_command("RSET\r\n").await.is_ok() {
            if self.read_reply(ClientState::Rset).await.is_err() {
                self.state = ClientState::Invalid;
            }
        } else {
            self.state = ClientState::Invalid;
        }
    }

    fn close_after_421(&mut self) -> String {
        tracing::debug!(context = "smtp-client", event = "close",
            peer = self.peer.as_str(), "Closing because the server sent 421.");
        self.state = ClientState::Invalid;
        "4.3.0".to_string()
    }

    pub async fn quit(mut self) {
        self.state = ClientState::Quit;
        let _ = self.send_command("QUIT\r\n").await;
    }

    /// Applies a 4xx/5xx reply: permanent failures mark recipients Failed,
    /// transient ones Delayed. A reply outside a RCPT exchange hits every
    /// undecided recipient.
    fn handle_failure(&self, delivery: &mut DeliverySet, reply: &Reply, rcpt: Option<usize>) {
        let status = reply
            .enhanced
            .clone()
            .unwrap_or_else(|| default_enhanced_status(reply.code, self.state).to_string());
        let permanent = reply.code / 100 == 5;
        let apply = |recipient: &mut DeliveryRecipientState| {
            recipient.action = if permanent {
                RecipientAction::Failed
            } else {
                RecipientAction::Delayed
            };
            recipient.status = status.clone();
        };
        match rcpt {
            Some(index) => apply(&mut delivery.recipients[index]),
            None => {
                for recipient in &mut delivery.recipients {
                    if recipient.action == RecipientAction::Unknown {
                        apply(recipient);
                    }
                }
            }
        }
    }

    async fn send_command(&mut self, command: &str) -> std::io::Result<()> {
        tracing::trace!(context = "smtp-client", event = "write",
            data = command.trim_end());
        tokio::time::timeout(COMMAND_TIMEOUT, async {
            self.stream.write_all(command.as_bytes()).await?;
            self.stream.flush().await
        })
        .await
        .map_err(|_| std::io::Error::other("write timed out"))?
    }

    async fn read_reply(&mut self, state: ClientState) -> std::io::Result<Reply> {
        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            let read = tokio::time::timeout(
                COMMAND_TIMEOUT,
                self.stream.read_line(&mut line),
            )
            .await
            .map_err(|_| std::io::Error::other("server timed out"))??;
            if read == 0 {
                return Err(std::io::Error::other("unexpected close by server"));
            }
            tracing::trace!(context = "smtp-client", event = "read",
                data = line.trim_end());
            let done = line.as_bytes().get(3) != Some(&b'-');
            lines.push(line.trim_end().to_string());
            if done {
                break;
            }
        }
        let last = lines.last().cloned().unwrap_or_default();
        let code = last
            .get(..3)
            .and_then(|digits| digits.parse::<u16>().ok())
            .ok_or_else(|| {
                std::io::Error::other(format!("server sent garbage: {:?}", last))
            })?;
        let enhanced = if self.capabilities & EXT_ENHANCED_STATUS_CODES as u64 != 0 {
            extract_enhanced_status(&last)
        } else {
            None
        };
        let _ = state;
        Ok(Reply {
            code,
            enhanced,
            lines,
        })
    }

    /// Parses EHLO continuation lines and records the extensions we use:
    /// ENHANCEDSTATUSCODES, SMTPUTF8 and SIZE.
    fn record_extensions(&mut self, lines: &[String]) {
        for line in lines {
            let text = line.get(4..).unwrap_or_default();
            let mut words = text.split_ascii_whitespace();
            match words
                .next()
                .unwrap_or_default()
                .to_ascii_uppercase()
                .as_str()
            {
                "ENHANCEDSTATUSCODES" => self.capabilities |= EXT_ENHANCED_STATUS_CODES as u64,
                "SMTPUTF8" => self.capabilities |= EXT_SMTP_UTF8 as u64,
                "SIZE" => {
                    self.capabilities |= EXT_SIZE as u64;
                    self.size_limit = words
                        .next()
                        .and_then(|size| size.parse::<usize>().ok())
                        .unwrap_or(0);
                }
                _ => (),
            }
        }
    }
}

/// Writes the body under write-progress monitoring. Each watchdog tick
/// compares the bytes the transport has accepted against the sample taken
/// at the previous tick: any departure renews the deadline, stagnation
/// fails the transfer with 4.4.1. A slow link that keeps draining never
/// times out, no matter how long the body takes.
async fn write_with_progress<S>(
    stream: &mut S,
    body: &[u8],
    window: Duration,
) -> Result<(), String>
where
    S: AsyncWrite + Unpin,
{
    let mut written = 0usize;
    let mut sampled = 0usize;
    let mut deadline = Instant::now() + window;
    while written < body.len() {
        tokio::select! {
            result = stream.write(&body[written..]) => {
                match result {
                    Ok(0) | Err(_) => return Err("4.4.2".to_string()),
                    Ok(bytes) => written += bytes,
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                if written > sampled {
                    sampled = written;
                    deadline = Instant::now() + window;
                } else {
                    return Err("4.4.1".to_string());
                }
            }
        }
    }
    // The buffered tail still has to depart.
    match tokio::time::timeout(window, stream.flush()).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) => Err("4.4.2".to_string()),
        Err(_) => Err("4.4.1".to_string()),
    }
}

/// Extracts an enhanced status code like "5.2.0" from the reply text after
/// the three-digit code.
pub fn extract_enhanced_status(line: &str) -> Option<String> {
    let text = line.get(4..)?;
    let candidate = text.split_ascii_whitespace().next()?;
    let mut parts = candidate.split('.');
    let class = parts.next()?.parse::<u8>().ok()?;
    let subject = parts.next()?.parse::<u16>().ok()?;
    let detail = parts.next()?.parse::<u16>().ok()?;
    if parts.next().is_some() || !(2..=5).contains(&class) {
        return None;
    }
    Some(format!("{}.{}.{}", class, subject, detail))
}

/// Default enhanced status codes for servers that do not announce
/// ENHANCEDSTATUSCODES, keyed by the basic reply code.
pub fn default_enhanced_status(code: u16, state: ClientState) -> &'static str {
    match code {
        211 | 214 | 220 | 221 | 252 | 354 => "2.0.0",
        250 => {
            if matches!(state, ClientState::MailFrom | ClientState::RcptTo) {
                "2.1.0"
            } else {
                "2.0.0"
            }
        }
        251 => "2.1.0",
        421 => "4.3.0",
        450 | 451 | 452 => "4.2.0",
        500 | 501 | 502 | 503 | 504 => "4.3.0",
        550 | 551 | 553 => "5.2.0",
        552 => "5.3.0",
        554 => "5.0.0",
        _ if (200..600).contains(&code) => match code / 100 {
            2 => "2.0.0",
            3 => "3.0.0",
            4 => "4.0.0",
            _ => "5.0.0",
        },
        _ => "4.0.0",
    }
}

/// Dot-stuffs a message body: lone CR and LF become CRLF, a line starting
/// with '.' gets another '.', and the terminating ".CRLF" is appended.
pub fn dot_stuff(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 8);
    let mut at_line_start = true;
    let mut iter = body.iter().peekable();
    while let Some(&ch) = iter.next() {
        match ch {
            b'\r' => {
                out.extend_from_slice(b"\r\n");
                at_line_start = true;
                if iter.peek() == Some(&&b'\n') {
                    iter.next();
                }
            }
            b'\n' => {
                out.extend_from_slice(b"\r\n");
                at_line_start = true;
            }
            _ => {
                if at_line_start && ch == b'.' {
                    out.push(b'.');
                }
                out.push(ch);
                at_line_start = false;
            }
        }
    }
    if !at_line_start {
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b".\r\n");
    out
}

/// Reverses dot-stuffing, minus the terminator. Used by the tests to check
/// the round-trip property.
#[cfg(test)]
pub fn un_dot_stuff(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len());
    let body = body.strip_suffix(b".\r\n").unwrap_or(body);
    for line in body.split_inclusive(|&ch| ch == b'\n') {
        let line = line.strip_prefix(b".").unwrap_or(line);
        out.extend_from_slice(line);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canonicalise_crlf(body: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(body.len());
        let mut iter = body.iter().peekable();
        while let Some(&ch) = iter.next() {
            match ch {
                b'\r' => {
                    out.extend_from_slice(b"\r\n");
                    if iter.peek() == Some(&&b'\n') {
                        iter.next();
                    }
                }
                b'\n' => out.extend_from_slice(b"\r\n"),
                _ => out.push(ch),
            }
        }
        if !out.ends_with(b"\r\n") && !out.is_empty() {
            out.extend_from_slice(b"\r\n");
        }
        out
    }

    #[test]
    fn dot_stuffing_round_trip() {
        for body in [
            &b"plain text\r\nsecond line\r\n"[..],
            &b".leading dot\r\n..two dots\r\n"[..],
            &b"bare\nnewlines\nhere"[..],
            &b"stray\rcarriage returns"[..],
            &b"mixed\r\n.\r\nterminator-lookalike\r\n"[..],
            &b""[..],
        ] {
            let stuffed = dot_stuff(body);
            assert!(stuffed.ends_with(b".\r\n"), "terminator missing");
            assert_eq!(
                un_dot_stuff(&stuffed),
                canonicalise_crlf(body),
                "round trip failed for {:?}",
                String::from_utf8_lossy(body)
            );
            // No line of the transmitted body may start with a bare dot.
            let transmitted = &stuffed[..stuffed.len() - 3];
            for line in transmitted.split_inclusive(|&ch| ch == b'\n') {
                assert!(
                    !line.starts_with(b".") || line.starts_with(b".."),
                    "unescaped dot in {:?}",
                    String::from_utf8_lossy(line)
                );
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_body_write_fails_with_441() {
        // Nobody reads the peer side: the pipe fills, then nothing departs
        // between two watchdog ticks.
        let (mut local, peer) = tokio::io::duplex(64);
        let body = vec![b'x'; 4096];
        assert_eq!(
            write_with_progress(&mut local, &body, Duration::from_secs(300)).await,
            Err("4.4.1".to_string())
        );
        drop(peer);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_but_progressing_write_never_times_out() {
        use tokio::io::AsyncReadExt;

        // The peer drains 16 bytes every 200 seconds; each 300 second
        // watchdog window sees some departure, so the deadline keeps being
        // renewed and the transfer outlives many nominal timeouts.
        let (mut local, mut peer) = tokio::io::duplex(64);
        let body = vec![b'y'; 1024];
        let writer = write_with_progress(&mut local, &body, Duration::from_secs(300));
        let reader = async move {
            let mut buf = [0u8; 16];
            let mut total = 0usize;
            while total < 1024 {
                tokio::time::sleep(Duration::from_secs(200)).await;
                match peer.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(read) => total += read,
                }
            }
            total
        };
        let (result, total) = tokio::join!(writer, reader);
        assert_eq!(result, Ok(()));
        assert_eq!(total, 1024);
    }

    #[test]
    fn enhanced_status_extraction() {
        assert_eq!(
            extract_enhanced_status("550 5.1.1 No such user"),
            Some("5.1.1".to_string())
        );
        assert_eq!(
            extract_enhanced_status("250 2.0.0 Ok: queued"),
            Some("2.0.0".to_string())
        );
        assert_eq!(extract_enhanced_status("250 Ok"), None);
        assert_eq!(extract_enhanced_status("250"), None);
        assert_eq!(extract_enhanced_status("550 9.1.1 bogus class"), None);
    }

    #[test]
    fn enhanced_status_defaults() {
        assert_eq!(default_enhanced_status(421, ClientState::Hello), "4.3.0");
        assert_eq!(default_enhanced_status(450, ClientState::RcptTo), "4.2.0");
        assert_eq!(default_enhanced_status(550, ClientState::RcptTo), "5.2.0");
        assert_eq!(default_enhanced_status(250, ClientState::MailFrom), "2.1.0");
        assert_eq!(default_enhanced_status(250, ClientState::Body), "2.0.0");
        assert_eq!(default_enhanced_status(599, ClientState::Body), "5.0.0");
    }

    #[test]
    fn recipient_bookkeeping() {
        let mut delivery = DeliverySet {
            sender: ("sender".into(), "example.com".into()),
            recipients: vec![
                DeliveryRecipientState {
                    address_id: 1,
                    address: "r1@example.net".into(),
                    action: RecipientAction::Relayed,
                    status: "2.0.0".into(),
                },
                DeliveryRecipientState {
                    address_id: 2,
                    address: "r2@example.net".into(),
                    action: RecipientAction::Unknown,
                    status: String::new(),
                },
            ],
            message: Vec::new(),
            needs_utf8: false,
        };
        assert!(delivery.pending());
        delivery.finish("4.5.0");
        assert!(!delivery.pending());
        assert_eq!(delivery.recipients[1].action, RecipientAction::Delayed);
        assert_eq!(delivery.recipients[1].status, "4.5.0");
        // Already-decided recipients keep their outcome.
        assert_eq!(delivery.recipients[0].action, RecipientAction::Relayed);
    }
}
