/*
 * SPDX-FileCopyrightText: 2024 Loriot Project <dev@loriot.email>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::sync::Arc;
use std::time::Duration;

use common::listener::{SessionData, SessionManager, SessionStream};
use imap_proto::receiver::{self, Receiver, Request};
use imap_proto::{Command, StatusResponse};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;

use super::command::{
    may_emit_expunge, runnable, start_delay, CommandState, ScheduledCommand,
};
use store::watch::MailboxEvent;
use super::{ClientBug, Imap, SelectedMailbox, SessionState, SessionUser};

const NAT_KEEPALIVE_SECS: u64 = 117;

#[derive(Clone)]
pub struct ImapSessionManager {
    pub imap: Arc<Imap>,
}

impl ImapSessionManager {
    pub fn new(imap: Arc<Imap>) -> Self {
        ImapSessionManager { imap }
    }
}

impl SessionManager for ImapSessionManager {
    fn spawn<T: SessionStream>(&self, session: SessionData<T>) {
        let imap = self.imap.clone();
        tokio::spawn(async move {
            run_session(imap, session).await;
        });
    }

    fn shutdown(&self) {}
}

async fn run_session<T: SessionStream>(imap: Arc<Imap>, data: SessionData<T>) {
    let remote = data
        .remote_addr
        .map(|addr| addr.to_string())
        .unwrap_or_else(|| "local".to_string());
    let span = tracing::info_span!(
        "imap",
        listener = data.instance.id.as_str(),
        remote = remote.as_str(),
        session = data.session_id,
    );

    if data.instance.tls_implicit {
        match data.instance.tls_accept(data.stream).await {
            Ok(stream) => {
                let mut session = Session::new(
                    imap,
                    stream,
                    data.instance.shutdown_rx.clone(),
                    data.session_id,
                    span,
                    true,
                );
                if session.write_greeting().await.is_ok() {
                    session.handle_conn().await;
                }
            }
            Err(err) => {
                tracing::debug!(parent: &span, event = "error", reason = %err,
                    "TLS handshake failed.");
            }
        }
        return;
    }

    let mut session = Session::new(
        imap.clone(),
        data.stream,
        data.instance.shutdown_rx.clone(),
        data.session_id,
        span.clone(),
        false,
    );
    if session.write_greeting().await.is_err() {
        return;
    }
    if session.handle_conn().await == SessionResult::UpgradeTls {
        let (stream, carry) = session.into_parts();
        match data.instance.tls_accept(stream).await {
            Ok(stream) => {
                let mut session = Session::from_parts(imap, stream, carry);
                session.handle_conn().await;
            }
            Err(err) => {
                tracing::debug!(parent: &span, event = "error", reason = %err,
                    "STARTTLS handshake failed.");
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionResult {
    Continue,
    Close,
    UpgradeTls,
}

/// Events sent to the session loop by command handler tasks.
pub enum SessionEvent {
    Untagged {
        command_id: u64,
        data: Vec<u8>,
    },
    Finished {
        command_id: u64,
        result: StatusResponse,
    },
    Authenticated {
        user: SessionUser,
    },
    Selected {
        mailbox: Arc<SelectedMailbox>,
    },
    Deselected,
    /// Reserve the input stream; raw bytes flow to the channel until
    /// Release.
    Reserve {
        input: mpsc::Sender<Vec<u8>>,
    },
    Release,
}

/// Untagged responses queued at session level, pending scheduler clearance.
enum QueuedResponse {
    Expunged { uids: Vec<u32> },
    Appended,
    FlagsChanged { uids: Vec<u32> },
}

/// Fields carried across a STARTTLS upgrade.
pub struct SessionCarry {
    shutdown_rx: watch::Receiver<bool>,
    session_id: u64,
    span: tracing::Span,
    receiver: Receiver,
    state: SessionState,
    event_tx: mpsc::Sender<SessionEvent>,
    event_rx: mpsc::Receiver<SessionEvent>,
    client_bugs: [bool; 2],
    condstore_enabled: bool,
    qresync_enabled: bool,
}

pub struct Session<T: SessionStream> {
    pub imap: Arc<Imap>,
    pub stream: T,
    pub span: tracing::Span,
    pub session_id: u64,
    shutdown_rx: watch::Receiver<bool>,
    receiver: Receiver,
    pub state: SessionState,
    is_tls: bool,

    commands: Vec<ScheduledCommand>,
    next_command_id: u64,
    event_tx: mpsc::Sender<SessionEvent>,
    event_rx: mpsc::Receiver<SessionEvent>,
    mailbox_rx: Option<broadcast::Receiver<MailboxEvent>>,
    responses: Vec<QueuedResponse>,
    reservation: Option<mpsc::Sender<Vec<u8>>>,

    syntax_errors: u32,
    last_bad_time: i64,
    preauth_bytes: usize,
    preauth_tags_plain: bool,
    client_bugs: [bool; 2],
    pub condstore_enabled: bool,
    pub qresync_enabled: bool,

    nat_deadline: Option<Instant>,
    closing: bool,
    upgrading: bool,
}

impl<T: SessionStream> Session<T> {
    pub fn new(
        imap: Arc<Imap>,
        stream: T,
        shutdown_rx: watch::Receiver<bool>,
        session_id: u64,
        span: tracing::Span,
        is_tls: bool,
    ) -> Self {
        let receiver = Receiver::new(imap.config.literal_size_limit);
        let (event_tx, event_rx) = mpsc::channel(128);
        Session {
            imap,
            stream,
            span,
            session_id,
            shutdown_rx,
            receiver,
            state: SessionState::NotAuthenticated { auth_failures: 0 },
            is_tls,
            commands: Vec::new(),
            next_command_id: 1,
            event_tx,
            event_rx,
            mailbox_rx: None,
            responses: Vec::new(),
            reservation: None,
            syntax_errors: 0,
            last_bad_time: 0,
            preauth_bytes: 0,
            preauth_tags_plain: true,
            client_bugs: [false; 2],
            condstore_enabled: false,
            qresync_enabled: false,
            nat_deadline: None,
            closing: false,
            upgrading: false,
        }
    }

    pub fn into_parts(self) -> (T, SessionCarry) {
        (
            self.stream,
            SessionCarry {
                shutdown_rx: self.shutdown_rx,
                session_id: self.session_id,
                span: self.span,
                receiver: self.receiver,
                state: self.state,
                event_tx: self.event_tx,
                event_rx: self.event_rx,
                client_bugs: self.client_bugs,
                condstore_enabled: self.condstore_enabled,
                qresync_enabled: self.qresync_enabled,
            },
        )
    }

    pub fn from_parts(imap: Arc<Imap>, stream: T, carry: SessionCarry) -> Session<T> {
        Session {
            imap,
            stream,
            span: carry.span,
            session_id: carry.session_id,
            shutdown_rx: carry.shutdown_rx,
            receiver: carry.receiver,
            state: carry.state,
            is_tls: true,
            commands: Vec::new(),
            next_command_id: 1,
            event_tx: carry.event_tx,
            event_rx: carry.event_rx,
            mailbox_rx: None,
            responses: Vec::new(),
            reservation: None,
            syntax_errors: 0,
            last_bad_time: 0,
            preauth_bytes: 0,
            preauth_tags_plain: true,
            client_bugs: carry.client_bugs,
            condstore_enabled: carry.condstore_enabled,
            qresync_enabled: carry.qresync_enabled,
            nat_deadline: None,
            closing: false,
            upgrading: false,
        }
    }

    pub async fn write_greeting(&mut self) -> Result<(), ()> {
        let greeting = self.imap.greeting(self.is_tls);
        self.write_bytes(&greeting).await
    }

    pub async fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), ()> {
        if let Err(err) = self.stream.write_all(bytes).await {
            tracing::debug!(parent: &self.span, event = "error", reason = %err,
                "Failed to write to stream.");
            return Err(());
        }
        let _ = self.stream.flush().await;
        tracing::trace!(parent: &self.span, event = "write", size = bytes.len(),
            data = std::str::from_utf8(bytes).unwrap_or("[binary]"));
        Ok(())
    }

    fn read_timeout(&self) -> Duration {
        if !self.state.is_authenticated() {
            self.imap.config.timeout_preauth
        } else if self.reservation.is_some() {
            self.imap.config.timeout_idle
        } else {
            self.imap.config.timeout_auth
        }
    }

    /// True when the server has nothing in flight for this client.
    fn is_idle(&self) -> bool {
        self.commands.iter().all(|c| match c.state {
            CommandState::Retired => true,
            CommandState::Executing => c.command == Command::Idle,
            _ => false,
        })
    }

    fn next_wake(&self) -> Option<Instant> {
        let mut wake = self.nat_deadline;
        let delay = start_delay(
            self.syntax_errors,
            self.last_bad_time,
            store::now(),
            self.state
                .user()
                .map_or(false, |user| !user.has_inbox),
        );
        if delay > 0
            && self
                .commands
                .iter()
                .any(|c| matches!(c.state, CommandState::Unparsed | CommandState::Blocked))
        {
            let delayed = Instant::now() + Duration::from_secs(delay);
            wake = Some(wake.map_or(delayed, |w| w.min(delayed)));
        }
        wake
    }

    pub async fn handle_conn(&mut self) -> SessionResult {
        let mut buf = vec![0u8; 8192];
        loop {
            let timeout = self.read_timeout();
            let wake = self.next_wake();
            let result = tokio::select! {
                read = tokio::time::timeout(timeout, self.stream.read(&mut buf)) => {
                    match read {
                        Ok(Ok(0)) => {
                            tracing::debug!(parent: &self.span, event = "close",
                                "Connection closed by client.");
                            self.fail_commands();
                            return SessionResult::Close;
                        }
                        Ok(Ok(bytes_read)) => self.ingest(&buf[..bytes_read]).await,
                        Ok(Err(err)) => {
                            tracing::debug!(parent: &self.span, event = "error",
                                reason = %err, "Connection error.");
                            self.fail_commands();
                            return SessionResult::Close;
                        }
                        Err(_) => {
                            tracing::debug!(parent: &self.span, event = "timeout",
                                "Idle timeout.");
                            let _ = self.write_bytes(b"* BYE Tempus fugit\r\n").await;
                            self.fail_commands();
                            return SessionResult::Close;
                        }
                    }
                }
                event = self.event_rx.recv() => {
                    match event {
                        Some(event) => self.apply_event(event),
                        None => SessionResult::Close,
                    }
                }
                event = mailbox_event(&mut self.mailbox_rx) => {
                    if let Some(event) = event {
                        self.queue_mailbox_event(event);
                    }
                    SessionResult::Continue
                }
                _ = sleep_until_opt(wake) => {
                    self.nat_tick().await;
                    SessionResult::Continue
                }
                _ = self.shutdown_rx.changed() => {
                    let _ = self.write_bytes(b"* BYE Server shutdown\r\n").await;
                    self.fail_commands();
                    return SessionResult::Close;
                }
            };

            if result == SessionResult::Close {
                self.fail_commands();
                return SessionResult::Close;
            }

            match self.drive().await {
                SessionResult::Continue => (),
                other => return other,
            }
        }
    }

    /// Feeds bytes from the wire into the receiver or the reservation
    /// holder, creating command objects for complete lines.
    async fn ingest(&mut self, bytes: &[u8]) -> SessionResult {
        tracing::trace!(parent: &self.span, event = "read", size = bytes.len());

        if let Some(input) = self.reservation.clone() {
            if input.send(bytes.to_vec()).await.is_err() {
                self.reservation = None;
            }
            return SessionResult::Continue;
        }

        if !self.state.is_authenticated() {
            self.preauth_bytes += bytes.len();
            if self.preauth_bytes > self.imap.config.preauth_input_limit {
                tracing::debug!(parent: &self.span, event = "error",
                    "More than 32k received before login.");
                let _ = self.write_bytes(b"* BYE overlong login sequence\r\n").await;
                return SessionResult::Close;
            }
        }

        let mut iter = bytes.iter();
        loop {
            match self.receiver.parse(&mut iter) {
                Ok(request) => {
                    self.add_command(request);
                    if self.reservation.is_some() {
                        // A just-started command reserved the stream; any
                        // following bytes belong to it, but a well-behaved
                        // client will not have sent any yet.
                        break;
                    }
                }
                Err(receiver::Error::NeedsMoreData) => break,
                Err(receiver::Error::NeedsLiteral { .. }) => {
                    if self.write_bytes(b"+ reading literal\r\n").await.is_err() {
                        return SessionResult::Close;
                    }
                    break;
                }
                Err(receiver::Error::UnknownCommand { tag, name }) => {
                    self.record_syntax_error();
                    if Command::parse(tag.to_ascii_uppercase().as_bytes(), false).is_some() {
                        let hint = format!(
                            "* OK  Hint: An IMAP command is prefixed by a tag. The command is the\r\n\
                             * OK  second word on the line, after the tag. In your command, {:?}\r\n\
                             * OK  is the command and {:?} is the tag.\r\n",
                            name, tag
                        );
                        if self.write_bytes(hint.as_bytes()).await.is_err() {
                            return SessionResult::Close;
                        }
                    }
                    let bad = format!("{} BAD No such command: {}\r\n", tag, name);
                    if self.write_bytes(bad.as_bytes()).await.is_err() {
                        return SessionResult::Close;
                    }
                }
                Err(receiver::Error::Error { response }) => {
                    self.record_syntax_error();
                    if self.write_bytes(&response.into_bytes()).await.is_err() {
                        return SessionResult::Close;
                    }
                    break;
                }
            }
        }

        SessionResult::Continue
    }

    fn add_command(&mut self, request: Request) {
        if !self.state.is_authenticated() {
            let tag = &request.tag;
            if tag.len() != 4
                || tag.contains('.')
                || !tag.chars().all(|ch| ch.is_ascii_alphabetic())
            {
                self.preauth_tags_plain = false;
            }
        }
        let id = self.next_command_id;
        self.next_command_id += 1;
        self.commands.push(ScheduledCommand::new(id, request));
        self.nat_deadline = None;
    }

    fn record_syntax_error(&mut self) {
        self.syntax_errors += 1;
        self.last_bad_time = store::now();
    }

    fn fail_commands(&mut self) {
        for command in &self.commands {
            if !matches!(command.state, CommandState::Retired) {
                tracing::debug!(parent: &self.span, event = "cancel",
                    tag = command.tag.as_str(), "Unexpected close by client.");
            }
        }
        self.commands.clear();
    }

    /// Applies an event from a handler task to session state.
    fn apply_event(&mut self, event: SessionEvent) -> SessionResult {
        match event {
            SessionEvent::Untagged { command_id, data } => {
                if let Some(command) = self.command_mut(command_id) {
                    command.pending.push(data);
                }
            }
            SessionEvent::Finished { command_id, result } => {
                if result.is_bad() {
                    self.record_syntax_error();
                }
                if let Some(command) = self.command_mut(command_id) {
                    command.result = Some(result);
                    command.state = CommandState::Finished;
                }
            }
            SessionEvent::Authenticated { user } => {
                tracing::debug!(parent: &self.span, event = "login",
                    login = user.user.login.as_str(), "Authenticated.");
                if self.preauth_tags_plain {
                    self.set_client_bug(ClientBug::Nat);
                }
                self.state = SessionState::Authenticated { user };
            }
            SessionEvent::Selected { mailbox } => {
                if let Some(user) = self.state.user().cloned() {
                    self.mailbox_rx = Some(self.imap.watches.subscribe(mailbox.id));
                    self.responses.clear();
                    self.state = SessionState::Selected { user, mailbox };
                }
            }
            SessionEvent::Deselected => {
                if let Some(user) = self.state.user().cloned() {
                    self.mailbox_rx = None;
                    self.responses.clear();
                    self.state = SessionState::Authenticated { user };
                }
            }
            SessionEvent::Reserve { input } => {
                self.reservation = Some(input);
            }
            SessionEvent::Release => {
                self.reservation = None;
            }
        }
        SessionResult::Continue
    }

    fn command_mut(&mut self, id: u64) -> Option<&mut ScheduledCommand> {
        self.commands.iter_mut().find(|c| c.id == id)
    }

    fn queue_mailbox_event(&mut self, event: MailboxEvent) {
        match event {
            MailboxEvent::Expunged { uids } => {
                if let Some(mailbox) = self.state.mailbox() {
                    let mut view = mailbox.view.lock();
                    for uid in &uids {
                        if !view.expunged_pending.contains(uid) {
                            view.expunged_pending.push(*uid);
                        }
                    }
                }
                self.responses.push(QueuedResponse::Expunged { uids });
            }
            MailboxEvent::Appended => {
                self.responses.push(QueuedResponse::Appended);
            }
            MailboxEvent::FlagsChanged { uids } => {
                self.responses.push(QueuedResponse::FlagsChanged { uids });
            }
        }
    }

    /// The scheduler tick: starts whatever may run, emits whatever may be
    /// emitted, and retires completed commands.
    async fn drive(&mut self) -> SessionResult {
        // Rate limiting defers command starts, not I/O.
        let delay = start_delay(
            self.syntax_errors,
            self.last_bad_time,
            store::now(),
            self.state
                .user()
                .map_or(false, |user| !user.has_inbox),
        );
        if delay == 0 {
            for id in runnable(&self.commands) {
                self.start_command(id).await;
            }
        } else if self
            .commands
            .iter()
            .any(|c| matches!(c.state, CommandState::Unparsed | CommandState::Blocked))
        {
            tracing::debug!(parent: &self.span, event = "throttle", seconds = delay,
                errors = self.syntax_errors, "Delaying next command.");
        }

        // Emit output for the head command, retiring it when finished.
        loop {
            while self
                .commands
                .first()
                .map_or(false, |c| c.state == CommandState::Retired)
            {
                self.commands.remove(0);
            }
            let (pending, result, id) = match self.commands.first_mut() {
                Some(head) => (
                    std::mem::take(&mut head.pending),
                    if head.state == CommandState::Finished {
                        head.result.take()
                    } else {
                        None
                    },
                    head.id,
                ),
                None => break,
            };
            for data in pending {
                if self.write_bytes(&data).await.is_err() {
                    return SessionResult::Close;
                }
            }
            match result {
                Some(result) => {
                    if self.write_bytes(&result.into_bytes()).await.is_err() {
                        return SessionResult::Close;
                    }
                    if let Some(head) = self.command_mut(id) {
                        head.state = CommandState::Retired;
                    }
                    if self.closing {
                        return SessionResult::Close;
                    }
                    if self.upgrading {
                        return SessionResult::UpgradeTls;
                    }
                    // More followers may now be eligible.
                    for id in runnable(&self.commands) {
                        self.start_command(id).await;
                    }
                }
                None => break,
            }
        }

        if self.emit_untagged().await.is_err() {
            return SessionResult::Close;
        }

        // Arm the NAT keepalive when the pipeline drains.
        if self.commands.iter().all(|c| c.state == CommandState::Retired)
            && self.client_bugs[ClientBug::Nat as usize]
            && self.state.is_authenticated()
            && self.nat_deadline.is_none()
        {
            self.nat_deadline =
                Some(Instant::now() + Duration::from_secs(NAT_KEEPALIVE_SECS));
        }

        SessionResult::Continue
    }

    /// Emits queued session-level responses. EXPUNGE disclosure waits for
    /// the scheduler gate; other responses flow as soon as they can be
    /// rendered.
    async fn emit_untagged(&mut self) -> Result<(), ()> {
        if self.responses.is_empty() {
            return Ok(());
        }
        if self.client_bugs[ClientBug::NoUnsolicitedResponses as usize]
            && self
                .commands
                .iter()
                .all(|c| c.state == CommandState::Retired)
        {
            return Ok(());
        }
        let mailbox = match self.state.mailbox().cloned() {
            Some(mailbox) => mailbox,
            None => {
                self.responses.clear();
                return Ok(());
            }
        };

        let expunge_allowed = may_emit_expunge(&self.commands);
        let mut keep = Vec::new();
        let responses = std::mem::take(&mut self.responses);
        for response in responses {
            match response {
                QueuedResponse::Expunged { uids } => {
                    if !expunge_allowed {
                        keep.push(QueuedResponse::Expunged { uids });
                        continue;
                    }
                    let mut out = Vec::new();
                    {
                        let mut view = mailbox.view.lock();
                        for uid in &uids {
                            view.expunged_pending.retain(|u| u != uid);
                            if let Some(msn) = view.remove(*uid) {
                                out.extend_from_slice(
                                    format!("* {} EXPUNGE\r\n", msn).as_bytes(),
                                );
                            }
                        }
                    }
                    if !out.is_empty() {
                        self.write_bytes(&out).await?;
                    }
                }
                QueuedResponse::Appended => {
                    let new_uids = {
                        let max_uid = mailbox.view.lock().max_uid();
                        match self.imap.store.mailbox_uids(mailbox.id).await {
                            Ok(uids) => uids
                                .into_iter()
                                .filter(|uid| *uid > max_uid)
                                .collect::<Vec<_>>(),
                            Err(_) => Vec::new(),
                        }
                    };
                    if new_uids.is_empty() {
                        continue;
                    }
                    let recent = self.imap.recent.claim(mailbox.id, &new_uids);
                    let (exists, recent_count) = {
                        let mut view = mailbox.view.lock();
                        for uid in &new_uids {
                            view.append(*uid);
                        }
                        view.recent.extend(recent.iter().copied());
                        (view.exists(), view.recent.len())
                    };
                    let out = format!(
                        "* {} EXISTS\r\n* {} RECENT\r\n",
                        exists, recent_count
                    );
                    self.write_bytes(out.as_bytes()).await?;
                }
                QueuedResponse::FlagsChanged { uids } => {
                    let in_view = {
                        let view = mailbox.view.lock();
                        uids.iter()
                            .copied()
                            .filter(|uid| {
                                view.msn_of(*uid).is_some()
                                    && !view.is_expunged_pending(*uid)
                            })
                            .collect::<Vec<_>>()
                    };
                    if in_view.is_empty() {
                        continue;
                    }
                    let flags = self
                        .imap
                        .store
                        .fetch_flags(mailbox.id, &in_view)
                        .await
                        .unwrap_or_default();
                    let trivia = self
                        .imap
                        .store
                        .fetch_trivia(mailbox.id, &in_view)
                        .await
                        .unwrap_or_default();
                    let mut out = Vec::new();
                    {
                        let view = mailbox.view.lock();
                        for uid in in_view {
                            let msn = match view.msn_of(uid) {
                                Some(msn) => msn,
                                None => continue,
                            };
                            let mut line = format!("* {} FETCH (UID {} FLAGS (", msn, uid);
                            let mut first = true;
                            if view.recent.contains(&uid) {
                                line.push_str("\\Recent");
                                first = false;
                            }
                            for flag in flags.get(&uid).map(|f| f.as_slice()).unwrap_or(&[])
                            {
                                if !first {
                                    line.push(' ');
                                }
                                line.push_str(flag);
                                first = false;
                            }
                            line.push(')');
                            if self.condstore_enabled || mailbox.condstore {
                                if let Some(trivia) = trivia.get(&uid) {
                                    line.push_str(&format!(" MODSEQ ({})", trivia.modseq));
                                }
                            }
                            line.push_str(")\r\n");
                            out.extend_from_slice(line.as_bytes());
                        }
                    }
                    if !out.is_empty() {
                        self.write_bytes(&out).await?;
                    }
                }
            }
        }
        self.responses = keep;
        Ok(())
    }

    async fn nat_tick(&mut self) {
        if let Some(deadline) = self.nat_deadline {
            if Instant::now() >= deadline {
                self.nat_deadline = None;
                if self.is_idle() && self.state.is_authenticated() {
                    let line = format!(
                        "* OK (NAT keepalive: {})\r\n",
                        imap_proto::protocol::iso_time(store::now())
                    );
                    if self.write_bytes(line.as_bytes()).await.is_ok() {
                        self.nat_deadline =
                            Some(Instant::now() + Duration::from_secs(NAT_KEEPALIVE_SECS));
                    }
                }
            }
        }
    }

    pub fn set_client_bug(&mut self, bug: ClientBug) {
        let index = bug as usize;
        if !self.client_bugs[index] {
            self.client_bugs[index] = true;
            tracing::debug!(parent: &self.span, event = "workaround",
                bug = ?bug, "Activating client workaround.");
        }
    }

    pub fn has_client_bug(&self, bug: ClientBug) -> bool {
        self.client_bugs[bug as usize]
    }

    /// Promotes one command out of Unparsed, argument-parses it and either
    /// completes it inline or hands it to a handler task.
    async fn start_command(&mut self, id: u64) {
        let (request, command, tag) = match self.command_mut(id) {
            Some(entry) => {
                let request = match entry.request.take() {
                    Some(request) => request,
                    None => return,
                };
                entry.state = CommandState::Executing;
                (request, entry.command, entry.tag.clone())
            }
            None => return,
        };

        if let Some(result) = self.check_state(command, &tag) {
            self.finish_inline(id, result, false);
            return;
        }

        match command {
            Command::Capability => {
                let caps = format!(
                    "* CAPABILITY {}\r\n",
                    self.imap.capabilities(self.is_tls)
                );
                self.push_untagged(id, caps.into_bytes());
                self.finish_inline(
                    id,
                    StatusResponse::completed(command).with_tag(tag),
                    false,
                );
            }
            Command::Noop => {
                self.finish_inline(
                    id,
                    StatusResponse::completed(command).with_tag(tag),
                    false,
                );
            }
            Command::Logout => {
                self.push_untagged(
                    id,
                    b"* BYE Have a nice day\r\n".to_vec(),
                );
                self.closing = true;
                self.finish_inline(
                    id,
                    StatusResponse::ok("LOGOUT completed").with_tag(tag),
                    false,
                );
            }
            Command::StartTls => {
                self.upgrading = true;
                self.finish_inline(
                    id,
                    StatusResponse::ok("Begin TLS negotiation now").with_tag(tag),
                    false,
                );
            }
            Command::Enable => {
                let mut enabled = Vec::new();
                for token in request.tokens {
                    if token.eq_ignore_ascii_case(b"CONDSTORE") {
                        self.condstore_enabled = true;
                        enabled.push("CONDSTORE");
                    } else if token.eq_ignore_ascii_case(b"QRESYNC") {
                        // QRESYNC implies CONDSTORE.
                        self.condstore_enabled = true;
                        self.qresync_enabled = true;
                        enabled.push("QRESYNC");
                    }
                }
                if !enabled.is_empty() {
                    self.push_untagged(
                        id,
                        format!("* ENABLED {}\r\n", enabled.join(" ")).into_bytes(),
                    );
                }
                self.finish_inline(
                    id,
                    StatusResponse::completed(command).with_tag(tag),
                    false,
                );
            }
            Command::Unselect => {
                if let Some(user) = self.state.user().cloned() {
                    self.mailbox_rx = None;
                    self.responses.clear();
                    self.state = SessionState::Authenticated { user };
                }
                self.finish_inline(
                    id,
                    StatusResponse::completed(command).with_tag(tag),
                    false,
                );
            }
            _ => {
                let handler = crate::op::Handler {
                    imap: self.imap.clone(),
                    command_id: id,
                    tag,
                    tx: self.event_tx.clone(),
                    user: self.state.user().cloned(),
                    mailbox: self.state.mailbox().cloned(),
                    condstore_enabled: self.condstore_enabled,
                    span: self.span.clone(),
                };
                crate::op::spawn_handler(handler, request);
            }
        }
    }

    fn push_untagged(&mut self, id: u64, data: Vec<u8>) {
        if let Some(command) = self.command_mut(id) {
            command.pending.push(data);
        }
    }

    fn finish_inline(&mut self, id: u64, result: StatusResponse, count_error: bool) {
        if count_error && result.is_bad() {
            self.record_syntax_error();
        }
        if let Some(command) = self.command_mut(id) {
            command.result = Some(result);
            command.state = CommandState::Finished;
        }
    }

    /// RFC 3501 state checking; None means the command may proceed.
    fn check_state(&self, command: Command, tag: &str) -> Option<StatusResponse> {
        match command {
            Command::Capability | Command::Noop | Command::Logout => None,
            Command::StartTls => {
                if self.is_tls {
                    Some(StatusResponse::bad("Already in TLS mode.").with_tag(tag))
                } else {
                    None
                }
            }
            Command::Login | Command::Authenticate => {
                if self.state.is_authenticated() {
                    Some(StatusResponse::bad("Already authenticated.").with_tag(tag))
                } else {
                    None
                }
            }
            Command::Enable
            | Command::Select
            | Command::Examine
            | Command::List
            | Command::Status
            | Command::Idle => {
                if self.state.is_authenticated() {
                    None
                } else {
                    Some(StatusResponse::no("Not authenticated.").with_tag(tag))
                }
            }
            Command::Close
            | Command::Unselect
            | Command::Expunge(_)
            | Command::Search(_)
            | Command::Fetch(_)
            | Command::Store(_) => match &self.state {
                SessionState::Selected { mailbox, .. } => {
                    if mailbox.read_only
                        && matches!(command, Command::Store(_) | Command::Expunge(_))
                    {
                        Some(
                            StatusResponse::no("Not permitted in EXAMINE state.")
                                .with_tag(tag),
                        )
                    } else {
                        None
                    }
                }
                SessionState::Authenticated { .. } => Some(
                    StatusResponse::bad("No mailbox is selected.").with_tag(tag),
                ),
                SessionState::NotAuthenticated { .. } => {
                    Some(StatusResponse::no("Not authenticated.").with_tag(tag))
                }
            },
        }
    }
}

async fn mailbox_event(
    rx: &mut Option<broadcast::Receiver<MailboxEvent>>,
) -> Option<MailboxEvent> {
    match rx {
        Some(rx) => match rx.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(_)) => None,
            Err(broadcast::error::RecvError::Closed) => {
                std::future::pending::<()>().await;
                None
            }
        },
        None => {
            std::future::pending::<()>().await;
            None
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
