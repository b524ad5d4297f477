/*
 * SPDX-FileCopyrightText: 2024 Loriot Project <dev@loriot.email>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::sync::Arc;

use imap_proto::receiver::Request;
use imap_proto::{Command, StatusResponse};
use tokio::sync::mpsc;

use crate::core::session::SessionEvent;
use crate::core::{Imap, SelectedMailbox, SessionUser};

pub mod authenticate;
pub mod close;
pub mod expunge;
pub mod fetch;
pub mod idle;
pub mod list;
pub mod login;
pub mod search;
pub mod select;
pub mod status;
pub mod store;

/// Context handed to a command handler task. Everything a handler does
/// flows back to the session loop as events; the handler never touches the
/// socket.
pub struct Handler {
    pub imap: Arc<Imap>,
    pub command_id: u64,
    pub tag: String,
    pub tx: mpsc::Sender<SessionEvent>,
    pub user: Option<SessionUser>,
    pub mailbox: Option<Arc<SelectedMailbox>>,
    pub condstore_enabled: bool,
    pub span: tracing::Span,
}

impl Handler {
    pub async fn untagged(&self, data: Vec<u8>) {
        let _ = self
            .tx
            .send(SessionEvent::Untagged {
                command_id: self.command_id,
                data,
            })
            .await;
    }

    pub async fn event(&self, event: SessionEvent) {
        let _ = self.tx.send(event).await;
    }

    /// Reserves the connection's input stream for this handler; raw bytes
    /// arrive on the returned channel until release().
    pub async fn reserve(&self) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel(16);
        let _ = self
            .tx
            .send(SessionEvent::Reserve { input: tx })
            .await;
        rx
    }

    pub async fn release(&self) {
        let _ = self.tx.send(SessionEvent::Release).await;
    }

    pub fn db_error(&self, err: ::store::Error) -> StatusResponse {
        tracing::warn!(parent: &self.span, event = "error", reason = %err,
            "Database failure.");
        StatusResponse::database_failure().with_tag(self.tag.clone())
    }

    pub fn selected(&self) -> Result<Arc<SelectedMailbox>, StatusResponse> {
        self.mailbox.clone().ok_or_else(|| {
            StatusResponse::bad("No mailbox is selected.").with_tag(self.tag.clone())
        })
    }
}

pub fn spawn_handler(handler: Handler, request: Request) {
    tokio::spawn(async move {
        let result = match request.command {
            Command::Login => login::handle(&handler, request).await,
            Command::Authenticate => authenticate::handle(&handler, request).await,
            Command::Select | Command::Examine => select::handle(&handler, request).await,
            Command::List => list::handle(&handler, request).await,
            Command::Status => status::handle(&handler, request).await,
            Command::Close => close::handle(&handler).await,
            Command::Expunge(is_uid) => expunge::handle(&handler, request, is_uid).await,
            Command::Search(is_uid) => search::handle(&handler, request, is_uid).await,
            Command::Fetch(is_uid) => fetch::handle(&handler, request, is_uid).await,
            Command::Store(is_uid) => store::handle(&handler, request, is_uid).await,
            Command::Idle => idle::handle(&handler).await,
            other => Err(StatusResponse::bad(format!("{} cannot run as a task.", other))
                .with_tag(handler.tag.clone())),
        };
        let status = match result {
            Ok(status) => status,
            Err(status) => status,
        };
        let _ = handler
            .tx
            .send(SessionEvent::Finished {
                command_id: handler.command_id,
                result: status,
            })
            .await;
    });
}

/// Expands a sequence set against the session view into UIDs, ascending.
/// MSN-form sets resolve through the view; UID-form sets keep missing UIDs
/// out silently.
pub fn resolve_sequence(
    sequence: &imap_proto::protocol::Sequence,
    mailbox: &SelectedMailbox,
    is_uid: bool,
) -> Vec<u32> {
    let view = mailbox.view.lock();
    let mut uids = if is_uid {
        let max = view.max_uid();
        view.uids
            .iter()
            .copied()
            .filter(|uid| sequence.contains(*uid, max))
            .collect::<Vec<_>>()
    } else {
        let exists = view.exists();
        let mut uids = Vec::new();
        for msn in 1..=exists {
            if sequence.contains(msn, exists) {
                if let Some(uid) = view.uid_of(msn) {
                    uids.push(uid);
                }
            }
        }
        uids
    };
    uids.sort_unstable();
    uids
}
