/*
 * SPDX-FileCopyrightText: 2024 Loriot Project <dev@loriot.email>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::sync::Arc;

use imap_proto::receiver::Request;
use imap_proto::{Command, ResponseCode, StatusResponse};
use parking_lot::Mutex;

use crate::core::session::SessionEvent;
use crate::core::{MailboxView, SelectedMailbox};

use super::Handler;

pub async fn handle(handler: &Handler, request: Request) -> imap_proto::Result<StatusResponse> {
    let read_only = request.command == Command::Examine;
    let arguments = request.parse_select()?;
    let user = handler.user.clone().ok_or_else(|| {
        StatusResponse::no("Not authenticated.").with_tag(handler.tag.clone())
    })?;

    // INBOX resolves to the user's own inbox, case-insensitively.
    let name = if arguments.mailbox_name.eq_ignore_ascii_case("INBOX") {
        store::users::inbox_name(&user.user.login)
    } else {
        arguments.mailbox_name.clone()
    };

    let mailbox = match handler
        .imap
        .store
        .mailbox_by_name(&name)
        .await
        .map_err(|err| handler.db_error(err))?
    {
        Some(mailbox) => mailbox,
        None => {
            return Ok(StatusResponse::no(format!(
                "Mailbox {:?} does not exist.",
                arguments.mailbox_name
            ))
            .with_code(ResponseCode::NonExistent)
            .with_tag(handler.tag.clone()));
        }
    };

    let uids = handler
        .imap
        .store
        .mailbox_uids(mailbox.id)
        .await
        .map_err(|err| handler.db_error(err))?;
    let counts = handler
        .imap
        .store
        .mailbox_counts(mailbox.id)
        .await
        .map_err(|err| handler.db_error(err))?;
    let recent = handler.imap.recent.claim(mailbox.id, &uids);
    let highest_modseq = mailbox.next_modseq.saturating_sub(1);

    // A session switching mailboxes tells the client the old one is gone.
    if handler.mailbox.is_some() {
        handler
            .untagged(b"* OK [CLOSED] Previous mailbox closed\r\n".to_vec())
            .await;
    }

    let mut output = Vec::with_capacity(256);
    output.extend_from_slice(format!("* {} EXISTS\r\n", uids.len()).as_bytes());
    output.extend_from_slice(format!("* {} RECENT\r\n", recent.len()).as_bytes());
    output.extend_from_slice(
        b"* FLAGS (\\Answered \\Flagged \\Deleted \\Seen \\Draft)\r\n",
    );
    StatusResponse::ok("permanent flags")
        .with_code(ResponseCode::PermanentFlags {
            flags: vec![
                imap_proto::protocol::Flag::Answered,
                imap_proto::protocol::Flag::Flagged,
                imap_proto::protocol::Flag::Deleted,
                imap_proto::protocol::Flag::Seen,
                imap_proto::protocol::Flag::Draft,
                imap_proto::protocol::Flag::Keyword("\\*".into()),
            ],
        })
        .serialize(&mut output);
    StatusResponse::ok("uids are stable")
        .with_code(ResponseCode::UidValidity {
            uid_validity: mailbox.uid_validity,
        })
        .serialize(&mut output);
    StatusResponse::ok("predicted next uid")
        .with_code(ResponseCode::UidNext {
            uid_next: mailbox.uid_next,
        })
        .serialize(&mut output);
    if let Some(first_unseen) = counts.first_unseen_uid {
        let msn = uids
            .iter()
            .position(|uid| *uid == first_unseen)
            .map(|index| index as u32 + 1)
            .unwrap_or(1);
        StatusResponse::ok("first unseen")
            .with_code(ResponseCode::Unseen { unseen: msn })
            .serialize(&mut output);
    }
    StatusResponse::ok("modseq tracked")
        .with_code(ResponseCode::HighestModseq {
            modseq: highest_modseq,
        })
        .serialize(&mut output);
    handler.untagged(output).await;

    let selected = Arc::new(SelectedMailbox {
        id: mailbox.id,
        name,
        uid_validity: mailbox.uid_validity,
        read_only,
        condstore: arguments.condstore,
        view: Mutex::new(MailboxView {
            uids,
            recent,
            expunged_pending: Vec::new(),
            highest_modseq,
        }),
    });
    handler
        .event(SessionEvent::Selected { mailbox: selected })
        .await;

    Ok(StatusResponse::ok(if read_only {
        "EXAMINE completed"
    } else {
        "SELECT completed"
    })
    .with_code(if read_only {
        ResponseCode::ReadOnly
    } else {
        ResponseCode::ReadWrite
    })
    .with_tag(handler.tag.clone()))
}
