/*
 * SPDX-FileCopyrightText: 2024 Loriot Project <dev@loriot.email>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use imap_proto::receiver::Request;
use imap_proto::StatusResponse;

use store::watch::MailboxEvent;

use super::{resolve_sequence, Handler};

/// EXPUNGE and UID EXPUNGE. The command's own untagged EXPUNGE responses
/// are emitted here; other sessions hear about it through the mailbox
/// watch.
pub async fn handle(
    handler: &Handler,
    request: Request,
    is_uid: bool,
) -> imap_proto::Result<StatusResponse> {
    let mailbox = handler.selected()?;

    let restrict = match request.tokens.into_iter().next() {
        Some(token) if is_uid => {
            let sequence = imap_proto::parser::parse_sequence_set(&token.unwrap_bytes())
                .map_err(|err| StatusResponse::bad(err).with_tag(handler.tag.clone()))?;
            Some(resolve_sequence(&sequence, &mailbox, true))
        }
        _ => None,
    };

    let expunged = handler
        .imap
        .store
        .expunge(
            mailbox.id,
            restrict.as_deref(),
            handler.user.as_ref().map(|user| user.user.id),
        )
        .await
        .map_err(|err| handler.db_error(err))?;

    if !expunged.is_empty() {
        // Disclose to this session immediately: EXPUNGE is a solo command,
        // so no MSN-dependent command can be in flight here.
        let mut output = Vec::new();
        {
            let mut view = mailbox.view.lock();
            for uid in &expunged {
                view.expunged_pending.retain(|u| u != uid);
                if let Some(msn) = view.remove(*uid) {
                    output.extend_from_slice(format!("* {} EXPUNGE\r\n", msn).as_bytes());
                }
                handler.imap.cache.remove(mailbox.id, *uid);
            }
        }
        handler.untagged(output).await;
        handler
            .imap
            .watches
            .publish(mailbox.id, MailboxEvent::Expunged { uids: expunged });
    }

    Ok(StatusResponse::ok(if is_uid {
        "UID EXPUNGE completed"
    } else {
        "EXPUNGE completed"
    })
    .with_tag(handler.tag.clone()))
}
