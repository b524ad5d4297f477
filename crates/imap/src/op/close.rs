/*
 * SPDX-FileCopyrightText: 2024 Loriot Project <dev@loriot.email>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use imap_proto::StatusResponse;

use store::watch::MailboxEvent;
use crate::core::session::SessionEvent;

use super::Handler;

/// CLOSE: silently expunge, then drop the selection. No untagged EXPUNGE
/// responses are sent to this session.
pub async fn handle(handler: &Handler) -> imap_proto::Result<StatusResponse> {
    let mailbox = handler.selected()?;

    if !mailbox.read_only {
        let expunged = handler
            .imap
            .store
            .expunge(
                mailbox.id,
                None,
                handler.user.as_ref().map(|user| user.user.id),
            )
            .await
            .map_err(|err| handler.db_error(err))?;
        if !expunged.is_empty() {
            for uid in &expunged {
                handler.imap.cache.remove(mailbox.id, *uid);
            }
            handler
                .imap
                .watches
                .publish(mailbox.id, MailboxEvent::Expunged { uids: expunged });
        }
    }

    handler.event(SessionEvent::Deselected).await;
    Ok(StatusResponse::ok("CLOSE completed").with_tag(handler.tag.clone()))
}
