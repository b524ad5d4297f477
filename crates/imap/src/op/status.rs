/*
 * SPDX-FileCopyrightText: 2024 Loriot Project <dev@loriot.email>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use imap_proto::parser::status::Item;
use imap_proto::receiver::Request;
use imap_proto::{ResponseCode, StatusResponse};

use super::Handler;

pub async fn handle(handler: &Handler, request: Request) -> imap_proto::Result<StatusResponse> {
    let arguments = request.parse_status()?;
    let user = handler.user.clone().ok_or_else(|| {
        StatusResponse::no("Not authenticated.").with_tag(handler.tag.clone())
    })?;

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
    let counts = handler
        .imap
        .store
        .mailbox_counts(mailbox.id)
        .await
        .map_err(|err| handler.db_error(err))?;

    let mut items = Vec::with_capacity(arguments.items.len());
    for item in &arguments.items {
        let value = match item {
            Item::Messages => counts.messages as u64,
            // Recent is a per-session notion; STATUS reports none.
            Item::Recent => 0,
            Item::UidNext => mailbox.uid_next as u64,
            Item::UidValidity => mailbox.uid_validity as u64,
            Item::Unseen => counts.unseen as u64,
            Item::HighestModSeq => mailbox.next_modseq.saturating_sub(1),
        };
        items.push(format!("{} {}", item.as_str(), value));
    }

    handler
        .untagged(
            format!(
                "* STATUS {} ({})\r\n",
                arguments.mailbox_name,
                items.join(" ")
            )
            .into_bytes(),
        )
        .await;

    Ok(StatusResponse::ok("STATUS completed").with_tag(handler.tag.clone()))
}
