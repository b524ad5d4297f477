/*
 * SPDX-FileCopyrightText: 2024 Loriot Project <dev@loriot.email>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use imap_proto::protocol::wildcard_match;
use imap_proto::receiver::Request;
use imap_proto::StatusResponse;

use super::Handler;

/// LIST with flat reference/pattern matching over the mailbox table. The
/// user sees their own mailboxes plus unowned (shared) ones; INBOX is
/// presented under its IMAP alias.
pub async fn handle(handler: &Handler, request: Request) -> imap_proto::Result<StatusResponse> {
    let mut tokens = request.tokens.into_iter();
    let reference = tokens
        .next()
        .ok_or_else(|| {
            StatusResponse::bad("Missing reference name.").with_tag(handler.tag.clone())
        })?
        .unwrap_string()
        .map_err(|err| StatusResponse::bad(err).with_tag(handler.tag.clone()))?;
    let pattern = tokens
        .next()
        .ok_or_else(|| {
            StatusResponse::bad("Missing mailbox pattern.").with_tag(handler.tag.clone())
        })?
        .unwrap_string()
        .map_err(|err| StatusResponse::bad(err).with_tag(handler.tag.clone()))?;

    let user = handler.user.clone().ok_or_else(|| {
        StatusResponse::no("Not authenticated.").with_tag(handler.tag.clone())
    })?;

    if pattern.is_empty() {
        // An empty pattern asks for the hierarchy delimiter.
        handler
            .untagged(b"* LIST (\\Noselect) \"/\" \"\"\r\n".to_vec())
            .await;
        return Ok(StatusResponse::ok("LIST completed").with_tag(handler.tag.clone()));
    }

    let full_pattern = format!("{}{}", reference, pattern);
    let inbox = store::users::inbox_name(&user.user.login);
    let mailboxes = handler
        .imap
        .store
        .list_mailboxes(Some(user.user.id))
        .await
        .map_err(|err| handler.db_error(err))?;

    let mut output = Vec::new();
    for mailbox in &mailboxes {
        // The user's INBOX is listed under its alias.
        let shown_name = if mailbox.name == inbox {
            "INBOX"
        } else {
            mailbox.name.as_str()
        };
        if wildcard_match(&full_pattern, shown_name)
            || (shown_name == "INBOX" && full_pattern.eq_ignore_ascii_case("inbox"))
        {
            output.extend_from_slice(
                format!("* LIST () \"/\" \"{}\"\r\n", shown_name).as_bytes(),
            );
        }
    }
    if !output.is_empty() {
        handler.untagged(output).await;
    }

    Ok(StatusResponse::ok("LIST completed").with_tag(handler.tag.clone()))
}
