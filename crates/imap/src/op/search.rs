/*
 * SPDX-FileCopyrightText: 2024 Loriot Project <dev@loriot.email>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use imap_proto::parser::search::Key;
use imap_proto::receiver::Request;
use imap_proto::StatusResponse;

use super::Handler;

/// SEARCH and UID SEARCH over flag state, sequence membership and
/// mod-sequences. Content keys are not served by this store.
pub async fn handle(
    handler: &Handler,
    request: Request,
    is_uid: bool,
) -> imap_proto::Result<StatusResponse> {
    let arguments = request.parse_search()?;
    let mailbox = handler.selected()?;

    let uids = {
        let view = mailbox.view.lock();
        view.uids.clone()
    };
    if uids.is_empty() {
        handler.untagged(b"* SEARCH\r\n".to_vec()).await;
        return Ok(finished(handler, is_uid));
    }

    let flags = handler
        .imap
        .store
        .fetch_flags(mailbox.id, &uids)
        .await
        .map_err(|err| handler.db_error(err))?;
    let trivia = handler
        .imap
        .store
        .fetch_trivia(mailbox.id, &uids)
        .await
        .map_err(|err| handler.db_error(err))?;

    let mut matched = Vec::new();
    {
        let view = mailbox.view.lock();
        for uid in &uids {
            let context = MatchContext {
                uid: *uid,
                msn: view.msn_of(*uid).unwrap_or(0),
                max_uid: view.max_uid(),
                exists: view.exists(),
                recent: view.recent.contains(uid),
                flags: flags.get(uid).map(|f| f.as_slice()).unwrap_or(&[]),
                modseq: trivia.get(uid).map(|t| t.modseq).unwrap_or(0),
            };
            if arguments.keys.iter().all(|key| matches(key, &context)) {
                matched.push(context);
            }
        }
    }

    let mut line = String::from("* SEARCH");
    for context in &matched {
        line.push(' ');
        if is_uid {
            line.push_str(&context.uid.to_string());
        } else {
            line.push_str(&context.msn.to_string());
        }
    }
    line.push_str("\r\n");
    handler.untagged(line.into_bytes()).await;

    Ok(finished(handler, is_uid))
}

fn finished(handler: &Handler, is_uid: bool) -> StatusResponse {
    StatusResponse::ok(if is_uid {
        "UID SEARCH completed"
    } else {
        "SEARCH completed"
    })
    .with_tag(handler.tag.clone())
}

struct MatchContext<'x> {
    uid: u32,
    msn: u32,
    max_uid: u32,
    exists: u32,
    recent: bool,
    flags: &'x [String],
    modseq: u64,
}

fn has_flag(context: &MatchContext<'_>, flag: &str) -> bool {
    context
        .flags
        .iter()
        .any(|f| f.eq_ignore_ascii_case(flag))
}

fn matches(key: &Key, context: &MatchContext<'_>) -> bool {
    match key {
        Key::All => true,
        Key::Answered => has_flag(context, "\\Answered"),
        Key::Deleted => has_flag(context, "\\Deleted"),
        Key::Draft => has_flag(context, "\\Draft"),
        Key::Flagged => has_flag(context, "\\Flagged"),
        Key::Seen => has_flag(context, "\\Seen"),
        Key::Recent => context.recent,
        Key::Unanswered => !has_flag(context, "\\Answered"),
        Key::Undeleted => !has_flag(context, "\\Deleted"),
        Key::Undraft => !has_flag(context, "\\Draft"),
        Key::Unflagged => !has_flag(context, "\\Flagged"),
        Key::Unseen => !has_flag(context, "\\Seen"),
        Key::Keyword(flag) => has_flag(context, flag.as_imap()),
        Key::Unkeyword(flag) => !has_flag(context, flag.as_imap()),
        Key::Sequence(sequence) => sequence.contains(context.msn, context.exists),
        Key::Uid(sequence) => sequence.contains(context.uid, context.max_uid),
        Key::ModSeq(limit) => context.modseq >= *limit,
        Key::Not(inner) => !matches(inner, context),
        Key::Or(left, right) => matches(left, context) || matches(right, context),
        Key::And(keys) => keys.iter().all(|inner| matches(inner, context)),
    }
}
