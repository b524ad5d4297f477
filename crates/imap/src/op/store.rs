/*
 * SPDX-FileCopyrightText: 2024 Loriot Project <dev@loriot.email>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use imap_proto::parser::store::Operation;
use imap_proto::receiver::Request;
use imap_proto::StatusResponse;

use store::watch::MailboxEvent;
use store::mailbox::FlagOperation;

use super::{resolve_sequence, Handler};

/// STORE and UID STORE: flag mutation with CONDSTORE conditionals. Every
/// modified row moves to the mailbox's current modseq, and the mailbox
/// counter advances by one.
pub async fn handle(
    handler: &Handler,
    request: Request,
    is_uid: bool,
) -> imap_proto::Result<StatusResponse> {
    let arguments = request.parse_store()?;
    let mailbox = handler.selected()?;

    let uids = resolve_sequence(&arguments.sequence_set, &mailbox, is_uid);
    if uids.is_empty() {
        return Ok(StatusResponse::ok("STORE completed, nothing to do")
            .with_tag(handler.tag.clone()));
    }

    let operation = match arguments.operation {
        Operation::Set => FlagOperation::Set,
        Operation::Add => FlagOperation::Add,
        Operation::Clear => FlagOperation::Clear,
    };
    let flags = arguments
        .flags
        .iter()
        .map(|flag| flag.as_imap().to_string())
        .collect::<Vec<_>>();

    let result = handler
        .imap
        .store
        .store_flags(
            mailbox.id,
            &uids,
            operation,
            &flags,
            arguments.unchanged_since,
        )
        .await
        .map_err(|err| handler.db_error(err))?;

    // Everyone sees the new flags; the flags facet in the cache is stale.
    for (uid, _, _) in &result.modified {
        if let Some(entry) = handler.imap.cache.find(mailbox.id, *uid) {
            let mut data = entry.lock();
            data.flags = None;
            data.trivia = None;
        }
    }

    if !arguments.silent || handler.condstore_enabled || mailbox.condstore {
        let mut output = Vec::new();
        {
            let view = mailbox.view.lock();
            for (uid, modseq, flags) in &result.modified {
                let msn = match view.msn_of(*uid) {
                    Some(msn) => msn,
                    None => continue,
                };
                let mut line = format!("* {} FETCH (", msn);
                if is_uid {
                    line.push_str(&format!("UID {} ", uid));
                }
                if !arguments.silent {
                    line.push_str("FLAGS (");
                    let mut first = true;
                    if view.recent.contains(uid) {
                        line.push_str("\\Recent");
                        first = false;
                    }
                    for flag in flags {
                        if !first {
                            line.push(' ');
                        }
                        line.push_str(flag);
                        first = false;
                    }
                    line.push(')');
                }
                if handler.condstore_enabled || mailbox.condstore {
                    if !arguments.silent {
                        line.push(' ');
                    }
                    line.push_str(&format!("MODSEQ ({})", modseq));
                }
                line.push_str(")\r\n");
                output.extend_from_slice(line.as_bytes());
            }
        }
        if !output.is_empty() {
            handler.untagged(output).await;
        }
    }

    if !result.modified.is_empty() {
        handler.imap.watches.publish(
            mailbox.id,
            MailboxEvent::FlagsChanged {
                uids: result.modified.iter().map(|(uid, _, _)| *uid).collect(),
            },
        );
    }

    let command = if is_uid { "UID STORE" } else { "STORE" };
    if result.failed.is_empty() {
        Ok(StatusResponse::ok(format!("{} completed", command))
            .with_tag(handler.tag.clone()))
    } else {
        // RFC 4551: rows that failed UNCHANGEDSINCE come back in MODIFIED.
        let failed = if is_uid {
            result.failed.clone()
        } else {
            let view = mailbox.view.lock();
            result
                .failed
                .iter()
                .filter_map(|uid| view.msn_of(*uid))
                .collect()
        };
        let set = failed
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        Ok(
            StatusResponse::ok(format!("[MODIFIED {}] Conditional {} failed", set, command))
                .with_tag(handler.tag.clone()),
        )
    }
}
