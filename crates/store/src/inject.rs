/*
 * SPDX-FileCopyrightText: 2024 Loriot Project <dev@loriot.email>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use mail_parser::{Encoding, HeaderValue, Message, MessageParser, PartType};

use crate::model::{
    FIELD_BCC, FIELD_CC, FIELD_FROM, FIELD_REPLY_TO, FIELD_SENDER, FIELD_TO,
};
use crate::{now, Error, Result, Store};

/// A message to be written to the store: content rows once, one mailbox row
/// per local recipient, one spooled delivery per remote recipient.
#[derive(Debug, Default)]
pub struct Injection {
    pub raw: Vec<u8>,
    pub internal_date: i64,
    pub flags: Vec<String>,
    pub local_mailboxes: Vec<u32>,
    pub remote: Option<RemoteDelivery>,
}

#[derive(Debug)]
pub struct RemoteDelivery {
    /// Envelope sender; empty localpart and domain for the null sender.
    pub sender: (String, String),
    pub recipients: Vec<(String, String)>,
    pub expires_at: i64,
    pub deliver_after: Option<i64>,
}

#[derive(Debug, Default)]
pub struct InjectResult {
    pub message_id: u32,
    /// (mailbox id, uid) per local recipient mailbox.
    pub mailbox_uids: Vec<(u32, u32)>,
    pub delivery_id: Option<u32>,
}

#[derive(Default)]
struct ContentRows {
    parts: Vec<(String, u32, u32, u32)>,
    headers: Vec<(String, i32, String, String)>,
    addresses: Vec<(String, i32, i32, Option<String>, Option<String>, String, String)>,
}

impl Store {
    /// Parses and writes a message in a single transaction, spooling remote
    /// deliveries and notifying the spool manager on commit.
    pub async fn inject(&self, injection: Injection) -> Result<InjectResult> {
        let message = MessageParser::default()
            .parse(&injection.raw)
            .ok_or_else(|| Error::Consistency("unparseable message".into()))?;
        let mut rows = ContentRows::default();
        collect_message(&message, 0, "", true, &mut rows, &injection.raw);
        drop(message);

        let client = self.begin().await?;
        let result = self.inject_in(&client, &injection, rows).await;
        match result {
            Ok(result) => {
                Store::commit(client).await?;
                Ok(result)
            }
            Err(err) => {
                let _ = Store::rollback(client).await;
                Err(err)
            }
        }
    }

    async fn inject_in(
        &self,
        client: &deadpool_postgres::Client,
        injection: &Injection,
        rows: ContentRows,
    ) -> Result<InjectResult> {
        let message_row = client
            .query_one(
                "INSERT INTO messages (idate, rfc822size) VALUES ($1, $2) RETURNING id",
                &[&injection.internal_date, &(injection.raw.len() as i32)],
            )
            .await?;
        let message_id: i32 = message_row.get(0);

        let bodypart_row = client
            .query_one(
                "INSERT INTO bodyparts (bytes, data) VALUES ($1, $2) RETURNING id",
                &[&(injection.raw.len() as i32), &injection.raw],
            )
            .await?;
        let bodypart_id: i32 = bodypart_row.get(0);

        for (part, header_offset, body_offset, end_offset) in &rows.parts {
            let bytes = end_offset.saturating_sub(*body_offset) as i32;
            let lines = injection
                .raw
                .get(*body_offset as usize..*end_offset as usize)
                .map(|slice| slice.iter().filter(|&&ch| ch == b'\n').count())
                .unwrap_or(0) as i32;
            let bodypart = if part.is_empty() {
                Some(bodypart_id)
            } else {
                None
            };
            client
                .execute(
                    "INSERT INTO part_numbers
                     (message, part, bodypart, header_offset, body_offset, end_offset,
                      bytes, lines)
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                     ON CONFLICT (message, part) DO NOTHING",
                    &[
                        &message_id,
                        part,
                        &bodypart,
                        &(*header_offset as i32),
                        &(*body_offset as i32),
                        &(*end_offset as i32),
                        &bytes,
                        &lines,
                    ],
                )
                .await?;
        }

        for (part, position, field, value) in &rows.headers {
            client
                .execute(
                    "INSERT INTO header_fields (message, part, position, field, value)
                     VALUES ($1, $2, $3, $4, $5)",
                    &[&message_id, part, position, field, value],
                )
                .await?;
        }

        for (part, position, field, group_name, name, localpart, domain) in &rows.addresses {
            client
                .execute(
                    "INSERT INTO address_fields
                     (message, part, position, field, group_name, name, localpart, domain)
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
                    &[
                        &message_id,
                        part,
                        position,
                        field,
                        group_name,
                        name,
                        localpart,
                        domain,
                    ],
                )
                .await?;
        }

        let mut result = InjectResult {
            message_id: message_id as u32,
            ..Default::default()
        };

        for mailbox_id in &injection.local_mailboxes {
            let row = client
                .query_one(
                    "UPDATE mailboxes
                     SET uidnext = uidnext + 1, nextmodseq = nextmodseq + 1
                     WHERE id = $1
                     RETURNING uidnext - 1, nextmodseq - 1",
                    &[&(*mailbox_id as i32)],
                )
                .await?;
            let uid: i32 = row.get(0);
            let modseq: i64 = row.get(1);
            client
                .execute(
                    "INSERT INTO mailbox_messages (mailbox, uid, message, modseq)
                     VALUES ($1, $2, $3, $4)",
                    &[&(*mailbox_id as i32), &uid, &message_id, &modseq],
                )
                .await?;
            for flag in &injection.flags {
                client
                    .execute(
                        "INSERT INTO flags (mailbox, uid, flag) VALUES ($1, $2, $3)
                         ON CONFLICT DO NOTHING",
                        &[&(*mailbox_id as i32), &uid, flag],
                    )
                    .await?;
            }
            result.mailbox_uids.push((*mailbox_id, uid as u32));
        }

        if let Some(remote) = &injection.remote {
            // Spooled deliveries reference the copy in the spool mailbox, or
            // failing that the first local copy.
            let (spool_mailbox, spool_uid) = match result.mailbox_uids.first() {
                Some(first) => *first,
                None => {
                    return Err(Error::Consistency(
                        "spooled message has no mailbox copy".into(),
                    ))
                }
            };
            let sender_id = self
                .address_id(client, "", &remote.sender.0, &remote.sender.1)
                .await? as i32;
            let delivery = client
                .query_one(
                    "INSERT INTO deliveries
                     (mailbox, uid, sender, injected_at, expires_at, deliver_after)
                     VALUES ($1, $2, $3, $4, $5, $6) RETURNING id",
                    &[
                        &(spool_mailbox as i32),
                        &(spool_uid as i32),
                        &sender_id,
                        &now(),
                        &remote.expires_at,
                        &remote.deliver_after,
                    ],
                )
                .await?;
            let delivery_id: i32 = delivery.get(0);
            for (localpart, domain) in &remote.recipients {
                let recipient_id = self.address_id(client, "", localpart, domain).await? as i32;
                client
                    .execute(
                        "INSERT INTO delivery_recipients (delivery, recipient)
                         VALUES ($1, $2) ON CONFLICT DO NOTHING",
                        &[&delivery_id, &recipient_id],
                    )
                    .await?;
            }
            client
                .execute(&format!("NOTIFY {}", crate::DELIVERIES_CHANNEL), &[])
                .await?;
            result.delivery_id = Some(delivery_id as u32);
        }

        Ok(result)
    }
}

/// Collects part, header and address rows for one (possibly nested) message.
/// `base` is the byte offset of this message within the outermost raw text;
/// `prefix` is its IMAP part prefix ("" for the outer message, "2" for a
/// message/rfc822 at part 2, and so on). Message/rfc822 parts keep the part
/// row pushed by their enclosing walk, so `push_row` is false for them.
fn collect_message(
    message: &Message<'_>,
    base: u32,
    prefix: &str,
    push_row: bool,
    rows: &mut ContentRows,
    raw: &[u8],
) {
    let root = match message.parts.first() {
        Some(root) => root,
        None => return,
    };

    let end = if prefix.is_empty() {
        raw.len() as u32
    } else {
        base + root.offset_end as u32
    };
    if push_row {
        rows.parts.push((
            prefix.to_string(),
            base + root.offset_header as u32,
            base + root.offset_body as u32,
            end,
        ));
    }

    collect_headers(message, 0, base, prefix, 0, rows, raw);
    collect_addresses(message, 0, prefix, rows);

    match &root.body {
        PartType::Multipart(children) => {
            for (index, child) in children.iter().enumerate() {
                let number = child_number(prefix, index);
                collect_part(message, *child as usize, base, &number, rows, raw);
            }
        }
        _ => {
            // Single-part message: the body is also addressable as part 1.
            let number = child_number(prefix, 0);
            rows.parts.push((
                number,
                base + root.offset_header as u32,
                base + root.offset_body as u32,
                end,
            ));
        }
    }
}

fn collect_part(
    message: &Message<'_>,
    part_id: usize,
    base: u32,
    number: &str,
    rows: &mut ContentRows,
    raw: &[u8],
) {
    let part = match message.parts.get(part_id) {
        Some(part) => part,
        None => return,
    };

    rows.parts.push((
        number.to_string(),
        base + part.offset_header as u32,
        base + part.offset_body as u32,
        base + part.offset_end as u32,
    ));

    match &part.body {
        PartType::Multipart(children) => {
            collect_headers(message, part_id, base, number, 0, rows, raw);
            for (index, child) in children.iter().enumerate() {
                let child_num = child_number(number, index);
                collect_part(message, *child as usize, base, &child_num, rows, raw);
            }
        }
        PartType::Message(nested) if matches!(part.encoding, Encoding::None) => {
            // The MIME header block of the enclosing part is stored with
            // negative positions; the embedded message's own header takes
            // the regular ones. The part row pushed above already spans the
            // embedded message, so the nested walk adds no row of its own.
            collect_headers(message, part_id, base, number, -1000, rows, raw);
            collect_message(
                nested,
                base + part.offset_body as u32,
                number,
                false,
                rows,
                raw,
            );
        }
        _ => {
            collect_headers(message, part_id, base, number, 0, rows, raw);
        }
    }
}

fn collect_headers(
    message: &Message<'_>,
    part_id: usize,
    base: u32,
    part_key: &str,
    position_base: i32,
    rows: &mut ContentRows,
    raw: &[u8],
) {
    let part = match message.parts.get(part_id) {
        Some(part) => part,
        None => return,
    };
    for (index, header) in part.headers.iter().enumerate() {
        let start = base as usize + header.offset_start as usize;
        let end = base as usize + header.offset_end as usize;
        let value = raw
            .get(start..end)
            .map(unfold_header_value)
            .unwrap_or_default();
        rows.headers.push((
            part_key.to_string(),
            position_base + index as i32,
            header.name.as_str().to_string(),
            value,
        ));
    }
}

fn collect_addresses(message: &Message<'_>, part_id: usize, part_key: &str, rows: &mut ContentRows) {
    let part = match message.parts.get(part_id) {
        Some(part) => part,
        None => return,
    };
    for header in &part.headers {
        let field = match header.name.as_str() {
            "From" => FIELD_FROM,
            "Sender" => FIELD_SENDER,
            "Reply-To" => FIELD_REPLY_TO,
            "To" => FIELD_TO,
            "Cc" => FIELD_CC,
            "Bcc" => FIELD_BCC,
            _ => continue,
        };
        let mut position = rows
            .addresses
            .iter()
            .filter(|row| row.0 == part_key && row.2 == field)
            .count() as i32;
        match &header.value {
            HeaderValue::Address(mail_parser::Address::List(addrs)) => {
                for addr in addrs {
                    push_address(rows, part_key, position, field, None, addr);
                    position += 1;
                }
            }
            HeaderValue::Address(mail_parser::Address::Group(groups)) => {
                for group in groups {
                    let group_name = group
                        .name
                        .as_ref()
                        .map(|name| name.to_string())
                        .unwrap_or_default();
                    if group.addresses.is_empty() {
                        // Empty groups keep a placeholder row so the
                        // envelope can render the group sentinels.
                        rows.addresses.push((
                            part_key.to_string(),
                            position,
                            field,
                            Some(group_name.clone()),
                            None,
                            String::new(),
                            String::new(),
                        ));
                        position += 1;
                    }
                    for addr in &group.addresses {
                        push_address(
                            rows,
                            part_key,
                            position,
                            field,
                            Some(group_name.clone()),
                            addr,
                        );
                        position += 1;
                    }
                }
            }
            _ => (),
        }
    }
}

fn push_address(
    rows: &mut ContentRows,
    part_key: &str,
    position: i32,
    field: i32,
    group_name: Option<String>,
    addr: &mail_parser::Addr<'_>,
) {
    let address = addr.address.as_deref().unwrap_or_default();
    let (localpart, domain) = address.split_once('@').unwrap_or((address, ""));
    rows.addresses.push((
        part_key.to_string(),
        position,
        field,
        group_name,
        addr.name.as_ref().map(|name| name.to_string()),
        localpart.to_string(),
        domain.to_string(),
    ));
}

fn child_number(prefix: &str, index: usize) -> String {
    if prefix.is_empty() {
        format!("{}", index + 1)
    } else {
        format!("{}.{}", prefix, index + 1)
    }
}

fn unfold_header_value(value: &[u8]) -> String {
    let text = String::from_utf8_lossy(value);
    let mut out = String::with_capacity(text.len());
    for line in text.split("\r\n") {
        let trimmed = if out.is_empty() {
            line.trim_end()
        } else {
            line.trim()
        };
        if !out.is_empty() && !trimmed.is_empty() {
            out.push(' ');
        }
        out.push_str(trimmed);
    }
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE: &[u8] = b"Date: Mon, 7 Feb 1994 21:52:25 -0800\r\n\
From: Fred Foobar <foobar@example.com>\r\n\
To: Friends: jdoe@example.com, jane@example.com;\r\n\
Subject: afternoon meeting\r\n\
Content-Type: text/plain\r\n\
\r\n\
Hello Joe, do you think we can meet at 3:30 tomorrow?\r\n";

    #[test]
    fn collect_simple_message() {
        let message = MessageParser::default().parse(SIMPLE).unwrap();
        let mut rows = ContentRows::default();
        collect_message(&message, 0, "", true, &mut rows, SIMPLE);

        let whole = rows.parts.iter().find(|p| p.0.is_empty()).unwrap();
        assert_eq!(whole.1, 0);
        assert_eq!(whole.3 as usize, SIMPLE.len());
        assert!(rows.parts.iter().any(|p| p.0 == "1"));

        let subject = rows
            .headers
            .iter()
            .find(|h| h.0.is_empty() && h.2 == "Subject")
            .unwrap();
        assert_eq!(subject.3, "afternoon meeting");

        let from = rows
            .addresses
            .iter()
            .find(|a| a.2 == FIELD_FROM)
            .unwrap();
        assert_eq!(from.5, "foobar");
        assert_eq!(from.6, "example.com");

        let group_members = rows
            .addresses
            .iter()
            .filter(|a| a.2 == FIELD_TO && a.3.as_deref() == Some("Friends"))
            .count();
        assert_eq!(group_members, 2);
    }

    const NESTED: &[u8] = b"From: outer@example.com\r\n\
Subject: enclosing\r\n\
Content-Type: multipart/mixed; boundary=\"xyz\"\r\n\
\r\n\
--xyz\r\n\
Content-Type: text/plain\r\n\
\r\n\
cover note\r\n\
--xyz\r\n\
Content-Type: message/rfc822\r\n\
\r\n\
From: inner@example.net\r\n\
Subject: enclosed\r\n\
Content-Type: text/plain\r\n\
\r\n\
inner body\r\n\
--xyz--\r\n";

    #[test]
    fn collect_nested_message() {
        let message = MessageParser::default().parse(NESTED).unwrap();
        let mut rows = ContentRows::default();
        collect_message(&message, 0, "", true, &mut rows, NESTED);

        for part in ["", "1", "2", "2.1"] {
            assert!(
                rows.parts.iter().any(|p| p.0 == part),
                "missing part {:?} in {:?}",
                part,
                rows.parts
            );
        }

        // The embedded message's header lands at regular positions under
        // part 2; the enclosing MIME block at negative ones.
        let embedded_subject = rows
            .headers
            .iter()
            .find(|h| h.0 == "2" && h.2 == "Subject" && h.1 >= 0)
            .unwrap();
        assert_eq!(embedded_subject.3, "enclosed");
        assert!(rows
            .headers
            .iter()
            .any(|h| h.0 == "2" && h.2 == "Content-Type" && h.1 < 0));

        // Inner body offsets slice the inner text out of the outer raw.
        let inner = rows.parts.iter().find(|p| p.0 == "2.1").unwrap();
        let body = &NESTED[inner.2 as usize..inner.3 as usize];
        assert_eq!(body, b"inner body\r\n");
    }

    #[test]
    fn header_unfolding() {
        assert_eq!(
            unfold_header_value(b"a folded\r\n  value here"),
            "a folded value here"
        );
        assert_eq!(unfold_header_value(b"plain\r\n"), "plain");
    }
}
