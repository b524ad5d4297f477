/*
 * SPDX-FileCopyrightText: 2024 Loriot Project <dev@loriot.email>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use imap_proto::protocol::fetch::{
    AnnotationEntry, Attribute, DataItem, FetchItem,
};
use imap_proto::protocol::{wildcard_match, Flag};
use imap_proto::receiver::Request;
use imap_proto::StatusResponse;
use tokio::sync::mpsc;

use crate::core::SelectedMailbox;
use crate::mime;
use store::mailbox::FlagOperation;
use store::model::{FacetSet, MessageData};
use store::Store;

use super::Handler;

/// Divisor for the adaptive response rate: each 1 Hz tick emits
/// `backlog / TRICKLE_DIVISOR` responses, with a floor of one.
pub const TRICKLE_DIVISOR: usize = 90;

/// Computes the facets a fetch needs. ENVELOPE implies headers and
/// addresses; BODY/BODYSTRUCTURE additionally imply part numbers; sections
/// imply the raw body.
pub fn facets_for(attributes: &[Attribute], condstore: bool) -> FacetSet {
    let mut facets = FacetSet::default();
    if condstore {
        facets.trivia = true;
    }
    for attribute in attributes {
        match attribute {
            Attribute::Envelope => {
                facets.headers = true;
                facets.addresses = true;
            }
            Attribute::Body | Attribute::BodyStructure => {
                // message/rfc822 parts render their envelope inside the
                // structure, so addresses and headers ride along.
                facets.headers = true;
                facets.addresses = true;
                facets.part_numbers = true;
            }
            Attribute::BodySection { .. }
            | Attribute::Binary { .. }
            | Attribute::BinarySize { .. }
            | Attribute::Rfc822
            | Attribute::Rfc822Text => {
                facets.headers = true;
                facets.bodies = true;
                facets.part_numbers = true;
            }
            Attribute::Rfc822Header => {
                facets.headers = true;
                facets.bodies = true;
                facets.part_numbers = true;
            }
            Attribute::Flags => facets.flags = true,
            Attribute::InternalDate | Attribute::Rfc822Size | Attribute::ModSeq => {
                facets.trivia = true;
            }
            Attribute::Annotation { .. } => facets.annotations = true,
            Attribute::Uid => (),
        }
    }
    facets
}

enum FacetResult {
    Addresses(AHashMap<u32, Vec<store::model::AddressRow>>),
    Headers(AHashMap<u32, Vec<store::model::HeaderRow>>),
    Raw(AHashMap<u32, Vec<u8>>),
    PartNumbers(AHashMap<u32, Vec<store::model::PartRow>>),
    Flags(AHashMap<u32, Vec<String>>),
    Trivia(AHashMap<u32, store::model::Trivia>),
    Annotations(AHashMap<u32, Vec<store::model::AnnotationRow>>),
    Failed,
}

pub async fn handle(
    handler: &Handler,
    request: Request,
    is_uid: bool,
) -> imap_proto::Result<StatusResponse> {
    let arguments = request.parse_fetch()?;
    let mailbox = handler.selected()?;

    let mut attributes = arguments.attributes;
    if is_uid && !attributes.contains(&Attribute::Uid) {
        attributes.insert(0, Attribute::Uid);
    }
    let condstore = handler.condstore_enabled
        || mailbox.condstore
        || arguments.changed_since.is_some()
        || attributes.contains(&Attribute::ModSeq);
    if condstore && !attributes.contains(&Attribute::ModSeq) {
        attributes.push(Attribute::ModSeq);
    }

    let mut uids = super::resolve_sequence(&arguments.sequence_set, &mailbox, is_uid);

    // RFC 2180 section 4.1.2: an MSN-form fetch that references messages
    // expunged by another session finishes with NO; UID FETCH stays silent
    // about them.
    let expunged = if !is_uid {
        let view = mailbox.view.lock();
        uids.iter()
            .copied()
            .filter(|uid| view.is_expunged_pending(*uid))
            .collect::<Vec<_>>()
    } else {
        Vec::new()
    };
    uids.retain(|uid| !expunged.contains(uid));

    // CHANGEDSINCE narrows the set inside a transaction; the row locks are
    // held until the fetch is done.
    let mut narrowing = None;
    if let Some(changed_since) = arguments.changed_since {
        let client = handler
            .imap
            .store
            .begin()
            .await
            .map_err(|err| handler.db_error(err))?;
        match Store::changed_uids(&client, mailbox.id, &uids, changed_since).await {
            Ok(mut changed) => {
                changed.sort_unstable();
                uids = changed;
                narrowing = Some(client);
            }
            Err(err) => {
                let _ = Store::rollback(client).await;
                return Err(handler.db_error(err));
            }
        }
    }

    // A non-peek body fetch marks the messages seen before their flags are
    // read, so the FLAGS data item reflects it.
    let peeking = !attributes.iter().any(|attribute| {
        matches!(
            attribute,
            Attribute::BodySection { peek: false, .. }
                | Attribute::Binary { peek: false, .. }
                | Attribute::Rfc822
                | Attribute::Rfc822Text
        )
    });
    if !peeking && !mailbox.read_only && !uids.is_empty() {
        let result = handler
            .imap
            .store
            .store_flags(
                mailbox.id,
                &uids,
                FlagOperation::Add,
                &["\\Seen".to_string()],
                None,
            )
            .await
            .map_err(|err| handler.db_error(err))?;
        for (uid, _, _) in &result.modified {
            if let Some(entry) = handler.imap.cache.find(mailbox.id, *uid) {
                let mut data = entry.lock();
                data.flags = None;
                data.trivia = None;
            }
        }
        if !result.modified.is_empty() {
            handler.imap.watches.publish(
                mailbox.id,
                store::watch::MailboxEvent::FlagsChanged {
                    uids: result.modified.iter().map(|(uid, _, _)| *uid).collect(),
                },
            );
        }
    }

    let facets = facets_for(&attributes, condstore);
    let outcome = run_fetch(handler, &mailbox, &attributes, facets, uids).await;

    if let Some(client) = narrowing {
        let _ = Store::commit(client).await;
    }
    outcome?;

    let command = if is_uid { "UID FETCH" } else { "FETCH" };
    if expunged.is_empty() {
        Ok(StatusResponse::ok(format!("{} completed", command))
            .with_tag(handler.tag.clone()))
    } else {
        let set = expunged
            .iter()
            .map(|uid| uid.to_string())
            .collect::<Vec<_>>()
            .join(",");
        Ok(StatusResponse::no(format!(
            "UID(s) {} has/have been expunged",
            set
        ))
        .with_tag(handler.tag.clone()))
    }
}

/// Issues one batched query per missing facet, picks messages up in
/// ascending UID order as their facets complete, and trickles responses at
/// the adaptive rate.
async fn run_fetch(
    handler: &Handler,
    mailbox: &Arc<SelectedMailbox>,
    attributes: &[Attribute],
    facets: FacetSet,
    uids: Vec<u32>,
) -> imap_proto::Result<()> {
    if uids.is_empty() {
        return Ok(());
    }

    let uid_map = handler
        .imap
        .store
        .uid_map(mailbox.id, &uids)
        .await
        .map_err(|err| handler.db_error(err))?;

    // The requested list, ascending; UIDs that vanished from the database
    // simply drop out.
    let mut requested = VecDeque::new();
    let mut missing = FacetSet::default();
    let mut fetch_uids = Vec::new();
    let mut fetch_messages = Vec::new();
    for uid in uids {
        let (message_id, modseq) = match uid_map.get(&uid) {
            Some(entry) => *entry,
            None => continue,
        };
        let entry = handler.imap.cache.entry(mailbox.id, uid, message_id);
        {
            let mut data = entry.lock();
            // Stale per-mailbox facets are refetched once the row's modseq
            // has moved on.
            if data.modseq() != modseq {
                data.flags = None;
                data.annotations = None;
                data.trivia = None;
            }
            if !facets.satisfied_by(&data) {
                if facets.addresses && !data.has_addresses() {
                    missing.addresses = true;
                }
                if facets.headers && !data.has_headers() {
                    missing.headers = true;
                }
                if facets.bodies && !data.has_bodies() {
                    missing.bodies = true;
                }
                if facets.part_numbers && !data.has_bytes_and_lines() {
                    missing.part_numbers = true;
                }
                if facets.flags && !data.has_flags() {
                    missing.flags = true;
                }
                if facets.trivia && !data.has_trivia() {
                    missing.trivia = true;
                }
                if facets.annotations && !data.has_annotations() {
                    missing.annotations = true;
                }
            }
        }
        fetch_uids.push(uid);
        fetch_messages.push(message_id);
        requested.push_back((uid, message_id, entry));
    }
    if requested.is_empty() {
        return Ok(());
    }

    // One batched fetch per missing facet type, all in flight at once.
    let (facet_tx, mut facet_rx) = mpsc::channel::<FacetResult>(8);
    let mut outstanding = 0usize;
    {
        let store = &handler.imap.store;
        let mailbox_id = mailbox.id;
        let span = &handler.span;
        let mut spawn_facet = |kind: u8| {
            outstanding += 1;
            let store = store.clone();
            let tx = facet_tx.clone();
            let uids = fetch_uids.clone();
            let messages = fetch_messages.clone();
            let span = span.clone();
            tokio::spawn(async move {
                let result = match kind {
                    0 => store.fetch_addresses(&messages).await.map(FacetResult::Addresses),
                    1 => store.fetch_headers(&messages).await.map(FacetResult::Headers),
                    2 => store.fetch_raw(&messages).await.map(FacetResult::Raw),
                    3 => store
                        .fetch_part_numbers(&messages)
                        .await
                        .map(FacetResult::PartNumbers),
                    4 => store.fetch_flags(mailbox_id, &uids).await.map(FacetResult::Flags),
                    5 => store.fetch_trivia(mailbox_id, &uids).await.map(FacetResult::Trivia),
                    6 => store
                        .fetch_annotations(mailbox_id, &uids)
                        .await
                        .map(FacetResult::Annotations),
                    _ => unreachable!(),
                };
                let message = match result {
                    Ok(message) => message,
                    Err(err) => {
                        tracing::warn!(parent: &span, event = "error", reason = %err,
                            "Facet fetch failed.");
                        FacetResult::Failed
                    }
                };
                let _ = tx.send(message).await;
            });
        };
        if missing.addresses {
            spawn_facet(0);
        }
        if missing.headers {
            spawn_facet(1);
        }
        if missing.bodies {
            spawn_facet(2);
        }
        if missing.part_numbers {
            spawn_facet(3);
        }
        if missing.flags {
            spawn_facet(4);
        }
        if missing.trivia {
            spawn_facet(5);
        }
        if missing.annotations {
            spawn_facet(6);
        }
    }
    drop(facet_tx);

    let mut available: VecDeque<(u32, Arc<parking_lot::Mutex<MessageData>>)> = VecDeque::new();
    let mut failed = false;
    let mut trickle = tokio::time::interval(Duration::from_secs(1));
    trickle.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    trickle.tick().await; // immediate first tick

    while outstanding > 0 {
        tokio::select! {
            result = facet_rx.recv() => {
                let result = match result {
                    Some(result) => result,
                    None => break,
                };
                outstanding -= 1;
                match result {
                    FacetResult::Failed => failed = true,
                    result => {
                        apply_facet(result, &requested);
                    }
                }
                pickup(&facets, &mut requested, &mut available, mailbox);
            }
            _ = trickle.tick() => {
                // Adaptive trickling: keep impatient clients fed without
                // letting the write buffer run away.
                let rate = (available.len() / TRICKLE_DIVISOR).max(1);
                for _ in 0..rate {
                    match available.pop_front() {
                        Some((uid, entry)) => {
                            emit_one(handler, mailbox, attributes, uid, &entry).await;
                        }
                        None => break,
                    }
                }
            }
        }
    }

    if failed {
        return Err(StatusResponse::database_failure().with_tag(handler.tag.clone()));
    }

    // Everything has arrived; flush the rest in order.
    pickup(&facets, &mut requested, &mut available, mailbox);
    while let Some((uid, entry)) = available.pop_front() {
        emit_one(handler, mailbox, attributes, uid, &entry).await;
    }

    Ok(())
}

fn apply_facet(
    result: FacetResult,
    requested: &VecDeque<(u32, u32, Arc<parking_lot::Mutex<MessageData>>)>,
) {
    for (uid, message_id, entry) in requested {
        let mut data = entry.lock();
        match &result {
            FacetResult::Addresses(map) => {
                if data.addresses.is_none() {
                    data.addresses = map.get(message_id).cloned();
                }
            }
            FacetResult::Headers(map) => {
                if data.headers.is_none() {
                    data.headers = map.get(message_id).cloned();
                }
            }
            FacetResult::Raw(map) => {
                if data.raw.is_none() {
                    data.raw = map.get(message_id).cloned();
                }
            }
            FacetResult::PartNumbers(map) => {
                if data.part_numbers.is_none() {
                    data.part_numbers = map.get(message_id).cloned();
                }
            }
            FacetResult::Flags(map) => {
                if data.flags.is_none() {
                    data.flags = map.get(uid).cloned();
                }
            }
            FacetResult::Trivia(map) => {
                if data.trivia.is_none() {
                    data.trivia = map.get(uid).copied();
                }
            }
            FacetResult::Annotations(map) => {
                if data.annotations.is_none() {
                    data.annotations = map.get(uid).cloned();
                }
            }
            FacetResult::Failed => (),
        }
    }
}

/// Walks the requested list in order; a message becomes available the
/// moment all its required facets are present and its UID still maps to an
/// MSN. This preserves ascending-UID response ordering.
fn pickup(
    facets: &FacetSet,
    requested: &mut VecDeque<(u32, u32, Arc<parking_lot::Mutex<MessageData>>)>,
    available: &mut VecDeque<(u32, Arc<parking_lot::Mutex<MessageData>>)>,
    mailbox: &SelectedMailbox,
) {
    let view = mailbox.view.lock();
    while let Some((uid, _, entry)) = requested.front() {
        let satisfied = facets.satisfied_by(&entry.lock());
        if !satisfied {
            break;
        }
        if view.msn_of(*uid).is_some() && !view.is_expunged_pending(*uid) {
            available.push_back((*uid, entry.clone()));
        }
        requested.pop_front();
    }
}

async fn emit_one(
    handler: &Handler,
    mailbox: &SelectedMailbox,
    attributes: &[Attribute],
    uid: u32,
    entry: &Arc<parking_lot::Mutex<MessageData>>,
) {
    let (msn, is_recent) = {
        let view = mailbox.view.lock();
        match view.msn_of(uid) {
            Some(msn) => (msn, view.recent.contains(&uid)),
            None => return,
        }
    };
    let items = {
    let data = entry.lock();
    let mut items = Vec::with_capacity(attributes.len());
    for attribute in attributes {
        match attribute {
            Attribute::Uid => items.push(DataItem::Uid { uid }),
            Attribute::Flags => {
                let mut flags = Vec::new();
                if is_recent {
                    flags.push(Flag::Recent);
                }
                for flag in data.flags.as_deref().unwrap_or(&[]) {
                    flags.push(Flag::parse_imap(flag.as_bytes()));
                }
                items.push(DataItem::Flags { flags });
            }
            Attribute::InternalDate => {
                if let Some(trivia) = &data.trivia {
                    items.push(DataItem::InternalDate {
                        date: trivia.internal_date,
                    });
                }
            }
            Attribute::Rfc822Size => {
                if let Some(trivia) = &data.trivia {
                    items.push(DataItem::Rfc822Size {
                        size: trivia.rfc822_size as usize,
                    });
                }
            }
            Attribute::ModSeq => {
                if let Some(trivia) = &data.trivia {
                    items.push(DataItem::ModSeq {
                        modseq: trivia.modseq,
                    });
                }
            }
            Attribute::Envelope => items.push(DataItem::Envelope {
                envelope: mime::envelope(&data, ""),
            }),
            Attribute::Body => items.push(DataItem::Body {
                part: mime::body_structure(&data, "", true),
            }),
            Attribute::BodyStructure => items.push(DataItem::BodyStructure {
                part: mime::body_structure(&data, "", true),
            }),
            Attribute::BodySection {
                sections, partial, ..
            } => {
                let contents =
                    mime::section_bytes(&data, sections, *partial, false).unwrap_or_default();
                items.push(DataItem::BodySection {
                    sections: sections.clone(),
                    origin_octet: partial.map(|(offset, _)| offset),
                    contents,
                });
            }
            Attribute::Binary {
                sections, partial, ..
            } => {
                let section_spec = sections
                    .iter()
                    .map(|num| imap_proto::protocol::fetch::Section::Part { num: *num })
                    .collect::<Vec<_>>();
                let contents =
                    mime::section_bytes(&data, &section_spec, *partial, true).unwrap_or_default();
                items.push(DataItem::Binary {
                    sections: sections.clone(),
                    origin_octet: partial.map(|(offset, _)| offset),
                    contents,
                });
            }
            Attribute::BinarySize { sections } => {
                let section_spec = sections
                    .iter()
                    .map(|num| imap_proto::protocol::fetch::Section::Part { num: *num })
                    .collect::<Vec<_>>();
                let size = mime::section_bytes(&data, &section_spec, None, true)
                    .map(|bytes| bytes.len())
                    .unwrap_or(0);
                items.push(DataItem::BinarySize {
                    sections: sections.clone(),
                    size,
                });
            }
            Attribute::Annotation {
                entries,
                attributes,
            } => {
                items.push(DataItem::Annotation {
                    entries: annotation_entries(
                        &data,
                        entries,
                        attributes,
                        handler.user.as_ref().map(|user| user.user.id),
                    ),
                });
            }
            Attribute::Rfc822 => {
                items.push(DataItem::Rfc822 {
                    contents: mime::section_bytes(&data, &[], None, false).unwrap_or_default(),
                });
            }
            Attribute::Rfc822Header => {
                items.push(DataItem::Rfc822Header {
                    contents: mime::section_bytes(
                        &data,
                        &[imap_proto::protocol::fetch::Section::Header],
                        None,
                        false,
                    )
                    .unwrap_or_default(),
                });
            }
            Attribute::Rfc822Text => {
                items.push(DataItem::Rfc822Text {
                    contents: mime::section_bytes(
                        &data,
                        &[imap_proto::protocol::fetch::Section::Text],
                        None,
                        false,
                    )
                    .unwrap_or_default(),
                });
            }
        }
    }
        items
    };

    let item = FetchItem { msn, items };
    let mut buf = Vec::with_capacity(128);
    item.serialize(&mut buf);
    handler.untagged(buf).await;
}

/// Builds the ANNOTATION entries for one message: stored entries matched
/// against the requested entry specs (with * and % wildcards), private
/// rows visible to their owner only, shared rows to everyone.
pub fn annotation_entries(
    data: &MessageData,
    entry_specs: &[String],
    attributes: &[String],
    user_id: Option<u32>,
) -> Vec<AnnotationEntry> {
    let rows = data.annotations.as_deref().unwrap_or(&[]);
    let mut names = Vec::new();
    for row in rows {
        let visible = match row.owner {
            None => true,
            Some(owner) => Some(owner) == user_id,
        };
        if visible
            && entry_specs
                .iter()
                .any(|spec| wildcard_match(spec, &row.name))
            && !names.contains(&row.name)
        {
            names.push(row.name.clone());
        }
    }

    names
        .into_iter()
        .map(|name| {
            let private = rows
                .iter()
                .find(|row| row.name == name && row.owner.is_some() && row.owner == user_id);
            let shared = rows.iter().find(|row| row.name == name && row.owner.is_none());
            let attributes = attributes
                .iter()
                .map(|attribute| {
                    let value = match attribute.as_str() {
                        "value.priv" => private.map(|row| row.value.clone()),
                        "value.shared" => shared.map(|row| row.value.clone()),
                        "size.priv" => private.map(|row| row.value.len().to_string()),
                        "size.shared" => shared.map(|row| row.value.len().to_string()),
                        _ => None,
                    };
                    (attribute.clone(), value)
                })
                .collect();
            AnnotationEntry { name, attributes }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MailboxView;
    use store::model::AnnotationRow;

    #[test]
    fn pickup_preserves_uid_order() {
        let mailbox = SelectedMailbox {
            id: 1,
            name: "INBOX".into(),
            uid_validity: 1,
            read_only: false,
            condstore: false,
            view: parking_lot::Mutex::new(MailboxView {
                uids: vec![1, 2, 3],
                ..Default::default()
            }),
        };
        let facets = FacetSet {
            flags: true,
            ..Default::default()
        };
        let entries = (1..=3u32)
            .map(|uid| {
                (
                    uid,
                    uid + 100,
                    Arc::new(parking_lot::Mutex::new(MessageData {
                        message_id: uid + 100,
                        ..Default::default()
                    })),
                )
            })
            .collect::<Vec<_>>();
        let mut requested: VecDeque<_> = entries.clone().into();
        let mut available = VecDeque::new();

        // UIDs 2 and 3 are ready, UID 1 is not: nothing may be emitted yet,
        // because responses must run in ascending UID order.
        entries[1].2.lock().flags = Some(Vec::new());
        entries[2].2.lock().flags = Some(Vec::new());
        pickup(&facets, &mut requested, &mut available, &mailbox);
        assert!(available.is_empty());
        assert_eq!(requested.len(), 3);

        // Once UID 1 arrives, all three become available in order.
        entries[0].2.lock().flags = Some(Vec::new());
        pickup(&facets, &mut requested, &mut available, &mailbox);
        assert_eq!(
            available.iter().map(|(uid, _)| *uid).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert!(requested.is_empty());
    }

    #[test]
    fn pickup_skips_vanished_uids() {
        let mailbox = SelectedMailbox {
            id: 1,
            name: "INBOX".into(),
            uid_validity: 1,
            read_only: false,
            condstore: false,
            view: parking_lot::Mutex::new(MailboxView {
                uids: vec![1, 3],
                expunged_pending: vec![3],
                ..Default::default()
            }),
        };
        let facets = FacetSet::default();
        let mut requested: VecDeque<_> = (1..=3u32)
            .map(|uid| {
                (
                    uid,
                    uid + 100,
                    Arc::new(parking_lot::Mutex::new(MessageData::default())),
                )
            })
            .collect();
        let mut available = VecDeque::new();
        pickup(&facets, &mut requested, &mut available, &mailbox);
        // UID 2 has no MSN mapping and UID 3 is pending expunge; only UID 1
        // is served.
        assert_eq!(
            available.iter().map(|(uid, _)| *uid).collect::<Vec<_>>(),
            vec![1]
        );
    }

    #[test]
    fn facet_planning() {
        let facets = facets_for(&[Attribute::Envelope], false);
        assert!(facets.headers && facets.addresses);
        assert!(!facets.bodies && !facets.flags);

        let facets = facets_for(&[Attribute::BodyStructure], false);
        assert!(facets.part_numbers && facets.headers && facets.addresses);
        assert!(!facets.bodies);

        let facets = facets_for(
            &[Attribute::BodySection {
                peek: true,
                sections: vec![],
                partial: None,
            }],
            false,
        );
        assert!(facets.bodies && facets.part_numbers);

        let facets = facets_for(&[Attribute::Flags, Attribute::Rfc822Size], true);
        assert!(facets.flags && facets.trivia);

        assert!(facets_for(&[Attribute::Uid], false).is_empty());
    }

    #[test]
    fn annotation_visibility_and_wildcards() {
        let data = MessageData {
            message_id: 1,
            annotations: Some(vec![
                AnnotationRow {
                    name: "/comment".into(),
                    owner: Some(7),
                    value: "mine".into(),
                },
                AnnotationRow {
                    name: "/comment".into(),
                    owner: None,
                    value: "everyone".into(),
                },
                AnnotationRow {
                    name: "/vendor/x".into(),
                    owner: Some(8),
                    value: "not mine".into(),
                },
            ]),
            ..Default::default()
        };

        let entries = annotation_entries(
            &data,
            &["*".to_string()],
            &[
                "value.priv".to_string(),
                "value.shared".to_string(),
                "size.priv".to_string(),
            ],
            Some(7),
        );
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "/comment");
        assert_eq!(
            entries[0].attributes[0],
            ("value.priv".to_string(), Some("mine".to_string()))
        );
        assert_eq!(
            entries[0].attributes[1],
            ("value.shared".to_string(), Some("everyone".to_string()))
        );
        assert_eq!(
            entries[0].attributes[2],
            ("size.priv".to_string(), Some("4".to_string()))
        );

        // The % wildcard does not cross hierarchy boundaries.
        let entries = annotation_entries(
            &data,
            &["/%".to_string()],
            &["value.shared".to_string()],
            Some(8),
        );
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "/comment");
    }
}
