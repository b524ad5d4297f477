/*
 * SPDX-FileCopyrightText: 2024 Loriot Project <dev@loriot.email>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use ahash::AHashMap;

/// Address field discriminants stored in address_fields.field.
pub const FIELD_FROM: i32 = 1;
pub const FIELD_SENDER: i32 = 2;
pub const FIELD_REPLY_TO: i32 = 3;
pub const FIELD_TO: i32 = 4;
pub const FIELD_CC: i32 = 5;
pub const FIELD_BCC: i32 = 6;

/// Recipient delivery states stored in delivery_recipients.action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecipientAction {
    Unknown = 0,
    Relayed = 1,
    Delayed = 2,
    Failed = 3,
}

impl RecipientAction {
    pub fn from_i32(value: i32) -> RecipientAction {
        match value {
            1 => RecipientAction::Relayed,
            2 => RecipientAction::Delayed,
            3 => RecipientAction::Failed,
            _ => RecipientAction::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mailbox {
    pub id: u32,
    pub name: String,
    pub owner: Option<u32>,
    pub uid_next: u32,
    pub uid_validity: u32,
    pub next_modseq: u64,
    pub deleted: bool,
}

/// One raw header field of one MIME part. For message/rfc822 parts the MIME
/// headers of the enclosing part are stored with negative positions, and the
/// embedded message's own header with positions from zero up; everywhere
/// else positions start at zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderRow {
    pub part: String,
    pub position: i32,
    pub field: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressRow {
    pub part: String,
    pub position: i32,
    pub field: i32,
    pub group_name: Option<String>,
    pub name: Option<String>,
    pub localpart: String,
    pub domain: String,
}

/// One MIME part of a stored message. Offsets index into the full raw
/// message; `bytes`/`lines` describe the encoded body octets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartRow {
    pub part: String,
    pub header_offset: u32,
    pub body_offset: u32,
    pub end_offset: u32,
    pub bytes: u32,
    pub lines: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trivia {
    pub rfc822_size: u32,
    pub internal_date: i64,
    pub modseq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotationRow {
    pub name: String,
    pub owner: Option<u32>,
    pub value: String,
}

/// A message materialised in the process-wide cache. Each facet is fetched
/// independently and may be absent; the facet accessors mirror that.
#[derive(Debug, Default)]
pub struct MessageData {
    pub message_id: u32,
    pub addresses: Option<Vec<AddressRow>>,
    pub headers: Option<Vec<HeaderRow>>,
    pub raw: Option<Vec<u8>>,
    pub part_numbers: Option<Vec<PartRow>>,
    pub trivia: Option<Trivia>,
    pub flags: Option<Vec<String>>,
    pub annotations: Option<Vec<AnnotationRow>>,
}

impl MessageData {
    pub fn has_addresses(&self) -> bool {
        self.addresses.is_some()
    }

    pub fn has_headers(&self) -> bool {
        self.headers.is_some()
    }

    pub fn has_bodies(&self) -> bool {
        self.raw.is_some()
    }

    pub fn has_bytes_and_lines(&self) -> bool {
        self.part_numbers.is_some()
    }

    pub fn has_trivia(&self) -> bool {
        self.trivia.is_some()
    }

    pub fn has_flags(&self) -> bool {
        self.flags.is_some()
    }

    pub fn has_annotations(&self) -> bool {
        self.annotations.is_some()
    }

    /// Modseq of the row when the trivia facet was loaded; used by the
    /// fetch planner to detect stale flag/annotation facets.
    pub fn modseq(&self) -> u64 {
        self.trivia.map(|t| t.modseq).unwrap_or(0)
    }

    pub fn part(&self, part: &str) -> Option<&PartRow> {
        self.part_numbers
            .as_deref()
            .and_then(|parts| parts.iter().find(|p| p.part == part))
    }

    pub fn headers_of(&self, part: &str) -> Vec<&HeaderRow> {
        let mut rows = self
            .headers
            .as_deref()
            .map(|headers| {
                headers
                    .iter()
                    .filter(|h| h.part == part && h.position >= 0)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        rows.sort_by_key(|h| h.position);
        rows
    }

    /// The MIME headers governing the content type of a part; distinct from
    /// `headers_of` only for message/rfc822 parts.
    pub fn mime_headers_of(&self, part: &str) -> Vec<&HeaderRow> {
        let mut rows = self
            .headers
            .as_deref()
            .map(|headers| {
                headers
                    .iter()
                    .filter(|h| h.part == part && h.position < 0)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        if rows.is_empty() {
            return self.headers_of(part);
        }
        rows.sort_by_key(|h| h.position);
        rows
    }

    pub fn addresses_of(&self, part: &str, field: i32) -> Vec<&AddressRow> {
        let mut rows = self
            .addresses
            .as_deref()
            .map(|addresses| {
                addresses
                    .iter()
                    .filter(|a| a.part == part && a.field == field)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        rows.sort_by_key(|a| a.position);
        rows
    }
}

/// The facets a fetch needs, derived from the requested attributes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FacetSet {
    pub addresses: bool,
    pub headers: bool,
    pub bodies: bool,
    pub part_numbers: bool,
    pub flags: bool,
    pub trivia: bool,
    pub annotations: bool,
}

impl FacetSet {
    pub fn is_empty(&self) -> bool {
        *self == FacetSet::default()
    }

    /// True when every facet in `self` is present on `data`.
    pub fn satisfied_by(&self, data: &MessageData) -> bool {
        (!self.addresses || data.has_addresses())
            && (!self.headers || data.has_headers())
            && (!self.bodies || data.has_bodies())
            && (!self.part_numbers || data.has_bytes_and_lines())
            && (!self.flags || data.has_flags())
            && (!self.trivia || data.has_trivia())
            && (!self.annotations || data.has_annotations())
    }
}

/// UID to message-id and modseq mapping for a set of mailbox rows.
pub type UidMap = AHashMap<u32, (u32, u64)>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryRecipient {
    pub address_id: u32,
    pub name: String,
    pub localpart: String,
    pub domain: String,
    pub action: RecipientAction,
    pub status: String,
    pub last_attempt: Option<i64>,
}

impl DeliveryRecipient {
    pub fn address(&self) -> String {
        format!("{}@{}", self.localpart, self.domain)
    }
}

#[derive(Debug, Clone)]
pub struct DeliveryRow {
    pub id: u32,
    pub sender_id: u32,
    pub expired: bool,
    pub can_retry: bool,
    pub recipients: Vec<DeliveryRecipient>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn facet_satisfaction() {
        let mut data = MessageData {
            message_id: 7,
            ..Default::default()
        };
        let facets = FacetSet {
            flags: true,
            trivia: true,
            ..Default::default()
        };
        assert!(!facets.satisfied_by(&data));
        data.flags = Some(vec!["\\Seen".into()]);
        assert!(!facets.satisfied_by(&data));
        data.trivia = Some(Trivia {
            rfc822_size: 10,
            internal_date: 0,
            modseq: 3,
        });
        assert!(facets.satisfied_by(&data));
        assert_eq!(data.modseq(), 3);
    }

    #[test]
    fn mime_headers_fall_back_to_part_headers() {
        let data = MessageData {
            message_id: 1,
            headers: Some(vec![
                HeaderRow {
                    part: "2".into(),
                    position: 0,
                    field: "Subject".into(),
                    value: "embedded".into(),
                },
                HeaderRow {
                    part: "2".into(),
                    position: -2,
                    field: "Content-Type".into(),
                    value: "message/rfc822".into(),
                },
                HeaderRow {
                    part: "1".into(),
                    position: 0,
                    field: "Content-Type".into(),
                    value: "text/plain".into(),
                },
            ]),
            ..Default::default()
        };
        assert_eq!(
            data.mime_headers_of("2")
                .iter()
                .map(|h| h.field.as_str())
                .collect::<Vec<_>>(),
            vec!["Content-Type"]
        );
        assert_eq!(
            data.headers_of("2")
                .iter()
                .map(|h| h.field.as_str())
                .collect::<Vec<_>>(),
            vec!["Subject"]
        );
        assert_eq!(
            data.mime_headers_of("1")
                .iter()
                .map(|h| h.value.as_str())
                .collect::<Vec<_>>(),
            vec!["text/plain"]
        );
    }
}
