/*
 * SPDX-FileCopyrightText: 2024 Loriot Project <dev@loriot.email>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Renders stored message facets into the IMAP data items: BODYSTRUCTURE
//! trees, envelopes and BODY[section] octets. Full MIME decoding lives with
//! the message parser at injection time; this module only needs the light
//! structure: header parameter lists and transfer-encoding names.

use imap_proto::protocol::fetch::{
    Address, AddressGroup, BodyPart, BodyPartExtension, BodyPartFields, EmailAddress, Envelope,
    Section,
};
use store::model::{
    MessageData, FIELD_BCC, FIELD_CC, FIELD_FROM, FIELD_REPLY_TO, FIELD_SENDER, FIELD_TO,
};

/// Splits "type/subtype; key=value; ..." into its pieces.
pub fn parse_content_type(value: &str) -> (String, String, Vec<(String, String)>) {
    let mut segments = value.split(';');
    let mime_type = segments.next().unwrap_or_default().trim();
    let (main, sub) = mime_type.split_once('/').unwrap_or((mime_type, ""));
    let mut parameters = Vec::new();
    for segment in segments {
        if let Some((key, value)) = segment.split_once('=') {
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value);
            parameters.push((key.trim().to_string(), value.to_string()));
        }
    }
    (main.to_string(), sub.to_string(), parameters)
}

fn header_value<'x>(headers: &[&'x store::model::HeaderRow], name: &str) -> Option<&'x str> {
    headers
        .iter()
        .find(|h| h.field.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
}

fn child_key(key: &str, index: usize) -> String {
    if key.is_empty() {
        format!("{}", index)
    } else {
        format!("{}.{}", key, index)
    }
}

/// Builds the BODY/BODYSTRUCTURE tree for a message from its part and
/// header facets. `key` is the part to describe; `embedded` selects the
/// embedded message's own header (for the outermost message and the content
/// of message/rfc822 parts) over the part's MIME header.
pub fn body_structure(data: &MessageData, key: &str, embedded: bool) -> BodyPart {
    let headers = if embedded {
        data.headers_of(key)
    } else {
        data.mime_headers_of(key)
    };
    let (ctype, subtype, parameters) = header_value(&headers, "Content-Type")
        .map(parse_content_type)
        .unwrap_or_else(|| ("text".into(), "plain".into(), Vec::new()));

    let extension = BodyPartExtension {
        // A disposition value has the same shape as a content type, minus
        // the slash: name, then ;-separated parameters.
        body_disposition: header_value(&headers, "Content-Disposition").map(|value| {
            let (disposition, _, parameters) = parse_content_type(value);
            (disposition, parameters)
        }),
        body_language: header_value(&headers, "Content-Language").map(|value| {
            value
                .split(',')
                .map(|lang| lang.trim().to_string())
                .filter(|lang| !lang.is_empty())
                .collect()
        }),
        body_location: header_value(&headers, "Content-Location").map(|v| v.to_string()),
    };
    let body_md5 = header_value(&headers, "Content-MD5").map(|v| v.to_string());

    if ctype.eq_ignore_ascii_case("multipart") {
        let mut body_parts = Vec::new();
        let mut index = 1;
        while let Some(_) = data.part(&child_key(key, index)) {
            body_parts.push(body_structure(data, &child_key(key, index), false));
            index += 1;
        }
        return BodyPart::Multipart {
            body_parts,
            body_subtype: subtype,
            body_parameters: if parameters.is_empty() {
                None
            } else {
                Some(parameters)
            },
            extension,
        };
    }

    // Sizes: leaf parts carry their own row; a message context (the root,
    // or an embedded message) sizes its single body from the part-1 alias.
    let size_row = if embedded {
        data.part(&child_key(key, 1)).or_else(|| data.part(key))
    } else {
        data.part(key)
    };
    let (bytes, lines) = size_row.map(|row| (row.bytes, row.lines)).unwrap_or((0, 0));

    let fields = BodyPartFields {
        body_subtype: if subtype.is_empty() {
            None
        } else {
            Some(subtype.clone())
        },
        body_parameters: if parameters.is_empty() {
            None
        } else {
            Some(parameters)
        },
        body_id: header_value(&headers, "Content-Id").map(|v| v.to_string()),
        body_description: header_value(&headers, "Content-Description").map(|v| v.to_string()),
        body_encoding: Some(
            header_value(&headers, "Content-Transfer-Encoding")
                .unwrap_or("7BIT")
                .to_string(),
        ),
        body_size_octets: bytes as usize,
    };

    if ctype.eq_ignore_ascii_case("message") && subtype.eq_ignore_ascii_case("rfc822") && !embedded
    {
        let whole = data.part(key);
        return BodyPart::Message {
            fields: BodyPartFields {
                body_size_octets: whole.map(|row| row.bytes as usize).unwrap_or(0),
                ..fields
            },
            envelope: Some(Box::new(envelope(data, key))),
            body: Some(Box::new(body_structure(data, key, true))),
            body_size_lines: whole.map(|row| row.lines as usize).unwrap_or(0),
            body_md5,
            extension,
        };
    }

    if ctype.eq_ignore_ascii_case("text") {
        BodyPart::Text {
            fields,
            body_size_lines: lines as usize,
            body_md5,
            extension,
        }
    } else {
        BodyPart::Basic {
            body_type: Some(ctype),
            fields,
            body_md5,
            extension,
        }
    }
}

/// The ENVELOPE of the message rooted at `key` ("" for the message itself,
/// a part key for embedded message/rfc822 parts).
pub fn envelope(data: &MessageData, key: &str) -> Envelope {
    let headers = data.headers_of(key);
    Envelope {
        date: header_value(&headers, "Date").map(|v| v.to_string()),
        subject: header_value(&headers, "Subject").map(|v| v.to_string()),
        from: address_list(data, key, FIELD_FROM),
        sender: address_list(data, key, FIELD_SENDER),
        reply_to: address_list(data, key, FIELD_REPLY_TO),
        to: address_list(data, key, FIELD_TO),
        cc: address_list(data, key, FIELD_CC),
        bcc: address_list(data, key, FIELD_BCC),
        in_reply_to: header_value(&headers, "In-Reply-To").map(|v| v.to_string()),
        message_id: header_value(&headers, "Message-ID")
            .or_else(|| header_value(&headers, "Message-Id"))
            .map(|v| v.to_string()),
    }
}

fn address_list(data: &MessageData, key: &str, field: i32) -> Vec<Address> {
    let rows = data.addresses_of(key, field);
    let mut out: Vec<Address> = Vec::new();
    for row in rows {
        let email = if row.localpart.is_empty() && row.domain.is_empty() {
            None
        } else {
            Some(EmailAddress {
                name: row.name.clone(),
                localpart: row.localpart.clone(),
                domain: row.domain.clone(),
            })
        };
        match &row.group_name {
            Some(group_name) => {
                let matches_last = matches!(
                    out.last(),
                    Some(Address::Group(group)) if group.name.as_deref() == Some(group_name.as_str())
                );
                if !matches_last {
                    out.push(Address::Group(AddressGroup {
                        name: Some(group_name.clone()),
                        addresses: Vec::new(),
                    }));
                }
                if let (Some(Address::Group(group)), Some(email)) = (out.last_mut(), email) {
                    group.addresses.push(email);
                }
            }
            None => {
                if let Some(email) = email {
                    out.push(Address::Single(email));
                }
            }
        }
    }
    out
}

/// Resolves BODY[section]/BINARY[section] octets. Returns None when the
/// required facets are absent or the part does not exist (the response then
/// renders an empty literal, matching the lenient server behaviour for
/// nonexistent part numbers).
pub fn section_bytes(
    data: &MessageData,
    sections: &[Section],
    partial: Option<(u32, u32)>,
    binary_decode: bool,
) -> Option<Vec<u8>> {
    let raw = data.raw.as_deref()?;

    let mut part_key = String::new();
    let mut selector: Option<&Section> = None;
    for section in sections {
        match section {
            Section::Part { num } => {
                if !part_key.is_empty() {
                    part_key.push('.');
                }
                part_key.push_str(&num.to_string());
            }
            other => {
                selector = Some(other);
                break;
            }
        }
    }

    let row = data.part(&part_key)?;
    let end = (row.end_offset as usize).min(raw.len());
    let body_start = (row.body_offset as usize).min(end);

    let mut out = match selector {
        None => {
            if part_key.is_empty() {
                // BODY[] is the entire message.
                raw.get(..end)?.to_vec()
            } else {
                raw.get(body_start..end)?.to_vec()
            }
        }
        Some(Section::Header) => {
            if part_key.is_empty() {
                raw.get(row.header_offset as usize..body_start)?.to_vec()
            } else {
                // The header of the embedded message, which starts at the
                // part's body offset.
                let header_end = find_header_end(raw, body_start, end);
                raw.get(body_start..header_end)?.to_vec()
            }
        }
        Some(Section::Mime) => raw.get(row.header_offset as usize..body_start)?.to_vec(),
        Some(Section::Text) => {
            if part_key.is_empty() {
                raw.get(body_start..end)?.to_vec()
            } else {
                let header_end = find_header_end(raw, body_start, end);
                raw.get(header_end..end)?.to_vec()
            }
        }
        Some(Section::HeaderFields { not, fields }) => {
            let mut out = Vec::new();
            for header in data.headers_of(&part_key) {
                let listed = fields
                    .iter()
                    .any(|field| field.eq_ignore_ascii_case(&header.field));
                if listed != *not {
                    out.extend_from_slice(header.field.as_bytes());
                    out.extend_from_slice(b": ");
                    out.extend_from_slice(header.value.as_bytes());
                    out.extend_from_slice(b"\r\n");
                }
            }
            out.extend_from_slice(b"\r\n");
            out
        }
        Some(Section::Part { .. }) => unreachable!("Section::Part is consumed above, not a selector"),
    };

    if binary_decode {
        let encoding = data
            .mime_headers_of(&part_key)
            .iter()
            .find(|h| h.field.eq_ignore_ascii_case("Content-Transfer-Encoding"))
            .map(|h| h.value.trim().to_ascii_lowercase())
            .unwrap_or_default();
        out = match encoding.as_str() {
            "base64" => {
                mail_parser::decoders::base64::base64_decode(&out).unwrap_or_default()
            }
            "quoted-printable" => {
                mail_parser::decoders::quoted_printable::quoted_printable_decode(&out)
                    .unwrap_or_default()
            }
            _ => out,
        };
    }

    // Partial ranges slice the encoded octets after everything else.
    if let Some((offset, length)) = partial {
        let start = (offset as usize).min(out.len());
        let stop = start.saturating_add(length as usize).min(out.len());
        out = out[start..stop].to_vec();
    }

    Some(out)
}

fn find_header_end(raw: &[u8], start: usize, end: usize) -> usize {
    let slice = match raw.get(start..end) {
        Some(slice) => slice,
        None => return end,
    };
    slice
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|pos| start + pos + 4)
        .unwrap_or(end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use store::model::{AddressRow, HeaderRow, PartRow};

    fn leaf_row(part: &str, header: u32, body: u32, end: u32) -> PartRow {
        PartRow {
            part: part.to_string(),
            header_offset: header,
            body_offset: body,
            end_offset: end,
            bytes: end - body,
            lines: 0,
        }
    }

    fn header(part: &str, position: i32, field: &str, value: &str) -> HeaderRow {
        HeaderRow {
            part: part.to_string(),
            position,
            field: field.to_string(),
            value: value.to_string(),
        }
    }

    #[test]
    fn content_type_parsing() {
        let (t, s, p) = parse_content_type("text/plain; charset=US-ASCII");
        assert_eq!((t.as_str(), s.as_str()), ("text", "plain"));
        assert_eq!(p, vec![("charset".to_string(), "US-ASCII".to_string())]);

        let (t, s, p) =
            parse_content_type("multipart/mixed; boundary=\"==_mimepart_abc\"");
        assert_eq!((t.as_str(), s.as_str()), ("multipart", "mixed"));
        assert_eq!(
            p,
            vec![("boundary".to_string(), "==_mimepart_abc".to_string())]
        );
    }

    fn simple_message() -> (Vec<u8>, MessageData) {
        let raw = b"Subject: hi\r\nContent-Type: text/plain\r\n\r\nhello body\r\n".to_vec();
        let body = raw.len() as u32 - 12;
        let data = MessageData {
            message_id: 1,
            raw: Some(raw.clone()),
            part_numbers: Some(vec![
                leaf_row("", 0, body, raw.len() as u32),
                leaf_row("1", 0, body, raw.len() as u32),
            ]),
            headers: Some(vec![
                header("", 0, "Subject", "hi"),
                header("", 1, "Content-Type", "text/plain"),
            ]),
            addresses: Some(Vec::new()),
            ..Default::default()
        };
        (raw, data)
    }

    #[test]
    fn whole_and_header_sections() {
        let (raw, data) = simple_message();
        assert_eq!(section_bytes(&data, &[], None, false).unwrap(), raw);
        assert_eq!(
            section_bytes(&data, &[Section::Text], None, false).unwrap(),
            b"hello body\r\n".to_vec()
        );
        let header_bytes = section_bytes(&data, &[Section::Header], None, false).unwrap();
        assert!(header_bytes.ends_with(b"\r\n\r\n"));
        assert!(header_bytes.starts_with(b"Subject: hi"));
    }

    #[test]
    fn header_fields_selection() {
        let (_, data) = simple_message();
        assert_eq!(
            section_bytes(
                &data,
                &[Section::HeaderFields {
                    not: false,
                    fields: vec!["subject".into()],
                }],
                None,
                false
            )
            .unwrap(),
            b"Subject: hi\r\n\r\n".to_vec()
        );
        assert_eq!(
            section_bytes(
                &data,
                &[Section::HeaderFields {
                    not: true,
                    fields: vec!["subject".into()],
                }],
                None,
                false
            )
            .unwrap(),
            b"Content-Type: text/plain\r\n\r\n".to_vec()
        );
    }

    #[test]
    fn partial_applies_last() {
        let (_, data) = simple_message();
        assert_eq!(
            section_bytes(&data, &[Section::Text], Some((6, 4)), false).unwrap(),
            b"body".to_vec()
        );
        assert_eq!(
            section_bytes(&data, &[Section::Text], Some((100, 4)), false).unwrap(),
            Vec::<u8>::new()
        );
    }

    #[test]
    fn missing_part_is_none() {
        let (_, data) = simple_message();
        assert!(section_bytes(&data, &[Section::Part { num: 9 }], None, false).is_none());
    }

    #[test]
    fn simple_body_structure() {
        let (_, data) = simple_message();
        let part = body_structure(&data, "", true);
        match part {
            BodyPart::Text {
                fields,
                body_size_lines: _,
                ..
            } => {
                assert_eq!(fields.body_subtype.as_deref(), Some("plain"));
                assert_eq!(fields.body_size_octets, 12);
            }
            other => panic!("expected text part, got {:?}", other),
        }
    }

    #[test]
    fn group_addresses_rebuild() {
        let data = MessageData {
            message_id: 1,
            addresses: Some(vec![
                AddressRow {
                    part: "".into(),
                    position: 0,
                    field: FIELD_TO,
                    group_name: Some("Friends".into()),
                    name: Some("John".into()),
                    localpart: "jdoe".into(),
                    domain: "example.com".into(),
                },
                AddressRow {
                    part: "".into(),
                    position: 1,
                    field: FIELD_TO,
                    group_name: Some("Friends".into()),
                    name: None,
                    localpart: "jane".into(),
                    domain: "example.com".into(),
                },
                AddressRow {
                    part: "".into(),
                    position: 2,
                    field: FIELD_TO,
                    group_name: None,
                    name: None,
                    localpart: "solo".into(),
                    domain: "example.net".into(),
                },
            ]),
            headers: Some(Vec::new()),
            ..Default::default()
        };
        let envelope = envelope(&data, "");
        assert_eq!(envelope.to.len(), 2);
        match &envelope.to[0] {
            Address::Group(group) => {
                assert_eq!(group.name.as_deref(), Some("Friends"));
                assert_eq!(group.addresses.len(), 2);
            }
            other => panic!("expected group, got {:?}", other),
        }
        assert!(matches!(&envelope.to[1], Address::Single(_)));
    }
}
