/*
 * SPDX-FileCopyrightText: 2024 Loriot Project <dev@loriot.email>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use super::{
    encode_phrase, literal_string, quoted_or_literal_string, quoted_or_literal_string_or_nil,
    quoted_timestamp, Flag, ImapResponse, Sequence,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arguments {
    pub tag: String,
    pub sequence_set: Sequence,
    pub attributes: Vec<Attribute>,
    pub changed_since: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub items: Vec<FetchItem>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchItem {
    pub msn: u32,
    pub items: Vec<DataItem>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribute {
    Envelope,
    Flags,
    InternalDate,
    Rfc822,
    Rfc822Size,
    Rfc822Header,
    Rfc822Text,
    Body,
    BodyStructure,
    BodySection {
        peek: bool,
        sections: Vec<Section>,
        partial: Option<(u32, u32)>,
    },
    Binary {
        peek: bool,
        sections: Vec<u32>,
        partial: Option<(u32, u32)>,
    },
    BinarySize {
        sections: Vec<u32>,
    },
    Annotation {
        entries: Vec<String>,
        attributes: Vec<String>,
    },
    Uid,
    ModSeq,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Section {
    Part { num: u32 },
    Header,
    HeaderFields { not: bool, fields: Vec<String> },
    Text,
    Mime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataItem {
    Envelope {
        envelope: Envelope,
    },
    Flags {
        flags: Vec<Flag>,
    },
    InternalDate {
        date: i64,
    },
    Uid {
        uid: u32,
    },
    Rfc822 {
        contents: Vec<u8>,
    },
    Rfc822Header {
        contents: Vec<u8>,
    },
    Rfc822Size {
        size: usize,
    },
    Rfc822Text {
        contents: Vec<u8>,
    },
    Body {
        part: BodyPart,
    },
    BodyStructure {
        part: BodyPart,
    },
    BodySection {
        sections: Vec<Section>,
        origin_octet: Option<u32>,
        contents: Vec<u8>,
    },
    Binary {
        sections: Vec<u32>,
        origin_octet: Option<u32>,
        contents: Vec<u8>,
    },
    BinarySize {
        sections: Vec<u32>,
        size: usize,
    },
    Annotation {
        entries: Vec<AnnotationEntry>,
    },
    ModSeq {
        modseq: u64,
    },
}

/// One annotation entry with its requested attributes in request order.
/// Absent attribute values render as NIL, except `size.*` which renders as
/// the quoted string "0".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotationEntry {
    pub name: String,
    pub attributes: Vec<(String, Option<String>)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Single(EmailAddress),
    Group(AddressGroup),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressGroup {
    pub name: Option<String>,
    pub addresses: Vec<EmailAddress>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailAddress {
    pub name: Option<String>,
    pub localpart: String,
    pub domain: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Envelope {
    pub date: Option<String>,
    pub subject: Option<String>,
    pub from: Vec<Address>,
    pub sender: Vec<Address>,
    pub reply_to: Vec<Address>,
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub bcc: Vec<Address>,
    pub in_reply_to: Option<String>,
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyPart {
    Multipart {
        body_parts: Vec<BodyPart>,
        body_subtype: String,
        // Extension data
        body_parameters: Option<Vec<(String, String)>>,
        extension: BodyPartExtension,
    },
    Basic {
        body_type: Option<String>,
        fields: BodyPartFields,
        // Extension data
        body_md5: Option<String>,
        extension: BodyPartExtension,
    },
    Text {
        fields: BodyPartFields,
        body_size_lines: usize,
        // Extension data
        body_md5: Option<String>,
        extension: BodyPartExtension,
    },
    Message {
        fields: BodyPartFields,
        envelope: Option<Box<Envelope>>,
        body: Option<Box<BodyPart>>,
        body_size_lines: usize,
        // Extension data
        body_md5: Option<String>,
        extension: BodyPartExtension,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BodyPartFields {
    pub body_subtype: Option<String>,
    pub body_parameters: Option<Vec<(String, String)>>,
    pub body_id: Option<String>,
    pub body_description: Option<String>,
    pub body_encoding: Option<String>,
    pub body_size_octets: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BodyPartExtension {
    pub body_disposition: Option<(String, Vec<(String, String)>)>,
    pub body_language: Option<Vec<String>>,
    pub body_location: Option<String>,
}

impl Address {
    pub fn serialize(&self, buf: &mut Vec<u8>) {
        match self {
            Address::Single(addr) => addr.serialize(buf),
            Address::Group(group) => group.serialize(buf),
        }
    }
}

impl EmailAddress {
    pub fn serialize(&self, buf: &mut Vec<u8>) {
        buf.push(b'(');
        match &self.name {
            Some(name) => quoted_or_literal_string(buf, &encode_phrase(name)),
            None => buf.extend_from_slice(b"NIL"),
        }
        buf.extend_from_slice(b" NIL ");
        quoted_or_literal_string(buf, &self.localpart);
        buf.push(b' ');
        if !self.domain.is_empty() {
            quoted_or_literal_string(buf, &self.domain);
        } else {
            // RFC 3501, page 77: a missing domain renders as " ".
            buf.extend_from_slice(b"\" \"");
        }
        buf.push(b')');
    }
}

impl AddressGroup {
    pub fn serialize(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(b"(NIL NIL ");
        match &self.name {
            Some(name) => quoted_or_literal_string(buf, &encode_phrase(name)),
            None => buf.extend_from_slice(b"\"\""),
        }
        buf.extend_from_slice(b" NIL)");
        for addr in &self.addresses {
            addr.serialize(buf);
        }
        buf.extend_from_slice(b"(NIL NIL NIL NIL)");
    }
}

impl Envelope {
    pub fn serialize(&self, buf: &mut Vec<u8>) {
        buf.push(b'(');
        quoted_or_literal_string_or_nil(buf, self.date.as_deref());
        buf.push(b' ');
        quoted_or_literal_string_or_nil(buf, self.subject.as_deref());
        for addresses in [
            &self.from,
            &self.sender,
            &self.reply_to,
            &self.to,
            &self.cc,
            &self.bcc,
        ] {
            buf.push(b' ');
            if !addresses.is_empty() {
                buf.push(b'(');
                for address in addresses {
                    address.serialize(buf);
                }
                buf.push(b')');
            } else {
                buf.extend_from_slice(b"NIL");
            }
        }
        for item in [&self.in_reply_to, &self.message_id] {
            buf.push(b' ');
            quoted_or_literal_string_or_nil(buf, item.as_deref());
        }
        buf.push(b')');
    }
}

impl BodyPart {
    pub fn serialize(&self, buf: &mut Vec<u8>, is_extended: bool) {
        buf.push(b'(');
        match self {
            BodyPart::Multipart {
                body_parts,
                body_subtype,
                body_parameters,
                extension,
            } => {
                for part in body_parts.iter() {
                    part.serialize(buf, is_extended);
                }
                buf.push(b' ');
                quoted_or_literal_string(buf, body_subtype);
                if is_extended {
                    serialize_parameters(buf, body_parameters.as_deref());
                    buf.push(b' ');
                    extension.serialize(buf);
                }
            }
            BodyPart::Basic {
                body_type,
                fields,
                body_md5,
                extension,
            } => {
                quoted_or_literal_string_or_nil(buf, body_type.as_deref());
                buf.push(b' ');
                fields.serialize(buf);
                if is_extended {
                    buf.push(b' ');
                    quoted_or_literal_string_or_nil(buf, body_md5.as_deref());
                    buf.push(b' ');
                    extension.serialize(buf);
                }
            }
            BodyPart::Text {
                fields,
                body_size_lines,
                body_md5,
                extension,
            } => {
                buf.extend_from_slice(b"\"text\" ");
                fields.serialize(buf);
                buf.push(b' ');
                buf.extend_from_slice(body_size_lines.to_string().as_bytes());
                if is_extended {
                    buf.push(b' ');
                    quoted_or_literal_string_or_nil(buf, body_md5.as_deref());
                    buf.push(b' ');
                    extension.serialize(buf);
                }
            }
            BodyPart::Message {
                fields,
                envelope,
                body,
                body_size_lines,
                body_md5,
                extension,
            } => {
                buf.extend_from_slice(b"\"message\" ");
                fields.serialize(buf);
                buf.push(b' ');
                if let Some(envelope) = envelope {
                    envelope.serialize(buf);
                } else {
                    buf.extend_from_slice(b"NIL");
                }
                buf.push(b' ');
                if let Some(body) = body {
                    body.serialize(buf, is_extended);
                } else {
                    buf.extend_from_slice(b"NIL");
                }
                buf.push(b' ');
                buf.extend_from_slice(body_size_lines.to_string().as_bytes());
                if is_extended {
                    buf.push(b' ');
                    quoted_or_literal_string_or_nil(buf, body_md5.as_deref());
                    buf.push(b' ');
                    extension.serialize(buf);
                }
            }
        }
        buf.push(b')');
    }
}

fn serialize_parameters(buf: &mut Vec<u8>, parameters: Option<&[(String, String)]>) {
    if let Some(parameters) = parameters {
        buf.extend_from_slice(b" (");
        for (pos, (key, value)) in parameters.iter().enumerate() {
            if pos > 0 {
                buf.push(b' ');
            }
            quoted_or_literal_string(buf, key);
            buf.push(b' ');
            quoted_or_literal_string(buf, value);
        }
        buf.push(b')');
    } else {
        buf.extend_from_slice(b" NIL");
    }
}

impl BodyPartFields {
    pub fn serialize(&self, buf: &mut Vec<u8>) {
        quoted_or_literal_string_or_nil(buf, self.body_subtype.as_deref());
        serialize_parameters(buf, self.body_parameters.as_deref());
        for item in [&self.body_id, &self.body_description, &self.body_encoding] {
            buf.push(b' ');
            quoted_or_literal_string_or_nil(buf, item.as_deref());
        }
        buf.push(b' ');
        buf.extend_from_slice(self.body_size_octets.to_string().as_bytes());
    }
}

impl BodyPartExtension {
    pub fn serialize(&self, buf: &mut Vec<u8>) {
        if let Some((disposition, parameters)) = &self.body_disposition {
            buf.push(b'(');
            quoted_or_literal_string(buf, disposition);
            if !parameters.is_empty() {
                buf.extend_from_slice(b" (");
                for (pos, (key, value)) in parameters.iter().enumerate() {
                    if pos > 0 {
                        buf.push(b' ');
                    }
                    quoted_or_literal_string(buf, key);
                    buf.push(b' ');
                    quoted_or_literal_string(buf, value);
                }
                buf.extend_from_slice(b"))");
            } else {
                buf.extend_from_slice(b" NIL)");
            }
        } else {
            buf.extend_from_slice(b"NIL");
        }
        if let Some(body_language) = &self.body_language {
            match body_language.len() {
                0 => buf.extend_from_slice(b" NIL"),
                1 => {
                    buf.push(b' ');
                    quoted_or_literal_string(buf, body_language.last().unwrap());
                }
                _ => {
                    buf.extend_from_slice(b" (");
                    for (pos, lang) in body_language.iter().enumerate() {
                        if pos > 0 {
                            buf.push(b' ');
                        }
                        quoted_or_literal_string(buf, lang);
                    }
                    buf.push(b')');
                }
            }
        } else {
            buf.extend_from_slice(b" NIL");
        }
        buf.push(b' ');
        quoted_or_literal_string_or_nil(buf, self.body_location.as_deref());
    }
}

impl Section {
    pub fn serialize(&self, buf: &mut Vec<u8>) {
        match self {
            Section::Part { num } => {
                buf.extend_from_slice(num.to_string().as_bytes());
            }
            Section::Header => {
                buf.extend_from_slice(b"HEADER");
            }
            Section::HeaderFields { not, fields } => {
                if !not {
                    buf.extend_from_slice(b"HEADER.FIELDS ");
                } else {
                    buf.extend_from_slice(b"HEADER.FIELDS.NOT ");
                }
                buf.push(b'(');
                for (pos, field) in fields.iter().enumerate() {
                    if pos > 0 {
                        buf.push(b' ');
                    }
                    buf.extend_from_slice(field.as_str().to_ascii_uppercase().as_bytes());
                }
                buf.push(b')');
            }
            Section::Text => {
                buf.extend_from_slice(b"TEXT");
            }
            Section::Mime => {
                buf.extend_from_slice(b"MIME");
            }
        };
    }
}

impl DataItem {
    pub fn serialize(&self, buf: &mut Vec<u8>) {
        match self {
            DataItem::Envelope { envelope } => {
                buf.extend_from_slice(b"ENVELOPE ");
                envelope.serialize(buf);
            }
            DataItem::Flags { flags } => {
                buf.extend_from_slice(b"FLAGS (");
                for (pos, flag) in flags.iter().enumerate() {
                    if pos > 0 {
                        buf.push(b' ');
                    }
                    flag.serialize(buf);
                }
                buf.push(b')');
            }
            DataItem::InternalDate { date } => {
                buf.extend_from_slice(b"INTERNALDATE ");
                quoted_timestamp(buf, *date, 0);
            }
            DataItem::Uid { uid } => {
                buf.extend_from_slice(b"UID ");
                buf.extend_from_slice(uid.to_string().as_bytes());
            }
            DataItem::Rfc822 { contents } => {
                buf.extend_from_slice(b"RFC822 ");
                literal_string(buf, contents);
            }
            DataItem::Rfc822Header { contents } => {
                buf.extend_from_slice(b"RFC822.HEADER ");
                literal_string(buf, contents);
            }
            DataItem::Rfc822Size { size } => {
                buf.extend_from_slice(b"RFC822.SIZE ");
                buf.extend_from_slice(size.to_string().as_bytes());
            }
            DataItem::Rfc822Text { contents } => {
                buf.extend_from_slice(b"RFC822.TEXT ");
                literal_string(buf, contents);
            }
            DataItem::Body { part } => {
                buf.extend_from_slice(b"BODY ");
                part.serialize(buf, false);
            }
            DataItem::BodyStructure { part } => {
                buf.extend_from_slice(b"BODYSTRUCTURE ");
                part.serialize(buf, true);
            }
            DataItem::BodySection {
                sections,
                origin_octet,
                contents,
            } => {
                buf.extend_from_slice(b"BODY[");
                for (pos, section) in sections.iter().enumerate() {
                    if pos > 0 {
                        buf.push(b'.');
                    }
                    section.serialize(buf);
                }
                if let Some(origin_octet) = origin_octet {
                    buf.extend_from_slice(b"]<");
                    buf.extend_from_slice(origin_octet.to_string().as_bytes());
                    buf.extend_from_slice(b"> ");
                } else {
                    buf.extend_from_slice(b"] ");
                }
                literal_string(buf, contents);
            }
            DataItem::Binary {
                sections,
                origin_octet,
                contents,
            } => {
                buf.extend_from_slice(b"BINARY[");
                for (pos, section) in sections.iter().enumerate() {
                    if pos > 0 {
                        buf.push(b'.');
                    }
                    buf.extend_from_slice(section.to_string().as_bytes());
                }
                if let Some(origin_octet) = origin_octet {
                    buf.extend_from_slice(b"]<");
                    buf.extend_from_slice(origin_octet.to_string().as_bytes());
                    buf.extend_from_slice(b"> ");
                } else {
                    buf.extend_from_slice(b"] ");
                }
                buf.extend_from_slice(b"~{");
                buf.extend_from_slice(contents.len().to_string().as_bytes());
                buf.extend_from_slice(b"}\r\n");
                buf.extend_from_slice(contents);
            }
            DataItem::BinarySize { sections, size } => {
                buf.extend_from_slice(b"BINARY.SIZE[");
                for (pos, section) in sections.iter().enumerate() {
                    if pos > 0 {
                        buf.push(b'.');
                    }
                    buf.extend_from_slice(section.to_string().as_bytes());
                }
                buf.extend_from_slice(b"] ");
                buf.extend_from_slice(size.to_string().as_bytes());
            }
            DataItem::Annotation { entries } => {
                buf.extend_from_slice(b"ANNOTATION (");
                for (pos, entry) in entries.iter().enumerate() {
                    if pos > 0 {
                        buf.push(b' ');
                    }
                    buf.extend_from_slice(entry.name.as_bytes());
                    if !entry.attributes.is_empty() {
                        buf.extend_from_slice(b" (");
                        for (pos, (attribute, value)) in entry.attributes.iter().enumerate() {
                            if pos > 0 {
                                buf.push(b' ');
                            }
                            buf.extend_from_slice(attribute.as_bytes());
                            buf.push(b' ');
                            match value {
                                Some(value) => quoted_or_literal_string(buf, value),
                                None if attribute.starts_with("size.") => {
                                    buf.extend_from_slice(b"\"0\"")
                                }
                                None => buf.extend_from_slice(b"NIL"),
                            }
                        }
                        buf.push(b')');
                    }
                }
                buf.push(b')');
            }
            DataItem::ModSeq { modseq } => {
                buf.extend_from_slice(b"MODSEQ (");
                buf.extend_from_slice(modseq.to_string().as_bytes());
                buf.push(b')');
            }
        }
    }
}

impl FetchItem {
    pub fn serialize(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(b"* ");
        buf.extend_from_slice(self.msn.to_string().as_bytes());
        buf.extend_from_slice(b" FETCH (");
        for (pos, item) in self.items.iter().enumerate() {
            if pos > 0 {
                buf.push(b' ');
            }
            item.serialize(buf);
        }
        buf.extend_from_slice(b")\r\n");
    }
}

impl ImapResponse for Response {
    fn serialize(self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(128);
        for item in &self.items {
            item.serialize(&mut buf);
        }
        buf
    }
}

/*

   body            = "(" (body-type-1part / body-type-mpart) ")"

   body-type-1part = (body-type-basic / body-type-msg / body-type-text)
                     [SP body-ext-1part]

   body-type-mpart = 1*body SP media-subtype
                     [SP body-ext-mpart]

   body-type-msg   = media-message SP body-fields SP envelope
                     SP body SP body-fld-lines

   body-type-text  = media-text SP body-fields SP body-fld-lines

   body-fields     = body-fld-param SP body-fld-id SP body-fld-desc SP
                     body-fld-enc SP body-fld-octets

   envelope        = "(" env-date SP env-subject SP env-from SP
                     env-sender SP env-reply-to SP env-to SP env-cc SP
                     env-bcc SP env-in-reply-to SP env-message-id ")"

*/

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Flag, ImapResponse};

    #[test]
    fn serialize_envelope() {
        for (item, expected_response) in [
            (
                DataItem::Envelope {
                    envelope: Envelope {
                        date: Some("Wed, 17 Jul 1996 02:23:25 -0700 (PDT)".into()),
                        subject: Some("IMAP4rev1 WG mtg summary and minutes".into()),
                        from: vec![Address::Single(EmailAddress {
                            name: Some("Terry Gray".into()),
                            localpart: "gray".into(),
                            domain: "cac.washington.edu".into(),
                        })],
                        sender: vec![Address::Single(EmailAddress {
                            name: Some("Terry Gray".into()),
                            localpart: "gray".into(),
                            domain: "cac.washington.edu".into(),
                        })],
                        reply_to: vec![],
                        to: vec![Address::Single(EmailAddress {
                            name: None,
                            localpart: "imap".into(),
                            domain: "cac.washington.edu".into(),
                        })],
                        cc: vec![
                            Address::Single(EmailAddress {
                                name: None,
                                localpart: "minutes".into(),
                                domain: "CNRI.Reston.VA.US".into(),
                            }),
                            Address::Single(EmailAddress {
                                name: Some("John Klensin".into()),
                                localpart: "KLENSIN".into(),
                                domain: "MIT.EDU".into(),
                            }),
                        ],
                        bcc: vec![],
                        in_reply_to: None,
                        message_id: Some("<B27397-0100000@cac.washington.edu>".into()),
                    },
                },
                concat!(
                    "ENVELOPE (\"Wed, 17 Jul 1996 02:23:25 -0700 (PDT)\" ",
                    "\"IMAP4rev1 WG mtg summary and minutes\" ",
                    "((\"Terry Gray\" NIL \"gray\" \"cac.washington.edu\")) ",
                    "((\"Terry Gray\" NIL \"gray\" \"cac.washington.edu\")) ",
                    "NIL ",
                    "((NIL NIL \"imap\" \"cac.washington.edu\")) ",
                    "((NIL NIL \"minutes\" \"CNRI.Reston.VA.US\")",
                    "(\"John Klensin\" NIL \"KLENSIN\" \"MIT.EDU\")) NIL NIL ",
                    "\"<B27397-0100000@cac.washington.edu>\")"
                ),
            ),
            (
                DataItem::Envelope {
                    envelope: Envelope {
                        date: None,
                        subject: Some("Group test".into()),
                        from: vec![Address::Single(EmailAddress {
                            name: Some("Bill Foobar".into()),
                            localpart: "foobar".into(),
                            domain: "example.com".into(),
                        })],
                        sender: vec![],
                        reply_to: vec![],
                        to: vec![Address::Group(AddressGroup {
                            name: Some("Friends and Family".into()),
                            addresses: vec![
                                EmailAddress {
                                    name: Some("John Doe".into()),
                                    localpart: "jdoe".into(),
                                    domain: "example.com".into(),
                                },
                                EmailAddress {
                                    name: Some("Jane Smith".into()),
                                    localpart: "jane.smith".into(),
                                    domain: "example.com".into(),
                                },
                            ],
                        })],
                        cc: vec![],
                        bcc: vec![],
                        in_reply_to: None,
                        message_id: None,
                    },
                },
                concat!(
                    "ENVELOPE (NIL ",
                    "\"Group test\" ",
                    "((\"Bill Foobar\" NIL \"foobar\" \"example.com\")) ",
                    "NIL NIL ",
                    "((NIL NIL \"Friends and Family\" NIL)",
                    "(\"John Doe\" NIL \"jdoe\" \"example.com\")",
                    "(\"Jane Smith\" NIL \"jane.smith\" \"example.com\")",
                    "(NIL NIL NIL NIL)) ",
                    "NIL NIL NIL NIL)"
                ),
            ),
            (
                DataItem::Envelope {
                    envelope: Envelope {
                        subject: Some("non-ascii sender".into()),
                        from: vec![Address::Single(EmailAddress {
                            name: Some("Träumerei".into()),
                            localpart: "traum".into(),
                            domain: "example.de".into(),
                        })],
                        ..Default::default()
                    },
                },
                concat!(
                    "ENVELOPE (NIL \"non-ascii sender\" ",
                    "((\"=?utf-8?q?Tr=C3=A4umerei?=\" NIL \"traum\" \"example.de\")) ",
                    "NIL NIL NIL NIL NIL NIL NIL)"
                ),
            ),
        ] {
            let mut buf = Vec::with_capacity(100);
            item.serialize(&mut buf);
            assert_eq!(String::from_utf8(buf).unwrap(), expected_response);
        }
    }

    #[test]
    fn serialize_body_structures() {
        for (item, expected_response) in [
            (
                DataItem::Body {
                    part: BodyPart::Text {
                        fields: BodyPartFields {
                            body_subtype: Some("PLAIN".into()),
                            body_parameters: vec![("CHARSET".into(), "US-ASCII".into())].into(),
                            body_id: None,
                            body_description: None,
                            body_encoding: Some("7BIT".into()),
                            body_size_octets: 2279,
                        },
                        body_size_lines: 48,
                        body_md5: None,
                        extension: BodyPartExtension::default(),
                    },
                },
                "BODY (\"text\" \"PLAIN\" (\"CHARSET\" \"US-ASCII\") NIL NIL \"7BIT\" 2279 48)",
            ),
            (
                DataItem::Body {
                    part: BodyPart::Multipart {
                        body_parts: vec![
                            BodyPart::Text {
                                fields: BodyPartFields {
                                    body_subtype: Some("PLAIN".into()),
                                    body_parameters: vec![("CHARSET".into(), "US-ASCII".into())]
                                        .into(),
                                    body_id: None,
                                    body_description: None,
                                    body_encoding: Some("7BIT".into()),
                                    body_size_octets: 1152,
                                },
                                body_size_lines: 23,
                                body_md5: None,
                                extension: BodyPartExtension::default(),
                            },
                            BodyPart::Text {
                                fields: BodyPartFields {
                                    body_subtype: Some("PLAIN".into()),
                                    body_parameters: vec![
                                        ("CHARSET".into(), "US-ASCII".into()),
                                        ("NAME".into(), "cc.diff".into()),
                                    ]
                                    .into(),
                                    body_id: Some(
                                        "<960723163407.20117h@cac.washington.edu>".into(),
                                    ),
                                    body_description: Some("Compiler diff".into()),
                                    body_encoding: Some("BASE64".into()),
                                    body_size_octets: 4554,
                                },
                                body_size_lines: 73,
                                body_md5: None,
                                extension: BodyPartExtension::default(),
                            },
                        ],
                        body_subtype: "MIXED".into(),
                        body_parameters: None,
                        extension: BodyPartExtension::default(),
                    },
                },
                concat!(
                    "BODY ((\"text\" \"PLAIN\" (\"CHARSET\" \"US-ASCII\") ",
                    "NIL NIL \"7BIT\" 1152 23)",
                    "(\"text\" \"PLAIN\" (\"CHARSET\" \"US-ASCII\" \"NAME\" \"cc.diff\") ",
                    "\"<960723163407.20117h@cac.washington.edu>\" \"Compiler diff\" ",
                    "\"BASE64\" 4554 73) \"MIXED\")",
                ),
            ),
            (
                DataItem::BodyStructure {
                    part: BodyPart::Multipart {
                        body_parts: vec![
                            BodyPart::Text {
                                fields: BodyPartFields {
                                    body_subtype: Some("PLAIN".into()),
                                    body_parameters: vec![("CHARSET".into(), "UTF-8".into())]
                                        .into(),
                                    body_id: Some("<111@domain.com>".into()),
                                    body_description: Some("Text part".into()),
                                    body_encoding: Some("7BIT".into()),
                                    body_size_octets: 1152,
                                },
                                body_size_lines: 23,
                                body_md5: Some("8o3456".into()),
                                extension: BodyPartExtension {
                                    body_disposition: ("inline".to_string(), vec![]).into(),
                                    body_language: vec!["en-US".to_string()].into(),
                                    body_location: Some("right here".into()),
                                },
                            },
                            BodyPart::Basic {
                                body_type: Some("APPLICATION".into()),
                                fields: BodyPartFields {
                                    body_subtype: Some("MSWORD".into()),
                                    body_parameters: vec![(
                                        "NAME".to_string(),
                                        "chimichangas.docx".to_string(),
                                    )]
                                    .into(),
                                    body_id: Some("<4444@chimi.changa>".into()),
                                    body_description: Some("Chimichangas recipe".into()),
                                    body_encoding: Some("base64".into()),
                                    body_size_octets: 84723,
                                },
                                body_md5: Some("1234".into()),
                                extension: BodyPartExtension {
                                    body_disposition: (
                                        "attachment".to_string(),
                                        vec![(
                                            "filename".to_string(),
                                            "chimichangas.docx".to_string(),
                                        )],
                                    )
                                        .into(),
                                    body_language: vec!["en-MX".to_string(), "es-MX".to_string()]
                                        .into(),
                                    body_location: Some("secret location".into()),
                                },
                            },
                        ],
                        body_subtype: "MIXED".into(),
                        body_parameters: None,
                        extension: BodyPartExtension::default(),
                    },
                },
                concat!(
                    "BODYSTRUCTURE ((\"text\" \"PLAIN\" (\"CHARSET\" \"UTF-8\") ",
                    "\"<111@domain.com>\" \"Text part\" \"7BIT\" 1152 23 \"8o3456\" ",
                    "(\"inline\" NIL) \"en-US\" \"right here\")",
                    "(\"APPLICATION\" \"MSWORD\" (\"NAME\" \"chimichangas.docx\") ",
                    "\"<4444@chimi.changa>\" \"Chimichangas recipe\" \"base64\"",
                    " 84723 \"1234\" ",
                    "(\"attachment\" (\"filename\" \"chimichangas.docx\")) ",
                    "(\"en-MX\" \"es-MX\") ",
                    "\"secret location\") \"MIXED\" NIL NIL NIL NIL)",
                ),
            ),
            (
                DataItem::Body {
                    part: BodyPart::Message {
                        fields: BodyPartFields {
                            body_subtype: Some("RFC822".into()),
                            body_parameters: None,
                            body_id: Some("<abc@123>".into()),
                            body_description: Some("An attached email".into()),
                            body_encoding: Some("quoted-printable".into()),
                            body_size_octets: 9323,
                        },
                        envelope: Box::new(Envelope {
                            date: Some("Wed, 17 Jul 1996 02:23:25 +0000".into()),
                            subject: Some("Hello world!".into()),
                            from: vec![Address::Single(EmailAddress {
                                name: None,
                                localpart: "gray".into(),
                                domain: "cac.washington.edu".into(),
                            })],
                            message_id: Some("<4234324@domain.com>".into()),
                            ..Default::default()
                        })
                        .into(),
                        body: Box::new(BodyPart::Text {
                            fields: BodyPartFields {
                                body_subtype: Some("HTML".into()),
                                body_parameters: None,
                                body_id: None,
                                body_description: None,
                                body_encoding: Some("8BIT".into()),
                                body_size_octets: 4234,
                            },
                            body_size_lines: 431,
                            body_md5: None,
                            extension: BodyPartExtension::default(),
                        })
                        .into(),
                        body_size_lines: 908,
                        body_md5: None,
                        extension: BodyPartExtension::default(),
                    },
                },
                concat!(
                    "BODY (\"message\" \"RFC822\" NIL \"<abc@123>\" \"An attached email\" ",
                    "\"quoted-printable\" 9323 (\"Wed, 17 Jul 1996 02:23:25 +0000\" ",
                    "\"Hello world!\" ",
                    "((NIL NIL \"gray\" \"cac.washington.edu\")) ",
                    "NIL NIL NIL NIL NIL NIL ",
                    "\"<4234324@domain.com>\") (\"text\" \"HTML\" NIL NIL NIL ",
                    "\"8BIT\" 4234 431) 908)"
                ),
            ),
        ] {
            let mut buf = Vec::with_capacity(100);
            item.serialize(&mut buf);
            assert_eq!(String::from_utf8(buf).unwrap(), expected_response);
        }
    }

    #[test]
    fn serialize_sections_and_annotations() {
        for (item, expected_response) in [
            (
                DataItem::BodySection {
                    sections: vec![
                        Section::Part { num: 1 },
                        Section::Part { num: 2 },
                        Section::Mime,
                    ],
                    origin_octet: 11.into(),
                    contents: b"howdy".to_vec(),
                },
                "BODY[1.2.MIME]<11> {5}\r\nhowdy",
            ),
            (
                DataItem::BodySection {
                    sections: vec![Section::HeaderFields {
                        not: true,
                        fields: vec!["Subject".into(), "x-special".into()],
                    }],
                    origin_octet: None,
                    contents: b"howdy".to_vec(),
                },
                "BODY[HEADER.FIELDS.NOT (SUBJECT X-SPECIAL)] {5}\r\nhowdy",
            ),
            (
                DataItem::Binary {
                    sections: vec![1, 2, 3],
                    origin_octet: 10.into(),
                    contents: b"hello".to_vec(),
                },
                "BINARY[1.2.3]<10> ~{5}\r\nhello",
            ),
            (
                DataItem::BinarySize {
                    sections: vec![9, 1],
                    size: 1024,
                },
                "BINARY.SIZE[9.1] 1024",
            ),
            (
                DataItem::Annotation {
                    entries: vec![
                        AnnotationEntry {
                            name: "/comment".into(),
                            attributes: vec![
                                ("value.priv".into(), Some("My comment".into())),
                                ("size.priv".into(), Some("10".into())),
                                ("value.shared".into(), None),
                                ("size.shared".into(), None),
                            ],
                        },
                        AnnotationEntry {
                            name: "/altsubject".into(),
                            attributes: vec![("value.priv".into(), None)],
                        },
                    ],
                },
                concat!(
                    "ANNOTATION (/comment (value.priv \"My comment\" size.priv \"10\" ",
                    "value.shared NIL size.shared \"0\") /altsubject (value.priv NIL))"
                ),
            ),
            (
                DataItem::InternalDate { date: 482374938 },
                "INTERNALDATE \"15-Apr-1985 01:02:18 +0000\"",
            ),
        ] {
            let mut buf = Vec::with_capacity(100);
            item.serialize(&mut buf);
            assert_eq!(String::from_utf8(buf).unwrap(), expected_response);
        }
    }

    #[test]
    fn serialize_fetch() {
        assert_eq!(
            String::from_utf8(
                Response {
                    items: vec![FetchItem {
                        msn: 123,
                        items: vec![
                            DataItem::Flags {
                                flags: vec![Flag::Deleted, Flag::Flagged],
                            },
                            DataItem::Uid { uid: 983 },
                            DataItem::Rfc822Size { size: 443 },
                            DataItem::ModSeq { modseq: 101 },
                        ],
                    }],
                }
                .serialize(),
            )
            .unwrap(),
            concat!(
                "* 123 FETCH (FLAGS (\\Deleted \\Flagged) ",
                "UID 983 ",
                "RFC822.SIZE 443 ",
                "MODSEQ (101))\r\n",
            )
        );
    }
}
