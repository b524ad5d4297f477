/*
 * SPDX-FileCopyrightText: 2024 Loriot Project <dev@loriot.email>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::borrow::Cow;
use std::iter::Peekable;
use std::vec::IntoIter;

use crate::{
    protocol::fetch::{self, Attribute, Section},
    receiver::{Request, Token},
};

use super::{parse_number, parse_sequence_set, PushUnique};

const LEGAL_ANNOTATION_ATTRIBUTES: &[&str] = &[
    "value",
    "value.priv",
    "value.shared",
    "size",
    "size.priv",
    "size.shared",
];

impl Request {
    #[allow(clippy::while_let_on_iterator)]
    pub fn parse_fetch(self) -> crate::Result<fetch::Arguments> {
        if self.tokens.len() < 2 {
            return Err(self.into_parse_error("Missing parameters."));
        }

        let mut tokens = self.tokens.into_iter().peekable();
        let mut attributes = Vec::new();
        let sequence_set = parse_sequence_set(
            &tokens
                .next()
                .ok_or((self.tag.as_str(), "Missing sequence set."))?
                .unwrap_bytes(),
        )
        .map_err(|v| (self.tag.as_str(), v))?;

        let mut in_parentheses = false;

        while let Some(token) = tokens.next() {
            match token {
                Token::Argument(value) => {
                    if value.eq_ignore_ascii_case(b"ALL") {
                        attributes = vec![
                            Attribute::Flags,
                            Attribute::InternalDate,
                            Attribute::Rfc822Size,
                            Attribute::Envelope,
                        ];
                        break;
                    } else if value.eq_ignore_ascii_case(b"FULL") {
                        attributes = vec![
                            Attribute::Flags,
                            Attribute::InternalDate,
                            Attribute::Rfc822Size,
                            Attribute::Envelope,
                            Attribute::Body,
                        ];
                        break;
                    } else if value.eq_ignore_ascii_case(b"FAST") {
                        attributes = vec![
                            Attribute::Flags,
                            Attribute::InternalDate,
                            Attribute::Rfc822Size,
                        ];
                        break;
                    } else if value.eq_ignore_ascii_case(b"ENVELOPE") {
                        attributes.push_unique(Attribute::Envelope);
                    } else if value.eq_ignore_ascii_case(b"FLAGS") {
                        attributes.push_unique(Attribute::Flags);
                    } else if value.eq_ignore_ascii_case(b"INTERNALDATE") {
                        attributes.push_unique(Attribute::InternalDate);
                    } else if value.eq_ignore_ascii_case(b"BODYSTRUCTURE") {
                        attributes.push_unique(Attribute::BodyStructure);
                    } else if value.eq_ignore_ascii_case(b"UID") {
                        attributes.push_unique(Attribute::Uid);
                    } else if value.eq_ignore_ascii_case(b"MODSEQ") {
                        attributes.push_unique(Attribute::ModSeq);
                    } else if value.eq_ignore_ascii_case(b"RFC822") {
                        attributes.push_unique(
                            if tokens.peek().map_or(false, |token| token.is_dot()) {
                                tokens.next();
                                let rfc822 = tokens
                                    .next()
                                    .ok_or((self.tag.as_str(), "Missing RFC822 parameter."))?
                                    .unwrap_bytes();
                                if rfc822.eq_ignore_ascii_case(b"HEADER") {
                                    Attribute::Rfc822Header
                                } else if rfc822.eq_ignore_ascii_case(b"SIZE") {
                                    Attribute::Rfc822Size
                                } else if rfc822.eq_ignore_ascii_case(b"TEXT") {
                                    Attribute::Rfc822Text
                                } else {
                                    return Err((
                                        self.tag,
                                        format!(
                                            "Invalid RFC822 parameter {:?}.",
                                            String::from_utf8_lossy(&rfc822)
                                        ),
                                    )
                                        .into());
                                }
                            } else {
                                Attribute::Rfc822
                            },
                        );
                    } else if value.eq_ignore_ascii_case(b"BODY") {
                        let is_peek = match tokens.peek() {
                            Some(Token::BracketOpen) => {
                                tokens.next();
                                false
                            }
                            Some(Token::Dot) => {
                                tokens.next();
                                if tokens
                                    .next()
                                    .map_or(true, |token| !token.eq_ignore_ascii_case(b"PEEK"))
                                {
                                    return Err(
                                        (self.tag.as_str(), "Expected 'PEEK' after '.'.").into()
                                    );
                                }
                                if tokens.next().map_or(true, |token| !token.is_bracket_open()) {
                                    return Err((
                                        self.tag.as_str(),
                                        "Expected '[' after 'BODY.PEEK'",
                                    )
                                        .into());
                                }
                                true
                            }
                            _ => {
                                attributes.push_unique(Attribute::Body);
                                continue;
                            }
                        };

                        let sections = parse_section_spec(&mut tokens)
                            .map_err(|v| (self.tag.as_str(), v))?;
                        attributes.push_unique(Attribute::BodySection {
                            peek: is_peek,
                            sections,
                            partial: parse_partial(&mut tokens)
                                .map_err(|v| (self.tag.as_str(), v))?,
                        });
                    } else if value.eq_ignore_ascii_case(b"BINARY") {
                        let (is_peek, is_size) = if let Some(Token::Dot) = tokens.peek() {
                            tokens.next();
                            let param = tokens
                                .next()
                                .ok_or({
                                    (self.tag.as_str(), "Missing parameter after 'BINARY.'.")
                                })?
                                .unwrap_bytes();
                            if param.eq_ignore_ascii_case(b"PEEK") {
                                (true, false)
                            } else if param.eq_ignore_ascii_case(b"SIZE") {
                                (false, true)
                            } else {
                                return Err((
                                    self.tag,
                                    "Expected 'PEEK' or 'SIZE' after 'BINARY.'.",
                                )
                                    .into());
                            }
                        } else {
                            (false, false)
                        };

                        if tokens.next().map_or(true, |token| !token.is_bracket_open()) {
                            return Err((self.tag.as_str(), "Expected '[' after 'BINARY'.").into());
                        }
                        let mut sections = Vec::new();
                        while let Some(token) = tokens.next() {
                            match token {
                                Token::Argument(value) => {
                                    sections.push(
                                        parse_number::<u32>(&value)
                                            .map_err(|v| (self.tag.as_str(), v))?,
                                    );
                                }
                                Token::Dot => (),
                                Token::BracketClose => break,
                                _ => {
                                    return Err((
                                        self.tag,
                                        format!(
                                            "Expected part section integer, got {:?}.",
                                            token.to_string()
                                        ),
                                    )
                                        .into())
                                }
                            }
                        }
                        attributes.push_unique(if !is_size {
                            Attribute::Binary {
                                peek: is_peek,
                                sections,
                                partial: parse_partial(&mut tokens)
                                    .map_err(|v| (self.tag.as_str(), v))?,
                            }
                        } else {
                            Attribute::BinarySize { sections }
                        });
                    } else if value.eq_ignore_ascii_case(b"ANNOTATION") {
                        attributes.push_unique(
                            parse_annotation(&mut tokens).map_err(|v| (self.tag.as_str(), v))?,
                        );
                    } else {
                        return Err((
                            self.tag,
                            format!("Invalid attribute {:?}", String::from_utf8_lossy(&value)),
                        )
                            .into());
                    }

                    if !in_parentheses {
                        break;
                    }
                }
                Token::ParenthesisOpen => {
                    if !in_parentheses {
                        in_parentheses = true;
                    } else {
                        return Err((self.tag.as_str(), "Unexpected parenthesis open.").into());
                    }
                }
                Token::ParenthesisClose => {
                    if in_parentheses {
                        break;
                    } else {
                        return Err((self.tag.as_str(), "Unexpected parenthesis close.").into());
                    }
                }
                _ => {
                    return Err((
                        self.tag,
                        format!("Invalid fetch argument {:?}.", token.to_string()),
                    )
                        .into())
                }
            }
        }

        // RFC 4466 fetch modifiers; only CHANGEDSINCE is recognised.
        let mut changed_since = None;
        if let Some(Token::ParenthesisOpen) = tokens.peek() {
            tokens.next();
            while let Some(token) = tokens.next() {
                match token {
                    Token::Argument(param) if param.eq_ignore_ascii_case(b"CHANGEDSINCE") => {
                        changed_since = parse_number::<u64>(
                            &tokens
                                .next()
                                .ok_or((self.tag.as_str(), "Missing CHANGEDSINCE parameter."))?
                                .unwrap_bytes(),
                        )
                        .map_err(|v| (self.tag.as_str(), v))?
                        .into();
                    }
                    Token::ParenthesisClose => {
                        break;
                    }
                    _ => {
                        return Err((
                            self.tag.as_str(),
                            Cow::from(format!("Unknown fetch modifier '{}'.", token)),
                        )
                            .into());
                    }
                }
            }
        }

        if !attributes.is_empty() {
            Ok(fetch::Arguments {
                tag: self.tag,
                sequence_set,
                attributes,
                changed_since,
            })
        } else {
            Err((self.tag, "No data items to fetch specified.").into())
        }
    }
}

#[allow(clippy::while_let_on_iterator)]
fn parse_section_spec(tokens: &mut Peekable<IntoIter<Token>>) -> super::Result<Vec<Section>> {
    let mut sections = Vec::new();
    while let Some(token) = tokens.next() {
        match token {
            Token::BracketClose => break,
            Token::Argument(value) => {
                let section = if value.eq_ignore_ascii_case(b"HEADER") {
                    if let Some(Token::Dot) = tokens.peek() {
                        tokens.next();
                        if tokens
                            .next()
                            .map_or(true, |token| !token.eq_ignore_ascii_case(b"FIELDS"))
                        {
                            return Err("Expected 'FIELDS' after 'HEADER.'.".into());
                        }
                        let is_not = if let Some(Token::Dot) = tokens.peek() {
                            tokens.next();
                            if tokens
                                .next()
                                .map_or(true, |token| !token.eq_ignore_ascii_case(b"NOT"))
                            {
                                return Err("Expected 'NOT' after 'HEADER.FIELDS.'.".into());
                            }
                            true
                        } else {
                            false
                        };
                        if tokens
                            .next()
                            .map_or(true, |token| !token.is_parenthesis_open())
                        {
                            return Err("Expected '(' after 'HEADER.FIELDS'.".into());
                        }
                        let mut fields = Vec::new();
                        while let Some(token) = tokens.next() {
                            match token {
                                Token::ParenthesisClose => break,
                                Token::Argument(value) => {
                                    fields.push(String::from_utf8(value).map_err(|_| {
                                        Cow::from("Invalid UTF-8 in header field name.")
                                    })?);
                                }
                                _ => return Err("Expected a header field name.".into()),
                            }
                        }
                        Section::HeaderFields {
                            not: is_not,
                            fields,
                        }
                    } else {
                        Section::Header
                    }
                } else if value.eq_ignore_ascii_case(b"TEXT") {
                    Section::Text
                } else if value.eq_ignore_ascii_case(b"MIME") {
                    Section::Mime
                } else {
                    Section::Part {
                        num: parse_number::<u32>(&value)?,
                    }
                };
                sections.push(section);
            }
            Token::Dot => (),
            _ => {
                return Err(format!("Invalid token {:?} found in section-spec.", token).into());
            }
        }
    }
    Ok(sections)
}

pub fn parse_partial(tokens: &mut Peekable<IntoIter<Token>>) -> super::Result<Option<(u32, u32)>> {
    if tokens.peek().map_or(true, |token| !token.is_lt()) {
        return Ok(None);
    }
    tokens.next();

    let offset = parse_number::<u32>(
        &tokens
            .next()
            .ok_or_else(|| Cow::from("Missing partial offset."))?
            .unwrap_bytes(),
    )?;

    if tokens.next().map_or(true, |token| !token.is_dot()) {
        return Err("Expected '.' after partial offset.".into());
    }

    let length = parse_number::<u32>(
        &tokens
            .next()
            .ok_or_else(|| Cow::from("Missing partial length."))?
            .unwrap_bytes(),
    )?;

    if length == 0 {
        return Err("Invalid partial range.".into());
    }

    if tokens.next().map_or(true, |token| !token.is_gt()) {
        return Err("Expected '>' after range.".into());
    }

    Ok(Some((offset, length)))
}

/// Reassembles an atom that the receiver split on '.' boundaries.
fn read_dotted_atom(tokens: &mut Peekable<IntoIter<Token>>) -> super::Result<String> {
    let mut atom = match tokens.next() {
        Some(Token::Argument(value)) => {
            String::from_utf8(value).map_err(|_| Cow::from("Invalid UTF-8 in atom."))?
        }
        token => {
            return Err(format!("Expected an atom, found {:?}.", token).into());
        }
    };
    while let Some(Token::Dot) = tokens.peek() {
        tokens.next();
        atom.push('.');
        match tokens.next() {
            Some(Token::Argument(value)) => {
                atom.push_str(
                    std::str::from_utf8(&value)
                        .map_err(|_| Cow::from("Invalid UTF-8 in atom."))?,
                );
            }
            token => {
                return Err(format!("Expected an atom, found {:?}.", token).into());
            }
        }
    }
    Ok(atom)
}

/// Parses the `ANNOTATION (entries attribs)` fetch attribute. Unsuffixed
/// attribute names expand into their `.priv` and `.shared` forms.
fn parse_annotation(tokens: &mut Peekable<IntoIter<Token>>) -> super::Result<Attribute> {
    if tokens
        .next()
        .map_or(true, |token| !token.is_parenthesis_open())
    {
        return Err("Expected '(' after ANNOTATION.".into());
    }

    let mut entries = Vec::new();
    if let Some(Token::ParenthesisOpen) = tokens.peek() {
        tokens.next();
        loop {
            entries.push(read_dotted_atom(tokens)?);
            if let Some(Token::ParenthesisClose) = tokens.peek() {
                tokens.next();
                break;
            }
        }
    } else {
        entries.push(read_dotted_atom(tokens)?);
    }

    let mut attributes = Vec::new();
    let mut push_attribute = |attribute: String| -> super::Result<()> {
        if !LEGAL_ANNOTATION_ATTRIBUTES.contains(&attribute.as_str()) {
            return Err(format!("Unknown annotation attribute: {}", attribute).into());
        }
        if attribute.ends_with(".priv") || attribute.ends_with(".shared") {
            attributes.push_unique(attribute);
        } else {
            attributes.push_unique(format!("{}.priv", attribute));
            attributes.push_unique(format!("{}.shared", attribute));
        }
        Ok(())
    };

    if let Some(Token::ParenthesisOpen) = tokens.peek() {
        tokens.next();
        loop {
            push_attribute(read_dotted_atom(tokens)?)?;
            if let Some(Token::ParenthesisClose) = tokens.peek() {
                tokens.next();
                break;
            }
        }
    } else {
        push_attribute(read_dotted_atom(tokens)?)?;
    }

    if tokens
        .next()
        .map_or(true, |token| !token.is_parenthesis_close())
    {
        return Err("Expected ')' after annotation attributes.".into());
    }

    Ok(Attribute::Annotation {
        entries,
        attributes,
    })
}

#[cfg(test)]
mod tests {
    use crate::{
        protocol::{
            fetch::{self, Attribute, Section},
            Sequence,
        },
        receiver::Receiver,
    };

    #[test]
    fn parse_fetch() {
        let mut receiver = Receiver::default();

        for (command, arguments) in [
            (
                "A654 FETCH 2:4 (FLAGS BODY[HEADER.FIELDS (DATE FROM)])\r\n",
                fetch::Arguments {
                    tag: "A654".into(),
                    sequence_set: Sequence::range(2.into(), 4.into()),
                    attributes: vec![
                        Attribute::Flags,
                        Attribute::BodySection {
                            peek: false,
                            sections: vec![Section::HeaderFields {
                                not: false,
                                fields: vec!["DATE".into(), "FROM".into()],
                            }],
                            partial: None,
                        },
                    ],
                    changed_since: None,
                },
            ),
            (
                "A001 FETCH 1 BODY[]\r\n",
                fetch::Arguments {
                    tag: "A001".into(),
                    sequence_set: Sequence::number(1),
                    attributes: vec![Attribute::BodySection {
                        peek: false,
                        sections: vec![],
                        partial: None,
                    }],
                    changed_since: None,
                },
            ),
            (
                "A001 FETCH 1 (BODY[HEADER.FIELDS.NOT (FROM TO SUBJECT)])\r\n",
                fetch::Arguments {
                    tag: "A001".into(),
                    sequence_set: Sequence::number(1),
                    attributes: vec![Attribute::BodySection {
                        peek: false,
                        sections: vec![Section::HeaderFields {
                            not: true,
                            fields: vec!["FROM".into(), "TO".into(), "SUBJECT".into()],
                        }],
                        partial: None,
                    }],
                    changed_since: None,
                },
            ),
            (
                "A001 FETCH 1 (BODY.PEEK[4.2.HEADER]<0.20> BODY[4.2.TEXT]<4.100>)\r\n",
                fetch::Arguments {
                    tag: "A001".into(),
                    sequence_set: Sequence::number(1),
                    attributes: vec![
                        Attribute::BodySection {
                            peek: true,
                            sections: vec![
                                Section::Part { num: 4 },
                                Section::Part { num: 2 },
                                Section::Header,
                            ],
                            partial: Some((0, 20)),
                        },
                        Attribute::BodySection {
                            peek: false,
                            sections: vec![
                                Section::Part { num: 4 },
                                Section::Part { num: 2 },
                                Section::Text,
                            ],
                            partial: Some((4, 100)),
                        },
                    ],
                    changed_since: None,
                },
            ),
            (
                "A001 FETCH 1 (BINARY[1.2.3] BINARY.PEEK[4]<9.88> BINARY.SIZE[9.1])\r\n",
                fetch::Arguments {
                    tag: "A001".into(),
                    sequence_set: Sequence::number(1),
                    attributes: vec![
                        Attribute::Binary {
                            peek: false,
                            sections: vec![1, 2, 3],
                            partial: None,
                        },
                        Attribute::Binary {
                            peek: true,
                            sections: vec![4],
                            partial: Some((9, 88)),
                        },
                        Attribute::BinarySize {
                            sections: vec![9, 1],
                        },
                    ],
                    changed_since: None,
                },
            ),
            (
                "A001 FETCH 1 ALL\r\n",
                fetch::Arguments {
                    tag: "A001".into(),
                    sequence_set: Sequence::number(1),
                    attributes: vec![
                        Attribute::Flags,
                        Attribute::InternalDate,
                        Attribute::Rfc822Size,
                        Attribute::Envelope,
                    ],
                    changed_since: None,
                },
            ),
            (
                "s100 UID FETCH 1:* (FLAGS MODSEQ) (CHANGEDSINCE 12345)\r\n",
                fetch::Arguments {
                    tag: "s100".into(),
                    sequence_set: Sequence::range(1.into(), None),
                    attributes: vec![Attribute::Flags, Attribute::ModSeq],
                    changed_since: 12345.into(),
                },
            ),
            (
                "A1 FETCH 1 (ANNOTATION (/comment value))\r\n",
                fetch::Arguments {
                    tag: "A1".into(),
                    sequence_set: Sequence::number(1),
                    attributes: vec![Attribute::Annotation {
                        entries: vec!["/comment".into()],
                        attributes: vec!["value.priv".into(), "value.shared".into()],
                    }],
                    changed_since: None,
                },
            ),
            (
                "A2 FETCH 1 (ANNOTATION ((/comment /altsubject) (value.priv size.priv)))\r\n",
                fetch::Arguments {
                    tag: "A2".into(),
                    sequence_set: Sequence::number(1),
                    attributes: vec![Attribute::Annotation {
                        entries: vec!["/comment".into(), "/altsubject".into()],
                        attributes: vec!["value.priv".into(), "size.priv".into()],
                    }],
                    changed_since: None,
                },
            ),
        ] {
            assert_eq!(
                receiver
                    .parse(&mut command.as_bytes().iter())
                    .unwrap()
                    .parse_fetch()
                    .expect(command),
                arguments,
                "{}",
                command
            );
        }
    }

    #[test]
    fn parse_fetch_invalid() {
        let mut receiver = Receiver::default();
        for command in [
            "A1 FETCH 1 (ANNOTATION (/comment frobs))\r\n",
            "A2 FETCH 1 ()\r\n",
            "A3 FETCH 1 (BODY[]<1.0>)\r\n",
        ] {
            assert!(
                receiver
                    .parse(&mut command.as_bytes().iter())
                    .unwrap()
                    .parse_fetch()
                    .is_err(),
                "{}",
                command
            );
        }
    }
}
