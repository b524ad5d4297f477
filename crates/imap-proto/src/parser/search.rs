/*
 * SPDX-FileCopyrightText: 2024 Loriot Project <dev@loriot.email>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::iter::Peekable;
use std::vec::IntoIter;

use crate::{
    protocol::{Flag, Sequence},
    receiver::{Request, Token},
};

use super::{parse_number, parse_sequence_set};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arguments {
    pub tag: String,
    pub keys: Vec<Key>,
}

/// The search keys this server evaluates without content indexes: flag
/// state, sequence membership and mod-sequences.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Key {
    All,
    Answered,
    Deleted,
    Draft,
    Flagged,
    Recent,
    Seen,
    Unanswered,
    Undeleted,
    Undraft,
    Unflagged,
    Unseen,
    Keyword(Flag),
    Unkeyword(Flag),
    Sequence(Sequence),
    Uid(Sequence),
    ModSeq(u64),
    Not(Box<Key>),
    Or(Box<Key>, Box<Key>),
    And(Vec<Key>),
}

impl Request {
    pub fn parse_search(self) -> crate::Result<Arguments> {
        if self.tokens.is_empty() {
            return Err(self.into_parse_error("Missing search criteria."));
        }
        let mut tokens = self.tokens.into_iter().peekable();

        // An optional CHARSET argument; only ASCII-compatible charsets are
        // accepted since this server evaluates no content keys.
        if tokens
            .peek()
            .map_or(false, |token| token.eq_ignore_ascii_case(b"CHARSET"))
        {
            tokens.next();
            let charset = tokens
                .next()
                .ok_or((self.tag.as_str(), "Missing CHARSET value."))?
                .unwrap_bytes();
            if !charset.eq_ignore_ascii_case(b"UTF-8")
                && !charset.eq_ignore_ascii_case(b"US-ASCII")
            {
                return Err((
                    self.tag,
                    format!(
                        "Unsupported CHARSET {:?}.",
                        String::from_utf8_lossy(&charset)
                    ),
                )
                    .into());
            }
        }

        let mut keys = Vec::new();
        while tokens.peek().is_some() {
            keys.push(parse_key(&mut tokens).map_err(|v| (self.tag.as_str(), v))?);
        }

        if keys.is_empty() {
            return Err((self.tag, "Missing search criteria.").into());
        }

        Ok(Arguments {
            tag: self.tag,
            keys,
        })
    }
}

fn parse_key(tokens: &mut Peekable<IntoIter<Token>>) -> super::Result<Key> {
    match tokens.next() {
        Some(Token::ParenthesisOpen) => {
            let mut keys = Vec::new();
            loop {
                match tokens.peek() {
                    Some(Token::ParenthesisClose) => {
                        tokens.next();
                        break;
                    }
                    Some(_) => keys.push(parse_key(tokens)?),
                    None => return Err("Unterminated parenthesized search key.".into()),
                }
            }
            Ok(Key::And(keys))
        }
        Some(Token::Argument(value)) => {
            if value.eq_ignore_ascii_case(b"ALL") {
                Ok(Key::All)
            } else if value.eq_ignore_ascii_case(b"ANSWERED") {
                Ok(Key::Answered)
            } else if value.eq_ignore_ascii_case(b"DELETED") {
                Ok(Key::Deleted)
            } else if value.eq_ignore_ascii_case(b"DRAFT") {
                Ok(Key::Draft)
            } else if value.eq_ignore_ascii_case(b"FLAGGED") {
                Ok(Key::Flagged)
            } else if value.eq_ignore_ascii_case(b"RECENT") {
                Ok(Key::Recent)
            } else if value.eq_ignore_ascii_case(b"SEEN") {
                Ok(Key::Seen)
            } else if value.eq_ignore_ascii_case(b"UNANSWERED") {
                Ok(Key::Unanswered)
            } else if value.eq_ignore_ascii_case(b"UNDELETED") {
                Ok(Key::Undeleted)
            } else if value.eq_ignore_ascii_case(b"UNDRAFT") {
                Ok(Key::Undraft)
            } else if value.eq_ignore_ascii_case(b"UNFLAGGED") {
                Ok(Key::Unflagged)
            } else if value.eq_ignore_ascii_case(b"UNSEEN") {
                Ok(Key::Unseen)
            } else if value.eq_ignore_ascii_case(b"NEW") {
                Ok(Key::And(vec![Key::Recent, Key::Unseen]))
            } else if value.eq_ignore_ascii_case(b"OLD") {
                Ok(Key::Not(Box::new(Key::Recent)))
            } else if value.eq_ignore_ascii_case(b"KEYWORD") {
                Ok(Key::Keyword(Flag::parse_imap(
                    &tokens
                        .next()
                        .ok_or("Missing KEYWORD flag.")?
                        .unwrap_bytes(),
                )))
            } else if value.eq_ignore_ascii_case(b"UNKEYWORD") {
                Ok(Key::Unkeyword(Flag::parse_imap(
                    &tokens
                        .next()
                        .ok_or("Missing UNKEYWORD flag.")?
                        .unwrap_bytes(),
                )))
            } else if value.eq_ignore_ascii_case(b"UID") {
                Ok(Key::Uid(parse_sequence_set(
                    &tokens
                        .next()
                        .ok_or("Missing UID sequence set.")?
                        .unwrap_bytes(),
                )?))
            } else if value.eq_ignore_ascii_case(b"MODSEQ") {
                // Skip the optional entry-name and entry-type-req arguments.
                let mut last = tokens
                    .next()
                    .ok_or("Missing MODSEQ value.")?
                    .unwrap_bytes();
                while !last.first().map_or(false, u8::is_ascii_digit) {
                    last = tokens
                        .next()
                        .ok_or("Missing MODSEQ value.")?
                        .unwrap_bytes();
                }
                Ok(Key::ModSeq(parse_number::<u64>(&last)?))
            } else if value.eq_ignore_ascii_case(b"NOT") {
                Ok(Key::Not(Box::new(parse_key(tokens)?)))
            } else if value.eq_ignore_ascii_case(b"OR") {
                Ok(Key::Or(
                    Box::new(parse_key(tokens)?),
                    Box::new(parse_key(tokens)?),
                ))
            } else if value.first().map_or(false, |ch| {
                ch.is_ascii_digit() || *ch == b'*'
            }) {
                Ok(Key::Sequence(parse_sequence_set(&value)?))
            } else {
                Err(format!(
                    "Unsupported search key {:?}.",
                    String::from_utf8_lossy(&value)
                )
                .into())
            }
        }
        token => Err(format!("Invalid search criteria {:?}.", token).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::{Arguments, Key};
    use crate::{
        protocol::{Flag, Sequence},
        receiver::Receiver,
    };

    #[test]
    fn parse_search() {
        let mut receiver = Receiver::default();

        for (command, arguments) in [
            (
                "A1 SEARCH UNSEEN\r\n",
                Arguments {
                    tag: "A1".into(),
                    keys: vec![Key::Unseen],
                },
            ),
            (
                "A2 SEARCH DELETED SINCE-NOT-SUPPORTED\r\n",
                Arguments {
                    tag: "err".into(),
                    keys: vec![],
                },
            ),
            (
                "A3 UID SEARCH UID 1:100 NOT DELETED\r\n",
                Arguments {
                    tag: "A3".into(),
                    keys: vec![
                        Key::Uid(Sequence::range(1.into(), 100.into())),
                        Key::Not(Box::new(Key::Deleted)),
                    ],
                },
            ),
            (
                "A4 SEARCH OR (SEEN FLAGGED) KEYWORD $Important MODSEQ 620162338\r\n",
                Arguments {
                    tag: "A4".into(),
                    keys: vec![
                        Key::Or(
                            Box::new(Key::And(vec![Key::Seen, Key::Flagged])),
                            Box::new(Key::Keyword(Flag::Keyword("$Important".into()))),
                        ),
                        Key::ModSeq(620162338),
                    ],
                },
            ),
            (
                "A5 SEARCH CHARSET UTF-8 2:4,9\r\n",
                Arguments {
                    tag: "A5".into(),
                    keys: vec![Key::Sequence(Sequence::List {
                        items: vec![Sequence::range(2.into(), 4.into()), Sequence::number(9)],
                    })],
                },
            ),
        ] {
            let result = receiver
                .parse(&mut command.as_bytes().iter())
                .unwrap()
                .parse_search();
            if arguments.tag == "err" {
                assert!(result.is_err(), "{}", command);
            } else {
                assert_eq!(result.expect(command), arguments, "{}", command);
            }
        }
    }
}
