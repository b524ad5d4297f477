/*
 * SPDX-FileCopyrightText: 2024 Loriot Project <dev@loriot.email>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::{
    protocol::{Flag, Sequence},
    receiver::{Request, Token},
};

use super::{parse_number, parse_sequence_set};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arguments {
    pub tag: String,
    pub sequence_set: Sequence,
    pub operation: Operation,
    pub silent: bool,
    pub flags: Vec<Flag>,
    pub unchanged_since: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Set,
    Add,
    Clear,
}

impl Request {
    pub fn parse_store(self) -> crate::Result<Arguments> {
        let mut tokens = self.tokens.into_iter().peekable();

        // Sequence set
        let sequence_set = parse_sequence_set(
            &tokens
                .next()
                .ok_or((self.tag.as_str(), "Missing sequence set."))?
                .unwrap_bytes(),
        )
        .map_err(|v| (self.tag.as_str(), v))?;

        // CONDSTORE parameters
        let mut unchanged_since = None;
        if let Some(Token::ParenthesisOpen) = tokens.peek() {
            tokens.next();
            while let Some(token) = tokens.next() {
                match token {
                    Token::Argument(param) if param.eq_ignore_ascii_case(b"UNCHANGEDSINCE") => {
                        unchanged_since = parse_number::<u64>(
                            &tokens
                                .next()
                                .ok_or((self.tag.as_str(), "Missing UNCHANGEDSINCE parameter."))?
                                .unwrap_bytes(),
                        )
                        .map_err(|v| (self.tag.as_str(), v))?
                        .into();
                    }
                    Token::ParenthesisClose => break,
                    _ => {
                        return Err((
                            self.tag,
                            format!("Unknown store modifier {:?}.", token.to_string()),
                        )
                            .into());
                    }
                }
            }
        }

        // Operation
        let operation = tokens
            .next()
            .ok_or((self.tag.as_str(), "Missing message data item name."))?
            .unwrap_bytes();
        let (operation, silent) = if operation.eq_ignore_ascii_case(b"FLAGS") {
            (Operation::Set, false)
        } else if operation.eq_ignore_ascii_case(b"FLAGS.SILENT") {
            (Operation::Set, true)
        } else if operation.eq_ignore_ascii_case(b"+FLAGS") {
            (Operation::Add, false)
        } else if operation.eq_ignore_ascii_case(b"+FLAGS.SILENT") {
            (Operation::Add, true)
        } else if operation.eq_ignore_ascii_case(b"-FLAGS") {
            (Operation::Clear, false)
        } else if operation.eq_ignore_ascii_case(b"-FLAGS.SILENT") {
            (Operation::Clear, true)
        } else {
            return Err((
                self.tag,
                format!(
                    "Unsupported data item name: {:?}.",
                    String::from_utf8_lossy(&operation)
                ),
            )
                .into());
        };

        // Flags
        let mut flags = Vec::new();
        for token in tokens {
            match token {
                Token::ParenthesisOpen | Token::ParenthesisClose => (),
                Token::Argument(flag) => {
                    flags.push(Flag::parse_imap(&flag));
                }
                _ => {
                    return Err((self.tag, "Invalid flag name.").into());
                }
            }
        }

        Ok(Arguments {
            tag: self.tag,
            sequence_set,
            operation,
            silent,
            flags,
            unchanged_since,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{Arguments, Operation};
    use crate::{
        protocol::{Flag, Sequence},
        receiver::Receiver,
    };

    #[test]
    fn parse_store() {
        let mut receiver = Receiver::default();

        for (command, arguments) in [
            (
                "A003 STORE 2:4 +FLAGS (\\Deleted)\r\n",
                Arguments {
                    tag: "A003".into(),
                    sequence_set: Sequence::range(2.into(), 4.into()),
                    operation: Operation::Add,
                    silent: false,
                    flags: vec![Flag::Deleted],
                    unchanged_since: None,
                },
            ),
            (
                "A004 STORE 1 FLAGS.SILENT (\\Seen custom)\r\n",
                Arguments {
                    tag: "A004".into(),
                    sequence_set: Sequence::number(1),
                    operation: Operation::Set,
                    silent: true,
                    flags: vec![Flag::Seen, Flag::Keyword("custom".into())],
                    unchanged_since: None,
                },
            ),
            (
                "d105 STORE 7,5,9 (UNCHANGEDSINCE 320162338) +FLAGS.SILENT (\\Deleted)\r\n",
                Arguments {
                    tag: "d105".into(),
                    sequence_set: Sequence::List {
                        items: vec![
                            Sequence::number(7),
                            Sequence::number(5),
                            Sequence::number(9),
                        ],
                    },
                    operation: Operation::Add,
                    silent: true,
                    flags: vec![Flag::Deleted],
                    unchanged_since: Some(320162338),
                },
            ),
        ] {
            assert_eq!(
                receiver
                    .parse(&mut command.as_bytes().iter())
                    .unwrap()
                    .parse_store()
                    .expect(command),
                arguments,
                "{}",
                command
            );
        }
    }
}
