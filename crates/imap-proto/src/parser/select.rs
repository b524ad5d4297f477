/*
 * SPDX-FileCopyrightText: 2024 Loriot Project <dev@loriot.email>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::receiver::{Request, Token};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arguments {
    pub tag: String,
    pub mailbox_name: String,
    pub condstore: bool,
}

impl Request {
    pub fn parse_select(self) -> crate::Result<Arguments> {
        let mut tokens = self.tokens.into_iter().peekable();

        let mailbox_name = tokens
            .next()
            .ok_or((self.tag.as_str(), "Missing mailbox name."))?
            .unwrap_string()
            .map_err(|v| (self.tag.as_str(), v))?;

        // Optional select parameters, of which only CONDSTORE is recognised.
        let mut condstore = false;
        if let Some(Token::ParenthesisOpen) = tokens.peek() {
            tokens.next();
            for token in tokens {
                match token {
                    Token::Argument(param) if param.eq_ignore_ascii_case(b"CONDSTORE") => {
                        condstore = true;
                    }
                    Token::ParenthesisClose => break,
                    _ => {
                        return Err((
                            self.tag,
                            format!("Unknown select parameter {:?}.", token.to_string()),
                        )
                            .into());
                    }
                }
            }
        }

        Ok(Arguments {
            tag: self.tag,
            mailbox_name,
            condstore,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::Arguments;
    use crate::receiver::Receiver;

    #[test]
    fn parse_select() {
        let mut receiver = Receiver::default();

        for (command, arguments) in [
            (
                "A142 SELECT INBOX\r\n",
                Arguments {
                    tag: "A142".into(),
                    mailbox_name: "INBOX".into(),
                    condstore: false,
                },
            ),
            (
                "A142 SELECT \"lists/mja\" (CONDSTORE)\r\n",
                Arguments {
                    tag: "A142".into(),
                    mailbox_name: "lists/mja".into(),
                    condstore: true,
                },
            ),
        ] {
            assert_eq!(
                receiver
                    .parse(&mut command.as_bytes().iter())
                    .unwrap()
                    .parse_select()
                    .expect(command),
                arguments,
                "{}",
                command
            );
        }
    }
}
