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
    pub items: Vec<Item>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Item {
    Messages,
    Recent,
    UidNext,
    UidValidity,
    Unseen,
    HighestModSeq,
}

impl Item {
    pub fn as_str(&self) -> &'static str {
        match self {
            Item::Messages => "MESSAGES",
            Item::Recent => "RECENT",
            Item::UidNext => "UIDNEXT",
            Item::UidValidity => "UIDVALIDITY",
            Item::Unseen => "UNSEEN",
            Item::HighestModSeq => "HIGHESTMODSEQ",
        }
    }
}

impl Request {
    pub fn parse_status(self) -> crate::Result<Arguments> {
        let mut tokens = self.tokens.into_iter();

        let mailbox_name = tokens
            .next()
            .ok_or((self.tag.as_str(), "Missing mailbox name."))?
            .unwrap_string()
            .map_err(|v| (self.tag.as_str(), v))?;

        let mut items = Vec::new();
        for token in tokens {
            match token {
                Token::ParenthesisOpen | Token::ParenthesisClose => (),
                Token::Argument(value) => {
                    if value.eq_ignore_ascii_case(b"MESSAGES") {
                        items.push(Item::Messages);
                    } else if value.eq_ignore_ascii_case(b"RECENT") {
                        items.push(Item::Recent);
                    } else if value.eq_ignore_ascii_case(b"UIDNEXT") {
                        items.push(Item::UidNext);
                    } else if value.eq_ignore_ascii_case(b"UIDVALIDITY") {
                        items.push(Item::UidValidity);
                    } else if value.eq_ignore_ascii_case(b"UNSEEN") {
                        items.push(Item::Unseen);
                    } else if value.eq_ignore_ascii_case(b"HIGHESTMODSEQ") {
                        items.push(Item::HighestModSeq);
                    } else {
                        return Err((
                            self.tag,
                            format!(
                                "Invalid status item {:?}.",
                                String::from_utf8_lossy(&value)
                            ),
                        )
                            .into());
                    }
                }
                _ => return Err((self.tag, "Invalid status arguments.").into()),
            }
        }

        if items.is_empty() {
            return Err((self.tag, "Missing status items.").into());
        }

        Ok(Arguments {
            tag: self.tag,
            mailbox_name,
            items,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{Arguments, Item};
    use crate::receiver::Receiver;

    #[test]
    fn parse_status() {
        let mut receiver = Receiver::default();

        assert_eq!(
            receiver
                .parse(&mut "A042 STATUS blurdybloop (UIDNEXT MESSAGES)\r\n".as_bytes().iter())
                .unwrap()
                .parse_status()
                .unwrap(),
            Arguments {
                tag: "A042".into(),
                mailbox_name: "blurdybloop".into(),
                items: vec![Item::UidNext, Item::Messages],
            }
        );
    }
}
