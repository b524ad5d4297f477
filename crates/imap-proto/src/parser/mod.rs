/*
 * SPDX-FileCopyrightText: 2024 Loriot Project <dev@loriot.email>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::borrow::Cow;
use std::str::FromStr;

use crate::protocol::Sequence;

pub mod fetch;
pub mod search;
pub mod select;
pub mod status;
pub mod store;

pub type Result<T> = std::result::Result<T, Cow<'static, str>>;

pub fn parse_number<T: FromStr>(value: &[u8]) -> Result<T> {
    std::str::from_utf8(value)
        .ok()
        .and_then(|string| string.parse::<T>().ok())
        .ok_or_else(|| {
            Cow::from(format!(
                "Expected a number, found {:?}.",
                String::from_utf8_lossy(value)
            ))
        })
}

/// Parses a sequence-set such as "1,3:5,7:*" or "*".
pub fn parse_sequence_set(value: &[u8]) -> Result<Sequence> {
    let mut items = Vec::new();
    for part in value.split(|&ch| ch == b',') {
        let mut range = part.splitn(2, |&ch| ch == b':');
        let start = parse_sequence_number(range.next().unwrap_or_default())?;
        match range.next() {
            Some(end) => {
                items.push(Sequence::Range {
                    start,
                    end: parse_sequence_number(end)?,
                });
            }
            None => match start {
                Some(value) => items.push(Sequence::Number { value }),
                None => items.push(Sequence::Range {
                    start: None,
                    end: None,
                }),
            },
        }
    }
    match items.len() {
        0 => Err("Invalid empty sequence set.".into()),
        1 => Ok(items.into_iter().next().unwrap()),
        _ => Ok(Sequence::List { items }),
    }
}

fn parse_sequence_number(value: &[u8]) -> Result<Option<u32>> {
    if value == b"*" {
        Ok(None)
    } else if !value.is_empty() {
        let num = parse_number::<u32>(value)?;
        if num > 0 {
            Ok(Some(num))
        } else {
            Err("Sequence numbers start at 1.".into())
        }
    } else {
        Err("Invalid sequence set.".into())
    }
}

pub trait PushUnique<T> {
    fn push_unique(&mut self, value: T);
}

impl<T: PartialEq> PushUnique<T> for Vec<T> {
    fn push_unique(&mut self, value: T) {
        if !self.contains(&value) {
            self.push(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_sequence_sets() {
        assert_eq!(
            parse_sequence_set(b"1").unwrap(),
            Sequence::Number { value: 1 }
        );
        assert_eq!(
            parse_sequence_set(b"2:4").unwrap(),
            Sequence::range(2.into(), 4.into())
        );
        assert_eq!(
            parse_sequence_set(b"*").unwrap(),
            Sequence::range(None, None)
        );
        assert_eq!(
            parse_sequence_set(b"1:*").unwrap(),
            Sequence::range(1.into(), None)
        );
        assert_eq!(
            parse_sequence_set(b"1,3:5,9").unwrap(),
            Sequence::List {
                items: vec![
                    Sequence::number(1),
                    Sequence::range(3.into(), 5.into()),
                    Sequence::number(9),
                ]
            }
        );
        assert!(parse_sequence_set(b"").is_err());
        assert!(parse_sequence_set(b"0").is_err());
        assert!(parse_sequence_set(b"1,a").is_err());
    }
}
