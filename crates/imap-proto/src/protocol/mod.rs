/*
 * SPDX-FileCopyrightText: 2024 Loriot Project <dev@loriot.email>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::cmp::Ordering;

use ahash::AHashSet;
use chrono::{DateTime, FixedOffset, TimeZone, Utc};

pub mod fetch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sequence {
    Number {
        value: u32,
    },
    Range {
        start: Option<u32>,
        end: Option<u32>,
    },
    List {
        items: Vec<Sequence>,
    },
}

impl Sequence {
    pub fn number(value: u32) -> Sequence {
        Sequence::Number { value }
    }

    pub fn range(start: Option<u32>, end: Option<u32>) -> Sequence {
        Sequence::Range { start, end }
    }

    pub fn contains(&self, value: u32, max_value: u32) -> bool {
        match self {
            Sequence::Number { value: number } => *number == value,
            Sequence::Range { start, end } => match (start, end) {
                (Some(start), Some(end)) => {
                    value >= *start && value <= *end || value >= *end && value <= *start
                }
                (Some(range), None) | (None, Some(range)) => {
                    value >= *range && value <= max_value || value >= max_value && value <= *range
                }
                (None, None) => value == max_value,
            },
            Sequence::List { items } => items.iter().any(|item| item.contains(value, max_value)),
        }
    }

    /// Expands the set against the current maximum ('*') value. The result
    /// is unordered; callers that need UID ordering sort it themselves.
    pub fn expand(&self, max_value: u32) -> AHashSet<u32> {
        let mut result = AHashSet::new();
        self.expand_into(max_value, &mut result);
        result
    }

    fn expand_into(&self, max_value: u32, result: &mut AHashSet<u32>) {
        match self {
            Sequence::Number { value } => {
                result.insert(*value);
            }
            Sequence::Range { start, end } => {
                let start = start.unwrap_or(max_value);
                let end = end.unwrap_or(max_value);
                match start.cmp(&end) {
                    Ordering::Equal => {
                        result.insert(start);
                    }
                    Ordering::Less => result.extend(start..=end),
                    Ordering::Greater => result.extend(end..=start),
                }
            }
            Sequence::List { items } => {
                for item in items {
                    item.expand_into(max_value, result);
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Flag {
    Seen,
    Answered,
    Flagged,
    Deleted,
    Draft,
    Recent,
    Keyword(String),
}

impl Flag {
    pub fn parse_imap(value: &[u8]) -> Flag {
        if value.eq_ignore_ascii_case(b"\\Seen") {
            Flag::Seen
        } else if value.eq_ignore_ascii_case(b"\\Answered") {
            Flag::Answered
        } else if value.eq_ignore_ascii_case(b"\\Flagged") {
            Flag::Flagged
        } else if value.eq_ignore_ascii_case(b"\\Deleted") {
            Flag::Deleted
        } else if value.eq_ignore_ascii_case(b"\\Draft") {
            Flag::Draft
        } else if value.eq_ignore_ascii_case(b"\\Recent") {
            Flag::Recent
        } else {
            Flag::Keyword(String::from_utf8_lossy(value).into_owned())
        }
    }

    /// The canonical form stored in the flags table.
    pub fn as_imap(&self) -> &str {
        match self {
            Flag::Seen => "\\Seen",
            Flag::Answered => "\\Answered",
            Flag::Flagged => "\\Flagged",
            Flag::Deleted => "\\Deleted",
            Flag::Draft => "\\Draft",
            Flag::Recent => "\\Recent",
            Flag::Keyword(keyword) => keyword.as_str(),
        }
    }

    pub fn serialize(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.as_imap().as_bytes());
    }
}

impl std::fmt::Display for Flag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_imap())
    }
}

pub trait ImapResponse {
    fn serialize(self) -> Vec<u8>;
}

pub fn quoted_string(buf: &mut Vec<u8>, text: &str) {
    buf.push(b'"');
    for &c in text.as_bytes() {
        if c == b'\\' || c == b'"' {
            buf.push(b'\\');
        }
        buf.push(c);
    }
    buf.push(b'"');
}

pub fn quoted_or_literal_string(buf: &mut Vec<u8>, text: &str) {
    if text
        .as_bytes()
        .iter()
        .any(|ch| [b'\\', b'"', b'\r', b'\n'].contains(ch))
    {
        literal_string(buf, text.as_bytes())
    } else {
        buf.push(b'"');
        buf.extend_from_slice(text.as_bytes());
        buf.push(b'"');
    }
}

pub fn quoted_or_literal_string_or_nil(buf: &mut Vec<u8>, text: Option<&str>) {
    if let Some(text) = text {
        quoted_or_literal_string(buf, text);
    } else {
        buf.extend_from_slice(b"NIL");
    }
}

pub fn literal_string(buf: &mut Vec<u8>, text: &[u8]) {
    buf.push(b'{');
    buf.extend_from_slice(text.len().to_string().as_bytes());
    buf.extend_from_slice(b"}\r\n");
    buf.extend_from_slice(text);
}

/// INTERNALDATE format: "dd-Mon-yyyy HH:MM:SS +ZZZZ", always quoted.
pub fn quoted_timestamp(buf: &mut Vec<u8>, timestamp: i64, tz_offset_seconds: i32) {
    buf.push(b'"');
    let tz = FixedOffset::east_opt(tz_offset_seconds)
        .unwrap_or_else(|| FixedOffset::east_opt(0).unwrap());
    let date: DateTime<FixedOffset> = Utc
        .timestamp_opt(timestamp, 0)
        .single()
        .unwrap_or_default()
        .with_timezone(&tz);
    buf.extend_from_slice(date.format("%d-%b-%Y %H:%M:%S %z").to_string().as_bytes());
    buf.push(b'"');
}

/// ISO 8601 HH:MM:SS, used by the NAT keepalive response.
pub fn iso_time(timestamp: i64) -> String {
    Utc.timestamp_opt(timestamp, 0)
        .single()
        .unwrap_or_default()
        .format("%H:%M:%S")
        .to_string()
}

/// RFC 2047 Q-encodes a display-name phrase when it contains non-ASCII
/// characters; returns the phrase unchanged otherwise.
pub fn encode_phrase(text: &str) -> String {
    if text.is_ascii() {
        return text.to_string();
    }
    let mut encoded = String::with_capacity(text.len() * 3 + 12);
    encoded.push_str("=?utf-8?q?");
    for byte in text.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'!' | b'*' | b'+' | b'-' | b'/' => {
                encoded.push(byte as char)
            }
            b' ' => encoded.push('_'),
            _ => {
                encoded.push('=');
                encoded.push_str(&format!("{:02X}", byte));
            }
        }
    }
    encoded.push_str("?=");
    encoded
}

/// Matches an entry name against a pattern where '*' matches anything and
/// '%' matches anything except the hierarchy separator.
pub fn wildcard_match(pattern: &str, name: &str) -> bool {
    fn matches(pattern: &[u8], name: &[u8]) -> bool {
        match (pattern.first(), name.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                matches(&pattern[1..], name)
                    || (!name.is_empty() && matches(pattern, &name[1..]))
            }
            (Some(b'%'), _) => {
                matches(&pattern[1..], name)
                    || (name.first().map_or(false, |&ch| ch != b'/')
                        && matches(pattern, &name[1..]))
            }
            (Some(p), Some(n)) if p == n => matches(&pattern[1..], &name[1..]),
            _ => false,
        }
    }
    matches(pattern.as_bytes(), name.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_sequence() {
        let mut uids = Sequence::List {
            items: vec![
                Sequence::number(3),
                Sequence::range(Some(5), Some(7)),
                Sequence::range(Some(9), None),
            ],
        }
        .expand(11)
        .into_iter()
        .collect::<Vec<_>>();
        uids.sort_unstable();
        assert_eq!(uids, vec![3, 5, 6, 7, 9, 10, 11]);

        assert!(Sequence::range(Some(1), None).contains(50, 50));
        assert!(!Sequence::range(Some(2), Some(4)).contains(5, 50));
    }

    #[test]
    fn quoted_internal_date() {
        let mut buf = Vec::new();
        quoted_timestamp(&mut buf, 482374938, 0);
        assert_eq!(
            String::from_utf8(buf).unwrap(),
            "\"15-Apr-1985 01:02:18 +0000\""
        );

        let mut buf = Vec::new();
        quoted_timestamp(&mut buf, 482374938, 7200);
        assert_eq!(
            String::from_utf8(buf).unwrap(),
            "\"15-Apr-1985 03:02:18 +0200\""
        );
    }

    #[test]
    fn phrase_encoding() {
        assert_eq!(encode_phrase("Terry Gray"), "Terry Gray");
        assert_eq!(encode_phrase("Träumerei"), "=?utf-8?q?Tr=C3=A4umerei?=");
    }

    #[test]
    fn entry_wildcards() {
        assert!(wildcard_match("*", "/comment"));
        assert!(wildcard_match("/comment", "/comment"));
        assert!(wildcard_match("/%", "/comment"));
        assert!(!wildcard_match("/%", "/vendor/x"));
        assert!(wildcard_match("/*", "/vendor/x"));
        assert!(!wildcard_match("/flags", "/comment"));
    }
}
