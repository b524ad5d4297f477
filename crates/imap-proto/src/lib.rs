/*
 * SPDX-FileCopyrightText: 2024 Loriot Project <dev@loriot.email>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::borrow::Cow;
use std::fmt::Display;

pub mod parser;
pub mod protocol;
pub mod receiver;

/// One IMAP command name, as recognised by the receiver. The boolean on the
/// selected-state commands records whether the UID variant was used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Command {
    // Any state
    Capability,
    #[default]
    Noop,
    Logout,

    // Not authenticated state
    StartTls,
    Authenticate,
    Login,

    // Authenticated state
    Enable,
    Select,
    Examine,
    List,
    Status,
    Idle,

    // Selected state
    Close,
    Unselect,
    Expunge(bool),
    Search(bool),
    Fetch(bool),
    Store(bool),
}

impl Command {
    pub fn parse(value: &[u8], is_uid: bool) -> Option<Self> {
        match value {
            b"CAPABILITY" => Some(Command::Capability),
            b"NOOP" => Some(Command::Noop),
            b"LOGOUT" => Some(Command::Logout),
            b"STARTTLS" => Some(Command::StartTls),
            b"AUTHENTICATE" => Some(Command::Authenticate),
            b"LOGIN" => Some(Command::Login),
            b"ENABLE" => Some(Command::Enable),
            b"SELECT" => Some(Command::Select),
            b"EXAMINE" => Some(Command::Examine),
            b"LIST" => Some(Command::List),
            b"STATUS" => Some(Command::Status),
            b"IDLE" => Some(Command::Idle),
            b"CLOSE" => Some(Command::Close),
            b"UNSELECT" => Some(Command::Unselect),
            b"EXPUNGE" => Some(Command::Expunge(is_uid)),
            b"SEARCH" => Some(Command::Search(is_uid)),
            b"FETCH" => Some(Command::Fetch(is_uid)),
            b"STORE" => Some(Command::Store(is_uid)),
            b"CHECK" => Some(Command::Noop),
            _ => None,
        }
    }

    pub fn is_uid(&self) -> bool {
        matches!(
            self,
            Command::Fetch(true)
                | Command::Search(true)
                | Command::Store(true)
                | Command::Expunge(true)
        )
    }

    /// Pipelining class. Group 0 commands run alone; group 1 commands (the
    /// UID variants) may run concurrently with each other; group 2 commands
    /// address messages by MSN and block expunge emission; group 3 commands
    /// mutate flags and block concurrent fetches.
    pub fn group(&self) -> u8 {
        match self {
            Command::Fetch(true) | Command::Search(true) | Command::Store(true) => 1,
            Command::Fetch(false) | Command::Search(false) => 2,
            Command::Store(false) => 3,
            _ => 0,
        }
    }

    /// True when untagged data produced by this command is addressed by
    /// message sequence number rather than UID.
    pub fn uses_msn(&self) -> bool {
        matches!(
            self,
            Command::Fetch(false) | Command::Search(false) | Command::Store(false)
        )
    }

    pub fn tokenize_brackets(&self) -> bool {
        matches!(self, Command::Fetch(_))
    }
}

impl Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Command::Capability => "CAPABILITY",
            Command::Noop => "NOOP",
            Command::Logout => "LOGOUT",
            Command::StartTls => "STARTTLS",
            Command::Authenticate => "AUTHENTICATE",
            Command::Login => "LOGIN",
            Command::Enable => "ENABLE",
            Command::Select => "SELECT",
            Command::Examine => "EXAMINE",
            Command::List => "LIST",
            Command::Status => "STATUS",
            Command::Idle => "IDLE",
            Command::Close => "CLOSE",
            Command::Unselect => "UNSELECT",
            Command::Expunge(false) => "EXPUNGE",
            Command::Expunge(true) => "UID EXPUNGE",
            Command::Search(false) => "SEARCH",
            Command::Search(true) => "UID SEARCH",
            Command::Fetch(false) => "FETCH",
            Command::Fetch(true) => "UID FETCH",
            Command::Store(false) => "STORE",
            Command::Store(true) => "UID STORE",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseCode {
    Alert,
    AuthenticationFailed,
    Cannot,
    ClientBug,
    Closed,
    ContactAdmin,
    ExpungeIssued,
    HighestModseq { modseq: u64 },
    Limit,
    NonExistent,
    NoPerm,
    Parse,
    PermanentFlags { flags: Vec<protocol::Flag> },
    ReadOnly,
    ReadWrite,
    TryCreate,
    UidNext { uid_next: u32 },
    UidValidity { uid_validity: u32 },
    Unseen { unseen: u32 },
}

impl ResponseCode {
    pub fn serialize(&self, buf: &mut Vec<u8>) {
        match self {
            ResponseCode::Alert => buf.extend_from_slice(b"ALERT"),
            ResponseCode::AuthenticationFailed => buf.extend_from_slice(b"AUTHENTICATIONFAILED"),
            ResponseCode::Cannot => buf.extend_from_slice(b"CANNOT"),
            ResponseCode::ClientBug => buf.extend_from_slice(b"CLIENTBUG"),
            ResponseCode::Closed => buf.extend_from_slice(b"CLOSED"),
            ResponseCode::ContactAdmin => buf.extend_from_slice(b"CONTACTADMIN"),
            ResponseCode::ExpungeIssued => buf.extend_from_slice(b"EXPUNGEISSUED"),
            ResponseCode::HighestModseq { modseq } => {
                buf.extend_from_slice(b"HIGHESTMODSEQ ");
                buf.extend_from_slice(modseq.to_string().as_bytes());
            }
            ResponseCode::Limit => buf.extend_from_slice(b"LIMIT"),
            ResponseCode::NonExistent => buf.extend_from_slice(b"NONEXISTENT"),
            ResponseCode::NoPerm => buf.extend_from_slice(b"NOPERM"),
            ResponseCode::Parse => buf.extend_from_slice(b"PARSE"),
            ResponseCode::PermanentFlags { flags } => {
                buf.extend_from_slice(b"PERMANENTFLAGS (");
                for (pos, flag) in flags.iter().enumerate() {
                    if pos > 0 {
                        buf.push(b' ');
                    }
                    flag.serialize(buf);
                }
                buf.push(b')');
            }
            ResponseCode::ReadOnly => buf.extend_from_slice(b"READ-ONLY"),
            ResponseCode::ReadWrite => buf.extend_from_slice(b"READ-WRITE"),
            ResponseCode::TryCreate => buf.extend_from_slice(b"TRYCREATE"),
            ResponseCode::UidNext { uid_next } => {
                buf.extend_from_slice(b"UIDNEXT ");
                buf.extend_from_slice(uid_next.to_string().as_bytes());
            }
            ResponseCode::UidValidity { uid_validity } => {
                buf.extend_from_slice(b"UIDVALIDITY ");
                buf.extend_from_slice(uid_validity.to_string().as_bytes());
            }
            ResponseCode::Unseen { unseen } => {
                buf.extend_from_slice(b"UNSEEN ");
                buf.extend_from_slice(unseen.to_string().as_bytes());
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseType {
    Ok,
    No,
    Bad,
    PreAuth,
    Bye,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusResponse {
    pub tag: Option<String>,
    pub code: Option<ResponseCode>,
    pub message: Cow<'static, str>,
    pub rtype: ResponseType,
}

impl StatusResponse {
    pub fn ok(message: impl Into<Cow<'static, str>>) -> Self {
        StatusResponse {
            tag: None,
            code: None,
            message: message.into(),
            rtype: ResponseType::Ok,
        }
    }

    pub fn no(message: impl Into<Cow<'static, str>>) -> Self {
        StatusResponse {
            tag: None,
            code: None,
            message: message.into(),
            rtype: ResponseType::No,
        }
    }

    pub fn bad(message: impl Into<Cow<'static, str>>) -> Self {
        StatusResponse {
            tag: None,
            code: None,
            message: message.into(),
            rtype: ResponseType::Bad,
        }
    }

    pub fn bye(message: impl Into<Cow<'static, str>>) -> Self {
        StatusResponse {
            tag: None,
            code: None,
            message: message.into(),
            rtype: ResponseType::Bye,
        }
    }

    pub fn completed(command: Command) -> Self {
        StatusResponse::ok(format!("{} completed", command))
    }

    pub fn database_failure() -> Self {
        StatusResponse::no("Database failure.").with_code(ResponseCode::ContactAdmin)
    }

    pub fn parse_error(message: impl Into<Cow<'static, str>>) -> Self {
        StatusResponse::bad(message).with_code(ResponseCode::Parse)
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_code(mut self, code: ResponseCode) -> Self {
        self.code = Some(code);
        self
    }

    pub fn is_bad(&self) -> bool {
        matches!(self.rtype, ResponseType::Bad)
    }

    pub fn serialize(&self, buf: &mut Vec<u8>) {
        if let Some(tag) = &self.tag {
            buf.extend_from_slice(tag.as_bytes());
        } else {
            buf.push(b'*');
        }
        buf.extend_from_slice(match self.rtype {
            ResponseType::Ok => b" OK ".as_slice(),
            ResponseType::No => b" NO ".as_slice(),
            ResponseType::Bad => b" BAD ".as_slice(),
            ResponseType::PreAuth => b" PREAUTH ".as_slice(),
            ResponseType::Bye => b" BYE ".as_slice(),
        });
        if let Some(code) = &self.code {
            buf.push(b'[');
            code.serialize(buf);
            buf.extend_from_slice(b"] ");
        }
        buf.extend_from_slice(self.message.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }

    pub fn into_bytes(self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.message.len() + 16);
        self.serialize(&mut buf);
        buf
    }
}

pub type Result<T> = std::result::Result<T, StatusResponse>;

impl From<(String, Cow<'static, str>)> for StatusResponse {
    fn from((tag, message): (String, Cow<'static, str>)) -> Self {
        StatusResponse::bad(message).with_tag(tag)
    }
}

impl From<(String, String)> for StatusResponse {
    fn from((tag, message): (String, String)) -> Self {
        StatusResponse::bad(message).with_tag(tag)
    }
}

impl From<(String, &'static str)> for StatusResponse {
    fn from((tag, message): (String, &'static str)) -> Self {
        StatusResponse::bad(message).with_tag(tag)
    }
}

impl From<(&str, Cow<'static, str>)> for StatusResponse {
    fn from((tag, message): (&str, Cow<'static, str>)) -> Self {
        StatusResponse::bad(message).with_tag(tag)
    }
}

impl From<(&str, String)> for StatusResponse {
    fn from((tag, message): (&str, String)) -> Self {
        StatusResponse::bad(message).with_tag(tag)
    }
}

impl From<(&str, &'static str)> for StatusResponse {
    fn from((tag, message): (&str, &'static str)) -> Self {
        StatusResponse::bad(message).with_tag(tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_groups() {
        assert_eq!(Command::Login.group(), 0);
        assert_eq!(Command::Select.group(), 0);
        assert_eq!(Command::Idle.group(), 0);
        assert_eq!(Command::Fetch(true).group(), 1);
        assert_eq!(Command::Search(true).group(), 1);
        assert_eq!(Command::Store(true).group(), 1);
        assert_eq!(Command::Fetch(false).group(), 2);
        assert_eq!(Command::Search(false).group(), 2);
        assert_eq!(Command::Store(false).group(), 3);
        assert_eq!(Command::Expunge(true).group(), 0);
    }

    #[test]
    fn serialize_status_response() {
        for (response, expected) in [
            (
                StatusResponse::completed(Command::Fetch(true)).with_tag("A1"),
                "A1 OK UID FETCH completed\r\n",
            ),
            (
                StatusResponse::no("UID(s) 3 has/have been expunged").with_tag("B2"),
                "B2 NO UID(s) 3 has/have been expunged\r\n",
            ),
            (
                StatusResponse::ok("Mailbox selected")
                    .with_tag("C3")
                    .with_code(ResponseCode::ReadWrite),
                "C3 OK [READ-WRITE] Mailbox selected\r\n",
            ),
            (
                StatusResponse::ok("done").with_code(ResponseCode::UidNext { uid_next: 44 }),
                "* OK [UIDNEXT 44] done\r\n",
            ),
            (StatusResponse::bye("Tempus fugit"), "* BYE Tempus fugit\r\n"),
        ] {
            assert_eq!(String::from_utf8(response.into_bytes()).unwrap(), expected);
        }
    }
}
