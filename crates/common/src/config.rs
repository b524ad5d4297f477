/*
 * SPDX-FileCopyrightText: 2024 Loriot Project <dev@loriot.email>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::path::Path;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub hostname: String,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub imap: ImapSection,
    #[serde(default)]
    pub smtp: SmtpSection,
    #[serde(default)]
    pub queue: QueueSection,
    #[serde(default)]
    pub tls: Option<TlsSection>,
    #[serde(default, rename = "listener")]
    pub listeners: Vec<ListenerSection>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreSection {
    #[serde(default = "default_db_host")]
    pub host: String,
    #[serde(default = "default_db_port")]
    pub port: u16,
    #[serde(default = "default_db_name")]
    pub database: String,
    #[serde(default = "default_db_name")]
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_pool_size", rename = "pool-size")]
    pub pool_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImapSection {
    /// Idle timeout before authentication, seconds.
    #[serde(default = "default_timeout_preauth", rename = "timeout-preauth")]
    pub timeout_preauth: u64,
    /// Idle timeout after authentication, seconds.
    #[serde(default = "default_timeout_auth", rename = "timeout-auth")]
    pub timeout_auth: u64,
    /// Idle timeout during IDLE, seconds.
    #[serde(default = "default_timeout_idle", rename = "timeout-idle")]
    pub timeout_idle: u64,
    #[serde(default = "default_literal_limit", rename = "literal-size-limit")]
    pub literal_size_limit: usize,
    #[serde(default = "default_cache_size", rename = "message-cache-size")]
    pub message_cache_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SmtpSection {
    #[serde(default = "default_max_message_size", rename = "max-message-size")]
    pub max_message_size: usize,
    #[serde(rename = "smarthost-address", default = "default_smarthost")]
    pub smarthost_address: String,
    #[serde(rename = "smarthost-port", default = "default_smarthost_port")]
    pub smarthost_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueSection {
    /// Maximum period between queue runs, seconds.
    #[serde(default = "default_spool_interval", rename = "spool-interval")]
    pub spool_interval: u64,
    /// How long a tried delivery is held before it may be retried, seconds.
    #[serde(default = "default_retry_hold", rename = "retry-hold")]
    pub retry_hold: u64,
    /// How long a spooled message is retried before remaining recipients
    /// fail, seconds.
    #[serde(default = "default_expiry")]
    pub expiry: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsSection {
    pub certificate: String,
    #[serde(rename = "private-key")]
    pub private_key: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenerSection {
    pub protocol: Protocol,
    /// "host:port", "unix:/path", or "systemd/inet/N".
    pub address: String,
    #[serde(default)]
    pub tls: bool,
    /// Whether a PROXY protocol v2 preamble is required on this endpoint.
    #[serde(default)]
    pub proxy: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Imap,
    Imaps,
    Smtp,
    Submission,
    Lmtp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Imap => "imap",
            Protocol::Imaps => "imaps",
            Protocol::Smtp => "smtp",
            Protocol::Submission => "submission",
            Protocol::Lmtp => "lmtp",
        }
    }
}

impl Config {
    pub fn parse(text: &str) -> Result<Config, String> {
        toml::from_str(text).map_err(|err| err.to_string())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Config, String> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|err| format!("{}: {}", path.as_ref().display(), err))?;
        Config::parse(&text)
    }
}

impl Default for StoreSection {
    fn default() -> Self {
        StoreSection {
            host: default_db_host(),
            port: default_db_port(),
            database: default_db_name(),
            user: default_db_name(),
            password: None,
            pool_size: default_pool_size(),
        }
    }
}

impl Default for ImapSection {
    fn default() -> Self {
        ImapSection {
            timeout_preauth: default_timeout_preauth(),
            timeout_auth: default_timeout_auth(),
            timeout_idle: default_timeout_idle(),
            literal_size_limit: default_literal_limit(),
            message_cache_size: default_cache_size(),
        }
    }
}

impl Default for SmtpSection {
    fn default() -> Self {
        SmtpSection {
            max_message_size: default_max_message_size(),
            smarthost_address: default_smarthost(),
            smarthost_port: default_smarthost_port(),
        }
    }
}

impl Default for QueueSection {
    fn default() -> Self {
        QueueSection {
            spool_interval: default_spool_interval(),
            retry_hold: default_retry_hold(),
            expiry: default_expiry(),
        }
    }
}

fn default_db_host() -> String {
    "localhost".into()
}
fn default_db_port() -> u16 {
    5432
}
fn default_db_name() -> String {
    "loriot".into()
}
fn default_pool_size() -> usize {
    8
}
fn default_timeout_preauth() -> u64 {
    120
}
fn default_timeout_auth() -> u64 {
    1860
}
fn default_timeout_idle() -> u64 {
    3600
}
fn default_literal_limit() -> usize {
    32 * 1024 * 1024
}
fn default_cache_size() -> usize {
    4096
}
fn default_max_message_size() -> usize {
    64 * 1024 * 1024
}
fn default_smarthost() -> String {
    "127.0.0.1".into()
}
fn default_smarthost_port() -> u16 {
    25
}
fn default_spool_interval() -> u64 {
    900
}
fn default_retry_hold() -> u64 {
    3600
}
fn default_expiry() -> u64 {
    7 * 86400
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_config() {
        let config = Config::parse(
            r#"
hostname = "mail.example.com"

[store]
database = "mail"
user = "mail"

[[listener]]
protocol = "imap"
address = "0.0.0.0:143"

[[listener]]
protocol = "lmtp"
address = "unix:/var/run/lmtp.sock"
proxy = false
"#,
        )
        .unwrap();
        assert_eq!(config.hostname, "mail.example.com");
        assert_eq!(config.imap.timeout_preauth, 120);
        assert_eq!(config.imap.timeout_auth, 1860);
        assert_eq!(config.imap.timeout_idle, 3600);
        assert_eq!(config.queue.spool_interval, 900);
        assert_eq!(config.listeners.len(), 2);
        assert_eq!(config.listeners[0].protocol, Protocol::Imap);
        assert!(!config.listeners[1].tls);
    }

    #[test]
    fn reject_unknown_keys() {
        assert!(Config::parse("hostname = \"h\"\nfrobs = 1\n").is_err());
    }
}
