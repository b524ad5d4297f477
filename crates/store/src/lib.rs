/*
 * SPDX-FileCopyrightText: 2024 Loriot Project <dev@loriot.email>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::fmt::Display;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use deadpool_postgres::{
    Config, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime,
};
use tokio_postgres::NoTls;

pub mod cache;
pub mod fetcher;
pub mod inject;
pub mod mailbox;
pub mod model;
pub mod spool;
pub mod users;
pub mod watch;

/// Name of the mailbox that receives locally injected bounce messages.
pub const SPOOL_MAILBOX: &str = "/archiveopteryx/spool";

/// Channel notified whenever new rows land in the deliveries table.
pub const DELIVERIES_CHANNEL: &str = "deliveries_updated";

#[derive(Debug)]
pub enum Error {
    Pool(String),
    Database(tokio_postgres::Error),
    NotFound,
    Consistency(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Pool(err) => write!(f, "connection pool error: {}", err),
            Error::Database(err) => write!(f, "database error: {}", err),
            Error::NotFound => write!(f, "row not found"),
            Error::Consistency(err) => write!(f, "consistency error: {}", err),
        }
    }
}

impl std::error::Error for Error {}

impl From<tokio_postgres::Error> for Error {
    fn from(err: tokio_postgres::Error) -> Self {
        Error::Database(err)
    }
}

impl From<deadpool_postgres::PoolError> for Error {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        Error::Pool(err.to_string())
    }
}

/// Connection parameters for the PostgreSQL store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: Option<String>,
    pub max_connections: usize,
    pub connect_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            host: "localhost".into(),
            port: 5432,
            database: "loriot".into(),
            user: "loriot".into(),
            password: None,
            max_connections: 8,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Shared handle on the relational store. Cloning is cheap; all clones use
/// the same connection pool.
#[derive(Clone)]
pub struct Store {
    pub(crate) pool: Pool,
    pub(crate) config: StoreConfig,
}

/// Seconds since the Unix epoch.
pub fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

impl Store {
    pub async fn open(config: StoreConfig, create_tables: bool) -> Result<Self> {
        let mut cfg = Config::new();
        cfg.host = Some(config.host.clone());
        cfg.port = Some(config.port);
        cfg.dbname = Some(config.database.clone());
        cfg.user = Some(config.user.clone());
        cfg.password = config.password.clone();
        cfg.connect_timeout = Some(config.connect_timeout);
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        cfg.pool = PoolConfig::new(config.max_connections).into();

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|err| Error::Pool(err.to_string()))?;

        let store = Store { pool, config };
        if create_tables {
            store.create_tables().await?;
        }
        Ok(store)
    }

    pub(crate) async fn client(&self) -> Result<deadpool_postgres::Client> {
        Ok(self.pool.get().await?)
    }

    /// Connection string for auxiliary connections that cannot come from the
    /// pool, such as the LISTEN/NOTIFY channel.
    pub(crate) fn conn_string(&self) -> String {
        let mut s = format!(
            "host={} port={} dbname={} user={}",
            self.config.host, self.config.port, self.config.database, self.config.user
        );
        if let Some(password) = &self.config.password {
            s.push_str(" password=");
            s.push_str(password);
        }
        s
    }

    async fn create_tables(&self) -> Result<()> {
        let client = self.client().await?;
        for ddl in [
            "CREATE TABLE IF NOT EXISTS addresses (
                id SERIAL PRIMARY KEY,
                name TEXT NOT NULL DEFAULT '',
                localpart TEXT NOT NULL,
                domain TEXT NOT NULL,
                UNIQUE (localpart, domain, name)
            )",
            "CREATE TABLE IF NOT EXISTS users (
                id SERIAL PRIMARY KEY,
                login TEXT NOT NULL UNIQUE,
                secret TEXT NOT NULL,
                address INTEGER REFERENCES addresses(id)
            )",
            "CREATE TABLE IF NOT EXISTS mailboxes (
                id SERIAL PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                owner INTEGER REFERENCES users(id),
                uidnext INTEGER NOT NULL DEFAULT 1,
                uidvalidity INTEGER NOT NULL DEFAULT 1,
                nextmodseq BIGINT NOT NULL DEFAULT 1,
                deleted BOOLEAN NOT NULL DEFAULT FALSE
            )",
            "CREATE TABLE IF NOT EXISTS aliases (
                id SERIAL PRIMARY KEY,
                address INTEGER NOT NULL REFERENCES addresses(id),
                mailbox INTEGER NOT NULL REFERENCES mailboxes(id)
            )",
            "CREATE TABLE IF NOT EXISTS messages (
                id SERIAL PRIMARY KEY,
                idate BIGINT NOT NULL,
                rfc822size INTEGER NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS bodyparts (
                id SERIAL PRIMARY KEY,
                bytes INTEGER NOT NULL,
                data BYTEA NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS part_numbers (
                message INTEGER NOT NULL REFERENCES messages(id),
                part TEXT NOT NULL,
                bodypart INTEGER REFERENCES bodyparts(id),
                header_offset INTEGER NOT NULL DEFAULT 0,
                body_offset INTEGER NOT NULL DEFAULT 0,
                end_offset INTEGER NOT NULL DEFAULT 0,
                bytes INTEGER NOT NULL DEFAULT 0,
                lines INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (message, part)
            )",
            "CREATE TABLE IF NOT EXISTS header_fields (
                message INTEGER NOT NULL REFERENCES messages(id),
                part TEXT NOT NULL,
                position INTEGER NOT NULL,
                field TEXT NOT NULL,
                value TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS address_fields (
                message INTEGER NOT NULL REFERENCES messages(id),
                part TEXT NOT NULL,
                position INTEGER NOT NULL,
                field INTEGER NOT NULL,
                group_name TEXT,
                name TEXT,
                localpart TEXT NOT NULL,
                domain TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS mailbox_messages (
                mailbox INTEGER NOT NULL REFERENCES mailboxes(id),
                uid INTEGER NOT NULL,
                message INTEGER NOT NULL REFERENCES messages(id),
                modseq BIGINT NOT NULL,
                PRIMARY KEY (mailbox, uid)
            )",
            "CREATE TABLE IF NOT EXISTS flags (
                mailbox INTEGER NOT NULL,
                uid INTEGER NOT NULL,
                flag TEXT NOT NULL,
                PRIMARY KEY (mailbox, uid, flag)
            )",
            "CREATE TABLE IF NOT EXISTS annotations (
                mailbox INTEGER NOT NULL,
                uid INTEGER NOT NULL,
                name TEXT NOT NULL,
                owner INTEGER,
                value TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS deleted_messages (
                mailbox INTEGER NOT NULL,
                uid INTEGER NOT NULL,
                message INTEGER NOT NULL,
                deleted_by INTEGER,
                deleted_at BIGINT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS deliveries (
                id SERIAL PRIMARY KEY,
                mailbox INTEGER NOT NULL,
                uid INTEGER NOT NULL,
                sender INTEGER NOT NULL REFERENCES addresses(id),
                injected_at BIGINT NOT NULL,
                tried_at BIGINT,
                expires_at BIGINT,
                deliver_after BIGINT
            )",
            "CREATE TABLE IF NOT EXISTS delivery_recipients (
                delivery INTEGER NOT NULL REFERENCES deliveries(id),
                recipient INTEGER NOT NULL REFERENCES addresses(id),
                action INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT '',
                last_attempt BIGINT,
                PRIMARY KEY (delivery, recipient)
            )",
            "CREATE TABLE IF NOT EXISTS views (
                id SERIAL PRIMARY KEY,
                source INTEGER NOT NULL REFERENCES mailboxes(id),
                view INTEGER NOT NULL REFERENCES mailboxes(id),
                selector TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS hf_message ON header_fields(message)",
            "CREATE INDEX IF NOT EXISTS af_message ON address_fields(message)",
            "CREATE INDEX IF NOT EXISTS dr_delivery ON delivery_recipients(delivery)",
        ] {
            client.execute(ddl, &[]).await?;
        }
        Ok(())
    }
}
