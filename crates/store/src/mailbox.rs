/*
 * SPDX-FileCopyrightText: 2024 Loriot Project <dev@loriot.email>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use tokio_postgres::Row;

use crate::model::Mailbox;
use crate::{now, Result, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagOperation {
    Set,
    Add,
    Clear,
}

/// Outcome of a STORE against one mailbox.
#[derive(Debug, Default)]
pub struct StoreFlagsResult {
    /// (uid, new modseq, resulting flags) per modified row.
    pub modified: Vec<(u32, u64, Vec<String>)>,
    /// Rows rejected by UNCHANGEDSINCE.
    pub failed: Vec<u32>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MailboxCounts {
    pub messages: u32,
    pub unseen: u32,
    pub first_unseen_uid: Option<u32>,
}

fn mailbox_from_row(row: &Row) -> Mailbox {
    Mailbox {
        id: row.get::<_, i32>(0) as u32,
        name: row.get(1),
        owner: row.get::<_, Option<i32>>(2).map(|id| id as u32),
        uid_next: row.get::<_, i32>(3) as u32,
        uid_validity: row.get::<_, i32>(4) as u32,
        next_modseq: row.get::<_, i64>(5) as u64,
        deleted: row.get(6),
    }
}

const MAILBOX_COLUMNS: &str = "id, name, owner, uidnext, uidvalidity, nextmodseq, deleted";

impl Store {
    pub async fn mailbox_by_name(&self, name: &str) -> Result<Option<Mailbox>> {
        let client = self.client().await?;
        let rows = client
            .query(
                &format!(
                    "SELECT {} FROM mailboxes WHERE lower(name) = lower($1) AND NOT deleted",
                    MAILBOX_COLUMNS
                ),
                &[&name],
            )
            .await?;
        Ok(rows.first().map(mailbox_from_row))
    }

    pub async fn mailbox_by_id(&self, id: u32) -> Result<Option<Mailbox>> {
        let client = self.client().await?;
        let rows = client
            .query(
                &format!("SELECT {} FROM mailboxes WHERE id = $1", MAILBOX_COLUMNS),
                &[&(id as i32)],
            )
            .await?;
        Ok(rows.first().map(mailbox_from_row))
    }

    pub async fn list_mailboxes(&self, owner: Option<u32>) -> Result<Vec<Mailbox>> {
        let client = self.client().await?;
        let rows = match owner {
            Some(owner) => {
                client
                    .query(
                        &format!(
                            "SELECT {} FROM mailboxes
                             WHERE NOT deleted AND (owner IS NULL OR owner = $1)
                             ORDER BY name",
                            MAILBOX_COLUMNS
                        ),
                        &[&(owner as i32)],
                    )
                    .await?
            }
            None => {
                client
                    .query(
                        &format!(
                            "SELECT {} FROM mailboxes WHERE NOT deleted ORDER BY name",
                            MAILBOX_COLUMNS
                        ),
                        &[],
                    )
                    .await?
            }
        };
        Ok(rows.iter().map(mailbox_from_row).collect())
    }

    /// Creates a mailbox, or revives a deleted one under the same name with
    /// a bumped uidvalidity so clients discard any cached state.
    pub async fn create_mailbox(&self, name: &str, owner: Option<u32>) -> Result<Mailbox> {
        let client = self.client().await?;
        let rows = client
            .query(
                &format!(
                    "INSERT INTO mailboxes (name, owner) VALUES ($1, $2)
                     ON CONFLICT (name) DO UPDATE
                     SET deleted = FALSE, owner = EXCLUDED.owner,
                         uidvalidity = mailboxes.uidvalidity + 1,
                         uidnext = CASE WHEN mailboxes.deleted THEN 1
                                        ELSE mailboxes.uidnext END
                     RETURNING {}",
                    MAILBOX_COLUMNS
                ),
                &[&name, &owner.map(|id| id as i32)],
            )
            .await?;
        rows.first()
            .map(mailbox_from_row)
            .ok_or(crate::Error::NotFound)
    }

    /// All UIDs of a mailbox in ascending order.
    pub async fn mailbox_uids(&self, mailbox_id: u32) -> Result<Vec<u32>> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT uid FROM mailbox_messages WHERE mailbox = $1 ORDER BY uid",
                &[&(mailbox_id as i32)],
            )
            .await?;
        Ok(rows.iter().map(|row| row.get::<_, i32>(0) as u32).collect())
    }

    pub async fn mailbox_counts(&self, mailbox_id: u32) -> Result<MailboxCounts> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT count(*)::int4,
                        count(*) FILTER (WHERE NOT EXISTS (
                            SELECT 1 FROM flags f
                            WHERE f.mailbox = mm.mailbox AND f.uid = mm.uid
                              AND f.flag = '\\Seen'))::int4,
                        min(mm.uid) FILTER (WHERE NOT EXISTS (
                            SELECT 1 FROM flags f
                            WHERE f.mailbox = mm.mailbox AND f.uid = mm.uid
                              AND f.flag = '\\Seen'))
                 FROM mailbox_messages mm WHERE mm.mailbox = $1",
                &[&(mailbox_id as i32)],
            )
            .await?;
        let row = rows.first().ok_or(crate::Error::NotFound)?;
        Ok(MailboxCounts {
            messages: row.get::<_, i32>(0) as u32,
            unseen: row.get::<_, i32>(1) as u32,
            first_unseen_uid: row.get::<_, Option<i32>>(2).map(|uid| uid as u32),
        })
    }

    /// Applies a flag mutation to a set of rows. Every modified row is
    /// stamped with the mailbox's current nextmodseq, which then advances by
    /// exactly one.
    pub async fn store_flags(
        &self,
        mailbox_id: u32,
        uids: &[u32],
        operation: FlagOperation,
        flags: &[String],
        unchanged_since: Option<u64>,
    ) -> Result<StoreFlagsResult> {
        let client = self.begin().await?;
        let result = self
            .store_flags_in(&client, mailbox_id, uids, operation, flags, unchanged_since)
            .await;
        match result {
            Ok(result) => {
                Store::commit(client).await?;
                Ok(result)
            }
            Err(err) => {
                let _ = Store::rollback(client).await;
                Err(err)
            }
        }
    }

    async fn store_flags_in(
        &self,
        client: &deadpool_postgres::Client,
        mailbox_id: u32,
        uids: &[u32],
        operation: FlagOperation,
        flags: &[String],
        unchanged_since: Option<u64>,
    ) -> Result<StoreFlagsResult> {
        let db_mailbox = mailbox_id as i32;
        let db_uids: Vec<i32> = uids.iter().map(|uid| *uid as i32).collect();

        let rows = client
            .query(
                "SELECT uid, modseq FROM mailbox_messages
                 WHERE mailbox = $1 AND uid = ANY($2) FOR UPDATE",
                &[&db_mailbox, &db_uids],
            )
            .await?;

        let mut result = StoreFlagsResult::default();
        let mut target_uids = Vec::with_capacity(rows.len());
        for row in &rows {
            let uid = row.get::<_, i32>(0) as u32;
            let modseq = row.get::<_, i64>(1) as u64;
            match unchanged_since {
                Some(limit) if modseq > limit => result.failed.push(uid),
                _ => target_uids.push(uid as i32),
            }
        }

        if target_uids.is_empty() {
            return Ok(result);
        }

        let modseq_row = client
            .query_one(
                "SELECT nextmodseq FROM mailboxes WHERE id = $1 FOR UPDATE",
                &[&db_mailbox],
            )
            .await?;
        let modseq: i64 = modseq_row.get(0);

        match operation {
            FlagOperation::Set => {
                client
                    .execute(
                        "DELETE FROM flags WHERE mailbox = $1 AND uid = ANY($2)",
                        &[&db_mailbox, &target_uids],
                    )
                    .await?;
                for flag in flags {
                    client
                        .execute(
                            "INSERT INTO flags (mailbox, uid, flag)
                             SELECT $1, u, $2 FROM unnest($3::int4[]) AS u
                             ON CONFLICT DO NOTHING",
                            &[&db_mailbox, flag, &target_uids],
                        )
                        .await?;
                }
            }
            FlagOperation::Add => {
                for flag in flags {
                    client
                        .execute(
                            "INSERT INTO flags (mailbox, uid, flag)
                             SELECT $1, u, $2 FROM unnest($3::int4[]) AS u
                             ON CONFLICT DO NOTHING",
                            &[&db_mailbox, flag, &target_uids],
                        )
                        .await?;
                }
            }
            FlagOperation::Clear => {
                for flag in flags {
                    client
                        .execute(
                            "DELETE FROM flags
                             WHERE mailbox = $1 AND uid = ANY($2) AND flag = $3",
                            &[&db_mailbox, &target_uids, flag],
                        )
                        .await?;
                }
            }
        }

        client
            .execute(
                "UPDATE mailbox_messages SET modseq = $1
                 WHERE mailbox = $2 AND uid = ANY($3)",
                &[&modseq, &db_mailbox, &target_uids],
            )
            .await?;
        client
            .execute(
                "UPDATE mailboxes SET nextmodseq = nextmodseq + 1 WHERE id = $1",
                &[&db_mailbox],
            )
            .await?;

        let flag_rows = client
            .query(
                "SELECT uid, flag FROM flags WHERE mailbox = $1 AND uid = ANY($2)",
                &[&db_mailbox, &target_uids],
            )
            .await?;
        let mut flags_by_uid: ahash::AHashMap<u32, Vec<String>> = target_uids
            .iter()
            .map(|uid| (*uid as u32, Vec::new()))
            .collect();
        for row in flag_rows {
            flags_by_uid
                .entry(row.get::<_, i32>(0) as u32)
                .or_default()
                .push(row.get(1));
        }
        for uid in &target_uids {
            let uid = *uid as u32;
            result.modified.push((
                uid,
                modseq as u64,
                flags_by_uid.remove(&uid).unwrap_or_default(),
            ));
        }
        result.modified.sort_by_key(|(uid, _, _)| *uid);

        Ok(result)
    }

    /// Removes \Deleted rows (optionally restricted to a UID set), records
    /// them in deleted_messages, and returns the expunged UIDs in order.
    pub async fn expunge(
        &self,
        mailbox_id: u32,
        restrict_to: Option<&[u32]>,
        deleted_by: Option<u32>,
    ) -> Result<Vec<u32>> {
        let client = self.begin().await?;
        let result = self
            .expunge_in(&client, mailbox_id, restrict_to, deleted_by)
            .await;
        match result {
            Ok(uids) => {
                Store::commit(client).await?;
                Ok(uids)
            }
            Err(err) => {
                let _ = Store::rollback(client).await;
                Err(err)
            }
        }
    }

    async fn expunge_in(
        &self,
        client: &deadpool_postgres::Client,
        mailbox_id: u32,
        restrict_to: Option<&[u32]>,
        deleted_by: Option<u32>,
    ) -> Result<Vec<u32>> {
        let db_mailbox = mailbox_id as i32;
        let restrict: Vec<i32> = restrict_to
            .map(|uids| uids.iter().map(|uid| *uid as i32).collect())
            .unwrap_or_default();

        let rows = client
            .query(
                "SELECT mm.uid, mm.message FROM mailbox_messages mm
                 WHERE mm.mailbox = $1
                   AND EXISTS (SELECT 1 FROM flags f
                               WHERE f.mailbox = mm.mailbox AND f.uid = mm.uid
                                 AND f.flag = '\\Deleted')
                   AND ($2 OR mm.uid = ANY($3))
                 ORDER BY mm.uid FOR UPDATE",
                &[&db_mailbox, &restrict_to.is_none(), &restrict],
            )
            .await?;
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let mut uids = Vec::with_capacity(rows.len());
        let deleted_by = deleted_by.map(|id| id as i32);
        let deleted_at = now();
        for row in &rows {
            let uid: i32 = row.get(0);
            let message: i32 = row.get(1);
            client
                .execute(
                    "INSERT INTO deleted_messages (mailbox, uid, message, deleted_by, deleted_at)
                     VALUES ($1, $2, $3, $4, $5)",
                    &[&db_mailbox, &uid, &message, &deleted_by, &deleted_at],
                )
                .await?;
            uids.push(uid as u32);
        }

        let db_uids: Vec<i32> = uids.iter().map(|uid| *uid as i32).collect();
        client
            .execute(
                "DELETE FROM flags WHERE mailbox = $1 AND uid = ANY($2)",
                &[&db_mailbox, &db_uids],
            )
            .await?;
        client
            .execute(
                "DELETE FROM annotations WHERE mailbox = $1 AND uid = ANY($2)",
                &[&db_mailbox, &db_uids],
            )
            .await?;
        client
            .execute(
                "DELETE FROM mailbox_messages WHERE mailbox = $1 AND uid = ANY($2)",
                &[&db_mailbox, &db_uids],
            )
            .await?;
        client
            .execute(
                "UPDATE mailboxes SET nextmodseq = nextmodseq + 1 WHERE id = $1",
                &[&db_mailbox],
            )
            .await?;

        Ok(uids)
    }

    pub async fn highest_modseq(&self, mailbox_id: u32) -> Result<u64> {
        let client = self.client().await?;
        let row = client
            .query_one(
                "SELECT nextmodseq FROM mailboxes WHERE id = $1",
                &[&(mailbox_id as i32)],
            )
            .await?;
        Ok((row.get::<_, i64>(0) as u64).saturating_sub(1))
    }
}
