/*
 * SPDX-FileCopyrightText: 2024 Loriot Project <dev@loriot.email>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use ahash::AHashMap;

use crate::model::{AddressRow, AnnotationRow, HeaderRow, PartRow, Trivia, UidMap};
use crate::{Result, Store};

/// Facet fetchers. Each issues exactly one batched query for the whole
/// message set; the fetch planner combines them so a FETCH touches the
/// database once per missing facet type, not once per message.
impl Store {
    /// Maps UIDs to (message id, modseq) for one mailbox.
    pub async fn uid_map(&self, mailbox_id: u32, uids: &[u32]) -> Result<UidMap> {
        let client = self.client().await?;
        let uids = to_db_ids(uids);
        let rows = client
            .query(
                "SELECT uid, message, modseq FROM mailbox_messages
                 WHERE mailbox = $1 AND uid = ANY($2)",
                &[&(mailbox_id as i32), &uids],
            )
            .await?;
        let mut map = UidMap::with_capacity(rows.len());
        for row in rows {
            map.insert(
                row.get::<_, i32>(0) as u32,
                (row.get::<_, i32>(1) as u32, row.get::<_, i64>(2) as u64),
            );
        }
        Ok(map)
    }

    /// UIDs in the set whose modseq is above the given value, locked
    /// `FOR UPDATE` on the supplied transaction-bearing connection.
    pub async fn changed_uids(
        client: &deadpool_postgres::Client,
        mailbox_id: u32,
        uids: &[u32],
        changed_since: u64,
    ) -> Result<Vec<u32>> {
        let uids = to_db_ids(uids);
        let rows = client
            .query(
                "SELECT uid FROM mailbox_messages
                 WHERE mailbox = $1 AND modseq > $2 AND uid = ANY($3) FOR UPDATE",
                &[&(mailbox_id as i32), &(changed_since as i64), &uids],
            )
            .await?;
        Ok(rows.iter().map(|row| row.get::<_, i32>(0) as u32).collect())
    }

    pub async fn begin(&self) -> Result<deadpool_postgres::Client> {
        let client = self.client().await?;
        client.batch_execute("BEGIN").await?;
        Ok(client)
    }

    pub async fn commit(client: deadpool_postgres::Client) -> Result<()> {
        client.batch_execute("COMMIT").await?;
        Ok(())
    }

    pub async fn rollback(client: deadpool_postgres::Client) -> Result<()> {
        client.batch_execute("ROLLBACK").await?;
        Ok(())
    }

    pub async fn fetch_trivia(
        &self,
        mailbox_id: u32,
        uids: &[u32],
    ) -> Result<AHashMap<u32, Trivia>> {
        let client = self.client().await?;
        let uids = to_db_ids(uids);
        let rows = client
            .query(
                "SELECT mm.uid, mm.modseq, m.idate, m.rfc822size
                 FROM mailbox_messages mm JOIN messages m ON (mm.message = m.id)
                 WHERE mm.mailbox = $1 AND mm.uid = ANY($2)",
                &[&(mailbox_id as i32), &uids],
            )
            .await?;
        let mut map = AHashMap::with_capacity(rows.len());
        for row in rows {
            map.insert(
                row.get::<_, i32>(0) as u32,
                Trivia {
                    modseq: row.get::<_, i64>(1) as u64,
                    internal_date: row.get::<_, i64>(2),
                    rfc822_size: row.get::<_, i32>(3) as u32,
                },
            );
        }
        Ok(map)
    }

    pub async fn fetch_flags(
        &self,
        mailbox_id: u32,
        uids: &[u32],
    ) -> Result<AHashMap<u32, Vec<String>>> {
        let client = self.client().await?;
        let db_uids = to_db_ids(uids);
        let rows = client
            .query(
                "SELECT uid, flag FROM flags WHERE mailbox = $1 AND uid = ANY($2)",
                &[&(mailbox_id as i32), &db_uids],
            )
            .await?;
        let mut map: AHashMap<u32, Vec<String>> =
            uids.iter().map(|uid| (*uid, Vec::new())).collect();
        for row in rows {
            map.entry(row.get::<_, i32>(0) as u32)
                .or_default()
                .push(row.get(1));
        }
        Ok(map)
    }

    pub async fn fetch_annotations(
        &self,
        mailbox_id: u32,
        uids: &[u32],
    ) -> Result<AHashMap<u32, Vec<AnnotationRow>>> {
        let client = self.client().await?;
        let db_uids = to_db_ids(uids);
        let rows = client
            .query(
                "SELECT uid, name, owner, value FROM annotations
                 WHERE mailbox = $1 AND uid = ANY($2)",
                &[&(mailbox_id as i32), &db_uids],
            )
            .await?;
        let mut map: AHashMap<u32, Vec<AnnotationRow>> =
            uids.iter().map(|uid| (*uid, Vec::new())).collect();
        for row in rows {
            map.entry(row.get::<_, i32>(0) as u32)
                .or_default()
                .push(AnnotationRow {
                    name: row.get(1),
                    owner: row.get::<_, Option<i32>>(2).map(|id| id as u32),
                    value: row.get(3),
                });
        }
        Ok(map)
    }

    pub async fn fetch_addresses(
        &self,
        message_ids: &[u32],
    ) -> Result<AHashMap<u32, Vec<AddressRow>>> {
        let client = self.client().await?;
        let ids = to_db_ids(message_ids);
        let rows = client
            .query(
                "SELECT message, part, position, field, group_name, name, localpart, domain
                 FROM address_fields WHERE message = ANY($1)",
                &[&ids],
            )
            .await?;
        let mut map: AHashMap<u32, Vec<AddressRow>> =
            message_ids.iter().map(|id| (*id, Vec::new())).collect();
        for row in rows {
            map.entry(row.get::<_, i32>(0) as u32)
                .or_default()
                .push(AddressRow {
                    part: row.get(1),
                    position: row.get(2),
                    field: row.get(3),
                    group_name: row.get(4),
                    name: row.get(5),
                    localpart: row.get(6),
                    domain: row.get(7),
                });
        }
        Ok(map)
    }

    pub async fn fetch_headers(
        &self,
        message_ids: &[u32],
    ) -> Result<AHashMap<u32, Vec<HeaderRow>>> {
        let client = self.client().await?;
        let ids = to_db_ids(message_ids);
        let rows = client
            .query(
                "SELECT message, part, position, field, value
                 FROM header_fields WHERE message = ANY($1)",
                &[&ids],
            )
            .await?;
        let mut map: AHashMap<u32, Vec<HeaderRow>> =
            message_ids.iter().map(|id| (*id, Vec::new())).collect();
        for row in rows {
            map.entry(row.get::<_, i32>(0) as u32)
                .or_default()
                .push(HeaderRow {
                    part: row.get(1),
                    position: row.get(2),
                    field: row.get(3),
                    value: row.get(4),
                });
        }
        Ok(map)
    }

    /// Full raw message octets, served from the part "" bodypart.
    pub async fn fetch_raw(&self, message_ids: &[u32]) -> Result<AHashMap<u32, Vec<u8>>> {
        let client = self.client().await?;
        let ids = to_db_ids(message_ids);
        let rows = client
            .query(
                "SELECT pn.message, bp.data
                 FROM part_numbers pn JOIN bodyparts bp ON (pn.bodypart = bp.id)
                 WHERE pn.message = ANY($1) AND pn.part = ''",
                &[&ids],
            )
            .await?;
        let mut map = AHashMap::with_capacity(rows.len());
        for row in rows {
            map.insert(row.get::<_, i32>(0) as u32, row.get::<_, Vec<u8>>(1));
        }
        Ok(map)
    }

    pub async fn fetch_part_numbers(
        &self,
        message_ids: &[u32],
    ) -> Result<AHashMap<u32, Vec<PartRow>>> {
        let client = self.client().await?;
        let ids = to_db_ids(message_ids);
        let rows = client
            .query(
                "SELECT message, part, header_offset, body_offset, end_offset, bytes, lines
                 FROM part_numbers WHERE message = ANY($1)",
                &[&ids],
            )
            .await?;
        let mut map: AHashMap<u32, Vec<PartRow>> =
            message_ids.iter().map(|id| (*id, Vec::new())).collect();
        for row in rows {
            map.entry(row.get::<_, i32>(0) as u32)
                .or_default()
                .push(PartRow {
                    part: row.get(1),
                    header_offset: row.get::<_, i32>(2) as u32,
                    body_offset: row.get::<_, i32>(3) as u32,
                    end_offset: row.get::<_, i32>(4) as u32,
                    bytes: row.get::<_, i32>(5) as u32,
                    lines: row.get::<_, i32>(6) as u32,
                });
        }
        Ok(map)
    }
}

fn to_db_ids(ids: &[u32]) -> Vec<i32> {
    ids.iter().map(|id| *id as i32).collect()
}
