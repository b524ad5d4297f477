/*
 * SPDX-FileCopyrightText: 2024 Loriot Project <dev@loriot.email>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::model::Mailbox;
use crate::{Error, Result, Store};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: u32,
    pub login: String,
    pub address_id: Option<u32>,
}

/// User home directory prefix; the IMAP name INBOX resolves below it.
pub fn inbox_name(login: &str) -> String {
    format!("/users/{}/INBOX", login)
}

pub fn home_prefix(login: &str) -> String {
    format!("/users/{}/", login)
}

impl Store {
    /// Verifies a login/secret pair. Secrets are stored by the admin CLI;
    /// mechanism internals (CRAM/DIGEST digests) live with the SASL layer.
    pub async fn authenticate(&self, login: &str, secret: &str) -> Result<Option<User>> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT id, login, address, secret FROM users WHERE lower(login) = lower($1)",
                &[&login],
            )
            .await?;
        Ok(rows.first().and_then(|row| {
            let stored: String = row.get(3);
            if stored == secret {
                Some(User {
                    id: row.get::<_, i32>(0) as u32,
                    login: row.get(1),
                    address_id: row.get::<_, Option<i32>>(2).map(|id| id as u32),
                })
            } else {
                None
            }
        }))
    }

    pub async fn user_by_login(&self, login: &str) -> Result<Option<User>> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT id, login, address FROM users WHERE lower(login) = lower($1)",
                &[&login],
            )
            .await?;
        Ok(rows.first().map(|row| User {
            id: row.get::<_, i32>(0) as u32,
            login: row.get(1),
            address_id: row.get::<_, Option<i32>>(2).map(|id| id as u32),
        }))
    }

    pub async fn list_users(&self) -> Result<Vec<(String, Option<String>)>> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT u.login, a.localpart || '@' || a.domain
                 FROM users u LEFT JOIN addresses a ON (u.address = a.id)
                 ORDER BY u.login",
                &[],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| (row.get(0), row.get::<_, Option<String>>(1)))
            .collect())
    }

    /// Finds or creates an address row.
    pub async fn address_id(
        &self,
        client: &deadpool_postgres::Client,
        name: &str,
        localpart: &str,
        domain: &str,
    ) -> Result<u32> {
        let row = client
            .query_one(
                "INSERT INTO addresses (name, localpart, domain) VALUES ($1, $2, $3)
                 ON CONFLICT (localpart, domain, name) DO UPDATE SET name = EXCLUDED.name
                 RETURNING id",
                &[&name, &localpart, &domain],
            )
            .await?;
        Ok(row.get::<_, i32>(0) as u32)
    }

    /// Creates a user with their INBOX and an alias row routing the address
    /// to it.
    pub async fn create_user(&self, login: &str, secret: &str, address: &str) -> Result<User> {
        let (localpart, domain) = address
            .split_once('@')
            .ok_or_else(|| Error::Consistency(format!("invalid address {:?}", address)))?;
        let client = self.begin().await?;
        let result: Result<User> = async {
            let address_id = self.address_id(&client, "", localpart, domain).await? as i32;
            let user = client
                .query_one(
                    "INSERT INTO users (login, secret, address) VALUES ($1, $2, $3)
                     RETURNING id",
                    &[&login, &secret, &address_id],
                )
                .await?;
            let user_id: i32 = user.get(0);
            let mailbox = client
                .query_one(
                    "INSERT INTO mailboxes (name, owner) VALUES ($1, $2)
                     ON CONFLICT (name) DO UPDATE
                     SET deleted = FALSE, owner = EXCLUDED.owner,
                         uidvalidity = mailboxes.uidvalidity + 1
                     RETURNING id",
                    &[&inbox_name(login), &user_id],
                )
                .await?;
            let mailbox_id: i32 = mailbox.get(0);
            client
                .execute(
                    "INSERT INTO aliases (address, mailbox) VALUES ($1, $2)",
                    &[&address_id, &mailbox_id],
                )
                .await?;
            Ok(User {
                id: user_id as u32,
                login: login.into(),
                address_id: Some(address_id as u32),
            })
        }
        .await;
        match result {
            Ok(user) => {
                Store::commit(client).await?;
                Ok(user)
            }
            Err(err) => {
                let _ = Store::rollback(client).await;
                Err(err)
            }
        }
    }

    /// Deletes a user. Unless `force` is set, the deletion is refused when
    /// any of the user's mailboxes still holds mail; the offending mailbox
    /// names are returned.
    pub async fn delete_user(
        &self,
        login: &str,
        force: bool,
    ) -> Result<std::result::Result<(), Vec<String>>> {
        let user = self.user_by_login(login).await?.ok_or(Error::NotFound)?;
        let client = self.begin().await?;
        let result: Result<std::result::Result<(), Vec<String>>> = async {
            let rows = client
                .query(
                    "SELECT m.id, m.name,
                            EXISTS (SELECT 1 FROM mailbox_messages mm
                                    WHERE mm.mailbox = m.id) AS occupied
                     FROM mailboxes m WHERE m.owner = $1 AND NOT m.deleted",
                    &[&(user.id as i32)],
                )
                .await?;
            let occupied = rows
                .iter()
                .filter(|row| row.get::<_, bool>(2))
                .map(|row| row.get::<_, String>(1))
                .collect::<Vec<_>>();
            if !occupied.is_empty() && !force {
                return Ok(Err(occupied));
            }
            for row in &rows {
                let mailbox_id: i32 = row.get(0);
                client
                    .execute(
                        "DELETE FROM aliases WHERE mailbox = $1",
                        &[&mailbox_id],
                    )
                    .await?;
                client
                    .execute(
                        "UPDATE mailboxes SET deleted = TRUE, owner = NULL,
                                uidvalidity = uidvalidity + 1
                         WHERE id = $1",
                        &[&mailbox_id],
                    )
                    .await?;
            }
            client
                .execute("DELETE FROM users WHERE id = $1", &[&(user.id as i32)])
                .await?;
            Ok(Ok(()))
        }
        .await;
        match result {
            Ok(outcome) => {
                Store::commit(client).await?;
                Ok(outcome)
            }
            Err(err) => {
                let _ = Store::rollback(client).await;
                Err(err)
            }
        }
    }

    pub async fn change_password(&self, login: &str, secret: &str) -> Result<()> {
        let client = self.client().await?;
        let updated = client
            .execute(
                "UPDATE users SET secret = $2 WHERE lower(login) = lower($1)",
                &[&login, &secret],
            )
            .await?;
        if updated == 0 {
            Err(Error::NotFound)
        } else {
            Ok(())
        }
    }

    /// Renames a user and moves their mailbox subtree along.
    pub async fn change_username(&self, old: &str, new: &str) -> Result<()> {
        let client = self.begin().await?;
        let result: Result<()> = async {
            let updated = client
                .execute(
                    "UPDATE users SET login = $2 WHERE lower(login) = lower($1)",
                    &[&old, &new],
                )
                .await?;
            if updated == 0 {
                return Err(Error::NotFound);
            }
            let old_prefix = home_prefix(old);
            let new_prefix = home_prefix(new);
            client
                .execute(
                    "UPDATE mailboxes SET name = $2 || substr(name, length($1) + 1)
                     WHERE name LIKE $1 || '%'",
                    &[&old_prefix, &new_prefix],
                )
                .await?;
            Ok(())
        }
        .await;
        match result {
            Ok(()) => Store::commit(client).await,
            Err(err) => {
                let _ = Store::rollback(client).await;
                Err(err)
            }
        }
    }

    pub async fn change_address(&self, login: &str, address: &str) -> Result<()> {
        let (localpart, domain) = address
            .split_once('@')
            .ok_or_else(|| Error::Consistency(format!("invalid address {:?}", address)))?;
        let client = self.begin().await?;
        let result: Result<()> = async {
            let address_id = self.address_id(&client, "", localpart, domain).await? as i32;
            let updated = client
                .execute(
                    "UPDATE users SET address = $2 WHERE lower(login) = lower($1)",
                    &[&login, &address_id],
                )
                .await?;
            if updated == 0 {
                return Err(Error::NotFound);
            }
            client
                .execute(
                    "UPDATE aliases SET address = $1
                     WHERE mailbox IN (SELECT id FROM mailboxes WHERE name = $2)",
                    &[&address_id, &inbox_name(login)],
                )
                .await?;
            Ok(())
        }
        .await;
        match result {
            Ok(()) => Store::commit(client).await,
            Err(err) => {
                let _ = Store::rollback(client).await;
                Err(err)
            }
        }
    }

    /// The user's INBOX, if it exists yet. A missing INBOX slows the
    /// session's command dispatch down, so this is consulted at login.
    pub async fn inbox_of(&self, login: &str) -> Result<Option<Mailbox>> {
        self.mailbox_by_name(&inbox_name(login)).await
    }

    /// Resolves a recipient address to the mailboxes aliased to it.
    pub async fn resolve_address(
        &self,
        localpart: &str,
        domain: &str,
    ) -> Result<Vec<u32>> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT al.mailbox FROM aliases al
                 JOIN addresses a ON (al.address = a.id)
                 JOIN mailboxes m ON (al.mailbox = m.id)
                 WHERE lower(a.localpart) = lower($1) AND lower(a.domain) = lower($2)
                   AND NOT m.deleted",
                &[&localpart, &domain],
            )
            .await?;
        Ok(rows.iter().map(|row| row.get::<_, i32>(0) as u32).collect())
    }
}
