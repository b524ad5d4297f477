/*
 * SPDX-FileCopyrightText: 2024 Loriot Project <dev@loriot.email>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use imap_proto::receiver::Request;
use imap_proto::{ResponseCode, StatusResponse};

use crate::core::session::SessionEvent;
use crate::core::SessionUser;

use super::Handler;

pub async fn handle(handler: &Handler, request: Request) -> imap_proto::Result<StatusResponse> {
    let mut tokens = request.tokens.into_iter();
    let login = tokens
        .next()
        .ok_or_else(|| StatusResponse::bad("Missing username.").with_tag(handler.tag.clone()))?
        .unwrap_string()
        .map_err(|err| StatusResponse::bad(err).with_tag(handler.tag.clone()))?;
    let secret = tokens
        .next()
        .ok_or_else(|| StatusResponse::bad("Missing password.").with_tag(handler.tag.clone()))?
        .unwrap_string()
        .map_err(|err| StatusResponse::bad(err).with_tag(handler.tag.clone()))?;

    authenticate_user(handler, &login, &secret, "LOGIN").await
}

pub(super) async fn authenticate_user(
    handler: &Handler,
    login: &str,
    secret: &str,
    mechanism: &str,
) -> imap_proto::Result<StatusResponse> {
    match handler
        .imap
        .store
        .authenticate(login, secret)
        .await
        .map_err(|err| handler.db_error(err))?
    {
        Some(user) => {
            tracing::info!(parent: &handler.span, event = "authenticated",
                login = user.login.as_str(), mechanism = mechanism,
                "Authentication successful.");
            let has_inbox = handler
                .imap
                .store
                .inbox_of(&user.login)
                .await
                .map_err(|err| handler.db_error(err))?
                .is_some();
            handler
                .event(SessionEvent::Authenticated {
                    user: SessionUser { user, has_inbox },
                })
                .await;
            Ok(StatusResponse::ok(format!("{} completed", mechanism))
                .with_tag(handler.tag.clone()))
        }
        None => {
            tracing::debug!(parent: &handler.span, event = "auth-failed",
                login = login, "Authentication failed.");
            Ok(StatusResponse::no("Login failed")
                .with_code(ResponseCode::AuthenticationFailed)
                .with_tag(handler.tag.clone()))
        }
    }
}
