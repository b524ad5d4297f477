/*
 * SPDX-FileCopyrightText: 2024 Loriot Project <dev@loriot.email>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use imap_proto::receiver::Request;
use imap_proto::{ResponseCode, StatusResponse};

use super::Handler;

/// AUTHENTICATE PLAIN, with or without an initial response. The mechanism
/// internals beyond PLAIN live with the SASL layer; CRAM and DIGEST would
/// slot in beside the challenge exchange here.
pub async fn handle(handler: &Handler, request: Request) -> imap_proto::Result<StatusResponse> {
    let mut tokens = request.tokens.into_iter();
    let mechanism = tokens
        .next()
        .ok_or_else(|| {
            StatusResponse::bad("Missing authentication mechanism.")
                .with_tag(handler.tag.clone())
        })?
        .unwrap_bytes();
    if !mechanism.eq_ignore_ascii_case(b"PLAIN") {
        return Ok(StatusResponse::no(format!(
            "Unsupported authentication mechanism {:?}.",
            String::from_utf8_lossy(&mechanism)
        ))
        .with_code(ResponseCode::Cannot)
        .with_tag(handler.tag.clone()));
    }

    let response = match tokens.next() {
        Some(token) => token.unwrap_bytes(),
        None => {
            // Reserve the stream and ask for the SASL response.
            let mut input = handler.reserve().await;
            handler.untagged(b"+ \r\n".to_vec()).await;
            let mut line = Vec::new();
            loop {
                match input.recv().await {
                    Some(bytes) => {
                        line.extend_from_slice(&bytes);
                        if line.ends_with(b"\n") {
                            break;
                        }
                    }
                    None => {
                        handler.release().await;
                        return Err(StatusResponse::bad("Connection lost.")
                            .with_tag(handler.tag.clone()));
                    }
                }
            }
            handler.release().await;
            while line.last().map_or(false, |ch| *ch == b'\r' || *ch == b'\n') {
                line.pop();
            }
            if line == b"*" {
                return Ok(StatusResponse::bad("Authentication aborted.")
                    .with_tag(handler.tag.clone()));
            }
            line
        }
    };

    let decoded = STANDARD.decode(&response).map_err(|_| {
        StatusResponse::bad("Invalid base64 in SASL response.").with_tag(handler.tag.clone())
    })?;
    // PLAIN: authzid NUL authcid NUL password.
    let mut fields = decoded.split(|&ch| ch == 0);
    let _authzid = fields.next().unwrap_or_default();
    let authcid = fields.next().unwrap_or_default();
    let password = fields.next().unwrap_or_default();
    let login = String::from_utf8_lossy(authcid).into_owned();
    let secret = String::from_utf8_lossy(password).into_owned();
    if login.is_empty() {
        return Ok(StatusResponse::no("Empty authentication identity.")
            .with_code(ResponseCode::AuthenticationFailed)
            .with_tag(handler.tag.clone()));
    }

    super::login::authenticate_user(handler, &login, &secret, "AUTHENTICATE").await
}
