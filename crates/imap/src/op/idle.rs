/*
 * SPDX-FileCopyrightText: 2024 Loriot Project <dev@loriot.email>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use imap_proto::StatusResponse;

use super::Handler;

/// IDLE (RFC 2177): reserve the input stream, acknowledge with a
/// continuation, and wait for DONE. While this command executes the
/// scheduler treats the connection as idle, so expunges and new-message
/// responses flow to the client.
pub async fn handle(handler: &Handler) -> imap_proto::Result<StatusResponse> {
    let mut input = handler.reserve().await;
    handler.untagged(b"+ idling\r\n".to_vec()).await;

    let mut line = Vec::new();
    loop {
        match input.recv().await {
            Some(bytes) => {
                line.extend_from_slice(&bytes);
                while let Some(pos) = line.iter().position(|&ch| ch == b'\n') {
                    let mut complete = line.drain(..=pos).collect::<Vec<_>>();
                    while complete
                        .last()
                        .map_or(false, |ch| *ch == b'\r' || *ch == b'\n')
                    {
                        complete.pop();
                    }
                    if complete.eq_ignore_ascii_case(b"DONE") {
                        handler.release().await;
                        return Ok(StatusResponse::ok("IDLE completed")
                            .with_tag(handler.tag.clone()));
                    }
                }
            }
            None => {
                handler.release().await;
                return Err(
                    StatusResponse::bad("Connection lost.").with_tag(handler.tag.clone())
                );
            }
        }
    }
}
