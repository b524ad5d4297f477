/*
 * SPDX-FileCopyrightText: 2024 Loriot Project <dev@loriot.email>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::fmt::Write;

use chrono::{TimeZone, Utc};
use mail_builder::headers::content_type::ContentType;
use mail_builder::headers::HeaderType;
use mail_builder::mime::{make_boundary, BodyPart, MimePart};
use mail_builder::MessageBuilder;
use store::model::RecipientAction;

use crate::outbound::client::DeliverySet;

/// Builds an RFC 3464 delivery status notification for a delivery set:
/// multipart/report with a human-readable part, a machine-readable
/// message/delivery-status part, and the undeliverable message's header.
pub fn build_bounce(hostname: &str, return_path: &str, set: &DeliverySet) -> Vec<u8> {
    let mut failed = String::new();
    let mut delayed = String::new();
    for recipient in &set.recipients {
        match recipient.action {
            RecipientAction::Failed => {
                let _ = writeln!(failed, "    {} ({})\r", recipient.address, recipient.status);
            }
            RecipientAction::Delayed | RecipientAction::Unknown => {
                let _ = writeln!(
                    delayed,
                    "    {} ({})\r",
                    recipient.address,
                    if recipient.status.is_empty() {
                        "still trying"
                    } else {
                        recipient.status.as_str()
                    }
                );
            }
            RecipientAction::Relayed => (),
        }
    }

    let mut text = String::with_capacity(256);
    let subject = if !failed.is_empty() && delayed.is_empty() {
        text.push_str("Your message could not be delivered to the following recipients:\r\n\r\n");
        text.push_str(&failed);
        "Failed to deliver message"
    } else if failed.is_empty() {
        text.push_str(
            "There was a temporary problem delivering your message to the following \
             recipients:\r\n\r\n",
        );
        text.push_str(&delayed);
        "Warning: Delay in message delivery"
    } else {
        text.push_str("Your message could not be delivered to some recipients:\r\n\r\n");
        text.push_str("    ----- Delivery to the following addresses failed -----\r\n");
        text.push_str(&failed);
        text.push_str("\r\n    ----- These addresses are still being retried -----\r\n");
        text.push_str(&delayed);
        "Warning: Temporary and permanent failures during message delivery"
    };

    // The machine-readable per-message and per-recipient fields.
    let mut report = String::with_capacity(256);
    let _ = write!(report, "Reporting-MTA: dns;{}\r\n", hostname);
    let _ = write!(
        report,
        "Arrival-Date: {}\r\n\r\n",
        Utc.timestamp_opt(store::now(), 0)
            .single()
            .unwrap_or_default()
            .format("%a, %d %b %Y %H:%M:%S +0000")
    );
    for recipient in &set.recipients {
        let (action, status) = match recipient.action {
            RecipientAction::Failed => ("failed", recipient.status.as_str()),
            RecipientAction::Delayed | RecipientAction::Unknown => {
                ("delayed", if recipient.status.is_empty() {
                    "4.0.0"
                } else {
                    recipient.status.as_str()
                })
            }
            RecipientAction::Relayed => ("relayed", "2.0.0"),
        };
        let _ = write!(report, "Final-Recipient: rfc822;{}\r\n", recipient.address);
        let _ = write!(report, "Action: {}\r\n", action);
        let _ = write!(report, "Status: {}\r\n\r\n", status);
    }

    // The original message's header block.
    let header_end = set
        .message
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|pos| pos + 2)
        .unwrap_or(set.message.len());
    let original_headers =
        String::from_utf8_lossy(&set.message[..header_end]).into_owned();

    MessageBuilder::new()
        .from(("Mail Delivery Subsystem", format!("MAILER-DAEMON@{}", hostname).as_str()))
        .header("To", HeaderType::Text(return_path.into()))
        .header("Auto-Submitted", HeaderType::Text("auto-replied".into()))
        .message_id(format!("<{}@{}>", make_boundary("."), hostname))
        .subject(subject)
        .body(MimePart::new(
            ContentType::new("multipart/report").attribute("report-type", "delivery-status"),
            BodyPart::Multipart(vec![
                MimePart::new(ContentType::new("text/plain"), BodyPart::Text(text.into())),
                MimePart::new(
                    ContentType::new("message/delivery-status"),
                    BodyPart::Text(report.into()),
                ),
                MimePart::new(
                    ContentType::new("message/rfc822"),
                    BodyPart::Text(original_headers.into()),
                ),
            ]),
        ))
        .write_to_vec()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::client::DeliveryRecipientState;

    #[test]
    fn bounce_for_partial_failure() {
        let set = DeliverySet {
            sender: ("sender".into(), "example.com".into()),
            recipients: vec![
                DeliveryRecipientState {
                    address_id: 1,
                    address: "ok@example.net".into(),
                    action: RecipientAction::Relayed,
                    status: "2.0.0".into(),
                },
                DeliveryRecipientState {
                    address_id: 2,
                    address: "gone@example.net".into(),
                    action: RecipientAction::Failed,
                    status: "5.2.0".into(),
                },
            ],
            message: b"Subject: original\r\nFrom: sender@example.com\r\n\r\nbody\r\n".to_vec(),
            needs_utf8: false,
        };
        let bounce = build_bounce("mail.example.com", "sender@example.com", &set);
        let text = String::from_utf8_lossy(&bounce);
        assert!(text.contains("MAILER-DAEMON@mail.example.com"));
        assert!(text.contains("multipart/report"));
        assert!(text.contains("Final-Recipient: rfc822;gone@example.net"));
        assert!(text.contains("Action: failed"));
        assert!(text.contains("Status: 5.2.0"));
        assert!(text.contains("Subject: original"));
        // The relayed recipient appears in the report but not as a failure.
        assert!(text.contains("Action: relayed"));
    }

    #[test]
    fn delay_warning_for_temporary_failure() {
        let set = DeliverySet {
            sender: ("sender".into(), "example.com".into()),
            recipients: vec![DeliveryRecipientState {
                address_id: 1,
                address: "busy@example.net".into(),
                action: RecipientAction::Delayed,
                status: "4.2.0".into(),
            }],
            message: b"Subject: original\r\n\r\nbody\r\n".to_vec(),
            needs_utf8: false,
        };
        let bounce = build_bounce("mail.example.com", "sender@example.com", &set);
        let text = String::from_utf8_lossy(&bounce);
        assert!(text.contains("Warning: Delay in message delivery"));
        assert!(text.contains("temporary problem delivering"));
        assert!(text.contains("Final-Recipient: rfc822;busy@example.net"));
        assert!(text.contains("Action: delayed"));
        assert!(text.contains("Status: 4.2.0"));
    }
}
