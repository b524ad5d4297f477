/*
 * SPDX-FileCopyrightText: 2024 Loriot Project <dev@loriot.email>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use imap_proto::receiver::Request;
use imap_proto::{Command, StatusResponse};

/// Lifecycle of one pipelined command.
///
/// Unparsed commands have been tokenized but not argument-parsed; Blocked
/// commands are parsed but may not start yet (group conflict or rate
/// limiting); Executing commands have a running handler task; Finished
/// commands hold their tagged result and wait for emission; Retired commands
/// have been written out and are dropped from the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    Unparsed,
    Blocked,
    Executing,
    Finished,
    Retired,
}

#[derive(Debug)]
pub struct ScheduledCommand {
    pub id: u64,
    pub tag: String,
    pub command: Command,
    pub state: CommandState,
    /// Consumed when the handler task starts.
    pub request: Option<Request>,
    /// Untagged output contributed by this command, buffered until the
    /// command reaches the head of the queue.
    pub pending: Vec<Vec<u8>>,
    pub result: Option<StatusResponse>,
}

impl ScheduledCommand {
    pub fn new(id: u64, request: Request) -> Self {
        ScheduledCommand {
            id,
            tag: request.tag.clone(),
            command: request.command,
            state: CommandState::Unparsed,
            request: Some(request),
            pending: Vec::new(),
            result: None,
        }
    }

    pub fn group(&self) -> u8 {
        self.command.group()
    }
}

/// Commands that may start now: the head command, plus followers in the
/// same non-zero group. A follower in a different group stays blocked until
/// the queue drains down to it.
pub fn runnable(commands: &[ScheduledCommand]) -> Vec<u64> {
    let mut out = Vec::new();
    let mut live = commands
        .iter()
        .filter(|c| c.state != CommandState::Retired);
    let head = match live.next() {
        Some(head) => head,
        None => return out,
    };
    if matches!(head.state, CommandState::Unparsed | CommandState::Blocked) {
        out.push(head.id);
    }
    let group = head.group();
    if group != 0 {
        for command in live {
            if command.group() != group {
                break;
            }
            if matches!(
                command.state,
                CommandState::Unparsed | CommandState::Blocked
            ) {
                out.push(command.id);
            }
        }
    }
    out
}

/// Whether untagged EXPUNGE responses may be emitted right now. Expunges
/// are permitted while the connection idles (no commands, or an executing
/// IDLE) and between finished commands; they are forbidden while any other
/// command executes, and while any MSN-addressing command (group 2 or 3) is
/// anywhere in the pipeline.
pub fn may_emit_expunge(commands: &[ScheduledCommand]) -> bool {
    let mut can = false;
    let mut cannot = false;
    let mut any = false;
    for command in commands {
        if command.state == CommandState::Retired {
            continue;
        }
        any = true;
        if command.state == CommandState::Executing && command.command == Command::Idle {
            can = true;
        } else if command.state == CommandState::Executing {
            cannot = true;
        } else if command.group() == 2 || command.group() == 3 {
            cannot = true;
        } else if command.command.uses_msn() {
            cannot = true;
        } else if command.state == CommandState::Finished {
            can = true;
        }
    }
    if cannot {
        false
    } else if any {
        can
    } else {
        true
    }
}

/// Seconds to hold back the next command start. The server slows down after
/// syntax errors (one second per accumulated error, capped at 16, counted
/// from the last bad command), and enforces a four second floor for a
/// logged-in user whose INBOX has not been created yet.
pub fn start_delay(
    syntax_errors: u32,
    last_bad_time: i64,
    now: i64,
    user_without_inbox: bool,
) -> u64 {
    let mut needed = (syntax_errors.min(16) as i64) + last_bad_time - now;
    if needed < 0 {
        needed = 0;
    }
    if user_without_inbox && needed < 4 {
        needed = 4;
    }
    needed as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(id: u64, command: Command, state: CommandState) -> ScheduledCommand {
        ScheduledCommand {
            id,
            tag: format!("t{}", id),
            command,
            state,
            request: None,
            pending: Vec::new(),
            result: None,
        }
    }

    #[test]
    fn solo_commands_run_alone() {
        let commands = vec![
            command(1, Command::Select, CommandState::Unparsed),
            command(2, Command::Fetch(true), CommandState::Unparsed),
        ];
        assert_eq!(runnable(&commands), vec![1]);
    }

    #[test]
    fn uid_group_runs_concurrently() {
        let commands = vec![
            command(1, Command::Fetch(true), CommandState::Executing),
            command(2, Command::Fetch(true), CommandState::Unparsed),
            command(3, Command::Search(true), CommandState::Unparsed),
            command(4, Command::Store(false), CommandState::Unparsed),
            command(5, Command::Fetch(true), CommandState::Unparsed),
        ];
        // Group 1 followers start; the group 3 STORE blocks itself and
        // everything behind it.
        assert_eq!(runnable(&commands), vec![2, 3]);
    }

    #[test]
    fn retired_heads_are_skipped() {
        let commands = vec![
            command(1, Command::Noop, CommandState::Retired),
            command(2, Command::Fetch(false), CommandState::Blocked),
        ];
        assert_eq!(runnable(&commands), vec![2]);
    }

    #[test]
    fn msn_fetch_blocks_followers() {
        let commands = vec![
            command(1, Command::Fetch(false), CommandState::Executing),
            command(2, Command::Fetch(true), CommandState::Unparsed),
        ];
        assert_eq!(runnable(&commands), Vec::<u64>::new());
    }

    #[test]
    fn expunge_gate() {
        // Idle pipeline: allowed.
        assert!(may_emit_expunge(&[]));

        // While IDLE executes: allowed.
        assert!(may_emit_expunge(&[command(
            1,
            Command::Idle,
            CommandState::Executing
        )]));

        // While a FETCH executes: not allowed.
        assert!(!may_emit_expunge(&[command(
            1,
            Command::Fetch(true),
            CommandState::Executing
        )]));

        // A group 2 command anywhere in the pipeline blocks expunges even
        // before it starts.
        assert!(!may_emit_expunge(&[
            command(1, Command::Noop, CommandState::Finished),
            command(2, Command::Fetch(false), CommandState::Unparsed),
        ]));

        // Between finished commands: allowed.
        assert!(may_emit_expunge(&[
            command(1, Command::Noop, CommandState::Finished),
            command(2, Command::Status, CommandState::Unparsed),
        ]));

        // Only retired commands left: allowed.
        assert!(may_emit_expunge(&[command(
            1,
            Command::Noop,
            CommandState::Retired
        )]));
    }

    #[test]
    fn syntax_error_delay() {
        // No errors, no delay.
        assert_eq!(start_delay(0, 0, 1000, false), 0);
        // Three errors, just recorded: three seconds.
        assert_eq!(start_delay(3, 1000, 1000, false), 3);
        // Errors long past: no delay.
        assert_eq!(start_delay(3, 100, 1000, false), 0);
        // Capped at sixteen seconds.
        assert_eq!(start_delay(40, 1000, 1000, false), 16);
        // Inboxless users always wait at least four seconds.
        assert_eq!(start_delay(0, 0, 1000, true), 4);
        assert_eq!(start_delay(10, 1000, 1000, true), 10);
    }
}
