/*
 * SPDX-FileCopyrightText: 2024 Loriot Project <dev@loriot.email>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::io;
use std::os::fd::RawFd;

/// Socket domain named in a systemd endpoint specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    Inet,
    Unix,
}

/// A `systemd/<domain>/<index>` endpoint, picking up fd 3+index from the
/// manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemdEndpoint {
    pub domain: Domain,
    pub index: u32,
}

pub const LISTEN_FDS_START: RawFd = 3;

/// Parses "systemd/inet/0" style endpoint addresses; returns None when the
/// address is not a systemd endpoint at all.
pub fn parse_endpoint(address: &str) -> Option<Result<SystemdEndpoint, String>> {
    let rest = address.strip_prefix("systemd/")?;
    let (domain, index) = match rest.split_once('/') {
        Some(parts) => parts,
        None => return Some(Err(format!("malformed systemd endpoint {:?}", address))),
    };
    let domain = match domain {
        "inet" => Domain::Inet,
        "unix" => Domain::Unix,
        other => {
            return Some(Err(format!("unknown systemd socket domain {:?}", other)));
        }
    };
    match index.parse::<u32>() {
        Ok(index) => Some(Ok(SystemdEndpoint { domain, index })),
        Err(_) => Some(Err(format!("invalid systemd socket index {:?}", index))),
    }
}

/// Validates the endpoint against LISTEN_PID/LISTEN_FDS and returns the
/// file descriptor to adopt.
pub fn take_fd(endpoint: SystemdEndpoint) -> io::Result<RawFd> {
    let listen_pid = std::env::var("LISTEN_PID")
        .ok()
        .and_then(|pid| pid.parse::<u32>().ok())
        .ok_or_else(|| io::Error::other("LISTEN_PID is not set"))?;
    if listen_pid != std::process::id() {
        return Err(io::Error::other(format!(
            "LISTEN_PID {} does not match pid {}",
            listen_pid,
            std::process::id()
        )));
    }
    let listen_fds = std::env::var("LISTEN_FDS")
        .ok()
        .and_then(|fds| fds.parse::<u32>().ok())
        .ok_or_else(|| io::Error::other("LISTEN_FDS is not set"))?;
    if endpoint.index >= listen_fds {
        return Err(io::Error::other(format!(
            "socket index {} out of range, LISTEN_FDS={}",
            endpoint.index, listen_fds
        )));
    }
    Ok(LISTEN_FDS_START + endpoint.index as RawFd)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_endpoints() {
        assert_eq!(
            parse_endpoint("systemd/inet/0"),
            Some(Ok(SystemdEndpoint {
                domain: Domain::Inet,
                index: 0
            }))
        );
        assert_eq!(
            parse_endpoint("systemd/unix/2"),
            Some(Ok(SystemdEndpoint {
                domain: Domain::Unix,
                index: 2
            }))
        );
        assert!(parse_endpoint("0.0.0.0:143").is_none());
        assert!(matches!(parse_endpoint("systemd/ipx/0"), Some(Err(_))));
        assert!(matches!(parse_endpoint("systemd/inet/x"), Some(Err(_))));
    }
}
