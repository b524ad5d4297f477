/*
 * SPDX-FileCopyrightText: 2024 Loriot Project <dev@loriot.email>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt};

/// The 12-byte PROXY protocol v2 signature.
pub const V2_SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

const FAMILY_TCP4: u8 = 0x11;
const FAMILY_TCP6: u8 = 0x21;

/// Addresses carried by a PROXY preamble. LOCAL commands and unsupported
/// address families leave both sides unset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProxiedAddresses {
    pub source: Option<SocketAddr>,
    pub destination: Option<SocketAddr>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ProxyError {
    /// Not enough bytes yet; the value is the minimum still missing.
    NeedsMoreData(usize),
    InvalidSignature,
    InvalidVersion,
}

/// Parses a PROXY v2 preamble from the start of `buf`. On success returns
/// the carried addresses and the number of preamble bytes consumed.
pub fn parse_v2_header(buf: &[u8]) -> Result<(ProxiedAddresses, usize), ProxyError> {
    if buf.len() < 16 {
        return Err(ProxyError::NeedsMoreData(16 - buf.len()));
    }
    if buf[..12] != V2_SIGNATURE {
        return Err(ProxyError::InvalidSignature);
    }
    let ver_cmd = buf[12];
    if ver_cmd & 0xf0 != 0x20 {
        return Err(ProxyError::InvalidVersion);
    }
    let family = buf[13];
    let len = u16::from_be_bytes([buf[14], buf[15]]) as usize;
    if buf.len() < 16 + len {
        return Err(ProxyError::NeedsMoreData(16 + len - buf.len()));
    }
    let addr = &buf[16..16 + len];

    let mut addresses = ProxiedAddresses::default();
    match ver_cmd & 0x0f {
        // PROXY command: pick up the carried addresses where the transport
        // is one we understand, otherwise keep the socket addresses.
        0x01 => match family {
            FAMILY_TCP4 if len >= 12 => {
                let src = Ipv4Addr::new(addr[0], addr[1], addr[2], addr[3]);
                let dst = Ipv4Addr::new(addr[4], addr[5], addr[6], addr[7]);
                let src_port = u16::from_be_bytes([addr[8], addr[9]]);
                let dst_port = u16::from_be_bytes([addr[10], addr[11]]);
                addresses.source = Some(SocketAddr::new(IpAddr::V4(src), src_port));
                addresses.destination = Some(SocketAddr::new(IpAddr::V4(dst), dst_port));
            }
            FAMILY_TCP6 if len >= 36 => {
                let mut src = [0u8; 16];
                let mut dst = [0u8; 16];
                src.copy_from_slice(&addr[0..16]);
                dst.copy_from_slice(&addr[16..32]);
                let src_port = u16::from_be_bytes([addr[32], addr[33]]);
                let dst_port = u16::from_be_bytes([addr[34], addr[35]]);
                addresses.source =
                    Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(src)), src_port));
                addresses.destination =
                    Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(dst)), dst_port));
            }
            _ => (),
        },
        // LOCAL command: health checks and the like; noted and ignored.
        0x00 => (),
        _ => (),
    }

    Ok((addresses, 16 + len))
}

/// Reads and parses the preamble from a stream. Used on endpoints where
/// proxying is configured, which makes the preamble mandatory.
pub async fn read_v2_header<T: AsyncRead + Unpin>(
    stream: &mut T,
) -> std::io::Result<ProxiedAddresses> {
    let mut header = [0u8; 16];
    stream.read_exact(&mut header).await?;
    if header[..12] != V2_SIGNATURE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "missing PROXY v2 signature",
        ));
    }
    let len = u16::from_be_bytes([header[14], header[15]]) as usize;
    let mut buf = Vec::with_capacity(16 + len);
    buf.extend_from_slice(&header);
    buf.resize(16 + len, 0);
    stream.read_exact(&mut buf[16..]).await?;
    parse_v2_header(&buf)
        .map(|(addresses, _)| addresses)
        .map_err(|err| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid PROXY v2 header: {:?}", err),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v2_tcp4(src: [u8; 4], src_port: u16, dst: [u8; 4], dst_port: u16) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&V2_SIGNATURE);
        buf.push(0x21); // version 2, PROXY
        buf.push(FAMILY_TCP4);
        buf.extend_from_slice(&12u16.to_be_bytes());
        buf.extend_from_slice(&src);
        buf.extend_from_slice(&dst);
        buf.extend_from_slice(&src_port.to_be_bytes());
        buf.extend_from_slice(&dst_port.to_be_bytes());
        buf
    }

    #[test]
    fn parse_tcp4_preamble() {
        let mut buf = v2_tcp4([10, 0, 0, 1], 1234, [192, 0, 2, 1], 143);
        let banner = b"* OK ready\r\n";
        buf.extend_from_slice(banner);

        let (addresses, consumed) = parse_v2_header(&buf).unwrap();
        assert_eq!(consumed, 28);
        assert_eq!(
            addresses.source.unwrap().to_string(),
            "10.0.0.1:1234".to_string()
        );
        assert_eq!(
            addresses.destination.unwrap().to_string(),
            "192.0.2.1:143".to_string()
        );
        assert_eq!(&buf[consumed..], banner);
    }

    #[test]
    fn parse_local_preamble() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&V2_SIGNATURE);
        buf.push(0x20); // version 2, LOCAL
        buf.push(0x00);
        buf.extend_from_slice(&0u16.to_be_bytes());

        let (addresses, consumed) = parse_v2_header(&buf).unwrap();
        assert_eq!(consumed, 16);
        assert_eq!(addresses, ProxiedAddresses::default());
    }

    #[test]
    fn parse_incomplete_and_invalid() {
        assert_eq!(
            parse_v2_header(&V2_SIGNATURE[..8]),
            Err(ProxyError::NeedsMoreData(8))
        );
        let buf = v2_tcp4([10, 0, 0, 1], 1, [10, 0, 0, 2], 2);
        assert_eq!(
            parse_v2_header(&buf[..20]),
            Err(ProxyError::NeedsMoreData(8))
        );
        assert_eq!(
            parse_v2_header(b"GET / HTTP/1.0\r\n\r\n"),
            Err(ProxyError::InvalidSignature)
        );
        let mut bad_version = buf;
        bad_version[12] = 0x31;
        assert_eq!(
            parse_v2_header(&bad_version),
            Err(ProxyError::InvalidVersion)
        );
    }
}
