/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

//! HAProxy PROXY protocol v1/v2: accept-side decoding of the original client
//! address, and emit-side encoding toward upstreams.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

// the v1 spec caps the whole line, CRLF included, at 107 bytes
const V1_MAX_LINE_LEN: usize = 107;

const V1_MAGIC: &[u8] = b"PROXY ";
const V2_MAGIC_HEADER: &[u8] = &[
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProxyProtocolVersion {
    V1,
    V2,
}

#[derive(Clone, Copy, Debug)]
pub struct ProxyAddr {
    pub src_addr: SocketAddr,
    pub dst_addr: SocketAddr,
}

#[derive(Debug, Error)]
pub enum ProxyProtocolReadError {
    #[error("read timed out")]
    ReadTimeout,
    #[error("closed unexpected")]
    ClosedUnexpected,
    #[error("invalid magic header")]
    InvalidMagicHeader,
    #[error("invalid data length: {0}")]
    InvalidDataLength(usize),
    #[error("invalid version: {0}")]
    InvalidVersion(u8),
    #[error("invalid command: {0}")]
    InvalidCommand(u8),
    #[error("invalid family: {0}")]
    InvalidFamily(u8),
    #[error("invalid src addr")]
    InvalidSrcAddr,
    #[error("invalid dst addr")]
    InvalidDstAddr,
    #[error("io failed: {0:?}")]
    IoFailed(#[from] io::Error),
}

pub struct ProxyProtocolV1Reader {
    timeout: Duration,
}

impl ProxyProtocolV1Reader {
    pub fn new(timeout: Duration) -> Self {
        ProxyProtocolV1Reader { timeout }
    }

    pub async fn read_proxy_protocol_v1_for_tcp(
        &self,
        stream: &mut TcpStream,
    ) -> Result<Option<ProxyAddr>, ProxyProtocolReadError> {
        match tokio::time::timeout(self.timeout, Self::recv_line(stream)).await {
            Ok(Ok((line, len))) => parse_v1_line(&line[0..len]),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ProxyProtocolReadError::ReadTimeout),
        }
    }

    /// Consume the header line one byte at a time. The line is tiny, read
    /// exactly once per connection, and must not swallow any byte past the
    /// terminating LF since whatever follows is the client's first request.
    async fn recv_line(
        stream: &mut TcpStream,
    ) -> Result<([u8; V1_MAX_LINE_LEN], usize), ProxyProtocolReadError> {
        let mut line = [0u8; V1_MAX_LINE_LEN];
        let mut len = 0usize;
        loop {
            let nr = stream.read(&mut line[len..len + 1]).await?;
            if nr == 0 {
                return Err(ProxyProtocolReadError::ClosedUnexpected);
            }
            len += 1;

            if line[len - 1] == b'\n' {
                return Ok((line, len));
            }
            if len >= V1_MAX_LINE_LEN {
                return Err(ProxyProtocolReadError::InvalidDataLength(len));
            }
            // bail out early on a non-matching signature instead of eating
            // the peer's request bytes until the cap
            let probe = len.min(V1_MAGIC.len());
            if line[0..probe] != V1_MAGIC[0..probe] {
                return Err(ProxyProtocolReadError::InvalidMagicHeader);
            }
        }
    }
}

fn parse_v1_line(line: &[u8]) -> Result<Option<ProxyAddr>, ProxyProtocolReadError> {
    let line =
        std::str::from_utf8(line).map_err(|_| ProxyProtocolReadError::InvalidMagicHeader)?;
    let line = line
        .strip_suffix('\n')
        .map(|l| l.strip_suffix('\r').unwrap_or(l))
        .unwrap_or(line);

    let mut fields = line.split(' ');
    if fields.next() != Some("PROXY") {
        return Err(ProxyProtocolReadError::InvalidMagicHeader);
    }

    match fields.next() {
        Some("UNKNOWN") => {
            // real addresses unknown, keep the socket ones
            Ok(None)
        }
        Some("TCP4") => {
            let (src_addr, dst_addr) = parse_v1_addresses::<Ipv4Addr>(&mut fields)?;
            Ok(Some(ProxyAddr { src_addr, dst_addr }))
        }
        Some("TCP6") => {
            let (src_addr, dst_addr) = parse_v1_addresses::<Ipv6Addr>(&mut fields)?;
            Ok(Some(ProxyAddr { src_addr, dst_addr }))
        }
        _ => Err(ProxyProtocolReadError::InvalidFamily(0x00)),
    }
}

fn parse_v1_addresses<'a, A>(
    fields: &mut impl Iterator<Item = &'a str>,
) -> Result<(SocketAddr, SocketAddr), ProxyProtocolReadError>
where
    A: FromStr,
    IpAddr: From<A>,
{
    let src_ip = fields
        .next()
        .and_then(|s| A::from_str(s).ok())
        .ok_or(ProxyProtocolReadError::InvalidSrcAddr)?;
    let dst_ip = fields
        .next()
        .and_then(|s| A::from_str(s).ok())
        .ok_or(ProxyProtocolReadError::InvalidDstAddr)?;
    let src_port = fields
        .next()
        .and_then(|s| u16::from_str(s).ok())
        .ok_or(ProxyProtocolReadError::InvalidSrcAddr)?;
    let dst_port = fields
        .next()
        .and_then(|s| u16::from_str(s).ok())
        .ok_or(ProxyProtocolReadError::InvalidDstAddr)?;

    Ok((
        SocketAddr::new(IpAddr::from(src_ip), src_port),
        SocketAddr::new(IpAddr::from(dst_ip), dst_port),
    ))
}

pub struct ProxyProtocolV2Reader {
    timeout: Duration,
}

impl ProxyProtocolV2Reader {
    pub fn new(timeout: Duration) -> Self {
        ProxyProtocolV2Reader { timeout }
    }

    pub async fn read_proxy_protocol_v2_for_tcp(
        &mut self,
        stream: &mut TcpStream,
    ) -> Result<Option<ProxyAddr>, ProxyProtocolReadError> {
        match tokio::time::timeout(self.timeout, Self::read_data(stream)).await {
            Ok(r) => r,
            Err(_) => Err(ProxyProtocolReadError::ReadTimeout),
        }
    }

    async fn read_data(
        stream: &mut TcpStream,
    ) -> Result<Option<ProxyAddr>, ProxyProtocolReadError> {
        let mut hdr = [0u8; 16];
        stream.read_exact(&mut hdr).await.map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                ProxyProtocolReadError::ClosedUnexpected
            } else {
                ProxyProtocolReadError::IoFailed(e)
            }
        })?;
        if &hdr[0..12] != V2_MAGIC_HEADER {
            return Err(ProxyProtocolReadError::InvalidMagicHeader);
        }
        let ver = hdr[12] >> 4;
        if ver != 2 {
            return Err(ProxyProtocolReadError::InvalidVersion(ver));
        }
        let cmd = hdr[12] & 0x0F;
        let family = hdr[13];
        let len = u16::from_be_bytes([hdr[14], hdr[15]]) as usize;

        let mut data = vec![0u8; len];
        stream.read_exact(&mut data).await.map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                ProxyProtocolReadError::ClosedUnexpected
            } else {
                ProxyProtocolReadError::IoFailed(e)
            }
        })?;

        match cmd {
            0x00 => return Ok(None), // LOCAL, use the real socket address
            0x01 => {}               // PROXY
            c => return Err(ProxyProtocolReadError::InvalidCommand(c)),
        }

        match family {
            0x11 => {
                // TCP over IPv4
                if len < 12 {
                    return Err(ProxyProtocolReadError::InvalidDataLength(len));
                }
                let src_ip = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
                let dst_ip = Ipv4Addr::new(data[4], data[5], data[6], data[7]);
                let src_port = u16::from_be_bytes([data[8], data[9]]);
                let dst_port = u16::from_be_bytes([data[10], data[11]]);
                Ok(Some(ProxyAddr {
                    src_addr: SocketAddr::new(IpAddr::V4(src_ip), src_port),
                    dst_addr: SocketAddr::new(IpAddr::V4(dst_ip), dst_port),
                }))
            }
            0x21 => {
                // TCP over IPv6
                if len < 36 {
                    return Err(ProxyProtocolReadError::InvalidDataLength(len));
                }
                let mut src_octets = [0u8; 16];
                src_octets.copy_from_slice(&data[0..16]);
                let mut dst_octets = [0u8; 16];
                dst_octets.copy_from_slice(&data[16..32]);
                let src_port = u16::from_be_bytes([data[32], data[33]]);
                let dst_port = u16::from_be_bytes([data[34], data[35]]);
                Ok(Some(ProxyAddr {
                    src_addr: SocketAddr::new(IpAddr::V6(Ipv6Addr::from(src_octets)), src_port),
                    dst_addr: SocketAddr::new(IpAddr::V6(Ipv6Addr::from(dst_octets)), dst_port),
                }))
            }
            0x00 => Ok(None), // UNSPEC
            f => Err(ProxyProtocolReadError::InvalidFamily(f)),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProxyProtocolEncodeError {
    #[error("mismatched address family")]
    AddressFamilyNotMatch,
}

pub struct ProxyProtocolEncoder {
    version: ProxyProtocolVersion,
    buf: Vec<u8>,
}

impl ProxyProtocolEncoder {
    pub fn new(version: ProxyProtocolVersion) -> Self {
        ProxyProtocolEncoder {
            version,
            buf: Vec::with_capacity(V1_MAX_LINE_LEN),
        }
    }

    pub fn encode_tcp(
        &mut self,
        client: SocketAddr,
        server: SocketAddr,
    ) -> Result<&[u8], ProxyProtocolEncodeError> {
        self.buf.clear();
        match self.version {
            ProxyProtocolVersion::V1 => self.encode_tcp_v1(client, server),
            ProxyProtocolVersion::V2 => self.encode_tcp_v2(client, server),
        }
    }

    fn encode_tcp_v1(
        &mut self,
        client: SocketAddr,
        server: SocketAddr,
    ) -> Result<&[u8], ProxyProtocolEncodeError> {
        use std::io::Write;

        match (client, server) {
            (SocketAddr::V4(c), SocketAddr::V4(s)) => {
                let _ = write!(
                    self.buf,
                    "PROXY TCP4 {} {} {} {}\r\n",
                    c.ip(),
                    s.ip(),
                    c.port(),
                    s.port()
                );
            }
            (SocketAddr::V6(c), SocketAddr::V6(s)) => {
                let _ = write!(
                    self.buf,
                    "PROXY TCP6 {} {} {} {}\r\n",
                    c.ip(),
                    s.ip(),
                    c.port(),
                    s.port()
                );
            }
            _ => return Err(ProxyProtocolEncodeError::AddressFamilyNotMatch),
        }
        Ok(self.buf.as_slice())
    }

    fn encode_tcp_v2(
        &mut self,
        client: SocketAddr,
        server: SocketAddr,
    ) -> Result<&[u8], ProxyProtocolEncodeError> {
        self.buf.extend_from_slice(V2_MAGIC_HEADER);
        self.buf.push(0x21); // version 2, command PROXY
        match (client, server) {
            (SocketAddr::V4(c), SocketAddr::V4(s)) => {
                self.buf.push(0x11); // TCP over IPv4
                self.buf.extend_from_slice(&12u16.to_be_bytes());
                self.buf.extend_from_slice(&c.ip().octets());
                self.buf.extend_from_slice(&s.ip().octets());
                self.buf.extend_from_slice(&c.port().to_be_bytes());
                self.buf.extend_from_slice(&s.port().to_be_bytes());
            }
            (SocketAddr::V6(c), SocketAddr::V6(s)) => {
                self.buf.push(0x21); // TCP over IPv6
                self.buf.extend_from_slice(&36u16.to_be_bytes());
                self.buf.extend_from_slice(&c.ip().octets());
                self.buf.extend_from_slice(&s.ip().octets());
                self.buf.extend_from_slice(&c.port().to_be_bytes());
                self.buf.extend_from_slice(&s.port().to_be_bytes());
            }
            _ => return Err(ProxyProtocolEncodeError::AddressFamilyNotMatch),
        }
        Ok(self.buf.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v1_emit_and_accept_agree_on_tcp4() {
        // the address pair the accept side substitutes for the socket peer
        let client = SocketAddr::from_str("203.0.113.9:41801").unwrap();
        let server = SocketAddr::from_str("198.51.100.4:8080").unwrap();

        let mut encoder = ProxyProtocolEncoder::new(ProxyProtocolVersion::V1);
        let encoded = encoder.encode_tcp(client, server).unwrap();
        assert_eq!(encoded, b"PROXY TCP4 203.0.113.9 198.51.100.4 41801 8080\r\n");

        let addr = parse_v1_line(encoded).unwrap().unwrap();
        assert_eq!(addr.src_addr, client);
        assert_eq!(addr.dst_addr, server);
    }

    #[test]
    fn v1_emit_and_accept_agree_on_tcp6() {
        let client = SocketAddr::from_str("[2001:db8:beef::2]:41801").unwrap();
        let server = SocketAddr::from_str("[2001:db8:beef::3]:8080").unwrap();

        let mut encoder = ProxyProtocolEncoder::new(ProxyProtocolVersion::V1);
        let encoded = encoder.encode_tcp(client, server).unwrap();

        let addr = parse_v1_line(encoded).unwrap().unwrap();
        assert_eq!(addr.src_addr, client);
        assert_eq!(addr.dst_addr, server);
    }

    #[test]
    fn v1_unknown_keeps_socket_addresses() {
        assert!(parse_v1_line(b"PROXY UNKNOWN\r\n").unwrap().is_none());
        // an UNKNOWN line may still carry the unparsed address fields
        assert!(parse_v1_line(b"PROXY UNKNOWN ffff::1 ffff::2 1 2\r\n")
            .unwrap()
            .is_none());
    }

    #[test]
    fn v1_rejects_malformed_lines() {
        assert!(matches!(
            parse_v1_line(b"NOPROXY TCP4 1.2.3.4 5.6.7.8 1 2\r\n"),
            Err(ProxyProtocolReadError::InvalidMagicHeader)
        ));
        assert!(matches!(
            parse_v1_line(b"PROXY TCP9 1.2.3.4 5.6.7.8 1 2\r\n"),
            Err(ProxyProtocolReadError::InvalidFamily(_))
        ));
        // TCP4 with v6 literals must not pass
        assert!(parse_v1_line(b"PROXY TCP4 ffff::1 ffff::2 1 2\r\n").is_err());
        // missing the destination port
        assert!(matches!(
            parse_v1_line(b"PROXY TCP4 1.2.3.4 5.6.7.8 1\r\n"),
            Err(ProxyProtocolReadError::InvalidDstAddr)
        ));
    }

    #[test]
    fn v2_encode_tcp4() {
        let client = SocketAddr::from_str("10.0.0.1:4000").unwrap();
        let server = SocketAddr::from_str("10.0.0.2:5000").unwrap();

        let mut encoder = ProxyProtocolEncoder::new(ProxyProtocolVersion::V2);
        let encoded = encoder.encode_tcp(client, server).unwrap();
        assert_eq!(&encoded[0..12], V2_MAGIC_HEADER);
        assert_eq!(encoded[12], 0x21);
        assert_eq!(encoded[13], 0x11);
        assert_eq!(encoded.len(), 16 + 12);
    }

    #[test]
    fn mismatched_family() {
        let client = SocketAddr::from_str("10.0.0.1:4000").unwrap();
        let server = SocketAddr::from_str("[2001:db8::11]:443").unwrap();

        let mut encoder = ProxyProtocolEncoder::new(ProxyProtocolVersion::V1);
        assert!(encoder.encode_tcp(client, server).is_err());
    }
}
