//! PROXY protocol header decoding and encoding.
//!
//! Both wire variants are understood:
//!
//! Text (v1), TCP only:
//! - `PROXY TCP4 <src ip> <dst ip> <src port> <dst port>\r\n`
//! - `PROXY TCP6 ...` with IPv6 addresses
//! - `PROXY UNKNOWN[ anything]\r\n` carries no address
//! - at most 107 bytes including the CRLF
//!
//! Binary (v2):
//! - 12 bytes signature
//! - 1 byte version and command
//! - 1 byte address family and transport protocol
//! - 2 bytes address length (big endian)
//! - variable: addresses and ports, then optional TLVs
//!
//! Decoding is single-shot: the whole header must be present in the buffer.
//! A header that does not fit is an error, never a request for more data.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use thiserror::Error;

/// PROXY protocol v2 signature (12 bytes).
pub const PROXY_V2_SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

/// PROXY protocol v1 signature, including the separating space.
pub const PROXY_V1_SIGNATURE: &[u8; 6] = b"PROXY ";

/// Longest legal v1 line, CRLF included.
pub const PROXY_V1_MAX_LEN: usize = 107;

/// Fixed part of a v2 header: signature, version/command, family, length.
pub const PROXY_V2_FIXED_LEN: usize = 16;

/// Largest legal header: a v2 header declaring a full `u16` variable part.
pub const MAX_HEADER_LEN: usize = PROXY_V2_FIXED_LEN + u16::MAX as usize;

/// Version 2 with LOCAL command (health checks, no address).
const VERSION_COMMAND_LOCAL: u8 = 0x20;

/// Version 2 with PROXY command (high nibble = version, low nibble = command).
const VERSION_COMMAND_PROXY: u8 = 0x21;

const AF_UNSPEC: u8 = 0x0;
const AF_INET: u8 = 0x1;
const AF_INET6: u8 = 0x2;
const AF_UNIX: u8 = 0x3;

const TRANSPORT_UNSPEC: u8 = 0x0;
const TRANSPORT_STREAM: u8 = 0x1;
const TRANSPORT_DGRAM: u8 = 0x2;

/// Length of IPv4 address block (4 + 4 + 2 + 2 = 12 bytes).
const IPV4_ADDR_LEN: u16 = 12;

/// Length of IPv6 address block (16 + 16 + 2 + 2 = 36 bytes).
const IPV6_ADDR_LEN: u16 = 36;

/// Transport the header is expected to describe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// TCP connection.
    Stream,
    /// UDP datagram.
    Datagram,
}

impl Transport {
    fn nibble(self) -> u8 {
        match self {
            Transport::Stream => TRANSPORT_STREAM,
            Transport::Datagram => TRANSPORT_DGRAM,
        }
    }
}

/// Wire variant a header was decoded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    V1,
    V2,
}

/// Address family announced by the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Unspec,
    Inet,
    Inet6,
    Unix,
}

/// Decoding failures. Callers drop the connection on any of them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeaderError {
    #[error("no PROXY protocol signature")]
    InvalidSignature,

    #[error("header incomplete in buffer of {available} bytes")]
    Truncated { available: usize },

    #[error("v1 header line exceeds 107 bytes")]
    LineTooLong,

    #[error("malformed v1 header: {0}")]
    Malformed(&'static str),

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("unsupported command {0:#x}")]
    UnsupportedCommand(u8),

    #[error("unsupported address family {0:#x}")]
    UnsupportedFamily(u8),

    #[error("unsupported transport protocol {0:#x}")]
    UnsupportedTransport(u8),

    #[error("header transport does not match a {0:?} listener")]
    TransportMismatch(Transport),

    #[error("address block of {len} bytes too short for {family:?}")]
    AddressBlockTooShort { family: AddressFamily, len: usize },
}

/// A decoded header borrowing the bytes that followed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyHeader<'a> {
    /// Original client address; `None` for LOCAL and UNKNOWN headers.
    pub source: Option<SocketAddr>,
    /// Original destination address, present whenever `source` is.
    pub destination: Option<SocketAddr>,
    pub family: AddressFamily,
    pub version: ProtocolVersion,
    /// Bytes consumed by the header, TLVs included.
    pub header_len: usize,
    /// Application bytes read together with the header.
    pub trailing: &'a [u8],
}

impl<'a> ProxyHeader<'a> {
    fn unaddressed(
        family: AddressFamily,
        version: ProtocolVersion,
        header_len: usize,
        buf: &'a [u8],
    ) -> Self {
        Self {
            source: None,
            destination: None,
            family,
            version,
            header_len,
            trailing: &buf[header_len..],
        }
    }
}

/// Decode the header at the start of `buf`.
pub fn decode(buf: &[u8], transport: Transport) -> Result<ProxyHeader<'_>, HeaderError> {
    if is_prefix_of(buf, &PROXY_V2_SIGNATURE) {
        return decode_v2(buf, transport);
    }

    if is_prefix_of(buf, PROXY_V1_SIGNATURE) {
        if transport == Transport::Datagram {
            return Err(HeaderError::TransportMismatch(transport));
        }
        return decode_v1(buf);
    }

    Err(HeaderError::InvalidSignature)
}

/// True when the shorter of `buf` and `signature` is a prefix of the other.
fn is_prefix_of(buf: &[u8], signature: &[u8]) -> bool {
    let n = buf.len().min(signature.len());
    n > 0 && buf[..n] == signature[..n]
}

fn decode_v1(buf: &[u8]) -> Result<ProxyHeader<'_>, HeaderError> {
    let window = &buf[..buf.len().min(PROXY_V1_MAX_LEN)];
    let Some(cr) = window.windows(2).position(|w| w == b"\r\n") else {
        if buf.len() >= PROXY_V1_MAX_LEN {
            return Err(HeaderError::LineTooLong);
        }
        return Err(HeaderError::Truncated {
            available: buf.len(),
        });
    };
    let header_len = cr + 2;

    let line = std::str::from_utf8(&buf[..cr]).map_err(|_| HeaderError::Malformed("not ASCII"))?;
    let fields: Vec<&str> = line.split(' ').collect();

    match fields.get(1).copied() {
        Some("UNKNOWN") => {
            return Ok(ProxyHeader::unaddressed(
                AddressFamily::Unspec,
                ProtocolVersion::V1,
                header_len,
                buf,
            ));
        }
        Some("TCP4") | Some("TCP6") => {}
        Some(_) => return Err(HeaderError::Malformed("unknown protocol family")),
        None => return Err(HeaderError::Malformed("missing protocol family")),
    }

    if fields.len() != 6 {
        return Err(HeaderError::Malformed("wrong field count"));
    }

    let (family, src_ip, dst_ip) = if fields[1] == "TCP4" {
        let src = fields[2]
            .parse::<Ipv4Addr>()
            .map_err(|_| HeaderError::Malformed("bad IPv4 source address"))?;
        let dst = fields[3]
            .parse::<Ipv4Addr>()
            .map_err(|_| HeaderError::Malformed("bad IPv4 destination address"))?;
        (AddressFamily::Inet, IpAddr::V4(src), IpAddr::V4(dst))
    } else {
        let src = fields[2]
            .parse::<Ipv6Addr>()
            .map_err(|_| HeaderError::Malformed("bad IPv6 source address"))?;
        let dst = fields[3]
            .parse::<Ipv6Addr>()
            .map_err(|_| HeaderError::Malformed("bad IPv6 destination address"))?;
        (AddressFamily::Inet6, IpAddr::V6(src), IpAddr::V6(dst))
    };

    let src_port = parse_port(fields[4])?;
    let dst_port = parse_port(fields[5])?;

    Ok(ProxyHeader {
        source: Some(SocketAddr::new(src_ip, src_port)),
        destination: Some(SocketAddr::new(dst_ip, dst_port)),
        family,
        version: ProtocolVersion::V1,
        header_len,
        trailing: &buf[header_len..],
    })
}

fn parse_port(field: &str) -> Result<u16, HeaderError> {
    if field.is_empty() || field.len() > 5 || !field.bytes().all(|b| b.is_ascii_digit()) {
        return Err(HeaderError::Malformed("bad port"));
    }
    field
        .parse::<u16>()
        .map_err(|_| HeaderError::Malformed("port out of range"))
}

fn decode_v2(buf: &[u8], transport: Transport) -> Result<ProxyHeader<'_>, HeaderError> {
    if buf.len() < PROXY_V2_FIXED_LEN {
        return Err(HeaderError::Truncated {
            available: buf.len(),
        });
    }

    let version_command = buf[12];
    let version = version_command >> 4;
    if version != 2 {
        return Err(HeaderError::UnsupportedVersion(version));
    }

    let addr_len = u16::from_be_bytes([buf[14], buf[15]]) as usize;
    let header_len = PROXY_V2_FIXED_LEN + addr_len;
    if buf.len() < header_len {
        return Err(HeaderError::Truncated {
            available: buf.len(),
        });
    }

    let family_nibble = buf[13] >> 4;
    let transport_nibble = buf[13] & 0x0F;
    let family = match family_nibble {
        AF_UNSPEC => AddressFamily::Unspec,
        AF_INET => AddressFamily::Inet,
        AF_INET6 => AddressFamily::Inet6,
        AF_UNIX => AddressFamily::Unix,
        other => return Err(HeaderError::UnsupportedFamily(other)),
    };

    match version_command {
        VERSION_COMMAND_LOCAL => {
            // Address fields, if any, are ignored.
            return Ok(ProxyHeader::unaddressed(
                family,
                ProtocolVersion::V2,
                header_len,
                buf,
            ));
        }
        VERSION_COMMAND_PROXY => {}
        other => return Err(HeaderError::UnsupportedCommand(other & 0x0F)),
    }

    if !matches!(
        transport_nibble,
        TRANSPORT_UNSPEC | TRANSPORT_STREAM | TRANSPORT_DGRAM
    ) {
        return Err(HeaderError::UnsupportedTransport(transport_nibble));
    }

    // Families we cannot spoof relay with the real peer address.
    if matches!(family, AddressFamily::Unspec | AddressFamily::Unix) {
        return Ok(ProxyHeader::unaddressed(
            family,
            ProtocolVersion::V2,
            header_len,
            buf,
        ));
    }

    if transport_nibble != transport.nibble() {
        return Err(HeaderError::TransportMismatch(transport));
    }

    let block = &buf[PROXY_V2_FIXED_LEN..header_len];
    let (source, destination) = match family {
        AddressFamily::Inet => {
            if block.len() < IPV4_ADDR_LEN as usize {
                return Err(HeaderError::AddressBlockTooShort {
                    family,
                    len: block.len(),
                });
            }
            let src_ip = Ipv4Addr::new(block[0], block[1], block[2], block[3]);
            let dst_ip = Ipv4Addr::new(block[4], block[5], block[6], block[7]);
            let src_port = u16::from_be_bytes([block[8], block[9]]);
            let dst_port = u16::from_be_bytes([block[10], block[11]]);
            (
                SocketAddr::new(IpAddr::V4(src_ip), src_port),
                SocketAddr::new(IpAddr::V4(dst_ip), dst_port),
            )
        }
        _ => {
            if block.len() < IPV6_ADDR_LEN as usize {
                return Err(HeaderError::AddressBlockTooShort {
                    family,
                    len: block.len(),
                });
            }
            let mut src_octets = [0u8; 16];
            let mut dst_octets = [0u8; 16];
            src_octets.copy_from_slice(&block[0..16]);
            dst_octets.copy_from_slice(&block[16..32]);
            let src_port = u16::from_be_bytes([block[32], block[33]]);
            let dst_port = u16::from_be_bytes([block[34], block[35]]);
            (
                SocketAddr::new(IpAddr::V6(Ipv6Addr::from(src_octets)), src_port),
                SocketAddr::new(IpAddr::V6(Ipv6Addr::from(dst_octets)), dst_port),
            )
        }
    };

    Ok(ProxyHeader {
        source: Some(source),
        destination: Some(destination),
        family,
        version: ProtocolVersion::V2,
        header_len,
        trailing: &buf[header_len..],
    })
}

/// PROXY protocol v2 header generator.
#[derive(Debug, Clone)]
pub struct ProxyProtocolV2 {
    /// Source (client) address.
    pub src_addr: SocketAddr,
    /// Destination address as observed by the sender.
    pub dst_addr: SocketAddr,
    /// Transport announced in the header.
    pub transport: Transport,
}

impl ProxyProtocolV2 {
    /// Create a stream header for the given connection.
    pub fn new(src_addr: SocketAddr, dst_addr: SocketAddr) -> Self {
        Self {
            src_addr,
            dst_addr,
            transport: Transport::Stream,
        }
    }

    /// Announce a different transport.
    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    /// A LOCAL header with an empty address block.
    pub fn encode_local() -> Vec<u8> {
        let mut buf = Vec::with_capacity(PROXY_V2_FIXED_LEN);
        buf.extend_from_slice(&PROXY_V2_SIGNATURE);
        buf.push(VERSION_COMMAND_LOCAL);
        buf.push((AF_UNSPEC << 4) | TRANSPORT_UNSPEC);
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf
    }

    /// Generate the PROXY v2 header bytes.
    ///
    /// Mixed families are encoded as IPv4 when the IPv6 side is v4-mapped,
    /// otherwise both sides are encoded as IPv6.
    pub fn encode(&self) -> Vec<u8> {
        match (self.src_addr.ip(), self.dst_addr.ip()) {
            (IpAddr::V4(src_ip), IpAddr::V4(dst_ip)) => self.encode_v4(src_ip, dst_ip),
            (IpAddr::V6(src_ip), IpAddr::V6(dst_ip)) => self.encode_v6(src_ip, dst_ip),
            (IpAddr::V4(src_ip), IpAddr::V6(dst_ip)) => match dst_ip.to_ipv4_mapped() {
                Some(dst_v4) => self.encode_v4(src_ip, dst_v4),
                None => self.encode_v6(src_ip.to_ipv6_mapped(), dst_ip),
            },
            (IpAddr::V6(src_ip), IpAddr::V4(dst_ip)) => match src_ip.to_ipv4_mapped() {
                Some(src_v4) => self.encode_v4(src_v4, dst_ip),
                None => self.encode_v6(src_ip, dst_ip.to_ipv6_mapped()),
            },
        }
    }

    fn encode_v4(&self, src_ip: Ipv4Addr, dst_ip: Ipv4Addr) -> Vec<u8> {
        let mut buf = Vec::with_capacity(PROXY_V2_FIXED_LEN + IPV4_ADDR_LEN as usize);
        buf.extend_from_slice(&PROXY_V2_SIGNATURE);
        buf.push(VERSION_COMMAND_PROXY);
        buf.push((AF_INET << 4) | self.transport.nibble());
        buf.extend_from_slice(&IPV4_ADDR_LEN.to_be_bytes());
        buf.extend_from_slice(&src_ip.octets());
        buf.extend_from_slice(&dst_ip.octets());
        buf.extend_from_slice(&self.src_addr.port().to_be_bytes());
        buf.extend_from_slice(&self.dst_addr.port().to_be_bytes());
        buf
    }

    fn encode_v6(&self, src_ip: Ipv6Addr, dst_ip: Ipv6Addr) -> Vec<u8> {
        let mut buf = Vec::with_capacity(PROXY_V2_FIXED_LEN + IPV6_ADDR_LEN as usize);
        buf.extend_from_slice(&PROXY_V2_SIGNATURE);
        buf.push(VERSION_COMMAND_PROXY);
        buf.push((AF_INET6 << 4) | self.transport.nibble());
        buf.extend_from_slice(&IPV6_ADDR_LEN.to_be_bytes());
        buf.extend_from_slice(&src_ip.octets());
        buf.extend_from_slice(&dst_ip.octets());
        buf.extend_from_slice(&self.src_addr.port().to_be_bytes());
        buf.extend_from_slice(&self.dst_addr.port().to_be_bytes());
        buf
    }
}

/// Text header for a TCP connection; `None` yields `PROXY UNKNOWN`.
pub fn encode_v1(addrs: Option<(SocketAddr, SocketAddr)>) -> Vec<u8> {
    match addrs {
        Some((src, dst)) => {
            let family = if src.is_ipv4() { "TCP4" } else { "TCP6" };
            format!(
                "PROXY {} {} {} {} {}\r\n",
                family,
                src.ip(),
                dst.ip(),
                src.port(),
                dst.port()
            )
            .into_bytes()
        }
        None => b"PROXY UNKNOWN\r\n".to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use rstest::rstest;

    use super::*;
    use crate::proxy::buffer::BufferPool;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_v1_tcp4_with_payload() {
        let data = b"PROXY TCP4 192.168.1.1 10.0.0.1 56324 443\r\nGET / HTTP/1.1\r\n";
        let header = decode(data, Transport::Stream).unwrap();

        assert_eq!(header.version, ProtocolVersion::V1);
        assert_eq!(header.family, AddressFamily::Inet);
        assert_eq!(header.source, Some(addr("192.168.1.1:56324")));
        assert_eq!(header.destination, Some(addr("10.0.0.1:443")));
        assert_eq!(header.trailing, b"GET / HTTP/1.1\r\n");
    }

    #[test]
    fn test_v1_tcp6() {
        let data = b"PROXY TCP6 2001:db8::1 2001:db8::2 4444 80\r\n";
        let header = decode(data, Transport::Stream).unwrap();

        assert_eq!(header.family, AddressFamily::Inet6);
        assert_eq!(header.source, Some(addr("[2001:db8::1]:4444")));
        assert_eq!(header.destination, Some(addr("[2001:db8::2]:80")));
        assert!(header.trailing.is_empty());
    }

    #[rstest]
    #[case(&b"PROXY UNKNOWN\r\npayload"[..])]
    #[case(&b"PROXY UNKNOWN ffff::1 ffff::2 1 2\r\npayload"[..])]
    fn test_v1_unknown_has_no_address(#[case] data: &[u8]) {
        let header = decode(data, Transport::Stream).unwrap();
        assert_eq!(header.source, None);
        assert_eq!(header.destination, None);
        assert_eq!(header.trailing, b"payload");
    }

    #[rstest]
    #[case(&b"PROXY TCP4 1.2.3.4 5.6.7.8 1 \r\n"[..])]
    #[case(&b"PROXY TCP4 1.2.3.4 5.6.7.8 1\r\n"[..])]
    #[case(&b"PROXY TCP4 1.2.3.4 5.6.7.8 1 2 3\r\n"[..])]
    #[case(&b"PROXY TCP4 ::1 5.6.7.8 1 2\r\n"[..])]
    #[case(&b"PROXY TCP6 1.2.3.4 ::1 1 2\r\n"[..])]
    #[case(&b"PROXY TCP4 1.2.3.4 5.6.7.8 65536 2\r\n"[..])]
    #[case(&b"PROXY TCP4 1.2.3.4 5.6.7.8 +1 2\r\n"[..])]
    #[case(&b"PROXY TCP4  1.2.3.4 5.6.7.8 1 2\r\n"[..])]
    #[case(&b"PROXY UDP4 1.2.3.4 5.6.7.8 1 2\r\n"[..])]
    #[case(&b"PROXY \r\n"[..])]
    fn test_v1_malformed(#[case] data: &[u8]) {
        let err = decode(data, Transport::Stream).unwrap_err();
        assert!(matches!(err, HeaderError::Malformed(_)), "{err:?}");
    }

    #[test]
    fn test_v1_line_too_long() {
        let mut data = b"PROXY TCP4 ".to_vec();
        data.resize(200, b'1');
        assert_eq!(
            decode(&data, Transport::Stream).unwrap_err(),
            HeaderError::LineTooLong
        );
    }

    #[test]
    fn test_v1_crlf_past_limit_is_rejected() {
        let mut data = b"PROXY UNKNOWN ".to_vec();
        data.resize(PROXY_V1_MAX_LEN, b'x');
        data.extend_from_slice(b"\r\n");
        assert_eq!(
            decode(&data, Transport::Stream).unwrap_err(),
            HeaderError::LineTooLong
        );
    }

    #[test]
    fn test_v1_unterminated() {
        let err = decode(b"PROXY TCP4 1.2.3.4", Transport::Stream).unwrap_err();
        assert_eq!(err, HeaderError::Truncated { available: 18 });
    }

    #[test]
    fn test_v1_rejected_for_datagrams() {
        let err = decode(b"PROXY UNKNOWN\r\n", Transport::Datagram).unwrap_err();
        assert_eq!(err, HeaderError::TransportMismatch(Transport::Datagram));
    }

    #[test]
    fn test_no_signature() {
        assert_eq!(
            decode(b"GET / HTTP/1.1\r\n", Transport::Stream).unwrap_err(),
            HeaderError::InvalidSignature
        );
        assert_eq!(
            decode(b"", Transport::Stream).unwrap_err(),
            HeaderError::InvalidSignature
        );
    }

    #[test]
    fn test_encode_ipv4() {
        let header = ProxyProtocolV2::new(addr("192.168.1.1:12345"), addr("10.0.0.1:443"));
        let encoded = header.encode();

        // 12 signature + 4 header + 12 addresses
        assert_eq!(encoded.len(), 28);
        assert_eq!(&encoded[..12], &PROXY_V2_SIGNATURE);
        assert_eq!(encoded[12], VERSION_COMMAND_PROXY);
        assert_eq!(encoded[13], 0x11);
        assert_eq!(u16::from_be_bytes([encoded[14], encoded[15]]), 12);
    }

    #[test]
    fn test_encode_ipv6_datagram() {
        let header = ProxyProtocolV2::new(addr("[2001:db8::1]:12345"), addr("[2001:db8::2]:53"))
            .with_transport(Transport::Datagram);
        let encoded = header.encode();

        assert_eq!(encoded.len(), 52);
        assert_eq!(encoded[13], 0x22);
        assert_eq!(u16::from_be_bytes([encoded[14], encoded[15]]), 36);
    }

    #[test]
    fn test_largest_v2_header_fits_default_buffer() {
        let mut data =
            ProxyProtocolV2::new(addr("10.0.0.5:4444"), addr("192.0.2.10:443")).encode();
        data[14..16].copy_from_slice(&u16::MAX.to_be_bytes());
        // Pad the variable part out to the declared length.
        data.resize(PROXY_V2_FIXED_LEN + u16::MAX as usize, 0x04);
        assert_eq!(data.len(), MAX_HEADER_LEN);
        data.extend_from_slice(b"GET /");

        let pool = std::sync::Arc::new(BufferPool::default());
        let mut buffer = pool.acquire();
        assert!(pool.buffer_size() >= data.len());
        buffer[..data.len()].copy_from_slice(&data);

        let header = decode(&buffer[..data.len()], Transport::Stream).unwrap();
        assert_eq!(header.header_len, MAX_HEADER_LEN);
        assert_eq!(header.source, Some(addr("10.0.0.5:4444")));
        assert_eq!(header.trailing, b"GET /");
    }

    #[test]
    fn test_v2_proxy_with_payload() {
        let mut data =
            ProxyProtocolV2::new(addr("10.0.0.5:4444"), addr("192.0.2.10:443")).encode();
        data.extend_from_slice(b"GET /");

        let header = decode(&data, Transport::Stream).unwrap();
        assert_eq!(header.version, ProtocolVersion::V2);
        assert_eq!(header.source, Some(addr("10.0.0.5:4444")));
        assert_eq!(header.destination, Some(addr("192.0.2.10:443")));
        assert_eq!(header.header_len, 28);
        assert_eq!(header.trailing, b"GET /");
    }

    #[test]
    fn test_v2_local_skips_tlv_padding() {
        let mut data = PROXY_V2_SIGNATURE.to_vec();
        data.push(VERSION_COMMAND_LOCAL);
        data.push(0x11);
        data.extend_from_slice(&20u16.to_be_bytes());
        data.extend_from_slice(&[0xEE; 20]);
        data.extend_from_slice(b"hello");

        let header = decode(&data, Transport::Stream).unwrap();
        assert_eq!(header.source, None);
        assert_eq!(header.destination, None);
        assert_eq!(header.header_len, 36);
        assert_eq!(header.trailing, b"hello");
    }

    #[test]
    fn test_v2_local_encoded() {
        let data = ProxyProtocolV2::encode_local();
        let header = decode(&data, Transport::Datagram).unwrap();
        assert_eq!(header.source, None);
        assert_eq!(header.family, AddressFamily::Unspec);
        assert!(header.trailing.is_empty());
    }

    #[test]
    fn test_v2_tlvs_counted_in_length() {
        let mut data =
            ProxyProtocolV2::new(addr("10.1.1.1:1000"), addr("10.2.2.2:2000")).encode();
        // Grow the declared length by one 7-byte TLV (type 0x04 NOOP).
        data[15] += 7;
        data.extend_from_slice(&[0x04, 0x00, 0x04, 0, 0, 0, 0]);
        data.extend_from_slice(b"rest");

        let header = decode(&data, Transport::Stream).unwrap();
        assert_eq!(header.source, Some(addr("10.1.1.1:1000")));
        assert_eq!(header.header_len, 35);
        assert_eq!(header.trailing, b"rest");
    }

    #[test]
    fn test_v2_declared_length_exceeds_buffer() {
        let mut data = ProxyProtocolV2::new(addr("10.1.1.1:1"), addr("10.2.2.2:2")).encode();
        data[15] = 200;

        let err = decode(&data, Transport::Stream).unwrap_err();
        assert_eq!(err, HeaderError::Truncated { available: 28 });
    }

    #[test]
    fn test_v2_short_fixed_part() {
        let err = decode(&PROXY_V2_SIGNATURE[..8], Transport::Stream).unwrap_err();
        assert_eq!(err, HeaderError::Truncated { available: 8 });
    }

    #[test]
    fn test_v2_bad_version() {
        let mut data = ProxyProtocolV2::new(addr("10.1.1.1:1"), addr("10.2.2.2:2")).encode();
        data[12] = 0x11;
        assert_eq!(
            decode(&data, Transport::Stream).unwrap_err(),
            HeaderError::UnsupportedVersion(1)
        );
    }

    #[test]
    fn test_v2_bad_command() {
        let mut data = ProxyProtocolV2::new(addr("10.1.1.1:1"), addr("10.2.2.2:2")).encode();
        data[12] = 0x2F;
        assert_eq!(
            decode(&data, Transport::Stream).unwrap_err(),
            HeaderError::UnsupportedCommand(0xF)
        );
    }

    #[test]
    fn test_v2_transport_mismatch() {
        let data = ProxyProtocolV2::new(addr("10.1.1.1:1"), addr("10.2.2.2:2")).encode();
        assert_eq!(
            decode(&data, Transport::Datagram).unwrap_err(),
            HeaderError::TransportMismatch(Transport::Datagram)
        );
    }

    #[test]
    fn test_v2_short_address_block() {
        let mut data = PROXY_V2_SIGNATURE.to_vec();
        data.push(VERSION_COMMAND_PROXY);
        data.push(0x21);
        data.extend_from_slice(&12u16.to_be_bytes());
        data.extend_from_slice(&[0u8; 12]);

        assert_eq!(
            decode(&data, Transport::Stream).unwrap_err(),
            HeaderError::AddressBlockTooShort {
                family: AddressFamily::Inet6,
                len: 12
            }
        );
    }

    #[test]
    fn test_v2_unix_family_relays_unspoofed() {
        let mut data = PROXY_V2_SIGNATURE.to_vec();
        data.push(VERSION_COMMAND_PROXY);
        data.push(0x31);
        data.extend_from_slice(&216u16.to_be_bytes());
        data.extend_from_slice(&[0u8; 216]);

        let header = decode(&data, Transport::Stream).unwrap();
        assert_eq!(header.family, AddressFamily::Unix);
        assert_eq!(header.source, None);
    }

    #[test]
    fn test_encode_v1_matches_decoder() {
        let src = addr("[2001:db8::7]:5000");
        let dst = addr("[2001:db8::8]:443");
        let data = encode_v1(Some((src, dst)));
        let header = decode(&data, Transport::Stream).unwrap();
        assert_eq!(header.source, Some(src));
        assert_eq!(header.destination, Some(dst));

        assert_eq!(encode_v1(None), b"PROXY UNKNOWN\r\n");
    }

    proptest! {
        #[test]
        fn prop_v2_roundtrip_ipv4(
            src in any::<[u8; 4]>(),
            dst in any::<[u8; 4]>(),
            sport in any::<u16>(),
            dport in any::<u16>(),
        ) {
            let src = SocketAddr::new(IpAddr::V4(Ipv4Addr::from(src)), sport);
            let dst = SocketAddr::new(IpAddr::V4(Ipv4Addr::from(dst)), dport);
            let data = ProxyProtocolV2::new(src, dst).encode();

            let header = decode(&data, Transport::Stream).unwrap();
            prop_assert_eq!(header.source, Some(src));
            prop_assert_eq!(header.destination, Some(dst));
            prop_assert!(header.trailing.is_empty());
        }

        #[test]
        fn prop_v2_roundtrip_ipv6(
            src in any::<[u8; 16]>(),
            dst in any::<[u8; 16]>(),
            sport in any::<u16>(),
            dport in any::<u16>(),
        ) {
            let src = SocketAddr::new(IpAddr::V6(Ipv6Addr::from(src)), sport);
            let dst = SocketAddr::new(IpAddr::V6(Ipv6Addr::from(dst)), dport);
            let data = ProxyProtocolV2::new(src, dst)
                .with_transport(Transport::Datagram)
                .encode();

            let header = decode(&data, Transport::Datagram).unwrap();
            prop_assert_eq!(header.source, Some(src));
            prop_assert_eq!(header.destination, Some(dst));
        }
    }
}
