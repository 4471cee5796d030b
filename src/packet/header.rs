//! IPv4/TCP header decoding
//!
//! [`parse_frame`] turns a raw frame read from the virtual interface into a
//! [`RawFrame`], a borrowed view that never outlives the read buffer. The
//! function is pure and may be called concurrently on independent buffers.

use std::fmt;
use std::net::Ipv4Addr;

use crate::error::PacketError;

use super::tracker::TcpFlowKey;

/// Minimum IPv4 header length in bytes (IHL = 5)
pub const MIN_IPV4_HEADER_LEN: usize = 20;

/// Minimum TCP header length in bytes (data offset = 5)
pub const MIN_TCP_HEADER_LEN: usize = 20;

/// IP protocol number for TCP
pub const IPPROTO_TCP: u8 = 6;

/// TCP flag bits
pub mod tcp_flags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
    pub const URG: u8 = 0x20;
}

/// Decoded view of an IPv4/TCP frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawFrame<'a> {
    data: &'a [u8],
    /// IPv4 header length in bytes
    pub header_len: usize,
    /// IP protocol number (always TCP for a successfully parsed frame)
    pub protocol: u8,
    /// Source address
    pub src_addr: Ipv4Addr,
    /// Destination address
    pub dst_addr: Ipv4Addr,
    /// TCP source port
    pub src_port: u16,
    /// TCP destination port
    pub dst_port: u16,
    /// TCP header length in bytes
    pub tcp_header_len: usize,
    /// TCP flags byte
    pub flags: u8,
    /// Offset of the TCP payload within the frame
    pub payload_offset: usize,
    /// Number of payload bytes
    pub payload_len: usize,
}

impl<'a> RawFrame<'a> {
    /// SYN flag set
    #[must_use]
    pub const fn syn(&self) -> bool {
        self.flags & tcp_flags::SYN != 0
    }

    /// ACK flag set
    #[must_use]
    pub const fn ack(&self) -> bool {
        self.flags & tcp_flags::ACK != 0
    }

    /// SYN without ACK: the opening packet of a handshake
    #[must_use]
    pub const fn is_bare_syn(&self) -> bool {
        self.syn() && !self.ack()
    }

    /// FIN or RST set: the flow is closing
    #[must_use]
    pub const fn is_closing(&self) -> bool {
        self.flags & (tcp_flags::FIN | tcp_flags::RST) != 0
    }

    /// (source port, destination port) pair
    #[must_use]
    pub const fn flow_key(&self) -> TcpFlowKey {
        TcpFlowKey::new(self.src_port, self.dst_port)
    }

    /// Payload bytes, or `None` when the segment carries no payload
    #[must_use]
    pub fn payload(&self) -> Option<&'a [u8]> {
        if self.payload_len == 0 {
            return None;
        }
        Some(&self.data[self.payload_offset..self.payload_offset + self.payload_len])
    }

    /// Flags in `SYN|ACK` form, for logs
    #[must_use]
    pub fn flags_string(&self) -> String {
        const NAMES: [(u8, &str); 6] = [
            (tcp_flags::SYN, "SYN"),
            (tcp_flags::ACK, "ACK"),
            (tcp_flags::FIN, "FIN"),
            (tcp_flags::RST, "RST"),
            (tcp_flags::PSH, "PSH"),
            (tcp_flags::URG, "URG"),
        ];
        let set: Vec<&str> = NAMES
            .iter()
            .filter(|(bit, _)| self.flags & bit != 0)
            .map(|(_, name)| *name)
            .collect();
        if set.is_empty() {
            "-".to_string()
        } else {
            set.join("|")
        }
    }
}

impl fmt::Display for RawFrame<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{} [{}] payload={}",
            self.src_addr,
            self.src_port,
            self.dst_addr,
            self.dst_port,
            self.flags_string(),
            self.payload_len
        )
    }
}

/// Decode the IPv4 and TCP headers of a frame
///
/// The payload spans from the end of the TCP header to the end of `data`.
///
/// # Errors
///
/// - `TooShort` if the buffer cannot hold the headers
/// - `UnsupportedVersion` if the version nibble is not 4
/// - `InvalidIpHeaderLength` if IHL × 4 is below 20 or beyond the buffer
/// - `UnsupportedProtocol` for anything but TCP
/// - `InvalidTcpHeaderLength` if the data offset is below 20 or beyond the buffer
pub fn parse_frame(data: &[u8]) -> Result<RawFrame<'_>, PacketError> {
    if data.len() < MIN_IPV4_HEADER_LEN {
        return Err(PacketError::TooShort {
            len: data.len(),
            needed: MIN_IPV4_HEADER_LEN,
        });
    }

    let version = data[0] >> 4;
    if version != 4 {
        return Err(PacketError::UnsupportedVersion(version));
    }

    // IHL is in 32-bit words
    let header_len = usize::from(data[0] & 0x0F) * 4;
    if header_len < MIN_IPV4_HEADER_LEN || header_len > data.len() {
        return Err(PacketError::InvalidIpHeaderLength(header_len));
    }

    let protocol = data[9];
    if protocol != IPPROTO_TCP {
        return Err(PacketError::UnsupportedProtocol(protocol));
    }

    let src_addr = Ipv4Addr::new(data[12], data[13], data[14], data[15]);
    let dst_addr = Ipv4Addr::new(data[16], data[17], data[18], data[19]);

    let tcp = &data[header_len..];
    if tcp.len() < MIN_TCP_HEADER_LEN {
        return Err(PacketError::TooShort {
            len: data.len(),
            needed: header_len + MIN_TCP_HEADER_LEN,
        });
    }

    let src_port = u16::from_be_bytes([tcp[0], tcp[1]]);
    let dst_port = u16::from_be_bytes([tcp[2], tcp[3]]);

    // Data offset is in the high 4 bits of byte 12, in 32-bit words
    let tcp_header_len = usize::from(tcp[12] >> 4) * 4;
    if tcp_header_len < MIN_TCP_HEADER_LEN || tcp_header_len > tcp.len() {
        return Err(PacketError::InvalidTcpHeaderLength(tcp_header_len));
    }

    let flags = tcp[13];
    let payload_offset = header_len + tcp_header_len;

    Ok(RawFrame {
        data,
        header_len,
        protocol,
        src_addr,
        dst_addr,
        src_port,
        dst_port,
        tcp_header_len,
        flags,
        payload_offset,
        payload_len: data.len() - payload_offset,
    })
}
