//! Ethernet/IPv4/TCP/UDP frames and checksum-safe rewriting.
//!
//! Header parsing and serialisation are delegated to `etherparse`. This module
//! owns the one rule that matters to the device under test: **no frame leaves
//! here with a stale checksum**. Every serialisation path goes through
//! [`Frame::seal`], which recomputes the IPv4 header checksum and the TCP/UDP
//! checksum over pseudo-header + segment before writing bytes.
//!
//! # Frame layout
//!
//! ```text
//!  ┌──────────────┬──────────────┬───────────────┬─────────┬─────────┐
//!  │ Ethernet II  │ IPv4 header  │ TCP/UDP header│ payload │ padding │
//!  │ 14 bytes     │ 20..60 bytes │ 20..60 / 8    │         │         │
//!  └──────────────┴──────────────┴───────────────┴─────────┴─────────┘
//!                 │◀──────────── IPv4 total_len ───────────▶│
//! ```
//!
//! Padding is whatever the link layer appended past the IPv4 `total_len`
//! (short frames are padded to the 60-byte Ethernet minimum). It is kept
//! separately so payload lengths never include it.

use std::net::Ipv4Addr;

use etherparse::{EtherType, Ethernet2Header, IpNumber, Ipv4Header, TcpHeader, UdpHeader};
use thiserror::Error;

/// TCP control-bit constants, using the on-wire bit positions.
pub mod flags {
    /// No more data from sender.
    pub const FIN: u8 = 0x01;
    /// Synchronise sequence numbers (handshake).
    pub const SYN: u8 = 0x02;
    /// Reset the connection.
    pub const RST: u8 = 0x04;
    /// Push buffered data to the application.
    pub const PSH: u8 = 0x08;
    /// Acknowledgement field is valid.
    pub const ACK: u8 = 0x10;
}

/// Length of an Ethernet II header.
pub const ETHERNET_HEADER_LEN: usize = 14;

const DEFAULT_TTL: u8 = 64;
const DEFAULT_WINDOW: u16 = 8192;

/// Errors that can arise when parsing or building a frame.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// A header could not be decoded.
    #[error("malformed {layer} header: {reason}")]
    Malformed { layer: &'static str, reason: String },
    /// The Ethernet payload is not IPv4.
    #[error("unsupported ether type {0:#06x}")]
    UnsupportedEtherType(u16),
    /// The IPv4 payload is neither TCP nor UDP.
    #[error("unsupported IP protocol {0}")]
    UnsupportedProtocol(u8),
    /// IPv4 `total_len` claims more bytes than the frame holds.
    #[error("IPv4 total length covers {declared} bytes but only {available} are present")]
    Truncated { declared: usize, available: usize },
    /// A TCP-only field was set on a UDP frame.
    #[error("cannot apply TCP field `{0}` to a UDP frame")]
    NotTcp(&'static str),
    /// Lengths do not fit the header fields.
    #[error("frame too large: {0}")]
    TooLarge(String),
}

fn malformed(layer: &'static str, err: impl std::fmt::Display) -> PacketError {
    PacketError::Malformed {
        layer,
        reason: err.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// Transport header of a parsed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    Tcp(TcpHeader),
    Udp(UdpHeader),
}

/// A decoded Ethernet II / IPv4 / (TCP | UDP) frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub ethernet: Ethernet2Header,
    pub ip: Ipv4Header,
    pub transport: Transport,
    /// Transport payload, bounded by the IPv4 total length.
    pub payload: Vec<u8>,
    /// Link-layer padding after the IPv4 datagram.
    pub padding: Vec<u8>,
}

impl Frame {
    /// Decode `bytes` as an Ethernet II frame carrying IPv4 + TCP or UDP.
    pub fn parse(bytes: &[u8]) -> Result<Self, PacketError> {
        let (ethernet, rest) =
            Ethernet2Header::from_slice(bytes).map_err(|e| malformed("Ethernet", e))?;
        if ethernet.ether_type != EtherType::IPV4 {
            return Err(PacketError::UnsupportedEtherType(ethernet.ether_type.0));
        }

        let (ip, _) = Ipv4Header::from_slice(rest).map_err(|e| malformed("IPv4", e))?;
        let rest = &rest[ip.header_len()..];
        let declared = usize::from(ip.total_len)
            .checked_sub(ip.header_len())
            .ok_or_else(|| {
                malformed(
                    "IPv4",
                    format!("total length {} is shorter than the header", ip.total_len),
                )
            })?;
        if declared > rest.len() {
            return Err(PacketError::Truncated {
                declared,
                available: rest.len(),
            });
        }
        let (segment, padding) = rest.split_at(declared);

        let (transport, payload) = match ip.protocol {
            IpNumber::TCP => {
                let (tcp, payload) =
                    TcpHeader::from_slice(segment).map_err(|e| malformed("TCP", e))?;
                (Transport::Tcp(tcp), payload)
            }
            IpNumber::UDP => {
                let (udp, payload) =
                    UdpHeader::from_slice(segment).map_err(|e| malformed("UDP", e))?;
                (Transport::Udp(udp), payload)
            }
            other => return Err(PacketError::UnsupportedProtocol(other.0)),
        };

        Ok(Self {
            ethernet,
            ip,
            transport,
            payload: payload.to_vec(),
            padding: padding.to_vec(),
        })
    }

    /// The TCP header, if this frame carries TCP.
    pub fn tcp(&self) -> Option<&TcpHeader> {
        match &self.transport {
            Transport::Tcp(tcp) => Some(tcp),
            Transport::Udp(_) => None,
        }
    }

    /// The UDP header, if this frame carries UDP.
    pub fn udp(&self) -> Option<&UdpHeader> {
        match &self.transport {
            Transport::Udp(udp) => Some(udp),
            Transport::Tcp(_) => None,
        }
    }

    /// TCP control bits packed as in [`flags`]; `None` for UDP.
    pub fn tcp_flags(&self) -> Option<u8> {
        self.tcp().map(tcp_flag_bits)
    }

    /// Application bytes carried by the segment. Padding is not counted.
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    pub fn source_ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.ip.source)
    }

    pub fn destination_ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.ip.destination)
    }

    /// Recompute every checksum and serialise the frame.
    pub fn seal(mut self) -> Result<Vec<u8>, PacketError> {
        self.ip.header_checksum = self.ip.calc_header_checksum();
        match &mut self.transport {
            Transport::Tcp(tcp) => {
                tcp.checksum = tcp
                    .calc_checksum_ipv4(&self.ip, &self.payload)
                    .map_err(|e| PacketError::TooLarge(e.to_string()))?;
            }
            Transport::Udp(udp) => {
                udp.checksum = udp
                    .calc_checksum_ipv4(&self.ip, &self.payload)
                    .map_err(|e| PacketError::TooLarge(e.to_string()))?;
            }
        }
        Ok(self.serialize())
    }

    fn serialize(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(
            ETHERNET_HEADER_LEN + usize::from(self.ip.total_len) + self.padding.len(),
        );
        bytes.extend_from_slice(&self.ethernet.to_bytes());
        bytes.extend_from_slice(&self.ip.to_bytes());
        match &self.transport {
            Transport::Tcp(tcp) => bytes.extend_from_slice(&tcp.to_bytes()),
            Transport::Udp(udp) => bytes.extend_from_slice(&udp.to_bytes()),
        }
        bytes.extend_from_slice(&self.payload);
        bytes.extend_from_slice(&self.padding);
        bytes
    }
}

// ---------------------------------------------------------------------------
// Rewriting
// ---------------------------------------------------------------------------

/// Field overrides applied by [`rewrite`]. `None` keeps the parsed value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rewrite {
    pub source_mac: Option<[u8; 6]>,
    pub destination_mac: Option<[u8; 6]>,
    pub source_ip: Option<Ipv4Addr>,
    pub destination_ip: Option<Ipv4Addr>,
    pub source_port: Option<u16>,
    pub destination_port: Option<u16>,
    /// TCP only.
    pub seq: Option<u32>,
    /// TCP only.
    pub ack: Option<u32>,
    /// TCP only; replaces FIN/SYN/RST/PSH/ACK as a whole.
    pub flags: Option<u8>,
}

impl Rewrite {
    /// Overrides that readdress a frame to `addressing`.
    pub fn addressed(addressing: &Addressing) -> Self {
        Self {
            source_mac: Some(addressing.source_mac),
            destination_mac: Some(addressing.destination_mac),
            source_ip: Some(addressing.source_ip),
            destination_ip: Some(addressing.destination_ip),
            source_port: Some(addressing.source_port),
            destination_port: Some(addressing.destination_port),
            ..Self::default()
        }
    }
}

/// Apply `changes` to a copy of `frame` and serialise it with fresh checksums.
///
/// `frame` itself is left untouched.
pub fn rewrite(frame: &Frame, changes: &Rewrite) -> Result<Vec<u8>, PacketError> {
    let mut out = frame.clone();

    if let Some(mac) = changes.source_mac {
        out.ethernet.source = mac;
    }
    if let Some(mac) = changes.destination_mac {
        out.ethernet.destination = mac;
    }
    if let Some(ip) = changes.source_ip {
        out.ip.source = ip.octets();
    }
    if let Some(ip) = changes.destination_ip {
        out.ip.destination = ip.octets();
    }

    match &mut out.transport {
        Transport::Tcp(tcp) => {
            if let Some(port) = changes.source_port {
                tcp.source_port = port;
            }
            if let Some(port) = changes.destination_port {
                tcp.destination_port = port;
            }
            if let Some(seq) = changes.seq {
                tcp.sequence_number = seq;
            }
            if let Some(ack) = changes.ack {
                tcp.acknowledgment_number = ack;
            }
            if let Some(bits) = changes.flags {
                set_flags(tcp, bits);
            }
        }
        Transport::Udp(udp) => {
            if changes.seq.is_some() {
                return Err(PacketError::NotTcp("seq"));
            }
            if changes.ack.is_some() {
                return Err(PacketError::NotTcp("ack"));
            }
            if changes.flags.is_some() {
                return Err(PacketError::NotTcp("flags"));
            }
            if let Some(port) = changes.source_port {
                udp.source_port = port;
            }
            if let Some(port) = changes.destination_port {
                udp.destination_port = port;
            }
        }
    }

    out.seal()
}

/// FIN/SYN/RST/PSH/ACK of `tcp` packed as in [`flags`].
pub fn tcp_flag_bits(tcp: &TcpHeader) -> u8 {
    let mut bits = 0;
    for (set, bit) in [
        (tcp.fin, flags::FIN),
        (tcp.syn, flags::SYN),
        (tcp.rst, flags::RST),
        (tcp.psh, flags::PSH),
        (tcp.ack, flags::ACK),
    ] {
        if set {
            bits |= bit;
        }
    }
    bits
}

fn set_flags(tcp: &mut TcpHeader, bits: u8) {
    tcp.fin = bits & flags::FIN != 0;
    tcp.syn = bits & flags::SYN != 0;
    tcp.rst = bits & flags::RST != 0;
    tcp.psh = bits & flags::PSH != 0;
    tcp.ack = bits & flags::ACK != 0;
}

/// Recompute the checksums of `bytes` and compare them with the stored ones.
pub fn verify_checksums(bytes: &[u8]) -> Result<bool, PacketError> {
    let frame = Frame::parse(bytes)?;
    let ip_ok = frame.ip.header_checksum == frame.ip.calc_header_checksum();
    let transport_ok = match &frame.transport {
        Transport::Tcp(tcp) => {
            tcp.checksum
                == tcp
                    .calc_checksum_ipv4(&frame.ip, &frame.payload)
                    .map_err(|e| PacketError::TooLarge(e.to_string()))?
        }
        Transport::Udp(udp) => {
            udp.checksum
                == udp
                    .calc_checksum_ipv4(&frame.ip, &frame.payload)
                    .map_err(|e| PacketError::TooLarge(e.to_string()))?
        }
    };
    Ok(ip_ok && transport_ok)
}

// ---------------------------------------------------------------------------
// Synthesised frames
// ---------------------------------------------------------------------------

/// Link, network and transport addresses of one direction of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Addressing {
    pub source_mac: [u8; 6],
    pub destination_mac: [u8; 6],
    pub source_ip: Ipv4Addr,
    pub destination_ip: Ipv4Addr,
    pub source_port: u16,
    pub destination_port: u16,
}

impl Addressing {
    /// Addresses as they appear in `frame`.
    pub fn of(frame: &Frame) -> Self {
        let (source_port, destination_port) = match &frame.transport {
            Transport::Tcp(tcp) => (tcp.source_port, tcp.destination_port),
            Transport::Udp(udp) => (udp.source_port, udp.destination_port),
        };
        Self {
            source_mac: frame.ethernet.source,
            destination_mac: frame.ethernet.destination,
            source_ip: frame.source_ip(),
            destination_ip: frame.destination_ip(),
            source_port,
            destination_port,
        }
    }

    /// Addresses for a reply to `frame`: source and destination swapped.
    pub fn reply_to(frame: &Frame) -> Self {
        Self::of(frame).reversed()
    }

    /// The opposite direction of this flow.
    pub fn reversed(&self) -> Self {
        Self {
            source_mac: self.destination_mac,
            destination_mac: self.source_mac,
            source_ip: self.destination_ip,
            destination_ip: self.source_ip,
            source_port: self.destination_port,
            destination_port: self.source_port,
        }
    }
}

fn ethernet_header(addressing: &Addressing) -> Ethernet2Header {
    Ethernet2Header {
        source: addressing.source_mac,
        destination: addressing.destination_mac,
        ether_type: EtherType::IPV4,
    }
}

fn ipv4_header(
    addressing: &Addressing,
    payload_len: usize,
    protocol: IpNumber,
) -> Result<Ipv4Header, PacketError> {
    let len = u16::try_from(payload_len)
        .map_err(|_| PacketError::TooLarge(format!("{payload_len} byte IPv4 payload")))?;
    Ipv4Header::new(
        len,
        DEFAULT_TTL,
        protocol,
        addressing.source_ip.octets(),
        addressing.destination_ip.octets(),
    )
    .map_err(|e| PacketError::TooLarge(e.to_string()))
}

/// Build a TCP segment with the given control bits.
pub fn build_tcp(
    addressing: &Addressing,
    seq: u32,
    ack: u32,
    flag_bits: u8,
    payload: &[u8],
) -> Result<Vec<u8>, PacketError> {
    let mut tcp = TcpHeader::new(
        addressing.source_port,
        addressing.destination_port,
        seq,
        DEFAULT_WINDOW,
    );
    tcp.acknowledgment_number = ack;
    set_flags(&mut tcp, flag_bits);

    let ip = ipv4_header(
        addressing,
        tcp.header_len() as usize + payload.len(),
        IpNumber::TCP,
    )?;
    Frame {
        ethernet: ethernet_header(addressing),
        ip,
        transport: Transport::Tcp(tcp),
        payload: payload.to_vec(),
        padding: Vec::new(),
    }
    .seal()
}

/// Build a UDP datagram carrying `payload`.
pub fn build_udp(addressing: &Addressing, payload: &[u8]) -> Result<Vec<u8>, PacketError> {
    let udp_len = UdpHeader::LEN + payload.len();
    let length = u16::try_from(udp_len)
        .map_err(|_| PacketError::TooLarge(format!("{udp_len} byte UDP datagram")))?;
    let udp = UdpHeader {
        source_port: addressing.source_port,
        destination_port: addressing.destination_port,
        length,
        checksum: 0,
    };
    let ip = ipv4_header(addressing, udp_len, IpNumber::UDP)?;
    Frame {
        ethernet: ethernet_header(addressing),
        ip,
        transport: Transport::Udp(udp),
        payload: payload.to_vec(),
        padding: Vec::new(),
    }
    .seal()
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
