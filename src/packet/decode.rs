//! Frame decoding.
//!
//! Turns a [`RawFrame`] into a [`DecodedPacket`] by slicing the link and
//! network layers with `etherparse`. Slicing is lax: a frame cut short by the
//! capture snaplen still decodes as long as its IP header is complete, and the
//! reported size comes from the header, not from the captured bytes. Frames
//! without an IP packet (ARP, LLDP) or with a broken IP header are a
//! [`DecodeError`] and the caller skips them.

use std::net::IpAddr;

use etherparse::{LaxNetSlice, LaxSlicedPacket, LinuxSllProtocolType, LinuxSllSlice};
use thiserror::Error;

use crate::capture::{LinkType, RawFrame};

use super::{DecodedPacket, Protocol};

/// Fixed IPv6 header length; `payload_length` excludes it.
const IPV6_HEADER_LEN: u32 = 40;

/// Errors that can occur while decoding a captured frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unsupported link type {raw}")]
    UnsupportedLinkType { raw: i32 },

    #[error("malformed frame ({len} bytes): {reason}")]
    Malformed { len: usize, reason: String },

    #[error("frame carries no IP packet")]
    NotIp,
}

impl DecodeError {
    /// Short label used for metrics and structured logs.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::UnsupportedLinkType { .. } => "unsupported_link_type",
            Self::Malformed { .. } => "malformed",
            Self::NotIp => "not_ip",
        }
    }
}

/// Decode one captured frame into its network-layer summary.
pub fn decode_frame(frame: &RawFrame) -> Result<DecodedPacket, DecodeError> {
    let data = frame.data.as_slice();

    let sliced = match frame.link_type {
        LinkType::Ethernet => {
            LaxSlicedPacket::from_ethernet(data).map_err(|e| malformed(data, e))?
        }
        LinkType::LinuxSll => {
            let sll = LinuxSllSlice::from_slice(data).map_err(|e| malformed(data, e))?;
            match sll.protocol_type() {
                LinuxSllProtocolType::EtherType(ether_type) => {
                    LaxSlicedPacket::from_ether_type(ether_type, sll.payload_slice())
                }
                _ => return Err(DecodeError::NotIp),
            }
        }
        LinkType::RawIp => LaxSlicedPacket::from_ip(data).map_err(|e| malformed(data, e))?,
        LinkType::Other(raw) => return Err(DecodeError::UnsupportedLinkType { raw }),
    };

    match &sliced.net {
        Some(LaxNetSlice::Ipv4(ipv4)) => {
            let header = ipv4.header();
            Ok(DecodedPacket {
                source: IpAddr::V4(header.source_addr()),
                destination: IpAddr::V4(header.destination_addr()),
                protocol: Protocol::from_number(header.protocol().0),
                size_bytes: u32::from(header.total_len()),
            })
        }
        Some(LaxNetSlice::Ipv6(ipv6)) => {
            let header = ipv6.header();
            Ok(DecodedPacket {
                source: IpAddr::V6(header.source_addr()),
                destination: IpAddr::V6(header.destination_addr()),
                protocol: Protocol::from_number(header.next_header().0),
                size_bytes: IPV6_HEADER_LEN + u32::from(header.payload_length()),
            })
        }
        // Parsing stopped before the network layer.
        None => match &sliced.stop_err {
            Some((err, _layer)) => Err(malformed(data, err)),
            None => Err(DecodeError::NotIp),
        },
    }
}

fn malformed(data: &[u8], err: impl std::fmt::Display) -> DecodeError {
    DecodeError::Malformed {
        len: data.len(),
        reason: err.to_string(),
    }
}
