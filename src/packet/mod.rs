pub mod classify;
pub mod decode;

use std::fmt;
use std::net::IpAddr;
use std::time::SystemTime;

/// IP protocol carried by a decoded packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Icmp,
    Igmp,
    Tcp,
    Udp,
    Gre,
    Esp,
    Icmpv6,
    Sctp,
    Other(u8),
}

/// Number of distinct counter slots used by per-protocol stats.
pub const PROTOCOL_SLOTS: usize = 9;

impl Protocol {
    /// Maps an IANA protocol number to a [`Protocol`].
    pub const fn from_number(n: u8) -> Self {
        match n {
            1 => Self::Icmp,
            2 => Self::Igmp,
            6 => Self::Tcp,
            17 => Self::Udp,
            47 => Self::Gre,
            50 => Self::Esp,
            58 => Self::Icmpv6,
            132 => Self::Sctp,
            other => Self::Other(other),
        }
    }

    /// Returns the IANA protocol number.
    pub const fn number(self) -> u8 {
        match self {
            Self::Icmp => 1,
            Self::Igmp => 2,
            Self::Tcp => 6,
            Self::Udp => 17,
            Self::Gre => 47,
            Self::Esp => 50,
            Self::Icmpv6 => 58,
            Self::Sctp => 132,
            Self::Other(n) => n,
        }
    }

    /// Returns the label stored in the `protocol` column.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Icmp => "ICMP",
            Self::Igmp => "IGMP",
            Self::Tcp => "TCP",
            Self::Udp => "UDP",
            Self::Gre => "GRE",
            Self::Esp => "ESP",
            Self::Icmpv6 => "ICMPv6",
            Self::Sctp => "SCTP",
            Self::Other(_) => "OTHER",
        }
    }

    /// Stable index into per-protocol counter arrays.
    pub const fn slot(self) -> usize {
        match self {
            Self::Icmp => 0,
            Self::Igmp => 1,
            Self::Tcp => 2,
            Self::Udp => 3,
            Self::Gre => 4,
            Self::Esp => 5,
            Self::Icmpv6 => 6,
            Self::Sctp => 7,
            Self::Other(_) => 8,
        }
    }

    /// Inverse of [`Protocol::slot`]. `Other` maps back with protocol number 255.
    pub const fn from_slot(slot: usize) -> Option<Self> {
        match slot {
            0 => Some(Self::Icmp),
            1 => Some(Self::Igmp),
            2 => Some(Self::Tcp),
            3 => Some(Self::Udp),
            4 => Some(Self::Gre),
            5 => Some(Self::Esp),
            6 => Some(Self::Icmpv6),
            7 => Some(Self::Sctp),
            8 => Some(Self::Other(255)),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Network-layer summary of one captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedPacket {
    pub source: IpAddr,
    pub destination: IpAddr,
    pub protocol: Protocol,
    /// Length of the IP packet in bytes, header included.
    pub size_bytes: u32,
}

/// One row of captured metadata, the unit accumulated in a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRecord {
    pub captured_at: SystemTime,
    pub packet: DecodedPacket,
    pub anomalous: bool,
}

impl BatchRecord {
    pub fn new(captured_at: SystemTime, packet: DecodedPacket, anomalous: bool) -> Self {
        Self {
            captured_at,
            packet,
            anomalous,
        }
    }
}
