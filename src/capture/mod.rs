//! Packet capture: device enumeration, backends, and the listener that feeds
//! decoded packets into the batching pipeline.

pub mod listener;
#[cfg(feature = "pcap")]
pub mod pcap;
pub mod replay;
pub mod select;
pub mod stats;

use std::fmt;
use std::time::SystemTime;

use thiserror::Error;

/// A capture-capable network interface as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureDevice {
    pub name: String,
    pub description: String,
}

impl CaptureDevice {
    /// Creates a device. An empty description falls back to the name.
    pub fn new(name: impl Into<String>, description: Option<String>) -> Self {
        let name = name.into();
        let description = description
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| name.clone());
        Self { name, description }
    }
}

impl fmt::Display for CaptureDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.description == self.name {
            f.write_str(&self.name)
        } else {
            write!(f, "{} ({})", self.name, self.description)
        }
    }
}

/// Link-layer framing of a captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Ethernet,
    /// Bare IPv4/IPv6 with no link header.
    RawIp,
    /// Linux "cooked" capture (SLL), used by the `any` pseudo-device.
    LinuxSll,
    Other(i32),
}

impl LinkType {
    /// Maps a libpcap DLT value.
    pub const fn from_dlt(dlt: i32) -> Self {
        match dlt {
            1 => Self::Ethernet,
            12 | 14 | 101 | 228 | 229 => Self::RawIp,
            113 => Self::LinuxSll,
            other => Self::Other(other),
        }
    }
}

/// One frame as delivered by a capture backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub link_type: LinkType,
    pub captured_at: SystemTime,
    pub data: Vec<u8>,
}

/// Errors raised by capture backends.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("no capture device matches '{fragment}'")]
    DeviceNotFound { fragment: String },

    #[error("capture device is not open")]
    NotOpen,

    #[error("capture device is already delivering frames")]
    AlreadySubscribed,

    #[error("capture backend error: {0}")]
    Backend(String),
}

/// Callback invoked on the capture thread for every frame.
pub type FrameHandler = Box<dyn FnMut(RawFrame) + Send + 'static>;

/// Callback invoked once when the device fails mid-capture.
pub type ErrorHandler = Box<dyn FnOnce(CaptureError) + Send + 'static>;

/// A source of captured frames.
///
/// `subscribe` starts delivery on a backend-owned thread; `close` stops it and
/// returns only after the last `on_frame` call has completed, so callers can
/// drain downstream state safely afterwards.
pub trait CaptureBackend: Send {
    fn name(&self) -> &str;

    fn list_devices(&self) -> Result<Vec<CaptureDevice>, CaptureError>;

    fn open(&mut self, device: &CaptureDevice) -> Result<(), CaptureError>;

    fn subscribe(
        &mut self,
        on_frame: FrameHandler,
        on_error: ErrorHandler,
    ) -> Result<(), CaptureError>;

    fn close(&mut self);
}
