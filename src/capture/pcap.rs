//! Live capture through libpcap.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use pcap::{Active, Capture, Device};

use crate::config::CaptureConfig;

use super::{
    CaptureBackend, CaptureDevice, CaptureError, ErrorHandler, FrameHandler, LinkType, RawFrame,
};

/// Capture backend backed by a libpcap handle.
///
/// The read timeout bounds how long the capture thread blocks in
/// `next_packet`, and therefore how quickly `close` returns.
pub struct PcapBackend {
    snaplen: i32,
    promiscuous: bool,
    timeout_ms: i32,
    capture: Option<Capture<Active>>,
    link_type: LinkType,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PcapBackend {
    pub fn new(cfg: &CaptureConfig) -> Self {
        let timeout_ms = i32::try_from(cfg.read_timeout.as_millis()).unwrap_or(i32::MAX);

        Self {
            snaplen: cfg.snaplen,
            promiscuous: cfg.promiscuous,
            timeout_ms: timeout_ms.max(1),
            capture: None,
            link_type: LinkType::Ethernet,
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }
}

impl CaptureBackend for PcapBackend {
    fn name(&self) -> &str {
        "pcap"
    }

    fn list_devices(&self) -> Result<Vec<CaptureDevice>, CaptureError> {
        let devices = Device::list().map_err(|e| CaptureError::Backend(e.to_string()))?;

        Ok(devices
            .into_iter()
            .map(|d| CaptureDevice::new(d.name, d.desc))
            .collect())
    }

    fn open(&mut self, device: &CaptureDevice) -> Result<(), CaptureError> {
        let capture = Capture::from_device(device.name.as_str())
            .and_then(|c| {
                c.promisc(self.promiscuous)
                    .snaplen(self.snaplen)
                    .timeout(self.timeout_ms)
                    .open()
            })
            .map_err(|e| CaptureError::Backend(format!("opening {}: {e}", device.name)))?;

        self.link_type = LinkType::from_dlt(capture.get_datalink().0);

        tracing::info!(
            device = %device.name,
            link_type = ?self.link_type,
            snaplen = self.snaplen,
            promiscuous = self.promiscuous,
            "opened capture device"
        );

        self.capture = Some(capture);

        Ok(())
    }

    fn subscribe(
        &mut self,
        mut on_frame: FrameHandler,
        on_error: ErrorHandler,
    ) -> Result<(), CaptureError> {
        if self.handle.is_some() {
            return Err(CaptureError::AlreadySubscribed);
        }
        let mut capture = self.capture.take().ok_or(CaptureError::NotOpen)?;

        let link_type = self.link_type;
        let running = Arc::clone(&self.running);
        running.store(true, Ordering::Release);

        let handle = std::thread::Builder::new()
            .name("pcap-capture".to_string())
            .spawn(move || {
                while running.load(Ordering::Acquire) {
                    match capture.next_packet() {
                        Ok(packet) => on_frame(RawFrame {
                            link_type,
                            captured_at: timeval_to_system_time(
                                i64::from(packet.header.ts.tv_sec),
                                i64::from(packet.header.ts.tv_usec),
                            ),
                            data: packet.data.to_vec(),
                        }),
                        Err(pcap::Error::TimeoutExpired) => continue,
                        Err(e) => {
                            if running.load(Ordering::Acquire) {
                                on_error(CaptureError::Backend(e.to_string()));
                            }
                            return;
                        }
                    }
                }
            })
            .map_err(|e| CaptureError::Backend(format!("spawning capture thread: {e}")))?;

        self.handle = Some(handle);

        Ok(())
    }

    fn close(&mut self) {
        self.running.store(false, Ordering::Release);

        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!(backend = "pcap", "capture thread panicked");
            }
        }

        self.capture = None;
    }
}

impl Drop for PcapBackend {
    fn drop(&mut self) {
        self.close();
    }
}

fn timeval_to_system_time(sec: i64, usec: i64) -> SystemTime {
    let secs = u64::try_from(sec).unwrap_or(0);
    let micros = u32::try_from(usec.clamp(0, 999_999)).unwrap_or(0);
    UNIX_EPOCH + Duration::new(secs, micros * 1_000)
}
