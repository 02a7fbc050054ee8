use thiserror::Error;

use crate::capture::CaptureError;
use crate::packet::decode::DecodeError;

/// Category of a pipeline error, used for metrics labels and severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    DeviceNotFound,
    Decode,
    StorageWrite,
    Configuration,
    Device,
}

impl ErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DeviceNotFound => "device_not_found",
            Self::Decode => "decode",
            Self::StorageWrite => "storage_write",
            Self::Configuration => "configuration",
            Self::Device => "device",
        }
    }

    /// Fatal kinds stop the session; the rest skip or retain work and continue.
    pub const fn is_fatal(self) -> bool {
        matches!(
            self,
            Self::DeviceNotFound | Self::Configuration | Self::Device
        )
    }
}

/// Errors surfaced by the capture pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("no capture device description contains '{fragment}'")]
    DeviceNotFound { fragment: String },

    #[error("decoding frame: {0}")]
    Decode(#[from] DecodeError),

    #[error("writing {records} records to {store}: {message}")]
    StorageWrite {
        store: String,
        records: usize,
        message: String,
    },

    #[error("configuration: {0}")]
    Configuration(String),

    #[error("capture device: {0}")]
    Device(String),
}

impl PipelineError {
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::DeviceNotFound { .. } => ErrorKind::DeviceNotFound,
            Self::Decode(_) => ErrorKind::Decode,
            Self::StorageWrite { .. } => ErrorKind::StorageWrite,
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Device(_) => ErrorKind::Device,
        }
    }

    pub const fn is_fatal(&self) -> bool {
        self.kind().is_fatal()
    }

    /// Builds a storage error; `{:#}` keeps the whole anyhow context chain.
    pub fn storage_write(store: &str, records: usize, err: &anyhow::Error) -> Self {
        Self::StorageWrite {
            store: store.to_string(),
            records,
            message: format!("{err:#}"),
        }
    }
}

impl From<CaptureError> for PipelineError {
    fn from(err: CaptureError) -> Self {
        match err {
            CaptureError::DeviceNotFound { fragment } => Self::DeviceNotFound { fragment },
            other => Self::Device(other.to_string()),
        }
    }
}
