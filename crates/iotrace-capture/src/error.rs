use iotrace_shared::NameError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("no space: {len} does not fit in {max}")]
    NoSpace { len: usize, max: usize },

    #[error("failed to allocate {bytes} bytes of trace buffer for cpu {cpu}")]
    OutOfMemory { cpu: usize, bytes: u64 },

    #[error("trace buffer full: record needs {needed} bytes, {free} free")]
    BufferFull { needed: usize, free: usize },

    #[error("buffer size cannot change while {clients} client(s) are attached")]
    AlreadyConfigured { clients: u32 },

    #[error("failed to register tracing callback: {0}")]
    RegistrationFailure(String),

    #[error("capture is not running")]
    NotCapturing,

    #[error("trace buffer already has a reader")]
    Busy,

    #[error("trace buffer for cpu {cpu} is closed")]
    Closed { cpu: usize },
}

impl CaptureError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        CaptureError::InvalidArgument(msg.into())
    }
}

impl From<NameError> for CaptureError {
    fn from(err: NameError) -> Self {
        match err {
            NameError::TooLong { len, max } => CaptureError::NoSpace { len, max },
            NameError::InteriorNul => CaptureError::invalid(err.to_string()),
        }
    }
}
