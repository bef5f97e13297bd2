use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, LinkError>;

#[derive(Debug, Error)]
pub enum LinkError {
    /// Every resolver strategy was exhausted for this hostname
    #[error("unable to resolve {hostname}")]
    ResolutionFailure { hostname: String },

    /// The stream response has no usable multipart boundary. Never retried.
    #[error("invalid stream header: {0}")]
    InvalidStreamHeader(String),

    /// The frame accumulator exceeded its ceiling
    #[error("frame buffer overflow at {size} bytes (limit {limit})")]
    BufferOverflow {
        size: usize,
        limit: usize,
        dump: Option<PathBuf>,
    },

    #[error("failed to decode frame: {0}")]
    TransientDecodeFailure(String),

    #[error("too many dropped frames ({0} in a row)")]
    TooManyDroppedFrames(usize),

    #[error("connection failed: {0}")]
    ConnectionIo(String),

    /// No connection has been created for the active device yet
    #[error("connection not available")]
    NotAvailable,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Url(#[from] url::ParseError),

    #[error(transparent)]
    Dns(#[from] hickory_proto::error::ProtoError),
}

impl LinkError {
    pub(crate) fn resolution(hostname: &str) -> Self {
        LinkError::ResolutionFailure {
            hostname: hostname.to_string(),
        }
    }

    /// Whether a stream reader may reconnect after this error
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            LinkError::InvalidStreamHeader(_) | LinkError::BufferOverflow { .. }
        )
    }
}
