//! Error types for the capture pipeline

use thiserror::Error;

/// Result type alias for capture operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while setting up or running a capture session
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to create the render surface or the writer pipeline
    #[error("Capture initialization failed: {0}")]
    InitializationError(String),

    /// Failed to navigate to or load a URL
    #[error("Failed to load URL: {0}")]
    LoadError(String),

    /// The renderer misbehaved (no surface, rejected request)
    #[error("Rendering failed: {0}")]
    RenderError(String),

    /// A bounded wait expired
    #[error("Timed out after {timeout_ms}ms waiting for {what}")]
    Timeout { what: &'static str, timeout_ms: u64 },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    /// Still-image encoding or decoding failed
    #[error("Frame encoding failed: {0}")]
    EncodeError(String),

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CDP-specific error
    #[cfg(feature = "cdp")]
    #[error("CDP error: {0}")]
    CdpError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

#[cfg(feature = "cdp")]
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::CdpError(err.to_string())
    }
}

impl From<png::EncodingError> for Error {
    fn from(err: png::EncodingError) -> Self {
        Error::EncodeError(err.to_string())
    }
}

impl From<png::DecodingError> for Error {
    fn from(err: png::DecodingError) -> Self {
        Error::EncodeError(err.to_string())
    }
}
