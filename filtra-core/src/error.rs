//! Domain-specific error types for the filtra protocol.
//!
//! All fallible operations return `Result<T, FiltraError>`.
//! No panics on invalid input — every error is typed and recoverable.

use thiserror::Error;

/// The canonical error type for the filtra protocol.
#[derive(Debug, Error)]
pub enum FiltraError {
    // ── Transport Errors ─────────────────────────────────────────
    /// Binding the UDP endpoint failed.
    #[error("failed to bind UDP port {port}: {source}")]
    Bind {
        port: u16,
        source: std::io::Error,
    },

    /// The socket layer reported an I/O error.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An mpsc channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    // ── Wire Errors ──────────────────────────────────────────────
    /// An envelope or payload could not be serialized or deserialized.
    #[error("wire encoding error: {0}")]
    Decode(#[from] serde_json::Error),

    /// A payload did not carry the structure its message kind implies.
    #[error("malformed payload: {0}")]
    MalformedPayload(&'static str),

    // ── Processing Errors ────────────────────────────────────────
    /// Image decode, filter, or re-encode failed.
    #[error("image processing error: {0}")]
    Image(#[from] image::ImageError),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

impl From<String> for FiltraError {
    fn from(s: String) -> Self {
        FiltraError::Other(s)
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for FiltraError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        FiltraError::ChannelClosed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = FiltraError::Bind {
            port: 9000,
            source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use"),
        };
        assert!(e.to_string().contains("9000"));

        let e = FiltraError::MalformedPayload("not an image task");
        assert!(e.to_string().contains("not an image task"));
    }

    #[test]
    fn from_string() {
        let e: FiltraError = "something broke".to_string().into();
        assert!(matches!(e, FiltraError::Other(_)));
    }

    #[test]
    fn from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broke");
        let e: FiltraError = io_err.into();
        assert!(matches!(e, FiltraError::Io(_)));
    }
}
