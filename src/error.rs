//! Error types for the interception proxy.
//!
//! Each component owns one enum. Everything is handled at the session
//! boundary: a failure ends the exchange or session it occurred in and never
//! reaches another peer.

use crate::key::KeyError;
use std::io;
use thiserror::Error;

/// Identity store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    /// State file could not be read or written
    #[error("state file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    /// State file exists but one of its entries does not parse
    #[error("corrupt state: {0}")]
    CorruptState(String),
}

impl StoreError {
    pub(crate) fn io(path: &std::path::Path, source: io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }

    pub(crate) fn corrupt(what: &str, err: impl std::fmt::Display) -> Self {
        Self::CorruptState(format!("{what}: {err}"))
    }
}

impl From<KeyError> for StoreError {
    fn from(err: KeyError) -> Self {
        Self::CorruptState(err.to_string())
    }
}

/// Length-prefixed framing failures.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame i/o: {0}")]
    Io(#[from] io::Error),

    /// Declared length is above the accepted ceiling
    #[error("frame length {0} exceeds limit")]
    TooLarge(usize),

    /// Stream ended inside a length prefix or payload
    #[error("truncated frame: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },
}

/// Record encode/decode failures.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// Sealed message failed authentication
    #[error("failed to decrypt")]
    Decrypt,

    #[error("failed to seal")]
    Seal,

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("zstd: {0}")]
    Compression(io::Error),
}

/// Interception session failures.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Inbound or outbound secure-session establishment failed
    #[error("handshake: {0}")]
    Handshake(String),

    #[error(transparent)]
    Storage(#[from] StoreError),

    /// Forwarding to the real server failed
    #[error("upstream: {0}")]
    Upstream(String),

    #[error("transport: {0}")]
    Transport(#[from] hyper::Error),
}

impl SessionError {
    pub fn handshake(msg: impl Into<String>) -> Self {
        Self::Handshake(msg.into())
    }

    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::Upstream(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_text_is_caller_visible() {
        let err = SessionError::upstream("connection refused");
        assert_eq!(err.to_string(), "upstream: connection refused");

        let err = CodecError::from(FrameError::TooLarge(2 << 20));
        assert_eq!(err.to_string(), "frame length 2097152 exceeds limit");

        let err = StoreError::corrupt("Noise", "bad key");
        assert!(matches!(err, StoreError::CorruptState(_)));
    }
}
