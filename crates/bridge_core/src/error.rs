use serde_json::Value;
use thiserror::Error;

/// Errors produced while turning values into wire bytes and back.
#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("serialization failed: {0}")]
    Serialize(String),

    #[error("deserialization failed: {0}")]
    Deserialize(String),

    #[error("compression failed: {0}")]
    Compress(String),

    #[error("decompression failed: {0}")]
    Decompress(String),

    /// The trailing checksum did not match the payload.
    #[error("checksum mismatch ({algorithm})")]
    ChecksumMismatch { algorithm: String },

    /// The frame is shorter than the negotiated checksum.
    #[error("frame of {len} bytes is too short for a {expected} byte checksum")]
    Truncated { len: usize, expected: usize },

    #[error("unknown {kind} algorithm `{name}`")]
    UnknownAlgorithm { kind: &'static str, name: String },
}

/// Errors raised by the frame protocol while splitting a byte stream.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame too large: {len} bytes (max {max})")]
    TooLarge { len: usize, max: usize },
}

/// Why a handshake did not produce an open session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeFailure {
    #[error("no common encoding (local {local:?}, remote {remote:?})")]
    NoCommonEncoding { local: Vec<String>, remote: Vec<String> },

    #[error("malformed handshake meta: {0}")]
    MalformedMeta(String),

    #[error("peer did not answer the handshake within {0} ms")]
    Timeout(u64),

    #[error("peer disconnected during handshake")]
    Disconnected,

    #[error("negotiated algorithm is not available: {0}")]
    UnknownAlgorithm(String),
}

/// Everything a [`Client`](crate::session::Client) operation can fail with.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeFailure),

    /// The session is closing or closed; no more frames can be written.
    #[error("connection closed")]
    Closed,

    #[error("request `{0}` timed out")]
    Timeout(String),

    /// The remote handler answered with an `error` field.
    #[error("remote error: {message}")]
    Remote { message: String, data: Option<Value> },

    #[error("transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

impl From<std::io::Error> for SessionError {
    fn from(err: std::io::Error) -> Self {
        SessionError::Transport(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SessionError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        SessionError::Transport(err.to_string())
    }
}
