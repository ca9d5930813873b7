//! Frame protocol for byte-stream transports (Unix and TCP sockets).
//!
//! Length-prefixed frames:
//!
//! ```text
//! [u32 LE length] [payload: length bytes]
//! ```
//!
//! or, for self-delimiting encodings, payloads separated by a delimiter byte
//! (`\n` for line-oriented JSON). WebSocket transports skip this module since
//! every message already is one frame.

use serde::{Deserialize, Serialize};

use crate::error::FrameError;

/// Maximum frame payload size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    #[default]
    LengthPrefixed,
    /// Only valid for encodings that never emit the delimiter byte.
    Delimited(u8),
}

/// Incremental splitter that handles partial reads.
///
/// Feed bytes via [`FrameProtocol::feed`] and collect every complete frame;
/// incomplete data stays buffered for the next call.
#[derive(Debug)]
pub struct FrameProtocol {
    framing: Framing,
    max_frame: usize,
    buf: Vec<u8>,
}

impl FrameProtocol {
    pub fn new(framing: Framing) -> Self {
        Self::with_limit(framing, MAX_FRAME_SIZE)
    }

    pub fn with_limit(framing: Framing, max_frame: usize) -> Self {
        Self {
            framing,
            max_frame,
            buf: Vec::new(),
        }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Wire bytes for one payload.
    pub fn encode(&self, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
        if payload.len() > self.max_frame {
            return Err(FrameError::TooLarge {
                len: payload.len(),
                max: self.max_frame,
            });
        }
        match self.framing {
            Framing::LengthPrefixed => {
                let mut out = Vec::with_capacity(4 + payload.len());
                out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
                out.extend_from_slice(payload);
                Ok(out)
            }
            Framing::Delimited(delimiter) => {
                let mut out = Vec::with_capacity(payload.len() + 1);
                out.extend_from_slice(payload);
                out.push(delimiter);
                Ok(out)
            }
        }
    }

    /// Appends `bytes` and extracts all complete frames, in order.
    ///
    /// An oversized frame is an unrecoverable protocol error for the stream,
    /// the buffer is discarded.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Vec<u8>>, FrameError> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();
        let mut consumed = 0;

        loop {
            let rest = &self.buf[consumed..];
            match self.framing {
                Framing::LengthPrefixed => {
                    if rest.len() < 4 {
                        break;
                    }
                    let len = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
                    if len > self.max_frame {
                        self.buf.clear();
                        return Err(FrameError::TooLarge { len, max: self.max_frame });
                    }
                    if rest.len() < 4 + len {
                        break;
                    }
                    frames.push(rest[4..4 + len].to_vec());
                    consumed += 4 + len;
                }
                Framing::Delimited(delimiter) => {
                    let Some(pos) = rest.iter().position(|b| *b == delimiter) else {
                        if rest.len() > self.max_frame {
                            let len = rest.len();
                            self.buf.clear();
                            return Err(FrameError::TooLarge { len, max: self.max_frame });
                        }
                        break;
                    };
                    if pos > self.max_frame {
                        self.buf.clear();
                        return Err(FrameError::TooLarge { len: pos, max: self.max_frame });
                    }
                    // empty lines carry nothing
                    if pos > 0 {
                        frames.push(rest[..pos].to_vec());
                    }
                    consumed += pos + 1;
                }
            }
        }

        self.buf.drain(..consumed);
        Ok(frames)
    }

    /// True if a partial frame is buffered.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}

impl Default for FrameProtocol {
    fn default() -> Self {
        Self::new(Framing::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(protocol: &FrameProtocol, payloads: &[&[u8]]) -> Vec<u8> {
        payloads
            .iter()
            .flat_map(|p| protocol.encode(p).unwrap())
            .collect()
    }

    #[test]
    fn multiple_frames_in_single_feed() {
        let mut protocol = FrameProtocol::default();
        let bytes = stream(&protocol, &[b"one".as_slice(), b"".as_slice(), b"three".as_slice()]);
        let frames = protocol.feed(&bytes).unwrap();
        assert_eq!(frames, vec![b"one".to_vec(), vec![], b"three".to_vec()]);
        assert!(!protocol.has_partial());
    }

    #[test]
    fn partial_frame_reassembly() {
        let mut protocol = FrameProtocol::default();
        let bytes = protocol.encode(b"{\"key\":\"value\"}").unwrap();
        let mid = bytes.len() / 2;

        assert!(protocol.feed(&bytes[..mid]).unwrap().is_empty());
        assert!(protocol.has_partial());
        assert_eq!(protocol.feed(&bytes[mid..]).unwrap(), vec![b"{\"key\":\"value\"}".to_vec()]);
        assert!(!protocol.has_partial());
    }

    #[test]
    fn chunking_does_not_change_the_frames() {
        for framing in [Framing::LengthPrefixed, Framing::Delimited(b'\n')] {
            let encoder = FrameProtocol::new(framing);
            let payloads: Vec<Vec<u8>> = (0..20u8)
                .map(|i| (0..i * 7).map(|b| b'a' + b % 26).collect())
                .filter(|p: &Vec<u8>| !p.is_empty())
                .collect();
            let refs: Vec<&[u8]> = payloads.iter().map(Vec::as_slice).collect();
            let bytes = stream(&encoder, &refs);

            let whole = FrameProtocol::new(framing).feed(&bytes).unwrap();
            assert_eq!(whole, payloads);

            for chunk in [1, 2, 3, 5, 64] {
                let mut protocol = FrameProtocol::new(framing);
                let mut frames = Vec::new();
                for piece in bytes.chunks(chunk) {
                    frames.extend(protocol.feed(piece).unwrap());
                }
                assert_eq!(frames, whole, "chunk size {chunk} with {framing:?}");
                assert!(!protocol.has_partial());
            }
        }
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let mut protocol = FrameProtocol::with_limit(Framing::LengthPrefixed, 8);
        assert!(protocol.encode(&[0u8; 9]).is_err());
        let err = protocol.feed(&100u32.to_le_bytes()).unwrap_err();
        assert_eq!(err, FrameError::TooLarge { len: 100, max: 8 });
        assert!(!protocol.has_partial());

        let mut protocol = FrameProtocol::with_limit(Framing::Delimited(b'\n'), 4);
        assert!(protocol.feed(b"abcdefgh").is_err());

        let mut protocol = FrameProtocol::with_limit(Framing::Delimited(b'\n'), 4);
        let err = protocol.feed(b"abcdefgh\n").unwrap_err();
        assert_eq!(err, FrameError::TooLarge { len: 8, max: 4 });
        assert!(!protocol.has_partial());

        let mut protocol = FrameProtocol::with_limit(Framing::Delimited(b'\n'), 4);
        let bytewise = b"abcdefgh\n"
            .chunks(1)
            .map(|piece| protocol.feed(piece))
            .find(Result::is_err);
        assert!(matches!(bytewise, Some(Err(FrameError::TooLarge { max: 4, .. }))));

        let mut protocol = FrameProtocol::with_limit(Framing::Delimited(b'\n'), 4);
        assert_eq!(protocol.feed(b"abcd\n").unwrap(), vec![b"abcd".to_vec()]);
    }

    #[test]
    fn delimited_skips_blank_lines() {
        let mut protocol = FrameProtocol::new(Framing::Delimited(b'\n'));
        let frames = protocol.feed(b"{\"a\":1}\n\n{\"b\":2}\n{\"c\"").unwrap();
        assert_eq!(frames, vec![b"{\"a\":1}".to_vec(), b"{\"b\":2}".to_vec()]);
        assert!(protocol.has_partial());
    }
}
