//! Length-prefixed JSON framing.
//!
//! Wire format: 4 bytes big-endian payload length, then that many bytes of
//! JSON. Zero-length frames are rejected. An oversized payload is skipped
//! without buffering it, so the stream stays aligned on the next frame.

use std::io::{self, Read, Write};

use serde::Deserialize;
use thiserror::Error;

use crate::types::protocol::{Frame, Token};


/// Largest frame accepted unless configured otherwise.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;


#[derive(Debug, Error)]
pub enum WireError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The peer closed the stream at a frame boundary.
    #[error("connection closed")]
    Closed,

    /// `token` is set when the payload starts with its token, as every
    /// frame written by [`write_frame`] does.
    #[error("frame too large: {len} bytes (limit {max})")]
    TooLarge {
        token: Option<Token>,
        len: usize,
        max: usize,
    },

    #[error("empty frame")]
    Empty,

    /// The payload is not a valid frame. `token` is set when at least the
    /// token could be recovered, so the receiver can still answer.
    #[error("cannot decode frame: {reason}")]
    Decode { token: Option<Token>, reason: String },

    #[error("cannot encode frame: {0}")]
    Encode(String),
}

impl WireError {
    /// True when the stream is unusable and the caller should stop reading.
    /// Empty, oversized and undecodable frames leave the stream aligned.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            WireError::Empty
                | WireError::TooLarge { .. }
                | WireError::Decode { .. }
                | WireError::Encode(_)
        )
    }

    /// Token of the rejected frame, when it could be recovered.
    pub fn token(&self) -> Option<Token> {
        match self {
            WireError::TooLarge { token, .. } | WireError::Decode { token, .. } => *token,
            _ => None,
        }
    }
}


/// Read one raw payload.
pub fn read_frame_bytes<R: Read>(reader: &mut R, max: usize) -> Result<Vec<u8>, WireError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Err(WireError::Closed),
        Err(e) => return Err(WireError::Io(e)),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 {
        return Err(WireError::Empty);
    }
    if len > max {
        let token = skip_payload(reader, len)?;
        return Err(WireError::TooLarge { token, len, max });
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}


/// Bytes of an oversized payload inspected for its token.
const TOKEN_PREFIX_BYTES: usize = 64;

/// Consume `len` payload bytes, returning the token if the payload opens
/// with `{"token":N`.
fn skip_payload<R: Read>(reader: &mut R, len: usize) -> Result<Option<Token>, WireError> {
    let mut prefix = vec![0u8; len.min(TOKEN_PREFIX_BYTES)];
    reader.read_exact(&mut prefix)?;
    let rest = (len - prefix.len()) as u64;
    let skipped = io::copy(&mut reader.by_ref().take(rest), &mut io::sink())?;
    if skipped < rest {
        return Err(WireError::Io(io::ErrorKind::UnexpectedEof.into()));
    }
    Ok(token_prefix(&prefix))
}

fn token_prefix(prefix: &[u8]) -> Option<Token> {
    let text = std::str::from_utf8(prefix)
        .or_else(|e| std::str::from_utf8(&prefix[..e.valid_up_to()]))
        .ok()?;
    let rest = text.trim_start().strip_prefix('{')?.trim_start();
    let rest = rest.strip_prefix("\"token\"")?.trim_start();
    let rest = rest.strip_prefix(':')?.trim_start();
    let digits: &str = &rest[..rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len())];
    digits.parse().ok().map(Token)
}


/// Read and decode one frame.
pub fn read_frame<R: Read>(reader: &mut R, max: usize) -> Result<Frame, WireError> {
    let payload = read_frame_bytes(reader, max)?;
    decode_frame(&payload)
}


/// Decode a payload. On failure, try to salvage the token.
pub fn decode_frame(payload: &[u8]) -> Result<Frame, WireError> {
    serde_json::from_slice::<Frame>(payload).map_err(|e| {
        #[derive(Deserialize)]
        struct TokenOnly {
            token: Token,
        }
        let token = serde_json::from_slice::<TokenOnly>(payload)
            .ok()
            .map(|t| t.token);
        WireError::Decode {
            token,
            reason: e.to_string(),
        }
    })
}


/// Encode and write one frame.
pub fn write_frame<W: Write>(writer: &mut W, frame: &Frame) -> Result<(), WireError> {
    let json = serde_json::to_vec(frame).map_err(|e| WireError::Encode(e.to_string()))?;
    let len = u32::try_from(json.len()).map_err(|_| WireError::TooLarge {
        token: Some(frame.token),
        len: json.len(),
        max: u32::MAX as usize,
    })?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(&json)?;
    writer.flush()?;
    Ok(())
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::protocol::Message;
    use std::io::Cursor;
    use std::os::unix::net::UnixStream;

    fn raw(payload: &[u8]) -> Vec<u8> {
        let mut out = (payload.len() as u32).to_be_bytes().to_vec();
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn frame_round_trip_over_socket_pair() {
        let (mut a, mut b) = UnixStream::pair().unwrap();
        let frame = Frame::new(Token(5), Message::ListChildren { path: "/".into() });
        write_frame(&mut a, &frame).unwrap();
        assert_eq!(read_frame(&mut b, DEFAULT_MAX_FRAME_BYTES).unwrap(), frame);
    }

    #[test]
    fn empty_frame_rejected() {
        let mut cur = Cursor::new(0u32.to_be_bytes().to_vec());
        assert!(matches!(
            read_frame(&mut cur, DEFAULT_MAX_FRAME_BYTES),
            Err(WireError::Empty)
        ));
    }

    #[test]
    fn oversized_frame_is_skipped_and_stream_stays_aligned() {
        let big = Frame::new(
            Token(7),
            Message::ListChildren {
                path: format!("/{}", "x".repeat(500)),
            },
        );
        let mut buf = Vec::new();
        write_frame(&mut buf, &big).unwrap();
        write_frame(&mut buf, &Frame::new(Token(8), Message::Ok)).unwrap();
        let mut cur = Cursor::new(buf);

        let err = read_frame(&mut cur, 100).unwrap_err();
        assert!(!err.is_fatal());
        assert_eq!(err.token(), Some(Token(7)));
        assert!(matches!(err, WireError::TooLarge { max: 100, .. }));
        assert_eq!(read_frame(&mut cur, 100).unwrap().token, Token(8));
    }

    #[test]
    fn oversized_garbage_has_no_token() {
        let mut cur = Cursor::new(raw(&[b'z'; 300]));
        let err = read_frame(&mut cur, 100).unwrap_err();
        assert!(matches!(err, WireError::TooLarge { token: None, len: 300, .. }));
    }

    #[test]
    fn truncated_oversized_payload_is_fatal() {
        let mut bytes = 1000u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(b"{\"token\":3");
        let mut cur = Cursor::new(bytes);
        let err = read_frame(&mut cur, 100).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn eof_at_boundary_is_closed() {
        let mut cur = Cursor::new(Vec::new());
        assert!(matches!(read_frame(&mut cur, 10), Err(WireError::Closed)));
    }

    #[test]
    fn decode_error_salvages_token() {
        let mut cur = Cursor::new(raw(br#"{"token":9,"message":{"type":"bogus"}}"#));
        match read_frame(&mut cur, DEFAULT_MAX_FRAME_BYTES) {
            Err(e @ WireError::Decode { .. }) => {
                assert!(!e.is_fatal());
                if let WireError::Decode { token, .. } = e {
                    assert_eq!(token, Some(Token(9)));
                }
            }
            other => panic!("expected Decode, got {:?}", other),
        }
    }

    #[test]
    fn garbage_has_no_token() {
        let mut cur = Cursor::new(raw(b"not json"));
        assert!(matches!(
            read_frame(&mut cur, DEFAULT_MAX_FRAME_BYTES),
            Err(WireError::Decode { token: None, .. })
        ));
    }

    #[test]
    fn consecutive_frames_stay_aligned() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Frame::new(Token(1), Message::Ok)).unwrap();
        write_frame(&mut buf, &Frame::new(Token(2), Message::Shutdown)).unwrap();
        let mut cur = Cursor::new(buf);
        assert_eq!(read_frame(&mut cur, 1024).unwrap().token, Token(1));
        assert_eq!(read_frame(&mut cur, 1024).unwrap().message, Message::Shutdown);
    }
}
