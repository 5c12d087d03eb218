//! Message framing for the worker transport
//!
//! Workers and the coordinator exchange discrete messages over a plain byte
//! stream. Each message is wrapped in a begin/end marker pair so a reader can
//! reassemble whole messages from arbitrarily split reads.
//!
//! # Frame Format
//!
//! ```text
//! [DLE STX][payload, every DLE doubled][DLE ETX]
//! ```
//!
//! DLE (0x10) is the only escape byte. Doubling it inside the payload makes
//! the markers unambiguous for any binary payload.

use thiserror::Error;

/// Escape byte that starts every marker
pub const DLE: u8 = 0x10;

/// Second byte of the begin marker
pub const STX: u8 = 0x02;

/// Second byte of the end marker
pub const ETX: u8 = 0x03;

/// Begin-of-message marker
pub const FRAME_BEGIN: [u8; 2] = [DLE, STX];

/// End-of-message marker
pub const FRAME_END: [u8; 2] = [DLE, ETX];

/// Largest payload accepted from a peer (64 MiB)
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Framing faults
///
/// None of these are fatal for the connection: the decoder drops the
/// partial frame and resynchronises on the next begin marker.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("invalid escape sequence 0x10 0x{0:02x} inside frame")]
    InvalidEscape(u8),

    #[error("frame exceeds {max} bytes")]
    TooLarge { max: usize },

    #[error("begin marker inside an open frame ({discarded} bytes discarded)")]
    Restarted { discarded: usize },
}

/// Wrap a payload in begin/end markers, escaping DLE bytes
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let escapes = payload.iter().filter(|&&b| b == DLE).count();
    let mut framed = Vec::with_capacity(payload.len() + escapes + 4);
    framed.extend_from_slice(&FRAME_BEGIN);
    for &byte in payload {
        framed.push(byte);
        if byte == DLE {
            framed.push(DLE);
        }
    }
    framed.extend_from_slice(&FRAME_END);
    framed
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    /// Waiting for a begin marker
    Idle,
    /// Saw DLE while idle
    IdleEscape,
    /// Inside a frame
    InFrame,
    /// Saw DLE inside a frame
    InFrameEscape,
}

/// Incremental frame decoder
///
/// Feed it whatever the socket returned; it yields each complete payload in
/// arrival order and keeps partial state between calls.
#[derive(Debug)]
pub struct FrameDecoder {
    state: DecodeState,
    current: Vec<u8>,
    max_len: usize,
    /// Bytes seen outside any frame (diagnostics only)
    skipped: usize,
}

impl FrameDecoder {
    /// Create a decoder with the default size limit
    pub fn new() -> Self {
        Self::with_max_len(MAX_FRAME_LEN)
    }

    /// Create a decoder with a custom size limit
    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            state: DecodeState::Idle,
            current: Vec::new(),
            max_len,
            skipped: 0,
        }
    }

    /// Number of stray bytes discarded outside of frames so far
    pub fn skipped_bytes(&self) -> usize {
        self.skipped
    }

    /// Whether a frame is currently partially assembled
    pub fn in_frame(&self) -> bool {
        matches!(self.state, DecodeState::InFrame | DecodeState::InFrameEscape)
    }

    /// Consume a chunk of bytes
    ///
    /// Returns every frame completed by this chunk, plus any framing faults
    /// hit along the way. A fault only affects the frame it occurred in.
    pub fn push(&mut self, chunk: &[u8]) -> (Vec<Vec<u8>>, Vec<FrameError>) {
        let mut frames = Vec::new();
        let mut errors = Vec::new();

        for &byte in chunk {
            match self.state {
                DecodeState::Idle => {
                    if byte == DLE {
                        self.state = DecodeState::IdleEscape;
                    } else {
                        self.skipped += 1;
                    }
                }
                DecodeState::IdleEscape => {
                    if byte == STX {
                        self.current.clear();
                        self.state = DecodeState::InFrame;
                    } else {
                        // A stuffed DLE pair from a dropped payload is data, not a marker
                        self.skipped += 2;
                        self.state = DecodeState::Idle;
                    }
                }
                DecodeState::InFrame => {
                    if byte == DLE {
                        self.state = DecodeState::InFrameEscape;
                    } else {
                        self.push_payload_byte(byte, &mut errors);
                    }
                }
                DecodeState::InFrameEscape => match byte {
                    DLE => {
                        self.state = DecodeState::InFrame;
                        self.push_payload_byte(DLE, &mut errors);
                    }
                    ETX => {
                        frames.push(std::mem::take(&mut self.current));
                        self.state = DecodeState::Idle;
                    }
                    STX => {
                        errors.push(FrameError::Restarted {
                            discarded: self.current.len(),
                        });
                        self.current.clear();
                        self.state = DecodeState::InFrame;
                    }
                    other => {
                        errors.push(FrameError::InvalidEscape(other));
                        self.current.clear();
                        self.state = DecodeState::Idle;
                    }
                },
            }
        }

        (frames, errors)
    }

    fn push_payload_byte(&mut self, byte: u8, errors: &mut Vec<FrameError>) {
        if self.current.len() >= self.max_len {
            errors.push(FrameError::TooLarge { max: self.max_len });
            self.current.clear();
            self.state = DecodeState::Idle;
            return;
        }
        self.current.push(byte);
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_plain_payload() {
        let framed = encode_frame(b"hello");
        assert_eq!(&framed[..2], &FRAME_BEGIN);
        assert_eq!(&framed[2..7], b"hello");
        assert_eq!(&framed[7..], &FRAME_END);
    }

    #[test]
    fn test_encode_escapes_dle() {
        let framed = encode_frame(&[1, DLE, 2]);
        assert_eq!(framed, vec![DLE, STX, 1, DLE, DLE, 2, DLE, ETX]);
    }

    #[test]
    fn test_decode_payload_containing_markers() {
        let payload = vec![DLE, ETX, 7, DLE, STX, DLE];
        let mut decoder = FrameDecoder::new();
        let (frames, errors) = decoder.push(&encode_frame(&payload));

        assert!(errors.is_empty());
        assert_eq!(frames, vec![payload]);
    }

    #[test]
    fn test_decode_split_across_reads() {
        let framed = encode_frame(&[DLE, 42, DLE]);
        let mut decoder = FrameDecoder::new();

        // Feed one byte at a time, including splits in the middle of escapes
        let mut frames = Vec::new();
        for byte in &framed {
            let (mut got, errors) = decoder.push(std::slice::from_ref(byte));
            assert!(errors.is_empty());
            frames.append(&mut got);
        }

        assert_eq!(frames, vec![vec![DLE, 42, DLE]]);
        assert!(!decoder.in_frame());
    }

    #[test]
    fn test_decode_multiple_frames_in_one_read() {
        let mut stream = encode_frame(b"first");
        stream.extend(encode_frame(b"second"));
        stream.extend(encode_frame(b""));

        let mut decoder = FrameDecoder::new();
        let (frames, errors) = decoder.push(&stream);

        assert!(errors.is_empty());
        assert_eq!(frames, vec![b"first".to_vec(), b"second".to_vec(), Vec::new()]);
    }

    #[test]
    fn test_garbage_between_frames_is_skipped() {
        let mut stream = b"noise".to_vec();
        stream.extend(encode_frame(b"ok"));
        stream.extend_from_slice(&[DLE, 0x55]);

        let mut decoder = FrameDecoder::new();
        let (frames, errors) = decoder.push(&stream);

        assert!(errors.is_empty());
        assert_eq!(frames, vec![b"ok".to_vec()]);
        assert_eq!(decoder.skipped_bytes(), 7);
    }

    #[test]
    fn test_stuffed_begin_in_dropped_payload_is_not_a_frame() {
        // Invalid escape drops the frame; the rest of its payload holds an
        // escaped DLE followed by STX
        let mut stream = vec![DLE, STX, 1, DLE, 0x7f, DLE, DLE, STX, b'x', DLE, ETX];
        stream.extend(encode_frame(b"next"));

        let mut decoder = FrameDecoder::new();
        let (frames, errors) = decoder.push(&stream);

        assert_eq!(errors, vec![FrameError::InvalidEscape(0x7f)]);
        assert_eq!(frames, vec![b"next".to_vec()]);
    }

    #[test]
    fn test_invalid_escape_drops_partial_frame() {
        let mut stream = vec![DLE, STX, 1, 2, DLE, 0x7f];
        stream.extend(encode_frame(b"next"));

        let mut decoder = FrameDecoder::new();
        let (frames, errors) = decoder.push(&stream);

        assert_eq!(errors, vec![FrameError::InvalidEscape(0x7f)]);
        assert_eq!(frames, vec![b"next".to_vec()]);
    }

    #[test]
    fn test_begin_marker_restarts_frame() {
        let mut stream = vec![DLE, STX, 9, 9, 9];
        stream.extend(encode_frame(b"fresh"));

        let mut decoder = FrameDecoder::new();
        let (frames, errors) = decoder.push(&stream);

        assert_eq!(errors, vec![FrameError::Restarted { discarded: 3 }]);
        assert_eq!(frames, vec![b"fresh".to_vec()]);
    }

    #[test]
    fn test_oversized_frame_is_dropped() {
        let mut stream = encode_frame(&[1u8; 16]);
        stream.extend(encode_frame(b"small"));

        let mut decoder = FrameDecoder::with_max_len(8);
        let (frames, errors) = decoder.push(&stream);

        assert_eq!(errors, vec![FrameError::TooLarge { max: 8 }]);
        assert_eq!(frames, vec![b"small".to_vec()]);
    }
}
