//! Frame encoding and decoding for the device serial link.
//!
//! The wire format brackets each packet between two reserved ASCII markers:
//! ```text
//! ┌──────────┬──────────────────────┬──────────┐
//! │   '@'    │   packet text        │   '#'    │
//! │  1 byte  │  never '@' or '#'    │  1 byte  │
//! └──────────┴──────────────────────┴──────────┘
//! ```
//!
//! Reads arrive in arbitrary chunks. The decoder keeps at most one partial
//! frame; a new start marker always supersedes an unfinished one, so a
//! device that restarts mid-frame cannot poison the next message.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::FrameError;

/// Start-of-frame marker.
pub const FRAME_START: u8 = b'@';

/// End-of-frame marker.
pub const FRAME_END: u8 = b'#';

/// Maximum frame payload size.
pub const MAX_FRAME_SIZE: usize = 4096;

/// Encodes a payload into a framed message.
///
/// # Errors
///
/// Returns a `FrameError` if the payload contains a reserved marker or
/// exceeds `MAX_FRAME_SIZE`.
pub fn encode(payload: &[u8]) -> Result<Bytes, FrameError> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge {
            size: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    if let Some(offset) = payload
        .iter()
        .position(|&b| b == FRAME_START || b == FRAME_END)
    {
        return Err(FrameError::ReservedByte {
            byte: payload[offset],
            offset,
        });
    }

    let mut buf = BytesMut::with_capacity(payload.len() + 2);
    buf.put_u8(FRAME_START);
    buf.put_slice(payload);
    buf.put_u8(FRAME_END);
    Ok(buf.freeze())
}

/// Decoder state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DecoderState {
    /// No partial frame buffered.
    #[default]
    Idle,
    /// Start marker seen, buffering payload until the end marker.
    Accumulating,
}

/// Frame decoder that handles partial data.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    state: DecoderState,
    buffer: BytesMut,
}

impl FrameDecoder {
    /// Creates a new frame decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk into the decoder and returns every payload it completes,
    /// in arrival order.
    ///
    /// Bytes outside a frame are ignored. A payload that would exceed
    /// `MAX_FRAME_SIZE` is dropped and the decoder returns to idle.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Bytes> {
        let mut frames = Vec::new();
        let mut cursor = 0;

        while cursor < data.len() {
            let rest = &data[cursor..];
            match self.state {
                DecoderState::Idle => {
                    let Some(start) = rest.iter().position(|&b| b == FRAME_START) else {
                        tracing::trace!("skipping {} bytes outside a frame", rest.len());
                        break;
                    };
                    if start > 0 {
                        tracing::trace!("skipping {} bytes outside a frame", start);
                    }
                    self.begin();
                    cursor += start + 1;
                }
                DecoderState::Accumulating => {
                    let Some(marker) = rest
                        .iter()
                        .position(|&b| b == FRAME_START || b == FRAME_END)
                    else {
                        self.append(rest);
                        break;
                    };
                    self.append(&rest[..marker]);
                    cursor += marker + 1;

                    if rest[marker] == FRAME_START {
                        if !self.buffer.is_empty() {
                            tracing::debug!(
                                "discarding {} byte partial frame superseded by new start",
                                self.buffer.len()
                            );
                        }
                        self.begin();
                    } else if self.state == DecoderState::Accumulating {
                        frames.push(self.buffer.split().freeze());
                        self.state = DecoderState::Idle;
                    }
                }
            }
        }

        frames
    }

    fn begin(&mut self) {
        self.buffer.clear();
        self.state = DecoderState::Accumulating;
    }

    fn append(&mut self, bytes: &[u8]) {
        if self.state != DecoderState::Accumulating {
            return;
        }
        if self.buffer.len() + bytes.len() > MAX_FRAME_SIZE {
            tracing::warn!(
                "{}",
                FrameError::TooLarge {
                    size: self.buffer.len() + bytes.len(),
                    max: MAX_FRAME_SIZE,
                }
            );
            self.clear();
            return;
        }
        self.buffer.extend_from_slice(bytes);
    }

    /// Returns the current state.
    #[must_use]
    pub const fn state(&self) -> DecoderState {
        self.state
    }

    /// Returns the number of bytes currently buffered.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Discards any partial frame.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = DecoderState::Idle;
    }
}
