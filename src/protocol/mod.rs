//! Protocol definitions for the device serial link.
//!
//! This module contains the low-level protocol types including:
//! - Frame encoding/decoding with start/end markers
//! - Packet encoding and inbound classification

pub mod frame;
pub mod packet;

pub use frame::{
    DecoderState, FRAME_END, FRAME_START, FrameDecoder, MAX_FRAME_SIZE, encode as encode_frame,
};
pub use packet::{Inbound, classify, decode_payload, encode_packet};
