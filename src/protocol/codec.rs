//! Frame codec for the management channel.
//!
//! Each frame is a 4-byte big-endian length prefix followed by one JSON
//! encoded [`Frame`].

use crate::protocol::models::Frame;
use crate::GatesyncError;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Largest frame accepted from the peer.
pub const MAX_FRAME_LENGTH: usize = 64 * 1024;

/// A stream wrapped in the management frame codec.
pub type FramedStream<S> = Framed<S, LengthDelimitedCodec>;

/// Build the length-delimited codec used on the wire.
pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

/// Wrap a byte stream in the frame codec.
pub fn framed<S: AsyncRead + AsyncWrite>(stream: S) -> FramedStream<S> {
    Framed::new(stream, frame_codec())
}

/// Serialize a frame body.
pub fn encode_frame(frame: &Frame) -> Result<Bytes, GatesyncError> {
    serde_json::to_vec(frame)
        .map(Bytes::from)
        .map_err(|e| GatesyncError::ProtocolError(format!("Failed to encode frame: {}", e)))
}

/// Parse a frame body.
pub fn decode_frame(body: &[u8]) -> Result<Frame, GatesyncError> {
    serde_json::from_slice(body)
        .map_err(|e| GatesyncError::ProtocolError(format!("Failed to decode frame: {}", e)))
}
