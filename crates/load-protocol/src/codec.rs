//! Data frames of the pull protocol.
//!
//! Every chunk is sent as a one-byte tag `D`, a 4-byte big-endian payload
//! length and the payload itself. A zero-length frame marks the end of a
//! session's data.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use sink_core::SinkError;
use tokio_util::codec::{Decoder, Encoder};

pub const DATA_TAG: u8 = b'D';
pub const HEADER_LEN: usize = 5;

/// The end-of-data marker: `D` followed by a zero length.
pub const SENTINEL: [u8; HEADER_LEN] = [DATA_TAG, 0, 0, 0, 0];

#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl Encoder<Bytes> for FrameCodec {
    type Error = SinkError;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = u32::try_from(payload.len()).map_err(|_| {
            SinkError::Protocol(format!("chunk of {} bytes exceeds frame size", payload.len()))
        })?;
        dst.reserve(HEADER_LEN + payload.len());
        dst.put_u8(DATA_TAG);
        dst.put_u32(len);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = SinkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        if src[0] != DATA_TAG {
            return Err(SinkError::Protocol(format!(
                "unexpected frame tag 0x{:02x}",
                src[0]
            )));
        }
        let len = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }
        src.advance(HEADER_LEN);
        Ok(Some(src.split_to(len).freeze()))
    }
}
