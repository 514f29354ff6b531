//! Length-prefixed framing of [`ProxyMessage`]s
//!
//! A frame is a big-endian `u32` body length followed by the bincode body.

use crate::messages::ProxyMessage;
use crate::MAX_FRAME_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Framing errors; any of them poisons the connection that produced it
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Malformed frame body: {0}")]
    Body(#[from] bincode::Error),

    #[error("Frame of {0} bytes exceeds the 16 MiB limit")]
    FrameTooLarge(usize),
}

/// Stateless frame encoder/decoder
pub struct ProxyCodec;

impl ProxyCodec {
    pub const MAX_MESSAGE_SIZE: usize = MAX_FRAME_SIZE as usize;

    const PREFIX: usize = std::mem::size_of::<u32>();

    pub fn encode(msg: &ProxyMessage) -> Result<Bytes, CodecError> {
        let body_len = bincode::serialized_size(msg)? as usize;
        Self::check_len(body_len)?;

        let mut frame = BytesMut::with_capacity(Self::PREFIX + body_len).writer();
        frame.get_mut().put_u32(body_len as u32);
        bincode::serialize_into(&mut frame, msg)?;
        Ok(frame.into_inner().freeze())
    }

    /// Take one complete frame off the front of `buf`
    ///
    /// Leaves `buf` untouched and returns `Ok(None)` while the frame is
    /// still partial.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<ProxyMessage>, CodecError> {
        let Some(mut prefix) = buf.get(..Self::PREFIX) else {
            return Ok(None);
        };
        let body_len = prefix.get_u32() as usize;
        Self::check_len(body_len)?;

        let frame_len = Self::PREFIX + body_len;
        if buf.len() < frame_len {
            buf.reserve(frame_len - buf.len());
            return Ok(None);
        }

        let frame = buf.split_to(frame_len);
        Ok(Some(bincode::deserialize(&frame[Self::PREFIX..])?))
    }

    fn check_len(body_len: usize) -> Result<(), CodecError> {
        if body_len > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::FrameTooLarge(body_len));
        }
        Ok(())
    }
}
