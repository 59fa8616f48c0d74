//! Length-delimited envelope codec for TCP streams.
//!
//! Wire format: 4-byte big-endian length prefix + envelope bytes. The codec
//! does not look inside the envelope; sealing and parsing live in `frame`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{ProtocolError, MAX_ENVELOPE_BYTES};

/// Length prefix size in bytes.
const LENGTH_PREFIX_SIZE: usize = 4;

/// Codec for framing envelopes over a byte stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvelopeCodec;

impl Decoder for EnvelopeCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        // Peek at the length
        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

        if length > MAX_ENVELOPE_BYTES {
            tracing::warn!(size = length, max = MAX_ENVELOPE_BYTES, "codec: oversized envelope prefix");
            return Err(ProtocolError::EnvelopeTooLarge {
                size: length,
                max: MAX_ENVELOPE_BYTES,
            });
        }

        let total = LENGTH_PREFIX_SIZE + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_SIZE);
        Ok(Some(src.split_to(length).freeze()))
    }
}

impl Encoder<Bytes> for EnvelopeCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > MAX_ENVELOPE_BYTES {
            return Err(ProtocolError::EnvelopeTooLarge {
                size: item.len(),
                max: MAX_ENVELOPE_BYTES,
            });
        }

        dst.reserve(LENGTH_PREFIX_SIZE + item.len());
        dst.put_u32(item.len() as u32);
        dst.extend_from_slice(&item);

        Ok(())
    }
}
