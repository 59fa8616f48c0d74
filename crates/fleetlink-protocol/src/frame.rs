//! Frame pipeline: Request <-> envelope bytes.
//!
//! Before identification the envelope is the plain JSON frame. Once a session
//! cipher exists: JSON -> gzip -> encrypt on the way out, and the reverse on
//! the way in.

use std::io::{Read, Write};

use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use fleetlink_crypto::Cipher;

use crate::request::Request;
use crate::{ProtocolError, MAX_ENVELOPE_BYTES};

pub fn compress(data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| ProtocolError::Compression(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| ProtocolError::Compression(e.to_string()))
}

/// Inflate a gzip body, refusing anything that grows past the envelope cap.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut inflated = Vec::new();
    GzDecoder::new(data)
        .take(MAX_ENVELOPE_BYTES as u64 + 1)
        .read_to_end(&mut inflated)
        .map_err(|e| {
            tracing::debug!(compressed = data.len(), "frame: gzip body rejected: {e}");
            ProtocolError::Compression(e.to_string())
        })?;
    if inflated.len() > MAX_ENVELOPE_BYTES {
        tracing::warn!(
            compressed = data.len(),
            max = MAX_ENVELOPE_BYTES,
            "frame: inflated body over the envelope cap"
        );
        return Err(ProtocolError::EnvelopeTooLarge {
            size: inflated.len(),
            max: MAX_ENVELOPE_BYTES,
        });
    }
    Ok(inflated)
}

/// True when `envelope` cannot be a plaintext frame: it does not open a JSON object.
pub fn looks_sealed(envelope: &[u8]) -> bool {
    envelope.iter().find(|b| !b.is_ascii_whitespace()) != Some(&b'{')
}

/// Turn a request into envelope bytes. `None` means plaintext (pre-identification).
pub fn seal(request: &Request, cipher: Option<&Cipher>) -> Result<Bytes, ProtocolError> {
    let json = request.to_json()?;
    match cipher {
        None => Ok(Bytes::from(json)),
        Some(cipher) => {
            let compressed = compress(&json)?;
            Ok(Bytes::from(cipher.encrypt(&compressed)?))
        }
    }
}

/// Turn envelope bytes back into a request.
pub fn open(envelope: &[u8], cipher: Option<&Cipher>) -> Result<Request, ProtocolError> {
    match cipher {
        None => Request::from_client(envelope),
        Some(cipher) => {
            let compressed = cipher.decrypt(envelope)?;
            let json = decompress(&compressed)?;
            Request::from_client(&json)
        }
    }
}
