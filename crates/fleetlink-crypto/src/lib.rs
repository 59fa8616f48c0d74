//! Fleetlink Crypto -- AES-256-GCM envelopes with an interleaved nonce.
//!
//! Envelope layout (before interleaving): ciphertext || 16-byte auth tag.
//! The 12 nonce bytes are then inserted at the agreed offsets, all of which
//! fall inside the first 31 bytes of the envelope, so the nonce never travels
//! as a contiguous block. The session id is bound in as AAD.

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};

pub const KEY_LENGTH: usize = 32;
pub const NONCE_LENGTH: usize = NONCE_LEN;
pub const TAG_LENGTH: usize = 16;

/// Offsets are drawn from the first 31 bytes of the envelope.
pub const OFFSET_WINDOW: u8 = 31;

/// Layout both sides agree on until the handshake rotates it.
const DEFAULT_OFFSETS: [u8; NONCE_LENGTH] = [1, 3, 4, 7, 9, 12, 15, 17, 20, 24, 27, 30];

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid key: expected {KEY_LENGTH} bytes, got {0}")]
    InvalidKey(usize),
    #[error("invalid key encoding: {0}")]
    KeyEncoding(#[from] hex::FromHexError),
    #[error("invalid nonce layout: {0}")]
    InvalidLayout(String),
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("decryption failed")]
    DecryptionFailed,
}

/// Positions of the nonce bytes inside an envelope.
///
/// Exactly [`NONCE_LENGTH`] strictly increasing offsets, each below
/// [`OFFSET_WINDOW`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<u8>", into = "Vec<u8>")]
pub struct NonceLayout([u8; NONCE_LENGTH]);

impl NonceLayout {
    pub fn new(offsets: &[u8]) -> Result<Self, CryptoError> {
        if offsets.len() != NONCE_LENGTH {
            return Err(CryptoError::InvalidLayout(format!(
                "expected {NONCE_LENGTH} offsets, got {}",
                offsets.len()
            )));
        }
        if let Some(bad) = offsets.iter().find(|o| **o >= OFFSET_WINDOW) {
            return Err(CryptoError::InvalidLayout(format!(
                "offset {bad} outside the first {OFFSET_WINDOW} bytes"
            )));
        }
        if offsets.windows(2).any(|w| w[0] >= w[1]) {
            return Err(CryptoError::InvalidLayout(
                "offsets must be strictly increasing".into(),
            ));
        }
        let mut layout = [0u8; NONCE_LENGTH];
        layout.copy_from_slice(offsets);
        Ok(Self(layout))
    }

    /// Draw a fresh layout (used when the handshake rotates offsets).
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        let mut picked: Vec<u8> =
            rand::seq::index::sample(&mut rng, OFFSET_WINDOW as usize, NONCE_LENGTH)
                .into_iter()
                .map(|i| i as u8)
                .collect();
        picked.sort_unstable();
        let mut layout = [0u8; NONCE_LENGTH];
        layout.copy_from_slice(&picked);
        Self(layout)
    }

    pub fn offsets(&self) -> &[u8] {
        &self.0
    }

    /// Final position of nonce byte `i` in an envelope whose body
    /// (ciphertext || tag) is `body_len` bytes long.
    ///
    /// Short bodies cannot reach the high offsets, so those bytes are
    /// appended instead; both directions compute the same clamp.
    fn position(&self, i: usize, body_len: usize) -> usize {
        (self.0[i] as usize).min(body_len + i)
    }
}

impl Default for NonceLayout {
    fn default() -> Self {
        Self(DEFAULT_OFFSETS)
    }
}

impl TryFrom<Vec<u8>> for NonceLayout {
    type Error = CryptoError;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<NonceLayout> for Vec<u8> {
    fn from(layout: NonceLayout) -> Self {
        layout.0.to_vec()
    }
}

/// Per-session AES-256-GCM cipher.
pub struct Cipher {
    key: LessSafeKey,
    session_id: String,
    layout: NonceLayout,
    rng: SystemRandom,
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cipher")
            .field("session_id", &self.session_id)
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

impl Cipher {
    pub fn new(key: &[u8], session_id: &str, layout: NonceLayout) -> Result<Self, CryptoError> {
        if key.len() != KEY_LENGTH {
            return Err(CryptoError::InvalidKey(key.len()));
        }
        let unbound =
            UnboundKey::new(&AES_256_GCM, key).map_err(|_| CryptoError::InvalidKey(key.len()))?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            session_id: session_id.to_string(),
            layout,
            rng: SystemRandom::new(),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn layout(&self) -> NonceLayout {
        self.layout
    }

    /// Same key and session, different nonce layout.
    pub fn with_layout(&self, layout: NonceLayout) -> Self {
        Self {
            key: self.key.clone(),
            session_id: self.session_id.clone(),
            layout,
            rng: SystemRandom::new(),
        }
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_LENGTH];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| CryptoError::EncryptionFailed("RNG failure".into()))?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        // ring appends the tag, giving ciphertext || tag
        let mut envelope = Vec::with_capacity(plaintext.len() + TAG_LENGTH + NONCE_LENGTH);
        envelope.extend_from_slice(plaintext);
        self.key
            .seal_in_place_append_tag(nonce, Aad::from(self.session_id.as_bytes()), &mut envelope)
            .map_err(|_| CryptoError::EncryptionFailed("seal failed".into()))?;

        let body_len = envelope.len();
        for (i, byte) in nonce_bytes.iter().enumerate() {
            envelope.insert(self.layout.position(i, body_len), *byte);
        }
        Ok(envelope)
    }

    pub fn decrypt(&self, envelope: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if envelope.len() < NONCE_LENGTH + TAG_LENGTH {
            return Err(CryptoError::DecryptionFailed);
        }
        let body_len = envelope.len() - NONCE_LENGTH;

        let mut body = envelope.to_vec();
        let mut nonce_bytes = [0u8; NONCE_LENGTH];
        for i in (0..NONCE_LENGTH).rev() {
            nonce_bytes[i] = body.remove(self.layout.position(i, body_len));
        }

        let nonce = Nonce::try_assume_unique_for_key(&nonce_bytes)
            .map_err(|_| CryptoError::DecryptionFailed)?;
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::from(self.session_id.as_bytes()), &mut body)
            .map_err(|_| CryptoError::DecryptionFailed)?;

        Ok(plaintext.to_vec())
    }
}

/// Generate a random 32-byte shared key.
pub fn generate_key() -> [u8; KEY_LENGTH] {
    let rng = SystemRandom::new();
    let mut key = [0u8; KEY_LENGTH];
    rng.fill(&mut key).expect("system RNG failure");
    key
}

/// Parse a hex-encoded shared key from configuration.
pub fn key_from_hex(encoded: &str) -> Result<[u8; KEY_LENGTH], CryptoError> {
    let bytes = hex::decode(encoded.trim())?;
    if bytes.len() != KEY_LENGTH {
        return Err(CryptoError::InvalidKey(bytes.len()));
    }
    let mut key = [0u8; KEY_LENGTH];
    key.copy_from_slice(&bytes);
    Ok(key)
}
