//! WeChat message encryption envelope
//!
//! Handles SHA1 signature verification and AES-256-CBC encryption/decryption
//! of callback messages.
//!
//! Plaintext frame: random(16) + msg_len(4, big-endian) + msg + app_id + padding
//!
//! Padding is PKCS#7 over a 32-byte block: `n` bytes of value `n`, with
//! `n` in `1..=32`. An aligned frame gets a full block.
//!
//! Encryption uses the first 16 bytes of the key as the CBC IV, as the
//! platform does. The random header is the first plaintext block, so it is
//! what makes two encryptions of the same message differ.
//!
//! On decrypt the first ciphertext block is used as the IV. In CBC only the
//! first plaintext block depends on the IV, and that block is the header,
//! which is discarded. Frames decode whichever IV the sender chose.

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::NoPadding};
use base64::Engine;
use base64::alphabet;
use base64::engine::general_purpose::{self, GeneralPurpose, GeneralPurposeConfig};
use rand::distr::Alphanumeric;
use rand::rngs::OsRng;
use rand::{Rng, TryRngCore};
use sha1::{Digest, Sha1};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::error::{EnvelopeError, EnvelopeResult};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Length of the EncodingAESKey as configured on the platform
pub const ENCODING_KEY_LEN: usize = 43;
/// Raw AES-256 key length
pub const AES_KEY_LEN: usize = 32;
/// AES block size, also the random header length
pub const BLOCK_SIZE: usize = 16;
/// Padding block size (not the cipher block size)
pub const PAD_BLOCK_SIZE: usize = 32;
/// Length of generated nonces
pub const NONCE_LEN: usize = 10;

const HEADER_LEN: usize = 16;
const LENGTH_FIELD_LEN: usize = 4;
const PAYLOAD_START: usize = HEADER_LEN + LENGTH_FIELD_LEN;

// The 43rd key character carries two spare bits that the platform does not zero.
const KEY_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_allow_trailing_bits(true),
);

// =============================================================================
// Key material
// =============================================================================

/// Raw 32-byte AES key derived from a 43-character EncodingAESKey
#[derive(Clone, PartialEq, Eq)]
pub struct AesKey([u8; AES_KEY_LEN]);

impl AesKey {
    /// Derive the key from the platform's EncodingAESKey
    ///
    /// The platform strips the trailing `=` from the base64 encoding of the
    /// 32 key bytes, leaving 43 characters. Add it back and decode.
    pub fn from_encoding_key(encoding_aes_key: &str) -> EnvelopeResult<Self> {
        let chars = encoding_aes_key.chars().count();
        if chars != ENCODING_KEY_LEN {
            return Err(EnvelopeError::InvalidKeyLength(chars));
        }

        let padded = format!("{}=", encoding_aes_key);
        let decoded = KEY_ENGINE
            .decode(&padded)
            .map_err(|e| EnvelopeError::KeyDecode(e.to_string()))?;

        let key: [u8; AES_KEY_LEN] = decoded.as_slice().try_into().map_err(|_| {
            EnvelopeError::KeyDecode(format!(
                "decoded to {} bytes, expected {}",
                decoded.len(),
                AES_KEY_LEN
            ))
        })?;

        Ok(Self(key))
    }

    pub fn from_bytes(bytes: [u8; AES_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; AES_KEY_LEN] {
        &self.0
    }

    /// IV used for encryption
    fn iv(&self) -> &[u8] {
        &self.0[..BLOCK_SIZE]
    }
}

impl std::fmt::Debug for AesKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AesKey(..)")
    }
}

// =============================================================================
// Envelope codec
// =============================================================================

/// Encrypt `plaintext` for `tenant_id` and return standard base64
pub fn encode(plaintext: &[u8], tenant_id: &str, key: &AesKey) -> EnvelopeResult<String> {
    let mut header = [0u8; HEADER_LEN];
    OsRng
        .try_fill_bytes(&mut header)
        .map_err(|e| EnvelopeError::Encrypt(format!("random source failed: {}", e)))?;

    let msg_len = u32::try_from(plaintext.len()).map_err(|_| {
        EnvelopeError::Encrypt(format!("payload too large: {} bytes", plaintext.len()))
    })?;

    let mut frame =
        Vec::with_capacity(PAYLOAD_START + plaintext.len() + tenant_id.len() + PAD_BLOCK_SIZE);
    frame.extend_from_slice(&header);
    frame.extend_from_slice(&msg_len.to_be_bytes());
    frame.extend_from_slice(plaintext);
    frame.extend_from_slice(tenant_id.as_bytes());
    pad(&mut frame);

    let frame_len = frame.len();
    let cipher = Aes256CbcEnc::new_from_slices(key.as_bytes(), key.iv())
        .map_err(|e| EnvelopeError::Encrypt(format!("cipher setup failed: {}", e)))?;
    let encrypted = cipher
        .encrypt_padded_mut::<NoPadding>(&mut frame, frame_len)
        .map_err(|_| EnvelopeError::Encrypt("frame is not block aligned".to_string()))?;

    Ok(general_purpose::STANDARD.encode(encrypted))
}

/// Decrypt a base64 ciphertext and split the frame into payload and tenant id
pub fn decode(ciphertext: &str, key: &AesKey) -> EnvelopeResult<(Vec<u8>, String)> {
    let mut buf = general_purpose::STANDARD.decode(ciphertext.trim())?;

    if buf.len() < BLOCK_SIZE || buf.len() % BLOCK_SIZE != 0 {
        return Err(EnvelopeError::MalformedCiphertext { len: buf.len() });
    }

    let mut iv = [0u8; BLOCK_SIZE];
    iv.copy_from_slice(&buf[..BLOCK_SIZE]);

    let len = buf.len();
    let cipher = Aes256CbcDec::new_from_slices(key.as_bytes(), &iv)
        .map_err(|e| EnvelopeError::KeyDecode(e.to_string()))?;
    cipher
        .decrypt_padded_mut::<NoPadding>(&mut buf)
        .map_err(|_| EnvelopeError::MalformedCiphertext { len })?;

    let pad_start = unpad_len(&buf)?;
    let (payload, tenant) = split_frame(&buf[..pad_start])?;

    let tenant_id = String::from_utf8(tenant.to_vec()).map_err(|_| EnvelopeError::InvalidTenantId)?;

    Ok((payload.to_vec(), tenant_id))
}

/// Append PKCS#7 padding over `PAD_BLOCK_SIZE`
fn pad(frame: &mut Vec<u8>) {
    let n = PAD_BLOCK_SIZE - frame.len() % PAD_BLOCK_SIZE;
    frame.resize(frame.len() + n, n as u8);
}

/// Return the offset where padding starts
fn unpad_len(buf: &[u8]) -> EnvelopeResult<usize> {
    let n = buf.last().copied().unwrap_or(0) as usize;
    if n == 0 || n > PAD_BLOCK_SIZE || n > buf.len() {
        return Err(EnvelopeError::InvalidPadding(n));
    }
    Ok(buf.len() - n)
}

/// Split an unpadded frame into (payload, tenant id bytes)
fn split_frame(frame: &[u8]) -> EnvelopeResult<(&[u8], &[u8])> {
    if frame.len() < PAYLOAD_START {
        return Err(EnvelopeError::InvalidFrameLength {
            needed: PAYLOAD_START,
            available: frame.len(),
        });
    }

    let mut len_bytes = [0u8; LENGTH_FIELD_LEN];
    len_bytes.copy_from_slice(&frame[HEADER_LEN..PAYLOAD_START]);
    let msg_len = u32::from_be_bytes(len_bytes) as usize;

    let payload_end = PAYLOAD_START.saturating_add(msg_len);
    if payload_end > frame.len() {
        return Err(EnvelopeError::InvalidFrameLength {
            needed: payload_end,
            available: frame.len(),
        });
    }

    Ok((&frame[PAYLOAD_START..payload_end], &frame[payload_end..]))
}

// =============================================================================
// Signatures
// =============================================================================

/// Generate signature
///
/// signature = SHA1(sort(token, timestamp, nonce[, ciphertext])), lowercase hex.
/// Empty inputs are skipped, so an empty `ciphertext` yields the plain URL
/// signature used for endpoint verification.
pub fn sign(token: &str, timestamp: &str, nonce: &str, ciphertext: &str) -> String {
    let mut parts: Vec<&str> = [token, timestamp, nonce, ciphertext]
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect();
    parts.sort_unstable();

    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Verify a signature in constant time
pub fn verify_signature(
    expected: &str,
    token: &str,
    timestamp: &str,
    nonce: &str,
    ciphertext: &str,
) -> bool {
    let computed = sign(token, timestamp, nonce, ciphertext);
    computed.len() == expected.len() && bool::from(computed.as_bytes().ct_eq(expected.as_bytes()))
}

/// Random alphanumeric nonce for outbound envelopes
pub fn random_nonce() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(NONCE_LEN)
        .map(char::from)
        .collect()
}

// =============================================================================
// Keyed handler with rotation
// =============================================================================

/// Which configured key decrypted a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySlot {
    Primary,
    Rotated,
}

/// Decrypted callback payload
#[derive(Debug, Clone)]
pub struct Decrypted {
    pub payload: Vec<u8>,
    pub slot: KeySlot,
}

/// WeChat cryptographic handler
///
/// Holds the current key, an optional previous key still accepted during
/// rotation, and the AppID every frame must carry.
#[derive(Clone)]
pub struct WechatCrypto {
    app_id: String,
    primary: AesKey,
    rotated: Option<AesKey>,
}

impl WechatCrypto {
    /// Create from 43-character EncodingAESKey and AppID
    pub fn new(encoding_aes_key: &str, app_id: &str) -> EnvelopeResult<Self> {
        Ok(Self {
            app_id: app_id.to_string(),
            primary: AesKey::from_encoding_key(encoding_aes_key)?,
            rotated: None,
        })
    }

    /// Also accept messages encrypted with the previous EncodingAESKey
    pub fn with_rotated_key(mut self, old_encoding_aes_key: &str) -> EnvelopeResult<Self> {
        self.rotated = Some(AesKey::from_encoding_key(old_encoding_aes_key)?);
        Ok(self)
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn has_rotated_key(&self) -> bool {
        self.rotated.is_some()
    }

    /// Encrypt with the primary key
    pub fn encrypt(&self, plaintext: &[u8]) -> EnvelopeResult<String> {
        self.encrypt_with(KeySlot::Primary, plaintext)
    }

    /// Encrypt with the key in `slot`, falling back to the primary key
    pub fn encrypt_with(&self, slot: KeySlot, plaintext: &[u8]) -> EnvelopeResult<String> {
        let key = match (slot, &self.rotated) {
            (KeySlot::Rotated, Some(rotated)) => rotated,
            _ => &self.primary,
        };
        encode(plaintext, &self.app_id, key)
    }

    /// Decrypt a message, trying the rotated key once if the primary key fails
    pub fn decrypt(&self, ciphertext: &str) -> EnvelopeResult<Decrypted> {
        let err = match self.decrypt_with(&self.primary, ciphertext) {
            Ok(payload) => {
                return Ok(Decrypted {
                    payload,
                    slot: KeySlot::Primary,
                });
            }
            Err(e) => e,
        };

        let Some(rotated) = &self.rotated else {
            return Err(err);
        };
        if !err.is_key_related() {
            return Err(err);
        }

        warn!("Decrypt with current key failed ({}), trying previous key", err);
        match self.decrypt_with(rotated, ciphertext) {
            Ok(payload) => {
                debug!("Message decrypted with previous key");
                Ok(Decrypted {
                    payload,
                    slot: KeySlot::Rotated,
                })
            }
            Err(rotated_err) => {
                warn!("Decrypt with previous key failed: {}", rotated_err);
                Err(err)
            }
        }
    }

    fn decrypt_with(&self, key: &AesKey, ciphertext: &str) -> EnvelopeResult<Vec<u8>> {
        let (payload, tenant_id) = decode(ciphertext, key)?;
        if tenant_id != self.app_id {
            return Err(EnvelopeError::TenantMismatch {
                expected: self.app_id.clone(),
                actual: tenant_id,
            });
        }
        Ok(payload)
    }
}

impl std::fmt::Debug for WechatCrypto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WechatCrypto")
            .field("app_id", &self.app_id)
            .field("rotated", &self.rotated.is_some())
            .finish()
    }
}
