//! Error types for the envelope codec and callback handling

/// Envelope and callback error type
///
/// Decode-time failures each get their own variant so callers can tell a
/// wrong key (worth one retry with the rotated key) from garbage input.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("EncodingAESKey must be 43 characters, got {0}")]
    InvalidKeyLength(usize),

    #[error("Failed to decode EncodingAESKey: {0}")]
    KeyDecode(String),

    #[error("Signature mismatch")]
    SignatureMismatch,

    #[error("Failed to base64 decode ciphertext: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("Malformed ciphertext: {len} bytes is not a positive multiple of the block size")]
    MalformedCiphertext { len: usize },

    #[error("Invalid padding length {0}")]
    InvalidPadding(usize),

    #[error("Invalid frame length: payload needs {needed} bytes, frame holds {available}")]
    InvalidFrameLength { needed: usize, available: usize },

    #[error("Tenant id in frame is not valid UTF-8")]
    InvalidTenantId,

    #[error("Tenant id mismatch: expected '{expected}', got '{actual}'")]
    TenantMismatch { expected: String, actual: String },

    #[error("Encryption failed: {0}")]
    Encrypt(String),

    #[error("XML error: {0}")]
    Xml(#[from] serde_xml_rs::Error),
}

impl EnvelopeError {
    /// Whether a retry with another key could plausibly succeed
    pub fn is_key_related(&self) -> bool {
        matches!(
            self,
            Self::InvalidPadding(_)
                | Self::InvalidFrameLength { .. }
                | Self::InvalidTenantId
                | Self::TenantMismatch { .. }
        )
    }
}

/// Result type for envelope operations
pub type EnvelopeResult<T> = Result<T, EnvelopeError>;
