use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("buffer too short: expected {expected}, got {actual}")]
    BufferTooShort { expected: usize, actual: usize },
    #[error("unsupported RTP version: {0}")]
    UnsupportedVersion(u8),
    #[error("secret key must be 32 bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("unsupported encryption mode: {0}")]
    UnsupportedMode(String),
    #[error("ip discovery: {0}")]
    Discovery(String),
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed (authentication error)")]
    DecryptionFailed,
}
