use thiserror::Error;

/// Errors surfaced at the boundaries of the SDK: decryption, data-source
/// loading, and explicit cancellation. Evaluation itself never returns an
/// error; it always produces a structured `FeatureResult`/`ExperimentResult`
/// with a `source` explaining why.
#[derive(Error, Debug, Clone)]
pub enum GrowthBookError {
    #[error("encrypted payload is not in '<iv>.<ciphertext>' form")]
    InvalidEncryptedFormat,

    #[error("initialization vector has the wrong length for the cipher block size")]
    InvalidIvLength,

    #[error("PKCS#7 padding on decrypted payload is malformed")]
    InvalidPadding,

    #[error("base64 decoding failed: {0}")]
    Base64(String),

    #[error("decryption key has the wrong length for AES-256")]
    InvalidKeyLength,

    #[error("cannot install encrypted features without a decryption key")]
    NoDecryptionKey,

    #[error("http request failed: {0}")]
    Http(String),

    #[error("failed to parse feature payload: {0}")]
    Parse(String),

    #[error("operation was cancelled")]
    Cancelled,

    #[error("unsupported hash version: {0}")]
    InvalidHashVersion(i32),
}

impl From<serde_json::Error> for GrowthBookError {
    fn from(e: serde_json::Error) -> Self {
        GrowthBookError::Parse(e.to_string())
    }
}
