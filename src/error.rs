use thiserror::Error;

/// Rejections raised while validating secret configuration or secret
/// material, surfaced at construction time and never coerced.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("digits must be 6 or 8, got {0}")]
    Digits(u32),
    #[error("period must be within 15..=60 seconds, got {0}")]
    Period(u32),
    #[error("secret must be 3..=128 Base32 characters, got {0}")]
    SecretLength(usize),
    #[error("secret contains characters outside the Base32 alphabet")]
    SecretAlphabet,
    #[error("secret length {0} cannot be decoded as unpadded Base32")]
    SecretUndecodable(usize),
    #[error("unknown mode: {0}")]
    Mode(String),
    #[error("unknown algorithm: {0}")]
    Algo(String),
}
