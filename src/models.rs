//! Data model for OTP secrets and their scratch codes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgRow, FromRow, Row};
use uuid::Uuid;

use crate::error::ValidationError;

/// Default number of digits per OTP.
pub const DEFAULT_DIGITS: u32 = 6;
/// Allowed OTP sizes.
pub const ALLOWED_DIGITS: [u32; 2] = [6, 8];
/// Default period for time based OTPs, seconds.
pub const DEFAULT_PERIOD: u32 = 30;
/// Allowed period range for time based OTPs, seconds.
pub const ALLOWED_PERIODS: std::ops::RangeInclusive<u32> = 15..=60;
/// Digits in a scratch code.
pub const SCRATCH_LENGTH: usize = 8;
/// Default number of scratch codes per batch.
pub const DEFAULT_SCRATCH_COUNT: usize = 5;

/// OTP mode of operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Totp,
    Hotp,
}

impl Mode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Totp => "totp",
            Self::Hotp => "hotp",
        }
    }

    /// Parse the persisted `mode` textual value into a typed enum.
    fn from_db(value: &str) -> Result<Self, sqlx::Error> {
        match value {
            "totp" => Ok(Self::Totp),
            "hotp" => Ok(Self::Hotp),
            _ => Err(sqlx::Error::Decode(Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid mode value: {value}"),
            )))),
        }
    }
}

impl std::str::FromStr for Mode {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "totp" => Ok(Self::Totp),
            "hotp" => Ok(Self::Hotp),
            other => Err(ValidationError::Mode(other.to_string())),
        }
    }
}

/// Hash algorithm used to derive OTPs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Algo {
    Sha1,
    Sha256,
    Sha512,
}

impl Algo {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sha1 => "SHA1",
            Self::Sha256 => "SHA256",
            Self::Sha512 => "SHA512",
        }
    }

    fn from_db(value: &str) -> Result<Self, sqlx::Error> {
        match value {
            "SHA1" => Ok(Self::Sha1),
            "SHA256" => Ok(Self::Sha256),
            "SHA512" => Ok(Self::Sha512),
            _ => Err(sqlx::Error::Decode(Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid algo value: {value}"),
            )))),
        }
    }
}

impl std::str::FromStr for Algo {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SHA1" => Ok(Self::Sha1),
            "SHA256" => Ok(Self::Sha256),
            "SHA512" => Ok(Self::Sha512),
            other => Err(ValidationError::Algo(other.to_string())),
        }
    }
}

/// Validated per-secret configuration.
///
/// Constructed through [`SecretConfig::new`], which rejects out-of-range
/// values up front; no partially validated value is ever observable.
/// Deserialization funnels through the same constructor, so a config file
/// with out-of-range digits or period fails to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawSecretConfig")]
pub struct SecretConfig {
    digits: u32,
    mode: Mode,
    algo: Algo,
    period: u32,
}

/// Unvalidated mirror of [`SecretConfig`] used as the deserialization
/// input; missing fields fall back to the defaults.
#[derive(Deserialize)]
#[serde(default)]
struct RawSecretConfig {
    digits: u32,
    mode: Mode,
    algo: Algo,
    period: u32,
}

impl Default for RawSecretConfig {
    fn default() -> Self {
        Self {
            digits: DEFAULT_DIGITS,
            mode: Mode::Totp,
            algo: Algo::Sha1,
            period: DEFAULT_PERIOD,
        }
    }
}

impl TryFrom<RawSecretConfig> for SecretConfig {
    type Error = ValidationError;

    fn try_from(raw: RawSecretConfig) -> Result<Self, Self::Error> {
        Self::new(raw.digits, raw.mode, raw.algo, raw.period)
    }
}

impl SecretConfig {
    /// Validates and builds a secret configuration.
    ///
    /// # Errors
    /// Returns a [`ValidationError`] when digits are not 6 or 8, or the
    /// period falls outside 15..=60 seconds.
    pub fn new(digits: u32, mode: Mode, algo: Algo, period: u32) -> Result<Self, ValidationError> {
        if !ALLOWED_DIGITS.contains(&digits) {
            return Err(ValidationError::Digits(digits));
        }
        if !ALLOWED_PERIODS.contains(&period) {
            return Err(ValidationError::Period(period));
        }
        Ok(Self {
            digits,
            mode,
            algo,
            period,
        })
    }

    #[must_use]
    pub const fn digits(&self) -> u32 {
        self.digits
    }

    #[must_use]
    pub const fn mode(&self) -> Mode {
        self.mode
    }

    #[must_use]
    pub const fn algo(&self) -> Algo {
        self.algo
    }

    #[must_use]
    pub const fn period(&self) -> u32 {
        self.period
    }
}

impl Default for SecretConfig {
    fn default() -> Self {
        Self {
            digits: DEFAULT_DIGITS,
            mode: Mode::Totp,
            algo: Algo::Sha1,
            period: DEFAULT_PERIOD,
        }
    }
}

/// Checks that a Base32-encoded secret is 3..=128 characters of the
/// `[A-Z2-7]` alphabet, case-insensitive, with a length that unpadded
/// Base32 can actually decode.
///
/// # Errors
/// Returns a [`ValidationError`] describing the first violated rule.
pub fn validate_secret_base32(secret: &str) -> Result<(), ValidationError> {
    if !(3..=128).contains(&secret.len()) {
        return Err(ValidationError::SecretLength(secret.len()));
    }
    // Unpadded Base32 never produces lengths of 1, 3 or 6 mod 8; such a
    // secret would fail to decode at generate/verify time.
    if matches!(secret.len() % 8, 1 | 3 | 6) {
        return Err(ValidationError::SecretUndecodable(secret.len()));
    }
    let valid = secret
        .bytes()
        .all(|b| b.is_ascii_alphabetic() || (b'2'..=b'7').contains(&b));
    if !valid {
        return Err(ValidationError::SecretAlphabet);
    }
    Ok(())
}

/// A secret row as persisted; field types mirror the schema.
#[derive(Debug, Clone)]
pub struct SecretRecord {
    pub secret_id: Uuid,
    /// Base32-encoded shared secret.
    pub secret: String,
    pub digits: i16,
    pub mode: Mode,
    pub algo: Algo,
    pub period: i16,
    /// HOTP moving factor; starts at 1, meaningless for TOTP rows.
    pub counter: i64,
    pub confirmed: bool,
    pub created_at: DateTime<Utc>,
    /// Changes only on confirmation or counter advancement.
    pub updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for SecretRecord {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let mode: String = row.try_get("mode")?;
        let algo: String = row.try_get("algo")?;
        Ok(Self {
            secret_id: row.try_get("secret_id")?,
            secret: row.try_get("secret")?,
            digits: row.try_get("digits")?,
            mode: Mode::from_db(&mode)?,
            algo: Algo::from_db(&algo)?,
            period: row.try_get("period")?,
            counter: row.try_get("counter")?,
            confirmed: row.try_get("confirmed")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Payload for creating a secret; always persisted unconfirmed.
#[derive(Debug, Clone)]
pub struct NewSecret {
    pub secret: String,
    pub config: SecretConfig,
}

impl NewSecret {
    /// Builds a creation payload, validating the secret material.
    ///
    /// # Errors
    /// Returns a [`ValidationError`] when the secret is not a well-formed
    /// Base32 string.
    pub fn new(secret: String, config: SecretConfig) -> Result<Self, ValidationError> {
        validate_secret_base32(&secret)?;
        Ok(Self { secret, config })
    }
}

/// A single-use recovery code bound to a secret.
#[derive(Debug, Clone, FromRow)]
pub struct ScratchCode {
    pub scratch_id: Uuid,
    pub secret_id: Uuid,
    /// Fixed-length string of decimal digits.
    pub code: String,
}
