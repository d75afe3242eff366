//! HOTP/TOTP code generation and slip-window verification.
//!
//! RFC 4226 dynamic truncation over HMAC-SHA1/SHA256/SHA512. The moving
//! factor is supplied by the caller: a time-window index for TOTP, a stored
//! counter for HOTP.

use data_encoding::BASE32_NOPAD;
use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, Rng, RngCore};
use sha1::Sha1;
use sha2::{Sha256, Sha512};

use crate::models::Algo;

type HmacSha1 = Hmac<Sha1>;
type HmacSha256 = Hmac<Sha256>;
type HmacSha512 = Hmac<Sha512>;

/// Raw length of generated shared secrets, bytes.
pub const SECRET_BYTES: usize = 20;

/// Generates a fresh random shared secret, Base32-encoded without padding.
#[must_use]
pub fn generate_secret_base32() -> String {
    let mut raw = [0u8; SECRET_BYTES];
    OsRng.fill_bytes(&mut raw);
    BASE32_NOPAD.encode(&raw)
}

/// Decodes a stored Base32 secret, case-insensitive, no padding.
#[must_use]
pub fn decode_secret(secret: &str) -> Option<Vec<u8>> {
    BASE32_NOPAD
        .decode(secret.to_ascii_uppercase().as_bytes())
        .ok()
}

/// Generates a uniformly random string of `len` decimal digits.
#[must_use]
pub fn random_digits(len: usize) -> String {
    let mut rng = OsRng;
    (0..len)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect()
}

fn hmac_bytes(secret: &[u8], algo: Algo, moving_factor: u64) -> Vec<u8> {
    let msg = moving_factor.to_be_bytes();
    // HMAC accepts keys of any length, new_from_slice cannot fail.
    match algo {
        Algo::Sha1 => {
            let mut mac = HmacSha1::new_from_slice(secret).expect("HMAC key of any length");
            mac.update(&msg);
            mac.finalize().into_bytes().to_vec()
        }
        Algo::Sha256 => {
            let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC key of any length");
            mac.update(&msg);
            mac.finalize().into_bytes().to_vec()
        }
        Algo::Sha512 => {
            let mut mac = HmacSha512::new_from_slice(secret).expect("HMAC key of any length");
            mac.update(&msg);
            mac.finalize().into_bytes().to_vec()
        }
    }
}

/// Computes the OTP for one exact moving factor.
#[must_use]
pub fn code(secret: &[u8], digits: u32, algo: Algo, moving_factor: u64) -> String {
    let mac = hmac_bytes(secret, algo, moving_factor);
    let offset = usize::from(mac[mac.len() - 1] & 0x0f);
    let bin = (u32::from(mac[offset] & 0x7f) << 24)
        | (u32::from(mac[offset + 1]) << 16)
        | (u32::from(mac[offset + 2]) << 8)
        | u32::from(mac[offset + 3]);
    let code = u64::from(bin) % 10u64.pow(digits);
    format!("{code:0width$}", width = digits as usize)
}

/// Checks a candidate against the window of moving factors allowed by
/// `slip`: offsets `-ceil(slip/2) ..= +floor(slip/2)` relative to the
/// current one, so odd slip values reach one step further into the past.
#[must_use]
pub fn verify(
    secret: &[u8],
    digits: u32,
    algo: Algo,
    candidate: &str,
    moving_factor: u64,
    slip: u32,
) -> bool {
    let back = i64::from(slip.div_ceil(2));
    let forward = i64::from(slip / 2);
    for offset in -back..=forward {
        let Some(factor) = moving_factor.checked_add_signed(offset) else {
            continue;
        };
        if code(secret, digits, algo, factor) == candidate {
            return true;
        }
    }
    false
}
